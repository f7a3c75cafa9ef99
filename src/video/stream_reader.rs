//! Look-ahead frame source
//!
//! Reads compressed frames for a playback time, keeping one predicted frame
//! in a prefetch slot. Restarts are posted without touching the file so the
//! caller never waits on a read in progress; the read side applies them.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::cursor::{Direction, LoopMode, PlaybackCursor};
use super::demuxer::{Demuxer, StreamHandle};
use super::frame::CompressedFrame;

/// Errors reading compressed frames
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("failed to read frame {index}: {source}")]
    Io {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to reopen stream: {0}")]
    Reopen(#[source] io::Error),
    #[error("stream is invalid after an earlier read failure")]
    Invalid,
    #[error("frame {0} is out of range")]
    OutOfRange(usize),
    #[error("stream reader is disposed")]
    Disposed,
}

/// Read-side state, only touched while holding the state lock
struct ReaderState {
    handle: Option<StreamHandle>,
    /// File position after the last read, `None` when unknown
    position: Option<u64>,
    /// Last frame read from disk and the direction it was read in
    last_read: Option<(usize, Direction)>,
    /// Last frame handed out by `read_for_time`
    last_delivered: Option<usize>,
    cursor: PlaybackCursor,
    /// Generation of the cursor currently applied
    generation: u64,
    prefetched: Option<CompressedFrame>,
    valid: bool,
    disposed: bool,
}

/// Frame source over one container
pub struct StreamReader {
    demuxer: Arc<Demuxer>,
    /// Latest requested generation, bumped by every restart
    generation: AtomicU64,
    /// Restart posted by the caller, applied by the next read
    pending: Mutex<Option<(PlaybackCursor, u64)>>,
    state: Mutex<ReaderState>,
    loop_mode: Mutex<LoopMode>,
}

impl StreamReader {
    /// Create a reader positioned at `time`
    ///
    /// An invalid container or a failure to open the stream yields a reader
    /// whose reads fail with [`ReadError::Invalid`].
    pub fn new(demuxer: Arc<Demuxer>, time: f64, delta: f64, loop_mode: LoopMode) -> Self {
        let handle = if demuxer.is_valid() {
            match demuxer.open_stream() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!("StreamReader: failed to open stream: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let valid = handle.is_some();

        Self {
            demuxer,
            generation: AtomicU64::new(0),
            pending: Mutex::new(None),
            state: Mutex::new(ReaderState {
                handle,
                position: None,
                last_read: None,
                last_delivered: None,
                cursor: PlaybackCursor::new(time, delta),
                generation: 0,
                prefetched: None,
                valid,
                disposed: false,
            }),
            loop_mode: Mutex::new(loop_mode),
        }
    }

    pub fn demuxer(&self) -> &Arc<Demuxer> {
        &self.demuxer
    }

    /// Latest generation requested by a restart
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn loop_mode(&self) -> LoopMode {
        *self.loop_mode.lock()
    }

    pub fn set_loop_mode(&self, loop_mode: LoopMode) {
        *self.loop_mode.lock() = loop_mode;
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// Frame index a clock time resolves to under the current loop mode
    pub fn target_index(&self, time: f64) -> usize {
        let wrapped = self.loop_mode().wrap_time(time, self.demuxer.duration());
        self.demuxer.frame_at(wrapped)
    }

    /// Discard in-flight and prefetched reads and move the cursor
    ///
    /// Returns the new generation. Does not block on I/O.
    pub fn restart(&self, time: f64, delta: f64) -> u64 {
        let mut pending = self.pending.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *pending = Some((PlaybackCursor::new(time, delta), generation));
        tracing::debug!(
            "StreamReader: restart at {:.3}s (delta {:.4}), generation {}",
            time,
            delta,
            generation
        );
        generation
    }

    /// Read the frame for `time`
    ///
    /// Returns `Ok(None)` when that frame is the one last delivered.
    pub fn read_for_time(&self, time: f64) -> Result<Option<CompressedFrame>, ReadError> {
        let mut state = self.state.lock();
        self.apply_pending(&mut state)?;
        if !state.valid {
            return Err(ReadError::Invalid);
        }

        let index = self.target_index(time);
        state.cursor.time = time;
        if state.last_delivered == Some(index) {
            return Ok(None);
        }

        let generation = state.generation;
        let frame = match state.prefetched.take() {
            Some(frame) if frame.index == index && frame.generation == generation => frame,
            _ => self.read_index(&mut state, index)?,
        };
        state.last_delivered = Some(index);
        Ok(Some(frame))
    }

    /// Read the frame predicted by the cursor into the prefetch slot
    pub fn prefetch(&self) -> Result<(), ReadError> {
        let mut state = self.state.lock();
        self.apply_pending(&mut state)?;
        if !state.valid {
            return Ok(());
        }

        let predicted = self.target_index(state.cursor.expected_next());
        let already_held = state
            .prefetched
            .as_ref()
            .is_some_and(|f| f.index == predicted && f.generation == state.generation);
        if state.last_delivered == Some(predicted) || already_held {
            return Ok(());
        }

        let frame = self.read_index(&mut state, predicted)?;
        state.prefetched = Some(frame);
        Ok(())
    }

    /// Release the stream; safe to call more than once
    pub fn dispose(&self) {
        self.pending.lock().take();
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.valid = false;
        state.prefetched = None;
        state.handle = None;
        tracing::debug!("StreamReader: disposed");
    }

    fn apply_pending(&self, state: &mut ReaderState) -> Result<(), ReadError> {
        if state.disposed {
            return Err(ReadError::Disposed);
        }
        let Some((cursor, generation)) = self.pending.lock().take() else {
            return Ok(());
        };

        state.cursor = cursor;
        state.generation = generation;
        state.prefetched = None;
        state.last_delivered = None;

        if !state.valid && self.demuxer.is_valid() {
            state.position = None;
            state.last_read = None;
            state.handle = None;
            let handle = self.demuxer.open_stream().map_err(ReadError::Reopen)?;
            state.handle = Some(handle);
            state.valid = true;
            tracing::info!("StreamReader: stream reopened after failure");
        }
        Ok(())
    }

    fn read_index(&self, state: &mut ReaderState, index: usize) -> Result<CompressedFrame, ReadError> {
        let entry = *self
            .demuxer
            .entry(index)
            .ok_or(ReadError::OutOfRange(index))?;
        let direction = state.cursor.direction();

        let sequential = match state.last_read {
            Some((last, last_direction)) => {
                last + 1 == index && last_direction != Direction::Backward
                    && direction != Direction::Backward
            }
            None => false,
        };
        let seek = !sequential || state.position != Some(entry.offset);

        let stats = self.demuxer.stats();
        let handle = state.handle.as_mut().ok_or(ReadError::Invalid)?;
        let result = read_entry(handle, entry.offset, entry.size as usize, seek);

        match result {
            Ok(data) => {
                stats.record_read(seek);
                state.position = Some(entry.offset + entry.size as u64);
                state.last_read = Some((index, direction));
                Ok(CompressedFrame {
                    index,
                    generation: state.generation,
                    data,
                })
            }
            Err(source) => {
                stats.record_read_failure();
                tracing::warn!("StreamReader: read of frame {} failed: {}", index, source);
                state.valid = false;
                state.position = None;
                state.last_read = None;
                state.prefetched = None;
                Err(ReadError::Io { index, source })
            }
        }
    }
}

fn read_entry(handle: &mut StreamHandle, offset: u64, size: usize, seek: bool) -> io::Result<Bytes> {
    if seek {
        handle.seek(SeekFrom::Start(offset))?;
    }
    let mut data = vec![0u8; size];
    handle.read_exact(&mut data)?;
    Ok(Bytes::from(data))
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.dispose();
    }
}
