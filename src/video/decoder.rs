//! Background Hap decoder
//!
//! One worker thread pulls compressed frames from the [`StreamReader`] and
//! decompresses them into block-compressed texture data. The caller only
//! records the time it wants; the worker always serves the latest request,
//! so a burst of requests costs one decode.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::frame::{CompressedFrame, DecodedFrame};
use super::hap::{decode_frame, HapFormat};
use super::stream_reader::StreamReader;

/// Handle for one `update_time` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DecodeTicket {
    sequence: u64,
}

impl DecodeTicket {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Latest desired time, written by the caller
#[derive(Debug, Clone, Copy, Default)]
struct Request {
    time: f64,
    target: Option<usize>,
    generation: u64,
    sequence: u64,
}

#[derive(Default)]
struct Published {
    latest: Option<Arc<DecodedFrame>>,
    /// Highest request sequence the worker has finished
    completed: u64,
}

struct Shared {
    request: Mutex<Request>,
    published: Mutex<Published>,
    completed_cv: Condvar,
    running: AtomicBool,
}

enum WorkerMessage {
    Wake,
    Shutdown,
}

/// Read-only view of the decoder's output, polled by the texture updater
#[derive(Clone)]
pub struct DecodeCompletion {
    shared: Arc<Shared>,
}

impl DecodeCompletion {
    /// Most recently published frame
    pub fn latest(&self) -> Option<Arc<DecodedFrame>> {
        self.shared.published.lock().latest.clone()
    }

    pub fn is_complete(&self, ticket: DecodeTicket) -> bool {
        self.shared.published.lock().completed >= ticket.sequence
    }

    /// Block until the request behind `ticket` has been processed
    ///
    /// Returns immediately once the decoder has shut down.
    pub fn wait(&self, ticket: DecodeTicket) {
        let mut published = self.shared.published.lock();
        while published.completed < ticket.sequence && self.shared.running.load(Ordering::Acquire)
        {
            self.shared.completed_cv.wait(&mut published);
        }
    }

    /// Like [`DecodeCompletion::wait`] with an upper bound; returns whether
    /// the request completed
    pub fn wait_timeout(&self, ticket: DecodeTicket, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut published = self.shared.published.lock();
        while published.completed < ticket.sequence && self.shared.running.load(Ordering::Acquire)
        {
            if self
                .shared
                .completed_cv
                .wait_until(&mut published, deadline)
                .timed_out()
            {
                break;
            }
        }
        published.completed >= ticket.sequence
    }
}

/// Frame decoder with one worker thread
pub struct Decoder {
    reader: Arc<StreamReader>,
    shared: Arc<Shared>,
    wake_tx: Sender<WorkerMessage>,
    thread_handle: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
    format: HapFormat,
}

impl Decoder {
    /// Start a decoder for frames of the given size and format
    pub fn new(
        reader: Arc<StreamReader>,
        width: u32,
        height: u32,
        format: HapFormat,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            request: Mutex::new(Request::default()),
            published: Mutex::new(Published::default()),
            completed_cv: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let (wake_tx, wake_rx) = unbounded();

        let worker = DecodeWorker {
            reader: Arc::clone(&reader),
            shared: Arc::clone(&shared),
            width,
            height,
            format,
            spare: None,
            publish_sequence: 0,
        };
        let thread_handle = thread::Builder::new()
            .name("hap-decoder".to_string())
            .spawn(move || worker.run(wake_rx))?;

        tracing::debug!(
            "Decoder: started for {}x{} {:?}",
            width,
            height,
            format
        );

        Ok(Self {
            reader,
            shared,
            wake_tx,
            thread_handle: Some(thread_handle),
            width,
            height,
            format,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> HapFormat {
        self.format
    }

    /// Record the desired playback time
    ///
    /// Does nothing when `time` resolves to the frame already requested in
    /// the current reader generation. With `wait_for_completion` the call
    /// returns once the worker has processed the request.
    pub fn update_time(&self, time: f64, wait_for_completion: bool) -> DecodeTicket {
        let target = self.reader.target_index(time);
        let generation = self.reader.generation();

        let ticket = {
            let mut request = self.shared.request.lock();
            let unchanged = request.sequence > 0
                && request.target == Some(target)
                && request.generation == generation;
            if !unchanged {
                request.sequence += 1;
                request.time = time;
                request.target = Some(target);
                request.generation = generation;
            }
            DecodeTicket {
                sequence: request.sequence,
            }
        };

        if self.thread_handle.is_some() {
            // Extra wakes are harmless: the worker skips requests it has done
            let _ = self.wake_tx.send(WorkerMessage::Wake);
        }
        if wait_for_completion {
            self.completion().wait(ticket);
        }
        ticket
    }

    pub fn completion(&self) -> DecodeCompletion {
        DecodeCompletion {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Most recently published frame
    pub fn latest(&self) -> Option<Arc<DecodedFrame>> {
        self.completion().latest()
    }

    /// Stop and join the worker; safe to call more than once
    pub fn dispose(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        let _ = self.wake_tx.send(WorkerMessage::Shutdown);
        if handle.join().is_err() {
            tracing::error!("Decoder: worker thread panicked");
        }
        self.shared.running.store(false, Ordering::Release);
        {
            let _published = self.shared.published.lock();
            self.shared.completed_cv.notify_all();
        }
        tracing::debug!("Decoder: disposed");
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Marks the decoder stopped when the worker exits, panics included,
/// so waiters never block on a dead thread
struct WorkerExitGuard {
    shared: Arc<Shared>,
}

impl Drop for WorkerExitGuard {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let _published = self.shared.published.lock();
        self.shared.completed_cv.notify_all();
    }
}

/// State owned by the worker thread
struct DecodeWorker {
    reader: Arc<StreamReader>,
    shared: Arc<Shared>,
    width: u32,
    height: u32,
    format: HapFormat,
    /// Buffer reclaimed from a frame the uploader has released
    spare: Option<Vec<u8>>,
    publish_sequence: u64,
}

impl DecodeWorker {
    fn run(mut self, wake_rx: Receiver<WorkerMessage>) {
        let _exit_guard = WorkerExitGuard {
            shared: Arc::clone(&self.shared),
        };
        let mut processed = 0u64;

        while let Ok(WorkerMessage::Wake) = wake_rx.recv() {
            // Coalesce queued wakes down to the latest request
            let mut shutdown = false;
            while let Ok(message) = wake_rx.try_recv() {
                if matches!(message, WorkerMessage::Shutdown) {
                    shutdown = true;
                }
            }
            if shutdown {
                break;
            }

            let request = *self.shared.request.lock();
            if request.sequence == processed {
                continue;
            }
            processed = request.sequence;

            self.process(request);

            {
                let mut published = self.shared.published.lock();
                published.completed = published.completed.max(request.sequence);
                self.shared.completed_cv.notify_all();
            }

            if let Err(e) = self.reader.prefetch() {
                tracing::debug!("Decoder: prefetch failed: {}", e);
            }
        }

        tracing::debug!("Decoder: worker exiting");
    }

    fn process(&mut self, request: Request) {
        let frame = match self.reader.read_for_time(request.time) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Decoder: no frame for {:.3}s: {}", request.time, e);
                return;
            }
        };

        if self.is_stale(&frame) {
            return;
        }

        let mut buffer = self.spare.take().unwrap_or_default();
        if let Err(e) = decode_frame(&frame.data, self.format, self.width, self.height, &mut buffer)
        {
            self.reader.demuxer().stats().record_decode_failure();
            tracing::warn!("Decoder: frame {} failed to decode: {}", frame.index, e);
            self.spare = Some(buffer);
            return;
        }
        self.reader.demuxer().stats().record_decode();

        if self.is_stale(&frame) {
            self.spare = Some(buffer);
            return;
        }

        self.publish_sequence += 1;
        let pts = self
            .reader
            .demuxer()
            .entry(frame.index)
            .map_or(0.0, |entry| entry.pts);
        let decoded = Arc::new(DecodedFrame {
            data: buffer,
            width: self.width,
            height: self.height,
            format: self.format,
            pts,
            frame_index: frame.index,
            generation: frame.generation,
            sequence: self.publish_sequence,
        });

        let previous = self.shared.published.lock().latest.replace(decoded);
        if let Some(previous) = previous {
            if let Ok(previous) = Arc::try_unwrap(previous) {
                self.spare = Some(previous.data);
            }
        }
    }

    /// A restart after this frame was read supersedes it
    fn is_stale(&self, frame: &CompressedFrame) -> bool {
        if frame.generation == self.reader.generation() {
            return false;
        }
        self.reader.demuxer().stats().record_stale_decode();
        tracing::trace!(
            "Decoder: dropping frame {} from generation {}",
            frame.index,
            frame.generation
        );
        true
    }
}
