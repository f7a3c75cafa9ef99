//! Texture update strategies
//!
//! Moves the decoder's latest frame onto a texture. The async strategy
//! uploads into a back texture on a worker thread and swaps it to the front
//! only once the copy has completed; the sync strategy copies inline when
//! the host calls [`TextureUpdater::update_now`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use super::decoder::DecodeCompletion;
use super::frame::DecodedFrame;
use super::texture::{TextureBackend, TextureDesc, UploadError};
use crate::settings::UploadMode;
use crate::telemetry::PipelineStats;

/// Outcome of one updater call
#[derive(Debug, Clone)]
pub enum UpdateStatus {
    /// No newer frame to upload
    Idle,
    /// An upload is pending or in flight
    Scheduled,
    /// The texture now shows this frame index
    Uploaded(usize),
    Failed(UploadError),
}

/// Strategy for keeping a texture in step with the decoder
pub trait TextureUpdater: Send {
    type Texture;

    /// Start an upload of the latest decoded frame if it is newer than the
    /// one presented; never blocks
    fn request_update(&mut self) -> UpdateStatus;

    /// Upload the latest decoded frame and return once it is on the texture
    fn update_now(&mut self) -> UpdateStatus;

    /// Wait for an outstanding upload and apply its result
    ///
    /// Returns `None` when nothing was in flight.
    fn flush(&mut self) -> Option<UpdateStatus>;

    /// Texture the host should display
    fn texture(&self) -> Option<&Self::Texture>;

    /// Frame index currently on the texture
    fn presented_frame(&self) -> Option<usize>;

    fn is_async(&self) -> bool;

    /// Release textures and workers; safe to call more than once
    fn dispose(&mut self);
}

/// Choose and build the update strategy for a backend
pub fn create_updater<B: TextureBackend>(
    backend: Arc<B>,
    desc: TextureDesc,
    completion: DecodeCompletion,
    stats: Arc<PipelineStats>,
    mode: UploadMode,
) -> Result<Box<dyn TextureUpdater<Texture = B::Texture>>, UploadError> {
    let use_async = match mode {
        UploadMode::Sync => false,
        UploadMode::Auto => backend.supports_async_upload(),
        UploadMode::Async => {
            if !backend.supports_async_upload() {
                tracing::warn!("Async upload requested but unsupported, using sync upload");
            }
            backend.supports_async_upload()
        }
    };

    if use_async {
        Ok(Box::new(AsyncTextureUpdater::new(backend, desc, completion, stats)?))
    } else {
        Ok(Box::new(SyncTextureUpdater::new(backend, desc, completion, stats)?))
    }
}

/// Newest published frame if it is newer than `last_sequence`
fn newer_frame(completion: &DecodeCompletion, last_sequence: u64) -> Option<Arc<DecodedFrame>> {
    completion
        .latest()
        .filter(|frame| frame.sequence > last_sequence)
}

struct UploadJob<T> {
    texture: Arc<T>,
    frame: Arc<DecodedFrame>,
}

struct UploadResult<T> {
    texture: Arc<T>,
    frame_index: usize,
    result: Result<Duration, UploadError>,
}

/// Double-buffered updater with one upload worker
pub struct AsyncTextureUpdater<B: TextureBackend> {
    completion: DecodeCompletion,
    stats: Arc<PipelineStats>,
    front: Option<Arc<B::Texture>>,
    /// `None` while its upload is in flight
    back: Option<Arc<B::Texture>>,
    job_tx: Option<Sender<UploadJob<B::Texture>>>,
    result_rx: Receiver<UploadResult<B::Texture>>,
    thread_handle: Option<JoinHandle<()>>,
    in_flight: bool,
    /// Publish sequence of the last frame sent for upload
    last_sequence: u64,
    presented: Option<usize>,
}

impl<B: TextureBackend> AsyncTextureUpdater<B> {
    pub fn new(
        backend: Arc<B>,
        desc: TextureDesc,
        completion: DecodeCompletion,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, UploadError> {
        let front = Arc::new(backend.create_texture(&desc, "HAP Front Texture")?);
        let back = Arc::new(backend.create_texture(&desc, "HAP Back Texture")?);

        let (job_tx, job_rx) = bounded::<UploadJob<B::Texture>>(1);
        let (result_tx, result_rx) = bounded(1);

        let thread_handle = thread::Builder::new()
            .name("hap-upload".to_string())
            .spawn(move || upload_loop(backend, desc, job_rx, result_tx))
            .map_err(|e| UploadError::Backend(e.to_string()))?;

        Ok(Self {
            completion,
            stats,
            front: Some(front),
            back: Some(back),
            job_tx: Some(job_tx),
            result_rx,
            thread_handle: Some(thread_handle),
            in_flight: false,
            last_sequence: 0,
            presented: None,
        })
    }

    fn finish(&mut self, upload: UploadResult<B::Texture>) -> UpdateStatus {
        self.in_flight = false;
        match upload.result {
            Ok(elapsed) => {
                self.stats.record_upload(elapsed);
                self.back = self.front.replace(upload.texture);
                self.presented = Some(upload.frame_index);
                UpdateStatus::Uploaded(upload.frame_index)
            }
            Err(e) => {
                self.stats.record_upload_failure();
                tracing::warn!("Async upload of frame {} failed: {}", upload.frame_index, e);
                self.back = Some(upload.texture);
                UpdateStatus::Failed(e)
            }
        }
    }

    fn poll_result(&mut self) -> Option<UpdateStatus> {
        if !self.in_flight {
            return None;
        }
        self.result_rx.try_recv().ok().map(|result| self.finish(result))
    }

    fn schedule(&mut self) -> bool {
        let Some(frame) = newer_frame(&self.completion, self.last_sequence) else {
            return false;
        };
        let Some(job_tx) = &self.job_tx else {
            return false;
        };
        let Some(texture) = self.back.take() else {
            return false;
        };

        let sequence = frame.sequence;
        match job_tx.try_send(UploadJob { texture, frame }) {
            Ok(()) => {
                self.last_sequence = sequence;
                self.in_flight = true;
                true
            }
            Err(e) => {
                self.back = Some(e.into_inner().texture);
                false
            }
        }
    }
}

fn upload_loop<B: TextureBackend>(
    backend: Arc<B>,
    desc: TextureDesc,
    job_rx: Receiver<UploadJob<B::Texture>>,
    result_tx: Sender<UploadResult<B::Texture>>,
) {
    while let Ok(job) = job_rx.recv() {
        let start = Instant::now();
        let result = backend
            .write_texture(&job.texture, &desc, &job.frame.data)
            .map(|()| start.elapsed());
        let frame_index = job.frame.frame_index;
        // Hand the buffer back to the decoder before reporting
        drop(job.frame);

        let upload = UploadResult {
            texture: job.texture,
            frame_index,
            result,
        };
        if result_tx.send(upload).is_err() {
            break;
        }
    }
    tracing::debug!("Upload worker exiting");
}

impl<B: TextureBackend> TextureUpdater for AsyncTextureUpdater<B> {
    type Texture = B::Texture;

    fn request_update(&mut self) -> UpdateStatus {
        let finished = match self.poll_result() {
            Some(UpdateStatus::Failed(e)) => return UpdateStatus::Failed(e),
            other => other,
        };
        if self.in_flight || self.schedule() {
            return UpdateStatus::Scheduled;
        }
        finished.unwrap_or(UpdateStatus::Idle)
    }

    fn update_now(&mut self) -> UpdateStatus {
        let mut status = self.flush().unwrap_or(UpdateStatus::Idle);
        if matches!(status, UpdateStatus::Failed(_)) {
            return status;
        }
        if self.schedule() {
            status = self.flush().unwrap_or(UpdateStatus::Idle);
        }
        status
    }

    fn flush(&mut self) -> Option<UpdateStatus> {
        if !self.in_flight {
            return None;
        }
        match self.result_rx.recv() {
            Ok(result) => Some(self.finish(result)),
            Err(_) => {
                self.in_flight = false;
                Some(UpdateStatus::Failed(UploadError::Backend(
                    "upload worker stopped".to_string(),
                )))
            }
        }
    }

    fn texture(&self) -> Option<&B::Texture> {
        self.front.as_deref()
    }

    fn presented_frame(&self) -> Option<usize> {
        self.presented
    }

    fn is_async(&self) -> bool {
        true
    }

    fn dispose(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        self.job_tx = None;
        // Drain so a blocked worker can finish its send
        while self.result_rx.try_recv().is_ok() {}
        if handle.join().is_err() {
            tracing::error!("Upload worker panicked");
        }
        while self.result_rx.try_recv().is_ok() {}
        self.in_flight = false;
        self.front = None;
        self.back = None;
        tracing::debug!("AsyncTextureUpdater: disposed");
    }
}

impl<B: TextureBackend> Drop for AsyncTextureUpdater<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Updater that copies on the caller's thread
///
/// `request_update` only notes that a newer frame exists; the copy happens
/// in `update_now`, normally from the host's end-of-frame hook.
pub struct SyncTextureUpdater<B: TextureBackend> {
    backend: Arc<B>,
    desc: TextureDesc,
    completion: DecodeCompletion,
    stats: Arc<PipelineStats>,
    texture: Option<Arc<B::Texture>>,
    pending: bool,
    last_sequence: u64,
    presented: Option<usize>,
}

impl<B: TextureBackend> SyncTextureUpdater<B> {
    pub fn new(
        backend: Arc<B>,
        desc: TextureDesc,
        completion: DecodeCompletion,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, UploadError> {
        let texture = Arc::new(backend.create_texture(&desc, "HAP Texture")?);
        Ok(Self::with_texture(backend, desc, completion, stats, texture))
    }

    /// Upload into a texture owned by the host
    pub fn with_texture(
        backend: Arc<B>,
        desc: TextureDesc,
        completion: DecodeCompletion,
        stats: Arc<PipelineStats>,
        texture: Arc<B::Texture>,
    ) -> Self {
        Self {
            backend,
            desc,
            completion,
            stats,
            texture: Some(texture),
            pending: false,
            last_sequence: 0,
            presented: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }
}

impl<B: TextureBackend> TextureUpdater for SyncTextureUpdater<B> {
    type Texture = B::Texture;

    fn request_update(&mut self) -> UpdateStatus {
        self.pending = newer_frame(&self.completion, self.last_sequence).is_some();
        if self.pending {
            UpdateStatus::Scheduled
        } else {
            UpdateStatus::Idle
        }
    }

    fn update_now(&mut self) -> UpdateStatus {
        self.pending = false;
        let Some(texture) = &self.texture else {
            return UpdateStatus::Idle;
        };
        let Some(frame) = newer_frame(&self.completion, self.last_sequence) else {
            return UpdateStatus::Idle;
        };

        let start = Instant::now();
        match self.backend.write_texture(texture, &self.desc, &frame.data) {
            Ok(()) => {
                self.stats.record_upload(start.elapsed());
                self.last_sequence = frame.sequence;
                self.presented = Some(frame.frame_index);
                UpdateStatus::Uploaded(frame.frame_index)
            }
            Err(e) => {
                self.stats.record_upload_failure();
                tracing::warn!("Upload of frame {} failed: {}", frame.frame_index, e);
                UpdateStatus::Failed(e)
            }
        }
    }

    fn flush(&mut self) -> Option<UpdateStatus> {
        None
    }

    fn texture(&self) -> Option<&B::Texture> {
        self.texture.as_deref()
    }

    fn presented_frame(&self) -> Option<usize> {
        self.presented
    }

    fn is_async(&self) -> bool {
        false
    }

    fn dispose(&mut self) {
        if self.texture.take().is_some() {
            tracing::debug!("SyncTextureUpdater: disposed");
        }
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::cursor::LoopMode;
    use crate::video::decoder::Decoder;
    use crate::video::demuxer::Demuxer;
    use crate::video::hap::HapFormat;
    use crate::video::stream_reader::StreamReader;
    use crate::video::test_support::{ten_frame_movie, texture_frame_index};
    use crate::video::texture::{MemoryBackend, MemoryTexture};

    struct Fixture {
        _dir: tempfile::TempDir,
        decoder: Decoder,
        backend: Arc<MemoryBackend>,
        stats: Arc<PipelineStats>,
        desc: TextureDesc,
    }

    fn fixture(backend: MemoryBackend) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let demuxer = Arc::new(Demuxer::open(ten_frame_movie(dir.path())));
        let stats = Arc::clone(demuxer.stats());
        let reader = Arc::new(StreamReader::new(demuxer, 0.0, 0.1, LoopMode::None));
        let decoder = Decoder::new(reader, 8, 8, HapFormat::Hap).unwrap();
        Fixture {
            _dir: dir,
            decoder,
            backend: Arc::new(backend),
            stats,
            desc: TextureDesc::new(8, 8, HapFormat::Hap),
        }
    }

    fn shown(texture: Option<&MemoryTexture>) -> Option<usize> {
        texture_frame_index(&texture.unwrap().pixels())
    }

    #[test]
    fn test_async_swaps_after_upload() {
        let f = fixture(MemoryBackend::new());
        f.backend.set_upload_delay(Duration::from_millis(150));
        let mut updater = AsyncTextureUpdater::new(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
        )
        .unwrap();

        f.decoder.update_time(0.35, true);
        assert!(matches!(updater.request_update(), UpdateStatus::Scheduled));
        // Front texture untouched while the copy runs
        assert_eq!(updater.presented_frame(), None);
        assert_eq!(shown(updater.texture()), Some(0));

        // At most one upload in flight
        assert!(matches!(updater.request_update(), UpdateStatus::Scheduled));

        assert!(matches!(updater.flush(), Some(UpdateStatus::Uploaded(3))));
        assert_eq!(updater.presented_frame(), Some(3));
        assert_eq!(shown(updater.texture()), Some(3));
        assert_eq!(f.backend.uploads(), 1);

        // Nothing newer
        assert!(matches!(updater.request_update(), UpdateStatus::Idle));
        assert!(updater.flush().is_none());
    }

    #[test]
    fn test_async_update_now() {
        let f = fixture(MemoryBackend::new());
        let mut updater = AsyncTextureUpdater::new(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
        )
        .unwrap();

        for (time, index) in [(0.25, 2), (0.65, 6)] {
            f.decoder.update_time(time, true);
            assert!(matches!(updater.update_now(), UpdateStatus::Uploaded(i) if i == index));
            assert_eq!(shown(updater.texture()), Some(index));
        }
        assert_eq!(f.stats.snapshot().uploads, 2);
    }

    #[test]
    fn test_async_failure_is_reported() {
        let f = fixture(MemoryBackend::new());
        let mut updater = AsyncTextureUpdater::new(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
        )
        .unwrap();

        f.backend.fail_next_uploads(1);
        f.decoder.update_time(0.15, true);
        assert!(matches!(updater.update_now(), UpdateStatus::Failed(_)));
        assert_eq!(updater.presented_frame(), None);
        assert_eq!(f.stats.snapshot().upload_failures, 1);
    }

    #[test]
    fn test_sync_copies_only_in_update_now() {
        let f = fixture(MemoryBackend::synchronous());
        let mut updater = SyncTextureUpdater::new(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
        )
        .unwrap();

        assert!(matches!(updater.request_update(), UpdateStatus::Idle));
        f.decoder.update_time(0.45, true);
        assert!(matches!(updater.request_update(), UpdateStatus::Scheduled));
        assert!(updater.has_pending());
        assert_eq!(f.backend.uploads(), 0);

        assert!(matches!(updater.update_now(), UpdateStatus::Uploaded(4)));
        assert!(!updater.has_pending());
        assert_eq!(shown(updater.texture()), Some(4));
        assert!(matches!(updater.update_now(), UpdateStatus::Idle));
    }

    #[test]
    fn test_sync_external_texture() {
        let f = fixture(MemoryBackend::synchronous());
        let external = Arc::new(f.backend.create_texture(&f.desc, "host").unwrap());
        let mut updater = SyncTextureUpdater::with_texture(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
            Arc::clone(&external),
        );

        f.decoder.update_time(0.75, true);
        updater.update_now();
        assert_eq!(texture_frame_index(&external.pixels()), Some(7));

        // Dispose drops our reference only
        updater.dispose();
        assert!(updater.texture().is_none());
        assert_eq!(f.backend.live_textures(), 1);
    }

    #[test]
    fn test_dispose_releases_textures() {
        let backend = MemoryBackend::new();
        let f = fixture(backend);
        let mut updater = create_updater(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
            UploadMode::Auto,
        )
        .unwrap();
        assert!(updater.is_async());
        assert_eq!(f.backend.live_textures(), 2);

        // No upload ever completed
        updater.dispose();
        updater.dispose();
        assert_eq!(f.backend.live_textures(), 0);
        assert!(updater.texture().is_none());
    }

    #[test]
    fn test_strategy_selection() {
        let f = fixture(MemoryBackend::synchronous());
        let updater = create_updater(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
            UploadMode::Async,
        )
        .unwrap();
        assert!(!updater.is_async());

        let f = fixture(MemoryBackend::new());
        let updater = create_updater(
            Arc::clone(&f.backend),
            f.desc,
            f.decoder.completion(),
            Arc::clone(&f.stats),
            UploadMode::Sync,
        )
        .unwrap();
        assert!(!updater.is_async());
    }
}
