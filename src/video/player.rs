//! HAP movie player
//!
//! Ties the pipeline together and drives it from the host's clock. Each tick
//! compares the requested cursor with the one last applied; a discontinuity
//! restarts the reader and waits for the new frame, otherwise the decoder is
//! nudged without blocking. Uploads go through the chosen texture updater.

use std::path::Path;
use std::sync::Arc;

use super::cursor::{detect_restart, LoopMode, PlaybackCursor, RestartReason};
use super::decoder::Decoder;
use super::demuxer::{Demuxer, OpenError, StreamMetadata};
use super::stream_reader::StreamReader;
use super::texture::{TextureBackend, TextureDesc, UploadError};
use super::updater::{create_updater, SyncTextureUpdater, TextureUpdater, UpdateStatus};
use crate::settings::PlayerSettings;
use crate::telemetry::{PipelineStats, PipelineStatsSnapshot};

/// Clock state for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockInput {
    /// Playback time in seconds, unwrapped
    pub time: f64,
    /// Signed time step until the next tick
    pub delta: f64,
    pub loop_mode: LoopMode,
    /// Timeline-driven time; overrides `time` and `delta` when set
    pub external_time: Option<f64>,
}

impl ClockInput {
    pub fn new(time: f64, delta: f64) -> Self {
        Self {
            time,
            delta,
            loop_mode: LoopMode::None,
            external_time: None,
        }
    }

    /// Input driven by an external timeline
    pub fn external(time: f64) -> Self {
        Self {
            external_time: Some(time),
            ..Self::new(time, 0.0)
        }
    }

    pub fn with_loop_mode(mut self, loop_mode: LoopMode) -> Self {
        self.loop_mode = loop_mode;
        self
    }
}

/// What one tick did
#[derive(Debug, Clone)]
pub struct TickStatus {
    /// Set when the tick restarted the pipeline
    pub restart: Option<RestartReason>,
    /// Frame the requested time resolves to
    pub target_frame: Option<usize>,
    /// Frame currently on the presented texture
    pub presented_frame: Option<usize>,
    pub upload: UpdateStatus,
}

impl TickStatus {
    fn idle() -> Self {
        Self {
            restart: None,
            target_frame: None,
            presented_frame: None,
            upload: UpdateStatus::Idle,
        }
    }
}

/// Host hook that displays the player's texture
pub trait Presenter<T> {
    fn present(&mut self, texture: &T);
}

/// Plays one HAP movie into a texture
pub struct HapPlayer<B: TextureBackend> {
    backend: Arc<B>,
    demuxer: Arc<Demuxer>,
    reader: Arc<StreamReader>,
    decoder: Decoder,
    updater: Box<dyn TextureUpdater<Texture = B::Texture>>,
    desc: TextureDesc,
    stats: Arc<PipelineStats>,
    /// Cursor applied by the last tick
    applied: Option<PlaybackCursor>,
    loop_mode: LoopMode,
    last_external: Option<f64>,
    disposed: bool,
}

impl<B: TextureBackend> HapPlayer<B> {
    /// Open a movie and build its pipeline
    pub fn open<P: AsRef<Path>>(
        path: P,
        backend: Arc<B>,
        settings: &PlayerSettings,
    ) -> Result<Self, OpenError> {
        Self::build(path.as_ref(), backend, settings, None)
    }

    /// Open a movie that uploads into a texture owned by the host
    ///
    /// Uploads then always run synchronously from [`HapPlayer::end_of_frame`].
    pub fn open_with_texture<P: AsRef<Path>>(
        path: P,
        backend: Arc<B>,
        settings: &PlayerSettings,
        texture: Arc<B::Texture>,
    ) -> Result<Self, OpenError> {
        Self::build(path.as_ref(), backend, settings, Some(texture))
    }

    fn build(
        path: &Path,
        backend: Arc<B>,
        settings: &PlayerSettings,
        external_texture: Option<Arc<B::Texture>>,
    ) -> Result<Self, OpenError> {
        let stats = Arc::new(PipelineStats::new());
        let demuxer = Arc::new(Demuxer::try_open_with_stats(path, Arc::clone(&stats))?);
        let metadata = demuxer.metadata();
        let format = metadata
            .format
            .ok_or_else(|| OpenError::Malformed("missing codec subtype".to_string()))?;

        let reader = Arc::new(StreamReader::new(
            Arc::clone(&demuxer),
            settings.time,
            settings.delta(),
            settings.loop_mode,
        ));
        let decoder = Decoder::new(
            Arc::clone(&reader),
            metadata.width,
            metadata.height,
            format,
        )?;

        let desc = TextureDesc::new(metadata.width, metadata.height, format);
        let updater: Box<dyn TextureUpdater<Texture = B::Texture>> = match external_texture {
            Some(texture) => Box::new(SyncTextureUpdater::with_texture(
                Arc::clone(&backend),
                desc,
                decoder.completion(),
                Arc::clone(&stats),
                texture,
            )),
            None => create_updater(
                Arc::clone(&backend),
                desc,
                decoder.completion(),
                Arc::clone(&stats),
                settings.upload_mode,
            )?,
        };

        tracing::info!(
            "HapPlayer: opened {:?} ({}x{} {:?}, {} frames, {} upload)",
            path,
            metadata.width,
            metadata.height,
            format,
            metadata.frame_count,
            if updater.is_async() { "async" } else { "sync" }
        );

        Ok(Self {
            backend,
            demuxer,
            reader,
            decoder,
            updater,
            desc,
            stats,
            applied: None,
            loop_mode: settings.loop_mode,
            last_external: None,
            disposed: false,
        })
    }

    /// Advance the pipeline to the clock's time
    pub fn tick(&mut self, input: &ClockInput) -> TickStatus {
        if self.disposed {
            return TickStatus::idle();
        }

        let requested = match input.external_time {
            Some(time) => {
                let delta = self.last_external.map_or(0.0, |last| time - last);
                self.last_external = Some(time);
                PlaybackCursor::new(time, delta)
            }
            None => {
                self.last_external = None;
                PlaybackCursor::new(input.time, input.delta)
            }
        };

        let mut restart = detect_restart(self.applied.as_ref(), &requested);
        if input.loop_mode != self.loop_mode {
            self.loop_mode = input.loop_mode;
            self.reader.set_loop_mode(input.loop_mode);
            restart = restart.or(Some(RestartReason::LoopModeChange));
        }

        let external = input.external_time.is_some();
        if let Some(reason) = restart {
            self.stats.record_restart();
            tracing::debug!(
                "HapPlayer: restart ({:?}) at {:.3}s, delta {:.4}",
                reason,
                requested.time,
                requested.delta
            );
            self.reader.restart(requested.time, requested.delta);
            self.decoder.update_time(requested.time, true);
        } else {
            self.decoder.update_time(requested.time, external);
        }
        self.applied = Some(requested);

        let upload = if external {
            self.upload_now()
        } else {
            self.request_upload()
        };

        TickStatus {
            restart,
            target_frame: Some(self.reader.target_index(requested.time)),
            presented_frame: self.updater.presented_frame(),
            upload,
        }
    }

    /// Host end-of-frame hook; runs the copy when uploads are synchronous
    pub fn end_of_frame(&mut self) -> UpdateStatus {
        if self.disposed || self.updater.is_async() {
            return UpdateStatus::Idle;
        }
        self.upload_now()
    }

    /// Decode and upload the frame for `time` before returning
    ///
    /// Used for timeline scrubbing, where the host needs the exact frame now.
    pub fn update_now(&mut self, time: f64) -> UpdateStatus {
        if self.disposed {
            return UpdateStatus::Idle;
        }

        let requested = PlaybackCursor::new(time, 0.0);
        if let Some(reason) = detect_restart(self.applied.as_ref(), &requested) {
            self.stats.record_restart();
            tracing::debug!("HapPlayer: restart ({:?}) for update at {:.3}s", reason, time);
            self.reader.restart(time, 0.0);
        }
        self.applied = Some(requested);
        self.last_external = None;

        self.decoder.update_time(time, true);
        self.upload_now()
    }

    /// Wait for an outstanding async upload
    pub fn flush(&mut self) -> UpdateStatus {
        match self.updater.flush() {
            Some(UpdateStatus::Failed(e)) => self.handle_failure(e),
            Some(status) => status,
            None => UpdateStatus::Idle,
        }
    }

    /// Hand the current texture to the host; returns false when there is none
    pub fn present<P: Presenter<B::Texture>>(&self, presenter: &mut P) -> bool {
        match self.texture() {
            Some(texture) => {
                presenter.present(texture);
                true
            }
            None => false,
        }
    }

    pub fn texture(&self) -> Option<&B::Texture> {
        if self.disposed {
            return None;
        }
        self.updater.texture()
    }

    pub fn metadata(&self) -> StreamMetadata {
        self.demuxer.metadata()
    }

    pub fn is_valid(&self) -> bool {
        !self.disposed && self.demuxer.is_valid()
    }

    pub fn presented_frame(&self) -> Option<usize> {
        self.updater.presented_frame()
    }

    /// Whether uploads currently run on the upload worker
    pub fn is_async_upload(&self) -> bool {
        self.updater.is_async()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Release the pipeline; safe to call more than once
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.updater.dispose();
        self.decoder.dispose();
        self.reader.dispose();
        self.demuxer.dispose();
        tracing::info!("HapPlayer: disposed {:?}", self.demuxer.path());
    }

    fn request_upload(&mut self) -> UpdateStatus {
        match self.updater.request_update() {
            UpdateStatus::Failed(e) => self.handle_failure(e),
            status => status,
        }
    }

    fn upload_now(&mut self) -> UpdateStatus {
        match self.updater.update_now() {
            UpdateStatus::Failed(e) if self.updater.is_async() => {
                self.handle_failure(e);
                self.updater.update_now()
            }
            status => status,
        }
    }

    /// Switch from async to sync uploads after an async failure
    fn handle_failure(&mut self, error: UploadError) -> UpdateStatus {
        if !self.updater.is_async() {
            return UpdateStatus::Failed(error);
        }

        tracing::warn!("HapPlayer: async upload failed ({}), switching to sync upload", error);
        self.updater.dispose();
        match SyncTextureUpdater::new(
            Arc::clone(&self.backend),
            self.desc,
            self.decoder.completion(),
            Arc::clone(&self.stats),
        ) {
            Ok(mut updater) => {
                updater.request_update();
                self.updater = Box::new(updater);
            }
            Err(e) => tracing::error!("HapPlayer: failed to create sync updater: {}", e),
        }
        UpdateStatus::Failed(error)
    }
}

impl<B: TextureBackend> Drop for HapPlayer<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::UploadMode;
    use crate::telemetry::{subscriber, LogConfig, LogOutput};
    use crate::video::hap::HapFormat;
    use crate::video::test_support::{
        movie_with_corrupt_frame, ten_frame_movie, texture_frame_index, CapturedLogs, MovBuilder,
    };
    use crate::video::texture::{MemoryBackend, MemoryTexture};

    fn open(path: &Path, backend: &Arc<MemoryBackend>) -> HapPlayer<MemoryBackend> {
        HapPlayer::open(path, Arc::clone(backend), &PlayerSettings::new(path)).unwrap()
    }

    fn shown(player: &HapPlayer<MemoryBackend>) -> Option<usize> {
        texture_frame_index(&player.texture().unwrap().pixels())
    }

    /// Tick at `time` and wait for the upload
    fn show(player: &mut HapPlayer<MemoryBackend>, input: ClockInput) -> TickStatus {
        let status = player.tick(&input);
        player.flush();
        player.end_of_frame();
        status
    }

    #[derive(Default)]
    struct Recorder {
        frames: Vec<Option<usize>>,
    }

    impl Presenter<MemoryTexture> for Recorder {
        fn present(&mut self, texture: &MemoryTexture) {
            self.frames.push(texture_frame_index(&texture.pixels()));
        }
    }

    #[test]
    fn test_frame_selection_scenarios() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);
        assert!(player.is_valid());
        assert_eq!(player.metadata().frame_count, 10);

        let status = show(&mut player, ClockInput::new(0.35, 0.0));
        assert_eq!(status.restart, Some(RestartReason::Initial));
        assert_eq!(status.target_frame, Some(3));
        assert_eq!(player.presented_frame(), Some(3));
        assert_eq!(shown(&player), Some(3));

        show(&mut player, ClockInput::new(0.95, 0.0));
        assert_eq!(player.presented_frame(), Some(9));

        let status = show(&mut player, ClockInput::new(1.2, 0.0).with_loop_mode(LoopMode::Loop));
        assert!(status.restart.is_some());
        assert_eq!(player.presented_frame(), Some(2));
        assert_eq!(shown(&player), Some(2));

        let mut recorder = Recorder::default();
        assert!(player.present(&mut recorder));
        assert_eq!(recorder.frames, vec![Some(2)]);
    }

    #[test]
    fn test_end_of_stream_without_loop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);

        show(&mut player, ClockInput::new(1.0, 0.0));
        assert_eq!(player.presented_frame(), Some(9));
        show(&mut player, ClockInput::new(1.0, 0.0).with_loop_mode(LoopMode::Loop));
        assert_eq!(player.presented_frame(), Some(0));
    }

    #[test]
    fn test_decode_failure_holds_previous_frame() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&movie_with_corrupt_frame(dir.path(), 4), &backend);

        show(&mut player, ClockInput::new(0.35, 0.0));
        assert_eq!(player.presented_frame(), Some(3));

        let status = show(&mut player, ClockInput::new(0.45, 0.0));
        assert_eq!(status.target_frame, Some(4));
        assert_eq!(player.presented_frame(), Some(3));
        assert_eq!(shown(&player), Some(3));
        assert_eq!(player.stats().decode_failures, 1);

        show(&mut player, ClockInput::new(0.55, 0.0));
        assert_eq!(player.presented_frame(), Some(5));
    }

    #[test]
    fn test_read_failure_holds_frame_until_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = ten_frame_movie(dir.path());
        let original = std::fs::read(&path).unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&path, &backend);

        show(&mut player, ClockInput::new(0.35, 0.0));
        assert_eq!(player.presented_frame(), Some(3));

        // Cut the file short underneath the open player
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(16)
            .unwrap();
        let status = show(&mut player, ClockInput::new(0.75, 0.0));
        assert_eq!(status.restart, Some(RestartReason::Seek));
        assert_eq!(status.target_frame, Some(7));
        assert_eq!(player.presented_frame(), Some(3));
        assert_eq!(shown(&player), Some(3));
        assert_eq!(player.stats().read_failures, 1);

        std::fs::write(&path, &original).unwrap();
        let status = show(&mut player, ClockInput::new(0.65, 0.0));
        assert_eq!(status.restart, Some(RestartReason::Seek));
        assert_eq!(player.presented_frame(), Some(6));
        assert_eq!(shown(&player), Some(6));
        assert_eq!(player.stats().read_failures, 1);
    }

    #[test]
    fn test_player_logs_through_configured_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let path = ten_frame_movie(dir.path());
        let backend = Arc::new(MemoryBackend::new());
        let logs = CapturedLogs::default();
        let config = LogConfig {
            output: LogOutput::Json,
            ..LogConfig::default()
        };

        tracing::subscriber::with_default(subscriber(&config, logs.clone()).unwrap(), || {
            let mut player = open(&path, &backend);
            show(&mut player, ClockInput::new(0.35, 0.0));
            player.dispose();
        });

        let contents = logs.contents();
        assert!(contents.contains("HapPlayer: opened"));
        assert!(contents.contains("HapPlayer: disposed"));
        assert!(contents.contains("\"target\":\"hap_player::video::player\""));
        // Restarts log at debug, below the default level
        assert!(!contents.contains("HapPlayer: restart"));
    }

    #[test]
    fn test_playback_is_monotonic_and_converges() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);

        let delta = 0.05;
        let mut time = 0.0;
        let mut forward = Vec::new();
        for _ in 0..12 {
            show(&mut player, ClockInput::new(time, delta));
            forward.extend(player.presented_frame());
            time += delta;
        }
        assert!(forward.windows(2).all(|w| w[0] <= w[1]));

        // Reverse from the current position
        let mut backward = Vec::new();
        for i in 0..8 {
            let status = show(&mut player, ClockInput::new(time, -delta));
            if i == 0 {
                assert_eq!(status.restart, Some(RestartReason::DirectionChange));
            }
            backward.extend(player.presented_frame());
            time -= delta;
        }
        assert!(backward.windows(2).all(|w| w[0] >= w[1]));

        // Pause and settle on the exact frame
        let status = show(&mut player, ClockInput::new(time, 0.0));
        assert_eq!(player.presented_frame(), status.target_frame);
    }

    #[test]
    fn test_restart_waits_for_decode() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);

        show(&mut player, ClockInput::new(0.0, 0.1));
        for t in [0.83, 0.12, 0.56] {
            let status = player.tick(&ClockInput::new(t, 0.1));
            assert_eq!(status.restart, Some(RestartReason::Seek));
            let latest = player.decoder.latest().unwrap();
            assert_eq!(Some(latest.frame_index), status.target_frame);
            player.flush();
        }
        assert_eq!(player.stats().restarts, 4);
    }

    #[test]
    fn test_external_time_uploads_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);

        let status = player.tick(&ClockInput::external(0.35));
        assert!(matches!(status.upload, UpdateStatus::Uploaded(3)));
        assert_eq!(status.presented_frame, Some(3));

        let status = player.tick(&ClockInput::external(0.55));
        assert_eq!(status.presented_frame, Some(5));
    }

    #[test]
    fn test_update_now() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);

        assert!(matches!(player.update_now(0.72), UpdateStatus::Uploaded(7)));
        assert_eq!(shown(&player), Some(7));
        assert!(matches!(player.update_now(0.72), UpdateStatus::Idle));
        assert!(matches!(player.update_now(0.15), UpdateStatus::Uploaded(1)));
    }

    #[test]
    fn test_sync_upload_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = ten_frame_movie(dir.path());
        let backend = Arc::new(MemoryBackend::new());
        let mut settings = PlayerSettings::new(&path);
        settings.upload_mode = UploadMode::Sync;
        let mut player = HapPlayer::open(&path, Arc::clone(&backend), &settings).unwrap();
        assert!(!player.is_async_upload());

        let status = player.tick(&ClockInput::new(0.25, 0.0));
        assert!(matches!(status.upload, UpdateStatus::Scheduled));
        assert_eq!(backend.uploads(), 0);

        assert!(matches!(player.end_of_frame(), UpdateStatus::Uploaded(2)));
        assert_eq!(shown(&player), Some(2));
    }

    #[test]
    fn test_async_failure_falls_back_to_sync() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);
        assert!(player.is_async_upload());

        backend.fail_next_uploads(1);
        player.tick(&ClockInput::new(0.35, 0.0));
        assert!(matches!(player.flush(), UpdateStatus::Failed(_)));
        assert!(!player.is_async_upload());
        assert_eq!(backend.live_textures(), 1);

        assert!(matches!(player.end_of_frame(), UpdateStatus::Uploaded(3)));
        assert_eq!(shown(&player), Some(3));
        assert_eq!(player.stats().upload_failures, 1);
    }

    #[test]
    fn test_external_texture() {
        let dir = tempfile::tempdir().unwrap();
        let path = ten_frame_movie(dir.path());
        let backend = Arc::new(MemoryBackend::new());
        let texture = Arc::new(
            backend
                .create_texture(&TextureDesc::new(8, 8, HapFormat::Hap), "host")
                .unwrap(),
        );
        let mut player = HapPlayer::open_with_texture(
            &path,
            Arc::clone(&backend),
            &PlayerSettings::new(&path),
            Arc::clone(&texture),
        )
        .unwrap();

        player.tick(&ClockInput::new(0.65, 0.0));
        player.end_of_frame();
        assert_eq!(texture_frame_index(&texture.pixels()), Some(6));

        drop(player);
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn test_dispose_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut player = open(&ten_frame_movie(dir.path()), &backend);
        show(&mut player, ClockInput::new(0.5, 0.1));
        assert_eq!(player.stats().open_files, 2);

        player.dispose();
        player.dispose();
        assert!(!player.is_valid());
        assert!(player.texture().is_none());
        assert_eq!(player.stats().open_files, 0);
        assert_eq!(backend.live_textures(), 0);

        // Ticking a disposed player is harmless
        let status = player.tick(&ClockInput::new(0.6, 0.1));
        assert!(status.target_frame.is_none());
        assert!(!player.present(&mut Recorder::default()));
    }

    #[test]
    fn test_dispose_without_any_upload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let player = open(&ten_frame_movie(dir.path()), &backend);
        drop(player);
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_open_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let settings = PlayerSettings::default();

        let missing = dir.path().join("missing.mov");
        assert!(matches!(
            HapPlayer::open(&missing, Arc::clone(&backend), &settings),
            Err(OpenError::Open { .. })
        ));

        let garbage = dir.path().join("garbage.mov");
        std::fs::write(&garbage, vec![0xAB; 64]).unwrap();
        assert!(matches!(
            HapPlayer::open(&garbage, Arc::clone(&backend), &settings),
            Err(OpenError::Malformed(_))
        ));

        let avc = dir.path().join("avc.mov");
        let mut builder = MovBuilder::hap(HapFormat::Hap, 8, 8, 3);
        builder.fourcc = *b"HapM";
        builder.write(&avc);
        assert!(matches!(
            HapPlayer::open(&avc, Arc::clone(&backend), &settings),
            Err(OpenError::UnsupportedCodec(_))
        ));
        assert_eq!(backend.live_textures(), 0);
    }
}
