//! Pipeline counters
//!
//! Read, decode and upload failures are absorbed inside the pipeline to keep
//! playback running. They are counted here so hosts can still observe them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Shared counters for one playback pipeline
///
/// Wrapped in `Arc<PipelineStats>` and shared by every pipeline stage.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_read: AtomicU64,
    seeks: AtomicU64,
    read_failures: AtomicU64,
    frames_decoded: AtomicU64,
    decode_failures: AtomicU64,
    stale_decodes: AtomicU64,
    uploads: AtomicU64,
    upload_failures: AtomicU64,
    upload_time_us: AtomicU64,
    restarts: AtomicU64,
    open_files: AtomicI64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PipelineStatsSnapshot {
    /// Compressed frames read from disk
    pub frames_read: u64,
    /// Positional seeks issued by the stream reader
    pub seeks: u64,
    /// I/O failures while reading frame bytes
    pub read_failures: u64,
    /// Frames successfully decompressed
    pub frames_decoded: u64,
    /// Frames skipped because their payload was corrupt
    pub decode_failures: u64,
    /// Decodes dropped because a restart superseded them
    pub stale_decodes: u64,
    /// Completed texture uploads
    pub uploads: u64,
    /// Failed texture uploads
    pub upload_failures: u64,
    /// Duration of the last upload in microseconds
    pub last_upload_us: u64,
    /// Pipeline restarts (seek, speed or direction change)
    pub restarts: u64,
    /// File handles currently held by the pipeline
    pub open_files: i64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, seeked: bool) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        if seeked {
            self.seeks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_decode(&self) {
        self.stale_decodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upload(&self, elapsed: Duration) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.upload_time_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_upload_failure(&self) {
        self.upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn file_opened(&self) {
        self.open_files.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn file_closed(&self) {
        self.open_files.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of file handles currently open for this pipeline
    pub fn open_files(&self) -> i64 {
        self.open_files.load(Ordering::Acquire)
    }

    /// Copy all counters
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            stale_decodes: self.stale_decodes.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            last_upload_us: self.upload_time_us.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            open_files: self.open_files.load(Ordering::Acquire),
        }
    }
}

impl PipelineStatsSnapshot {
    /// Last upload duration in milliseconds
    pub fn last_upload_ms(&self) -> f64 {
        self.last_upload_us as f64 / 1000.0
    }
}
