//! HAP Player Library
//!
//! Plays HAP-encoded QuickTime movies into a GPU texture, driven by a
//! caller-owned playback clock. The pipeline is demuxer → stream reader →
//! decoder → texture updater; decode and upload run off the caller's thread.

pub mod settings;
pub mod telemetry;
pub mod video;

// Re-export commonly used types
pub use settings::{PlayerSettings, UploadMode};
pub use telemetry::{PipelineStats, PipelineStatsSnapshot};
pub use video::{
    ClockInput, Decoder, Demuxer, HapFormat, HapPlayer, LoopMode, MemoryBackend, OpenError,
    Presenter, StreamMetadata, StreamReader, TextureBackend, TextureUpdater, WgpuBackend,
};
