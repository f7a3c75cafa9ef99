//! HAP video pipeline
//!
//! Container parsing, look-ahead reading, Hap decompression and GPU texture
//! upload, tied together by [`HapPlayer`].

mod atoms;
mod cursor;
mod decoder;
mod demuxer;
mod frame;
mod hap;
mod player;
mod stream_reader;
mod texture;
mod updater;

#[cfg(test)]
pub(crate) mod test_support;

pub use cursor::{detect_restart, Direction, LoopMode, PlaybackCursor, RestartReason};
pub use decoder::{DecodeCompletion, DecodeTicket, Decoder};
pub use demuxer::{Demuxer, FrameIndexEntry, OpenError, StreamMetadata};
pub use frame::{CompressedFrame, DecodedFrame};
pub use hap::{decode_frame, Compressor, DecodeError, HapFormat};
pub use player::{ClockInput, HapPlayer, Presenter, TickStatus};
pub use stream_reader::{ReadError, StreamReader};
pub use texture::{
    MemoryBackend, MemoryTexture, TextureBackend, TextureDesc, UploadError, WgpuBackend,
    WgpuTexture,
};
pub use updater::{
    create_updater, AsyncTextureUpdater, SyncTextureUpdater, TextureUpdater, UpdateStatus,
};
