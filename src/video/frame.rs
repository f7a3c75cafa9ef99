//! Frame buffers passed between pipeline stages
//!
//! A [`CompressedFrame`] is what the stream reader hands the decoder; a
//! [`DecodedFrame`] holds GPU-native block-compressed texture data ready for
//! upload.

use bytes::Bytes;

use super::hap::HapFormat;

/// Raw Hap payload of one frame as stored in the container
#[derive(Debug, Clone)]
pub struct CompressedFrame {
    /// Frame index (0-based)
    pub index: usize,
    /// Reader generation the frame was read under
    pub generation: u64,
    pub data: Bytes,
}

/// A decoded frame with DXT/BC texture data
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Block-compressed texture data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    pub format: HapFormat,
    /// Presentation timestamp in seconds
    pub pts: f64,
    /// Frame index (0-based)
    pub frame_index: usize,
    /// Reader generation the frame was decoded under
    pub generation: u64,
    /// Publish sequence, strictly increasing per decoder
    pub sequence: u64,
}
