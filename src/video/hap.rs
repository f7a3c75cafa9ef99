//! HAP video codec support
//!
//! HAP is a GPU-accelerated video codec that stores frames in DXT/S3TC compressed
//! texture formats, allowing direct GPU upload without CPU decompression.
//!
//! HAP Variants:
//! - HAP: DXT1 (BC1) - RGB, no alpha, 4:1 compression
//! - HAP Alpha: DXT5 (BC3) - RGBA, with alpha, 4:1 compression
//! - HAP Q: Scaled YCoCg DXT5 (BC3) - higher quality
//! - HAP Alpha-Only: RGTC1 (BC4) - single channel
//! - HAP R: BPTC (BC7) - high quality RGBA
//!
//! HAP frames can be compressed with Snappy, either as a whole or split into
//! independently compressed chunks.
//! Format reference: https://github.com/Vidvox/hap/blob/master/documentation/HapVideoDRAFT.md

/// HAP texture format variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HapFormat {
    /// DXT1/BC1 - RGB, no alpha (standard Hap)
    Hap,
    /// DXT5/BC3 - RGBA with alpha (Hap Alpha)
    HapAlpha,
    /// Scaled YCoCg DXT5 (Hap Q)
    HapQ,
    /// RGTC1/BC4 - alpha channel only
    HapAlphaOnly,
    /// BPTC/BC7 - RGBA (Hap R)
    HapR,
}

impl HapFormat {
    /// Get the wgpu texture format for this HAP variant
    pub fn texture_format(&self) -> wgpu::TextureFormat {
        match self {
            HapFormat::Hap => wgpu::TextureFormat::Bc1RgbaUnorm,
            HapFormat::HapAlpha => wgpu::TextureFormat::Bc3RgbaUnorm,
            HapFormat::HapQ => wgpu::TextureFormat::Bc3RgbaUnorm, // YCoCg uses BC3
            HapFormat::HapAlphaOnly => wgpu::TextureFormat::Bc4RUnorm,
            HapFormat::HapR => wgpu::TextureFormat::Bc7RgbaUnorm,
        }
    }

    /// Get bytes per block (4x4 pixels)
    pub fn bytes_per_block(&self) -> usize {
        match self {
            HapFormat::Hap => 8,           // BC1: 8 bytes per 4x4 block
            HapFormat::HapAlpha => 16,     // BC3: 16 bytes per 4x4 block
            HapFormat::HapQ => 16,         // BC3: 16 bytes per 4x4 block
            HapFormat::HapAlphaOnly => 8,  // BC4: 8 bytes per 4x4 block
            HapFormat::HapR => 16,         // BC7: 16 bytes per 4x4 block
        }
    }

    /// Parse from the QuickTime sample description fourcc
    ///
    /// `HapM` (Hap Q Alpha) needs two textures and is not supported.
    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"Hap1" => Some(HapFormat::Hap),
            b"Hap5" => Some(HapFormat::HapAlpha),
            b"HapY" => Some(HapFormat::HapQ),
            b"HapA" => Some(HapFormat::HapAlphaOnly),
            b"Hap7" => Some(HapFormat::HapR),
            _ => None,
        }
    }

    /// The QuickTime sample description fourcc
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            HapFormat::Hap => *b"Hap1",
            HapFormat::HapAlpha => *b"Hap5",
            HapFormat::HapQ => *b"HapY",
            HapFormat::HapAlphaOnly => *b"HapA",
            HapFormat::HapR => *b"Hap7",
        }
    }

    /// Parse from the lower nibble of a section type byte
    pub fn from_texture_type(texture_type: u8) -> Option<Self> {
        match texture_type & 0x0F {
            0x0B => Some(HapFormat::Hap),
            0x0E => Some(HapFormat::HapAlpha),
            0x0F => Some(HapFormat::HapQ),
            0x01 => Some(HapFormat::HapAlphaOnly),
            0x0C => Some(HapFormat::HapR),
            _ => None,
        }
    }

    /// Lower nibble of the section type byte for this format
    pub fn texture_type(&self) -> u8 {
        match self {
            HapFormat::Hap => 0x0B,
            HapFormat::HapAlpha => 0x0E,
            HapFormat::HapQ => 0x0F,
            HapFormat::HapAlphaOnly => 0x01,
            HapFormat::HapR => 0x0C,
        }
    }

    /// Size in bytes of one decoded frame (dimensions rounded up to whole blocks)
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let blocks_wide = (width as usize + 3) / 4;
        let blocks_high = (height as usize + 3) / 4;
        blocks_wide * blocks_high * self.bytes_per_block()
    }
}

/// Second-stage compressor (upper 4 bits of the section type byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// Raw texture data
    Uncompressed,
    /// Snappy compressed as a single block
    Snappy,
    /// Split into chunks described by a decode instructions container
    Complex,
}

impl Compressor {
    pub fn from_type_byte(byte: u8) -> Option<Self> {
        match byte & 0xF0 {
            0xA0 => Some(Compressor::Uncompressed),
            0xB0 => Some(Compressor::Snappy),
            0xC0 => Some(Compressor::Complex),
            _ => None,
        }
    }
}

/// Errors for a single frame's compressed payload
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated section: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown texture type 0x{0:02x}")]
    UnknownTextureType(u8),
    #[error("unknown compressor 0x{0:02x}")]
    UnknownCompressor(u8),
    #[error("unsupported section type 0x{0:02x}")]
    UnsupportedSection(u8),
    #[error("frame is {found:?} but the stream is {expected:?}")]
    FormatMismatch { expected: HapFormat, found: HapFormat },
    #[error("malformed chunk table: {0}")]
    MalformedChunks(&'static str),
    #[error("snappy decompression failed: {0}")]
    Snappy(#[from] snap::Error),
    #[error("decoded {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

// Section types inside a complex frame
const SECTION_MULTIPLE_IMAGES: u8 = 0x0D;
const SECTION_DECODE_INSTRUCTIONS: u8 = 0x01;
const SECTION_COMPRESSOR_TABLE: u8 = 0x02;
const SECTION_CHUNK_SIZE_TABLE: u8 = 0x03;
const SECTION_CHUNK_OFFSET_TABLE: u8 = 0x04;

// Per-chunk compressor codes
const CHUNK_UNCOMPRESSED: u8 = 0x0A;
const CHUNK_SNAPPY: u8 = 0x0B;

struct Section<'a> {
    kind: u8,
    body: &'a [u8],
}

/// Parse one section header, returning the section and the bytes after it
///
/// Two header layouts exist:
/// - 4 bytes: 24-bit little-endian length, type byte
/// - 8 bytes: three zero bytes, type byte, 32-bit little-endian length
fn read_section(data: &[u8]) -> Result<(Section<'_>, &[u8]), DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4,
            available: data.len(),
        });
    }

    let length_24bit =
        (data[0] as usize) | ((data[1] as usize) << 8) | ((data[2] as usize) << 16);
    let kind = data[3];

    let (header, length) = if length_24bit == 0 {
        if data.len() < 8 {
            return Err(DecodeError::Truncated {
                needed: 8,
                available: data.len(),
            });
        }
        let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        (8, length)
    } else {
        (4, length_24bit)
    };

    let end = header + length;
    if data.len() < end {
        return Err(DecodeError::Truncated {
            needed: end,
            available: data.len(),
        });
    }

    Ok((
        Section {
            kind,
            body: &data[header..end],
        },
        &data[end..],
    ))
}

fn read_u32_table(body: &[u8]) -> Result<Vec<u32>, DecodeError> {
    if body.len() % 4 != 0 {
        return Err(DecodeError::MalformedChunks("table length is not a multiple of 4"));
    }
    Ok(body
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Decompress Snappy data, appending to `out`
///
/// The length header is checked against `limit` before allocating.
fn decompress_snappy_into(
    compressed: &[u8],
    out: &mut Vec<u8>,
    limit: usize,
) -> Result<(), DecodeError> {
    let length = snap::raw::decompress_len(compressed)?;
    let start = out.len();
    if start + length > limit {
        return Err(DecodeError::SizeMismatch {
            expected: limit,
            actual: start + length,
        });
    }
    out.resize(start + length, 0);
    let written = snap::raw::Decoder::new().decompress(compressed, &mut out[start..])?;
    out.truncate(start + written);
    Ok(())
}

fn decode_chunks(body: &[u8], out: &mut Vec<u8>, limit: usize) -> Result<(), DecodeError> {
    let (instructions, frame_data) = read_section(body)?;
    if instructions.kind != SECTION_DECODE_INSTRUCTIONS {
        return Err(DecodeError::MalformedChunks("missing decode instructions"));
    }

    let mut compressors: Option<&[u8]> = None;
    let mut sizes: Option<Vec<u32>> = None;
    let mut offsets: Option<Vec<u32>> = None;

    let mut rest = instructions.body;
    while !rest.is_empty() {
        let (section, next) = read_section(rest)?;
        match section.kind {
            SECTION_COMPRESSOR_TABLE => compressors = Some(section.body),
            SECTION_CHUNK_SIZE_TABLE => sizes = Some(read_u32_table(section.body)?),
            SECTION_CHUNK_OFFSET_TABLE => offsets = Some(read_u32_table(section.body)?),
            _ => {}
        }
        rest = next;
    }

    let compressors = compressors.ok_or(DecodeError::MalformedChunks("missing compressor table"))?;
    let sizes = sizes.ok_or(DecodeError::MalformedChunks("missing chunk size table"))?;
    if sizes.len() != compressors.len() {
        return Err(DecodeError::MalformedChunks("table lengths differ"));
    }
    if offsets.as_ref().is_some_and(|o| o.len() != sizes.len()) {
        return Err(DecodeError::MalformedChunks("table lengths differ"));
    }

    let mut position = 0usize;
    for (i, (&compressor, &size)) in compressors.iter().zip(&sizes).enumerate() {
        let start = offsets.as_ref().map_or(position, |o| o[i] as usize);
        let end = start + size as usize;
        if end > frame_data.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: frame_data.len(),
            });
        }
        let chunk = &frame_data[start..end];

        match compressor {
            CHUNK_UNCOMPRESSED => out.extend_from_slice(chunk),
            CHUNK_SNAPPY => decompress_snappy_into(chunk, out, limit)?,
            other => return Err(DecodeError::UnknownCompressor(other)),
        }
        position = end;
    }

    Ok(())
}

/// Decode one Hap frame into raw block-compressed texture data
///
/// `out` is cleared and reused so the caller can recycle buffers between
/// frames. The frame must match the stream's declared format and size.
pub fn decode_frame(
    packet: &[u8],
    expected: HapFormat,
    width: u32,
    height: u32,
    out: &mut Vec<u8>,
) -> Result<(), DecodeError> {
    let (section, _) = read_section(packet)?;
    if section.kind == SECTION_MULTIPLE_IMAGES {
        return Err(DecodeError::UnsupportedSection(section.kind));
    }

    let found = HapFormat::from_texture_type(section.kind)
        .ok_or(DecodeError::UnknownTextureType(section.kind & 0x0F))?;
    if found != expected {
        return Err(DecodeError::FormatMismatch { expected, found });
    }
    let compressor = Compressor::from_type_byte(section.kind)
        .ok_or(DecodeError::UnknownCompressor(section.kind >> 4))?;

    let expected_size = expected.frame_size(width, height);
    out.clear();
    match compressor {
        Compressor::Uncompressed => out.extend_from_slice(section.body),
        Compressor::Snappy => decompress_snappy_into(section.body, out, expected_size)?,
        Compressor::Complex => decode_chunks(section.body, out, expected_size)?,
    }

    if out.len() != expected_size {
        return Err(DecodeError::SizeMismatch {
            expected: expected_size,
            actual: out.len(),
        });
    }
    Ok(())
}
