//! Helpers that write minimal QuickTime files carrying Hap frames.
//!
//! Every frame's texture bytes are filled with its frame index so tests can
//! tell which frame ended up on a texture.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use super::hap::HapFormat;

/// Hap section with a 4-byte header, or the 8-byte form for large bodies
pub(crate) fn section(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    if body.is_empty() || body.len() >= 1 << 24 {
        out.extend_from_slice(&[0, 0, 0, kind]);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    } else {
        let len = body.len() as u32;
        out.extend_from_slice(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, kind]);
    }
    out.extend_from_slice(body);
    out
}

/// Complex (chunked) Hap frame with every chunk Snappy compressed
pub(crate) fn complex_section(format: HapFormat, chunks: &[&[u8]]) -> Vec<u8> {
    let compressed: Vec<Vec<u8>> = chunks
        .iter()
        .map(|chunk| snap::raw::Encoder::new().compress_vec(chunk).unwrap())
        .collect();

    let compressors = vec![0x0Bu8; chunks.len()];
    let sizes: Vec<u8> = compressed
        .iter()
        .flat_map(|c| (c.len() as u32).to_le_bytes())
        .collect();

    let instructions = [section(0x02, &compressors), section(0x03, &sizes)].concat();
    let body = [section(0x01, &instructions), compressed.concat()].concat();
    section(0xC0 | format.texture_type(), &body)
}

/// Texture bytes for one frame, every byte set to the frame index
pub(crate) fn frame_texture(format: HapFormat, width: u32, height: u32, index: usize) -> Vec<u8> {
    vec![index as u8; format.frame_size(width, height)]
}

/// Snappy compressed Hap frame whose texture encodes `index`
pub(crate) fn hap_frame(format: HapFormat, width: u32, height: u32, index: usize) -> Vec<u8> {
    let texture = frame_texture(format, width, height, index);
    let compressed = snap::raw::Encoder::new().compress_vec(&texture).unwrap();
    section(0xB0 | format.texture_type(), &compressed)
}

/// Frame whose payload fails to decompress
pub(crate) fn corrupt_frame(format: HapFormat) -> Vec<u8> {
    section(0xB0 | format.texture_type(), &[0x20, 0xF0, 0x01, 0x02])
}

/// Description of a movie to write
pub(crate) struct MovBuilder {
    pub fourcc: [u8; 4],
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub sample_durations: Vec<u32>,
    pub samples: Vec<Vec<u8>>,
    /// 1-based sample numbers; `None` writes no `stss` (all keyframes)
    pub keyframes: Option<Vec<u32>>,
    pub samples_per_chunk: usize,
    pub use_co64: bool,
}

impl MovBuilder {
    /// `count` Hap frames of `duration` timescale units each
    pub fn hap(format: HapFormat, width: u32, height: u32, count: usize) -> Self {
        Self {
            fourcc: format.fourcc(),
            width,
            height,
            timescale: 1000,
            sample_durations: vec![100; count],
            samples: (0..count)
                .map(|i| hap_frame(format, width, height, i))
                .collect(),
            keyframes: None,
            samples_per_chunk: 1,
            use_co64: false,
        }
    }

    pub fn write(&self, path: &Path) {
        fs::write(path, self.build()).unwrap();
    }

    pub fn build(&self) -> Vec<u8> {
        let mut ftyp = b"qt  ".to_vec();
        ftyp.extend_from_slice(&[0, 0, 2, 0]);
        ftyp.extend_from_slice(b"qt  ");
        let ftyp = atom(b"ftyp", &ftyp);
        let mdat_body = self.samples.concat();
        let mdat = atom(b"mdat", &mdat_body);
        let data_start = (ftyp.len() + 8) as u64;

        let mut chunk_offsets = Vec::new();
        let mut offset = data_start;
        for chunk in self.samples.chunks(self.samples_per_chunk.max(1)) {
            chunk_offsets.push(offset);
            offset += chunk.iter().map(|s| s.len() as u64).sum::<u64>();
        }

        let moov = atom(b"moov", &[self.mvhd(), self.trak(&chunk_offsets)].concat());
        [ftyp, mdat, moov].concat()
    }

    fn total_duration(&self) -> u32 {
        self.sample_durations.iter().sum()
    }

    fn mvhd(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0; 8]);
        body.extend_from_slice(&self.timescale.to_be_bytes());
        body.extend_from_slice(&self.total_duration().to_be_bytes());
        body.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        body.extend_from_slice(&0x0100u16.to_be_bytes());
        body.extend_from_slice(&[0; 10 + 36 + 24]);
        body.extend_from_slice(&2u32.to_be_bytes());
        full_atom(b"mvhd", 0, &body)
    }

    fn trak(&self, chunk_offsets: &[u64]) -> Vec<u8> {
        let tkhd = full_atom(b"tkhd", 7, &[0; 80]);

        let mut mdhd = Vec::new();
        mdhd.extend_from_slice(&[0; 8]);
        mdhd.extend_from_slice(&self.timescale.to_be_bytes());
        mdhd.extend_from_slice(&self.total_duration().to_be_bytes());
        mdhd.extend_from_slice(&[0; 4]);
        let mdhd = full_atom(b"mdhd", 0, &mdhd);

        let mut hdlr = b"mhlr".to_vec();
        hdlr.extend_from_slice(b"vide");
        hdlr.extend_from_slice(&[0; 13]);
        let hdlr = full_atom(b"hdlr", 0, &hdlr);

        let vmhd = full_atom(b"vmhd", 1, &[0; 8]);
        let minf = atom(b"minf", &[vmhd, self.stbl(chunk_offsets)].concat());
        let mdia = atom(b"mdia", &[mdhd, hdlr, minf].concat());
        atom(b"trak", &[tkhd, mdia].concat())
    }

    fn stbl(&self, chunk_offsets: &[u64]) -> Vec<u8> {
        let mut entry = Vec::new();
        entry.extend_from_slice(&[0; 6]);
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0; 16]);
        entry.extend_from_slice(&(self.width as u16).to_be_bytes());
        entry.extend_from_slice(&(self.height as u16).to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        entry.extend_from_slice(&[0; 4]);
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0; 32]);
        entry.extend_from_slice(&24u16.to_be_bytes());
        entry.extend_from_slice(&(-1i16).to_be_bytes());
        let mut stsd = 1u32.to_be_bytes().to_vec();
        stsd.extend_from_slice(&atom(&self.fourcc, &entry));
        let stsd = full_atom(b"stsd", 0, &stsd);

        // Run-length encode sample durations
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for &duration in &self.sample_durations {
            match runs.last_mut() {
                Some((count, delta)) if *delta == duration => *count += 1,
                _ => runs.push((1, duration)),
            }
        }
        let mut stts = (runs.len() as u32).to_be_bytes().to_vec();
        for (count, delta) in runs {
            stts.extend_from_slice(&count.to_be_bytes());
            stts.extend_from_slice(&delta.to_be_bytes());
        }
        let stts = full_atom(b"stts", 0, &stts);

        let spc = self.samples_per_chunk.max(1) as u32;
        let mut stsc_entries = vec![(1u32, spc)];
        let remainder = (self.samples.len() % spc as usize) as u32;
        if remainder != 0 && chunk_offsets.len() > 1 {
            stsc_entries.push((chunk_offsets.len() as u32, remainder));
        } else if remainder != 0 {
            stsc_entries[0].1 = remainder;
        }
        let mut stsc = (stsc_entries.len() as u32).to_be_bytes().to_vec();
        for (first_chunk, samples) in stsc_entries {
            stsc.extend_from_slice(&first_chunk.to_be_bytes());
            stsc.extend_from_slice(&samples.to_be_bytes());
            stsc.extend_from_slice(&1u32.to_be_bytes());
        }
        let stsc = full_atom(b"stsc", 0, &stsc);

        let uniform = self
            .samples
            .first()
            .filter(|first| self.samples.iter().all(|s| s.len() == first.len()))
            .map(|first| first.len() as u32);
        let mut stsz = uniform.unwrap_or(0).to_be_bytes().to_vec();
        stsz.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());
        if uniform.is_none() {
            for sample in &self.samples {
                stsz.extend_from_slice(&(sample.len() as u32).to_be_bytes());
            }
        }
        let stsz = full_atom(b"stsz", 0, &stsz);

        let mut offsets = (chunk_offsets.len() as u32).to_be_bytes().to_vec();
        for &offset in chunk_offsets {
            if self.use_co64 {
                offsets.extend_from_slice(&offset.to_be_bytes());
            } else {
                offsets.extend_from_slice(&(offset as u32).to_be_bytes());
            }
        }
        let offsets = full_atom(if self.use_co64 { b"co64" } else { b"stco" }, 0, &offsets);

        let mut children = vec![stsd, stts, stsc, stsz, offsets];
        if let Some(keyframes) = &self.keyframes {
            let mut stss = (keyframes.len() as u32).to_be_bytes().to_vec();
            for k in keyframes {
                stss.extend_from_slice(&k.to_be_bytes());
            }
            children.push(full_atom(b"stss", 0, &stss));
        }
        atom(b"stbl", &children.concat())
    }
}

fn atom(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn full_atom(kind: &[u8; 4], flags: u32, body: &[u8]) -> Vec<u8> {
    let mut full = vec![0, (flags >> 16) as u8, (flags >> 8) as u8, flags as u8];
    full.extend_from_slice(body);
    atom(kind, &full)
}

/// 10 DXT1 frames of 8x8 at 0.0..0.9s, duration 1.0s
pub(crate) fn ten_frame_movie(dir: &Path) -> PathBuf {
    let path = dir.join("ten_frames.mov");
    MovBuilder::hap(HapFormat::Hap, 8, 8, 10).write(&path);
    path
}

/// Same as [`ten_frame_movie`] with frame `corrupt` replaced by garbage
pub(crate) fn movie_with_corrupt_frame(dir: &Path, corrupt: usize) -> PathBuf {
    let path = dir.join("corrupt_frame.mov");
    let mut builder = MovBuilder::hap(HapFormat::Hap, 8, 8, 10);
    builder.samples[corrupt] = corrupt_frame(HapFormat::Hap);
    builder.write(&path);
    path
}

/// Frame index encoded in a decoded texture
pub(crate) fn texture_frame_index(data: &[u8]) -> Option<usize> {
    data.first().map(|&b| b as usize)
}

/// Log sink that keeps everything written to it
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
