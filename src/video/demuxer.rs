//! QuickTime container index for HAP movies
//!
//! Opens a `.mov`/`.mp4` file, validates its first video track, and builds a
//! frame index (presentation time, byte range, keyframe flag) from the sample
//! tables. The index is immutable once built and shared by the pipeline.

use std::fs::File;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::atoms::{self, ByteReader, FourCc};
use super::hap::HapFormat;
use super::texture::UploadError;
use crate::telemetry::PipelineStats;

/// Times within this distance of a frame start resolve to that frame
const TIME_EPSILON: f64 = 1e-6;

/// Errors that make a container unusable
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while reading container: {0}")]
    Io(#[from] io::Error),
    #[error("malformed container: {0}")]
    Malformed(String),
    #[error("no video track found")]
    NoVideoTrack,
    #[error("unsupported codec '{0}'")]
    UnsupportedCodec(String),
    #[error("container has no frames")]
    Empty,
    #[error("failed to create frame texture: {0}")]
    Texture(#[from] UploadError),
}

/// Stream metadata, zeroed for an invalid container
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    /// Codec subtype, `None` when the container is invalid
    pub format: Option<HapFormat>,
    pub frame_count: usize,
    /// Duration in seconds
    pub duration: f64,
    /// Average frame rate (fps)
    pub frame_rate: f64,
    pub is_valid: bool,
}

/// One decodable frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameIndexEntry {
    /// Presentation time in seconds
    pub pts: f64,
    /// Byte offset of the frame in the file
    pub offset: u64,
    /// Byte length of the frame
    pub size: u32,
    pub keyframe: bool,
}

/// An open file counted in the pipeline's open-handle gauge
pub(crate) struct StreamHandle {
    file: File,
    stats: Arc<PipelineStats>,
}

impl StreamHandle {
    fn new(file: File, stats: Arc<PipelineStats>) -> Self {
        stats.file_opened();
        Self { file, stats }
    }
}

impl Deref for StreamHandle {
    type Target = File;

    fn deref(&self) -> &File {
        &self.file
    }
}

impl DerefMut for StreamHandle {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stats.file_closed();
    }
}

/// Container index (demuxer)
///
/// Holds the file handle for the pipeline's lifetime. Readers get their own
/// handle through [`Demuxer::open_stream`].
pub struct Demuxer {
    path: PathBuf,
    file: Mutex<Option<StreamHandle>>,
    metadata: StreamMetadata,
    entries: Vec<FrameIndexEntry>,
    stats: Arc<PipelineStats>,
}

impl Demuxer {
    /// Open a container, returning an invalid demuxer on failure
    ///
    /// Check [`Demuxer::is_valid`] before building a pipeline on it.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::try_open(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to open HAP container {:?}: {}", path, e);
            Self::invalid(path, Arc::new(PipelineStats::new()))
        })
    }

    /// Open a container, returning the failure reason
    pub fn try_open<P: AsRef<Path>>(path: P) -> Result<Self, OpenError> {
        Self::try_open_with_stats(path, Arc::new(PipelineStats::new()))
    }

    /// Open a container that reports into existing pipeline counters
    pub fn try_open_with_stats<P: AsRef<Path>>(
        path: P,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| OpenError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut handle = StreamHandle::new(file, Arc::clone(&stats));

        let file_len = handle.metadata()?.len();
        let moov = atoms::read_moov(&mut handle, file_len)?;
        let track = parse_video_track(&moov, file_len)?;

        let format = HapFormat::from_fourcc(track.fourcc)
            .ok_or_else(|| OpenError::UnsupportedCodec(atoms::fourcc_str(&track.fourcc)))?;
        if track.width == 0 || track.height == 0 {
            return Err(OpenError::Malformed("zero frame dimensions".to_string()));
        }

        let entries = build_index(&track, file_len)?;
        if entries.is_empty() {
            return Err(OpenError::Empty);
        }

        let duration = track.duration_secs();
        let frame_rate = if duration > 0.0 {
            entries.len() as f64 / duration
        } else {
            0.0
        };

        let metadata = StreamMetadata {
            width: track.width,
            height: track.height,
            format: Some(format),
            frame_count: entries.len(),
            duration,
            frame_rate,
            is_valid: true,
        };

        tracing::info!(
            "Opened HAP container: {}x{} {:?}, {} frames @ {:.2}fps, duration: {:.2}s",
            metadata.width,
            metadata.height,
            format,
            metadata.frame_count,
            frame_rate,
            duration
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(handle)),
            metadata,
            entries,
            stats,
        })
    }

    fn invalid(path: &Path, stats: Arc<PipelineStats>) -> Self {
        Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
            metadata: StreamMetadata::default(),
            entries: Vec::new(),
            stats,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.metadata.is_valid
    }

    pub fn metadata(&self) -> StreamMetadata {
        self.metadata
    }

    pub fn width(&self) -> u32 {
        self.metadata.width
    }

    pub fn height(&self) -> u32 {
        self.metadata.height
    }

    pub fn format(&self) -> Option<HapFormat> {
        self.metadata.format
    }

    pub fn frame_count(&self) -> usize {
        self.metadata.frame_count
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.metadata.duration
    }

    pub fn frame_rate(&self) -> f64 {
        self.metadata.frame_rate
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[FrameIndexEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&FrameIndexEntry> {
        self.entries.get(index)
    }

    pub(crate) fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Index of the frame whose presentation interval contains `time`
    ///
    /// Times past the end resolve to the last frame and negative times to
    /// frame 0. Loop wrapping is the caller's job.
    pub fn frame_at(&self, time: f64) -> usize {
        self.entries
            .partition_point(|e| e.pts <= time + TIME_EPSILON)
            .saturating_sub(1)
    }

    /// Duplicate the container's file handle for a stream reader
    pub(crate) fn open_stream(&self) -> io::Result<StreamHandle> {
        let guard = self.file.lock();
        let handle = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "container is closed"))?;
        let file = handle.try_clone()?;
        Ok(StreamHandle::new(file, Arc::clone(&self.stats)))
    }

    /// Release the file handle; safe to call more than once
    pub fn dispose(&self) {
        if self.file.lock().take().is_some() {
            tracing::debug!("Demuxer: released {:?}", self.path);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.file.lock().is_none()
    }
}

impl std::fmt::Debug for Demuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demuxer")
            .field("path", &self.path)
            .field("metadata", &self.metadata)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Sample tables of the first video track
#[derive(Default)]
struct VideoTrack {
    fourcc: FourCc,
    width: u32,
    height: u32,
    timescale: u32,
    duration: u64,
    time_to_sample: Vec<(u32, u32)>,
    sync_samples: Option<Vec<u32>>,
    sample_to_chunk: Vec<(u32, u32)>,
    sample_sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
}

impl VideoTrack {
    fn total_ticks(&self) -> u64 {
        self.time_to_sample
            .iter()
            .fold(0u64, |total, &(count, delta)| {
                total.saturating_add(count as u64 * delta as u64)
            })
    }

    fn duration_secs(&self) -> f64 {
        let ticks = if self.duration > 0 {
            self.duration
        } else {
            self.total_ticks()
        };
        ticks as f64 / self.timescale as f64
    }
}

fn parse_video_track(moov: &[u8], file_len: u64) -> Result<VideoTrack, OpenError> {
    for atom in atoms::atoms(moov) {
        let trak = atom?;
        if trak.kind != atoms::TRAK {
            continue;
        }
        let Some(mdia) = atoms::find(trak.body, atoms::MDIA)? else {
            continue;
        };
        let Some(hdlr) = atoms::find(mdia.body, atoms::HDLR)? else {
            continue;
        };
        if parse_hdlr(hdlr.body)? != *b"vide" {
            continue;
        }
        return parse_media(mdia.body, file_len);
    }
    Err(OpenError::NoVideoTrack)
}

fn parse_media(mdia: &[u8], file_len: u64) -> Result<VideoTrack, OpenError> {
    let mut track = VideoTrack::default();

    let mdhd = atoms::find(mdia, atoms::MDHD)?
        .ok_or_else(|| OpenError::Malformed("missing 'mdhd'".to_string()))?;
    let (timescale, duration) = parse_mdhd(mdhd.body)?;
    if timescale == 0 {
        return Err(OpenError::Malformed("zero timescale".to_string()));
    }
    track.timescale = timescale;
    track.duration = duration;

    let stbl = atoms::find_path(mdia, &[atoms::MINF, atoms::STBL])?
        .ok_or_else(|| OpenError::Malformed("missing 'stbl'".to_string()))?;

    let mut have_offsets = false;
    for atom in atoms::atoms(stbl.body) {
        let atom = atom?;
        match atom.kind {
            atoms::STSD => {
                let (fourcc, width, height) = parse_stsd(atom.body)?;
                track.fourcc = fourcc;
                track.width = width;
                track.height = height;
            }
            atoms::STTS => track.time_to_sample = parse_pairs(atom.body, "stts")?,
            atoms::STSS => track.sync_samples = Some(parse_u32_list(atom.body, "stss")?),
            atoms::STSC => track.sample_to_chunk = parse_stsc(atom.body)?,
            atoms::STSZ => track.sample_sizes = parse_stsz(atom.body, file_len)?,
            atoms::STCO => {
                track.chunk_offsets = parse_u32_list(atom.body, "stco")?
                    .into_iter()
                    .map(u64::from)
                    .collect();
                have_offsets = true;
            }
            atoms::CO64 => {
                track.chunk_offsets = parse_co64(atom.body)?;
                have_offsets = true;
            }
            _ => {}
        }
    }

    if track.fourcc == [0; 4] {
        return Err(OpenError::Malformed("missing 'stsd'".to_string()));
    }
    if !have_offsets {
        return Err(OpenError::Malformed("missing chunk offsets".to_string()));
    }
    Ok(track)
}

fn parse_hdlr(body: &[u8]) -> Result<FourCc, OpenError> {
    let mut r = ByteReader::new(body, "hdlr");
    r.version_and_flags()?;
    r.skip(4)?; // component type / pre_defined
    r.fourcc()
}

fn parse_mdhd(body: &[u8]) -> Result<(u32, u64), OpenError> {
    let mut r = ByteReader::new(body, "mdhd");
    if r.version_and_flags()? == 1 {
        r.skip(16)?;
        let timescale = r.u32()?;
        Ok((timescale, r.u64()?))
    } else {
        r.skip(8)?;
        let timescale = r.u32()?;
        Ok((timescale, r.u32()? as u64))
    }
}

fn parse_stsd(body: &[u8]) -> Result<(FourCc, u32, u32), OpenError> {
    let mut r = ByteReader::new(body, "stsd");
    r.version_and_flags()?;
    if r.u32()? == 0 {
        return Err(OpenError::Malformed("empty sample description".to_string()));
    }
    r.skip(4)?; // entry size
    let fourcc = r.fourcc()?;
    // reserved, data reference index, version, revision, vendor, quality
    r.skip(6 + 2 + 16)?;
    let width = r.u16()? as u32;
    let height = r.u16()? as u32;
    Ok((fourcc, width, height))
}

fn parse_pairs(body: &[u8], context: &'static str) -> Result<Vec<(u32, u32)>, OpenError> {
    let mut r = ByteReader::new(body, context);
    r.version_and_flags()?;
    let count = r.entry_count(8)?;
    (0..count).map(|_| Ok((r.u32()?, r.u32()?))).collect()
}

fn parse_u32_list(body: &[u8], context: &'static str) -> Result<Vec<u32>, OpenError> {
    let mut r = ByteReader::new(body, context);
    r.version_and_flags()?;
    let count = r.entry_count(4)?;
    (0..count).map(|_| r.u32()).collect()
}

fn parse_co64(body: &[u8]) -> Result<Vec<u64>, OpenError> {
    let mut r = ByteReader::new(body, "co64");
    r.version_and_flags()?;
    let count = r.entry_count(8)?;
    (0..count).map(|_| r.u64()).collect()
}

/// Sample-to-chunk runs as (first chunk, samples per chunk)
fn parse_stsc(body: &[u8]) -> Result<Vec<(u32, u32)>, OpenError> {
    let mut r = ByteReader::new(body, "stsc");
    r.version_and_flags()?;
    let count = r.entry_count(12)?;
    (0..count)
        .map(|_| {
            let first_chunk = r.u32()?;
            let samples_per_chunk = r.u32()?;
            r.skip(4)?; // sample description index
            Ok((first_chunk, samples_per_chunk))
        })
        .collect()
}

fn parse_stsz(body: &[u8], file_len: u64) -> Result<Vec<u32>, OpenError> {
    let mut r = ByteReader::new(body, "stsz");
    r.version_and_flags()?;
    let uniform_size = r.u32()?;
    if uniform_size != 0 {
        let count = r.u32()?;
        // Every sample must fit in the file
        if count as u64 * uniform_size as u64 > file_len {
            return Err(OpenError::Malformed(format!(
                "stsz declares {} samples of {} bytes, more than the file holds",
                count, uniform_size
            )));
        }
        return Ok(vec![uniform_size; count as usize]);
    }
    let count = r.entry_count(4)?;
    (0..count).map(|_| r.u32()).collect()
}

/// Combine the sample tables into one entry per frame
fn build_index(track: &VideoTrack, file_len: u64) -> Result<Vec<FrameIndexEntry>, OpenError> {
    let sample_count = track.sample_sizes.len();

    // Presentation times
    let mut times = Vec::with_capacity(sample_count);
    let mut ticks = 0u64;
    'runs: for &(count, delta) in &track.time_to_sample {
        for _ in 0..count {
            if times.len() == sample_count {
                break 'runs;
            }
            times.push(ticks as f64 / track.timescale as f64);
            ticks = ticks.saturating_add(delta as u64);
        }
    }
    if times.len() < sample_count {
        return Err(OpenError::Malformed(
            "time-to-sample table is shorter than the sample count".to_string(),
        ));
    }

    // Byte offsets
    let chunk_count = track.chunk_offsets.len();
    let mut offsets = Vec::with_capacity(sample_count);
    for (run, &(first_chunk, samples_per_chunk)) in track.sample_to_chunk.iter().enumerate() {
        let first = (first_chunk as usize).saturating_sub(1);
        let end = track
            .sample_to_chunk
            .get(run + 1)
            .map_or(chunk_count, |&(next, _)| (next as usize).saturating_sub(1))
            .min(chunk_count);

        for &chunk_offset in track.chunk_offsets.get(first..end).unwrap_or(&[]) {
            let mut offset = chunk_offset;
            for _ in 0..samples_per_chunk {
                let Some(&size) = track.sample_sizes.get(offsets.len()) else {
                    break;
                };
                offsets.push(offset);
                offset = offset.checked_add(size as u64).ok_or_else(|| {
                    OpenError::Malformed("chunk extends past the addressable range".to_string())
                })?;
            }
        }
    }
    if offsets.len() < sample_count {
        return Err(OpenError::Malformed(
            "sample-to-chunk table does not cover every sample".to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(sample_count);
    for (i, (&size, (&pts, &offset))) in track
        .sample_sizes
        .iter()
        .zip(times.iter().zip(&offsets))
        .enumerate()
    {
        if offset.checked_add(size as u64).map_or(true, |end| end > file_len) {
            return Err(OpenError::Malformed(format!(
                "frame {} lies past the end of the file",
                i
            )));
        }
        let keyframe = track
            .sync_samples
            .as_ref()
            .map_or(true, |sync| sync.binary_search(&(i as u32 + 1)).is_ok());
        entries.push(FrameIndexEntry {
            pts,
            offset,
            size,
            keyframe,
        });
    }

    Ok(entries)
}
