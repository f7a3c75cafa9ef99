//! QuickTime atom (ISO BMFF box) reading
//!
//! Only the pieces needed to locate `moov` in a file and walk the sample
//! tables of one track. Everything under `moov` is parsed from memory.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use super::demuxer::OpenError;

pub(crate) type FourCc = [u8; 4];

pub(crate) const MOOV: FourCc = *b"moov";
pub(crate) const TRAK: FourCc = *b"trak";
pub(crate) const MDIA: FourCc = *b"mdia";
pub(crate) const MDHD: FourCc = *b"mdhd";
pub(crate) const HDLR: FourCc = *b"hdlr";
pub(crate) const MINF: FourCc = *b"minf";
pub(crate) const STBL: FourCc = *b"stbl";
pub(crate) const STSD: FourCc = *b"stsd";
pub(crate) const STTS: FourCc = *b"stts";
pub(crate) const STSS: FourCc = *b"stss";
pub(crate) const STSC: FourCc = *b"stsc";
pub(crate) const STSZ: FourCc = *b"stsz";
pub(crate) const STCO: FourCc = *b"stco";
pub(crate) const CO64: FourCc = *b"co64";

pub(crate) fn fourcc_str(kind: &FourCc) -> String {
    kind.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

/// One atom borrowed from an in-memory parent
pub(crate) struct Atom<'a> {
    pub kind: FourCc,
    pub body: &'a [u8],
}

/// Iterator over the atoms packed back to back in `data`
pub(crate) struct Atoms<'a> {
    data: &'a [u8],
}

pub(crate) fn atoms(data: &[u8]) -> Atoms<'_> {
    Atoms { data }
}

impl<'a> Iterator for Atoms<'a> {
    type Item = Result<Atom<'a>, OpenError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let result = split_atom(self.data);
        match result {
            Ok((atom, rest)) => {
                self.data = rest;
                Some(Ok(atom))
            }
            Err(e) => {
                self.data = &[];
                Some(Err(e))
            }
        }
    }
}

fn split_atom(data: &[u8]) -> Result<(Atom<'_>, &[u8]), OpenError> {
    let mut reader = ByteReader::new(data, "atom header");
    let size32 = reader.u32()?;
    let kind = reader.fourcc()?;

    let (header, size) = match size32 {
        0 => (8, data.len() as u64),
        1 => (16, reader.u64()?),
        n => (8, n as u64),
    };

    if size < header as u64 || size > data.len() as u64 {
        return Err(OpenError::Malformed(format!(
            "atom '{}' has invalid size {}",
            fourcc_str(&kind),
            size
        )));
    }

    let size = size as usize;
    Ok((
        Atom {
            kind,
            body: &data[header..size],
        },
        &data[size..],
    ))
}

/// Find the first child atom of the given kind
pub(crate) fn find<'a>(data: &'a [u8], kind: FourCc) -> Result<Option<Atom<'a>>, OpenError> {
    for atom in atoms(data) {
        let atom = atom?;
        if atom.kind == kind {
            return Ok(Some(atom));
        }
    }
    Ok(None)
}

/// Follow a chain of nested atoms, e.g. `mdia/minf/stbl`
pub(crate) fn find_path<'a>(
    data: &'a [u8],
    path: &[FourCc],
) -> Result<Option<Atom<'a>>, OpenError> {
    let mut current = data;
    let mut found = None;
    for &kind in path {
        match find(current, kind)? {
            Some(atom) => {
                current = atom.body;
                found = Some(atom);
            }
            None => return Ok(None),
        }
    }
    Ok(found)
}

/// Scan the top level of a file and return the body of its `moov` atom
///
/// `mdat` and other large atoms are skipped by seeking.
pub(crate) fn read_moov(file: &mut File, file_len: u64) -> Result<Vec<u8>, OpenError> {
    let mut position = 0u64;

    while position + 8 <= file_len {
        file.seek(SeekFrom::Start(position))?;

        let mut header = [0u8; 8];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let kind: FourCc = [header[4], header[5], header[6], header[7]];

        let (header_len, size) = match size32 {
            0 => (8u64, file_len - position),
            1 => {
                let mut large = [0u8; 8];
                file.read_exact(&mut large)?;
                (16u64, u64::from_be_bytes(large))
            }
            n => (8u64, n as u64),
        };

        if size < header_len || size > file_len - position {
            return Err(OpenError::Malformed(format!(
                "top-level atom '{}' has invalid size {}",
                fourcc_str(&kind),
                size
            )));
        }

        if kind == MOOV {
            let mut body = vec![0u8; (size - header_len) as usize];
            file.read_exact(&mut body)?;
            return Ok(body);
        }

        position += size;
    }

    Err(OpenError::Malformed("no 'moov' atom".to_string()))
}

/// Big-endian reader over an atom body
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self { data, pos: 0, context }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OpenError> {
        if self.data.len() - self.pos < n {
            return Err(OpenError::Malformed(format!(
                "unexpected end of {} data",
                self.context
            )));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), OpenError> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, OpenError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, OpenError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, OpenError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, OpenError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn fourcc(&mut self) -> Result<FourCc, OpenError> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// Skip the version/flags word of a full atom, returning the version
    pub fn version_and_flags(&mut self) -> Result<u8, OpenError> {
        let version = self.u8()?;
        self.skip(3)?;
        Ok(version)
    }

    /// Read an entry count, rejecting counts the remaining bytes cannot hold
    pub fn entry_count(&mut self, entry_size: usize) -> Result<usize, OpenError> {
        let count = self.u32()? as usize;
        let remaining = self.data.len() - self.pos;
        if count.saturating_mul(entry_size) > remaining {
            return Err(OpenError::Malformed(format!(
                "{} entry count {} exceeds atom size",
                self.context, count
            )));
        }
        Ok(count)
    }
}
