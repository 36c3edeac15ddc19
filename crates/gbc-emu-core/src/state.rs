//! Tagged-section binary streams used for snapshots and battery saves.
//!
//! A stream is a sequence of sections, each a 4-byte ASCII tag followed by a
//! little-endian `u32` payload length and the payload itself, terminated by
//! an `END ` section. Readers look sections up by tag, so order does not
//! matter, but unknown and duplicated tags are rejected.

use std::collections::HashMap;

use crate::error::StateError;

pub const END_TAG: [u8; 4] = *b"END ";

/// Implemented by components that can be written into and restored from a
/// snapshot section.
pub trait Snapshot {
    fn save_state(&self, w: &mut StateWriter);
    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError>;
}

#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    /// Raw bytes with no length prefix; the reader must know the size.
    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed bytes.
    pub fn blob(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.bytes(v);
    }

    /// Write one tagged section whose payload is produced by `f`.
    pub fn section(&mut self, tag: &[u8; 4], f: impl FnOnce(&mut StateWriter)) {
        let mut inner = StateWriter::new();
        f(&mut inner);
        self.buf.extend_from_slice(tag);
        self.u32(inner.buf.len() as u32);
        self.buf.extend_from_slice(&inner.buf);
    }

    pub fn end(&mut self) {
        self.buf.extend_from_slice(&END_TAG);
        self.u32(0);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over one section payload.
#[derive(Debug, Clone)]
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
    section: &'static str,
}

impl<'a> StateReader<'a> {
    pub fn new(data: &'a [u8], section: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            section,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StateError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(StateError::Truncated(self.section))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], StateError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, StateError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, StateError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, StateError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, StateError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, StateError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, StateError> {
        Ok(f32::from_bits(u32::from_le_bytes(self.array()?)))
    }

    /// Fill `out` with exactly `out.len()` bytes.
    pub fn bytes_into(&mut self, out: &mut [u8]) -> Result<(), StateError> {
        out.copy_from_slice(self.take(out.len())?);
        Ok(())
    }

    /// Read a length-prefixed blob whose length must equal `expected`.
    pub fn blob_exact(&mut self, what: &'static str, out: &mut [u8]) -> Result<(), StateError> {
        let len = self.u32()? as usize;
        if len != out.len() {
            return Err(StateError::Mismatch {
                what,
                expected: out.len() as u64,
                found: len as u64,
            });
        }
        self.bytes_into(out)
    }

    pub fn blob(&mut self) -> Result<Vec<u8>, StateError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail if the payload was not fully consumed.
    pub fn finish(&self) -> Result<(), StateError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(StateError::TrailingBytes {
                section: self.section,
                extra,
            }),
        }
    }
}

/// Decoded section table of a stream.
#[derive(Debug)]
pub struct Sections<'a> {
    map: HashMap<&'static str, &'a [u8]>,
}

impl<'a> Sections<'a> {
    /// Split `data` into sections, accepting only the tags in `known`.
    pub fn parse(data: &'a [u8], known: &[&'static str]) -> Result<Self, StateError> {
        let mut r = StateReader::new(data, "stream");
        let mut map = HashMap::new();
        loop {
            let tag: [u8; 4] = r.array()?;
            let len = r.u32()? as usize;
            if tag == END_TAG {
                break;
            }
            let name = String::from_utf8_lossy(&tag).into_owned();
            let key = known
                .iter()
                .copied()
                .find(|k| k.as_bytes() == tag)
                .ok_or_else(|| StateError::UnknownTag(name.clone()))?;
            let payload = r.take(len)?;
            if map.insert(key, payload).is_some() {
                return Err(StateError::DuplicateSection(name));
            }
        }
        Ok(Self { map })
    }

    pub fn get(&self, tag: &'static str) -> Option<StateReader<'a>> {
        self.map.get(tag).map(|data| StateReader::new(data, tag))
    }

    pub fn require(&self, tag: &'static str) -> Result<StateReader<'a>, StateError> {
        self.get(tag).ok_or(StateError::MissingSection(tag))
    }
}

/// Check a structural parameter of a stream against the live machine.
pub fn expect_eq(what: &'static str, expected: u64, found: u64) -> Result<(), StateError> {
    if expected == found {
        Ok(())
    } else {
        Err(StateError::Mismatch {
            what,
            expected,
            found,
        })
    }
}
