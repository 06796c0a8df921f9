//! Qt `QDataStream`-compatible primitive codec.
//!
//! Everything on the wire is big-endian. Strings are a `u32` byte length
//! followed by that many bytes of UTF-16BE; `0xFFFF_FFFF` is Qt's null
//! string and decodes as empty. Endianness is explicit here so the codec
//! never leans on the platform's native string layout.

use thiserror::Error;

/// Qt's null-string length sentinel.
pub const NULL_STRING: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("short read: need {need} more bytes, have {have}")]
    Short { need: usize, have: usize },
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),
}

/// Cursor-style reader over one datagram. Failed reads do not advance,
/// so tolerant callers can fall back to defaults for truncated tails.
pub struct QtReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> QtReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Short { need: n, have: self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.u64()? as i64)
    }

    pub fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Qt string: `u32` byte length + UTF-16BE payload. Null decodes as
    /// empty; an odd byte count tolerates the stray trailing byte.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()?;
        if len == NULL_STRING || len == 0 {
            return Ok(String::new());
        }
        let raw = match self.take(len as usize) {
            Ok(raw) => raw,
            Err(e) => {
                // un-consume the length prefix so the cursor stays sane
                self.pos -= 4;
                return Err(e);
            }
        };
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())
    }
}

/// Append-only writer mirroring [`QtReader`].
#[derive(Default)]
pub struct QtWriter {
    buf: Vec<u8>,
}

impl QtWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(v as u8)
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.u64(v as u64)
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.u64(v.to_bits())
    }

    /// Empty strings are written as Qt null; the decoder app treats both
    /// identically and "no change" sentinels stay intact.
    pub fn string(&mut self, s: &str) -> &mut Self {
        if s.is_empty() {
            return self.u32(NULL_STRING);
        }
        let units: Vec<u16> = s.encode_utf16().collect();
        self.u32((units.len() * 2) as u32);
        for u in units {
            self.buf.extend_from_slice(&u.to_be_bytes());
        }
        self
    }
}
