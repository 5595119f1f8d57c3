use crate::error::{Error, Result};

/// Bounds-checked read position over a byte slice.
///
/// Every read either succeeds inside `data[..end]` or returns
/// [`Error::BufferExceeded`]; nothing reads past the stored end.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, end: data.len() }
    }

    /// Cursor over `data[pos..end]`; `end` is clamped to the slice length.
    pub fn with_bounds(data: &'a [u8], pos: usize, end: usize) -> Self {
        let end = end.min(data.len());
        Self { data, pos: pos.min(end), end }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    pub fn peek_u8(&self) -> Result<u8> {
        if self.pos < self.end {
            Ok(self.data[self.pos])
        } else {
            Err(Error::BufferExceeded { need: 1, have: 0 })
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::BufferExceeded { need: n, have: self.remaining() });
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_slice(n).map(|_| ())
    }

    /// Big-endian unsigned integer of `n` bytes (at most 8).
    pub fn read_be(&mut self, n: usize) -> Result<u64> {
        let bytes = self.read_slice(n)?;
        Ok(be_u64(bytes))
    }

    /// A cursor over the next `len` bytes, advancing this one past them.
    pub fn split(&mut self, len: usize) -> Result<Cursor<'a>> {
        if len > self.remaining() {
            return Err(Error::BufferExceeded { need: len, have: self.remaining() });
        }
        let sub = Cursor { data: self.data, pos: self.pos, end: self.pos + len };
        self.pos += len;
        Ok(sub)
    }
}

/// Big-endian value of up to the last 8 bytes of `bytes`.
#[inline]
pub fn be_u64(bytes: &[u8]) -> u64 {
    let tail = &bytes[bytes.len().saturating_sub(8)..];
    tail.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}
