//! Little-endian cursors over packets

use crate::Error;

/// Sequential reader over a byte slice; every read fails with
/// [`Error::InvalidPacket`] instead of panicking on short input
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if n > self.data.len() {
            return Err(Error::InvalidPacket);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Everything not read yet
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        core::mem::take(&mut self.data)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn le16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.array()?))
    }
}

/// Sequential writer into a fixed slice; a write that does not fit fails
/// with [`Error::MessageTooLong`] and leaves the output untouched
#[derive(Debug)]
pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Free space left
    pub(crate) fn available(&self) -> usize {
        self.buf.len() - self.len
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub(crate) fn put_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        let end = self.len + data.len();
        if end > self.buf.len() {
            return Err(Error::MessageTooLong);
        }
        self.buf[self.len..end].copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    /// Copy as much of `data` as fits, returning the count
    pub(crate) fn put_truncated(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    pub(crate) fn u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_slice(&[value])
    }

    pub(crate) fn le16(&mut self, value: u16) -> Result<(), Error> {
        self.put_slice(&value.to_le_bytes())
    }

    /// Remaining space as a slice, for fills whose length is known afterwards
    pub(crate) fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Account for `n` bytes written through [`spare`](Self::spare)
    pub(crate) fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buf.len());
    }

    /// Drop everything written after `len`
    pub(crate) fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}
