use crate::{check_range, Result, Type};

/// A fixed-capacity byte buffer written through a monotonically increasing cursor.
///
/// The arena never reallocates: any write that would move the cursor past `capacity` fails with
/// [`crate::LayoutError::OutOfBounds`] and leaves the arena unchanged. Bytes skipped by
/// [`ByteArena::bump`] and [`ByteArena::align`] read as zero.
#[derive(Debug, Clone)]
pub struct ByteArena {
    buf: Vec<u8>,
    len: usize,
}

impl ByteArena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Reserves `len` bytes and returns the offset of the first one.
    pub fn bump(&mut self, len: usize) -> Result<usize> {
        let range = check_range(self.buf.len(), self.len, len)?;
        self.len = range.end;
        Ok(range.start)
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<usize> {
        let at = self.bump(bytes.len())?;
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(at)
    }

    /// Reserves room for a `T` and writes `value` into it.
    pub fn alloc<T: Type>(&mut self, value: T::Value) -> Result<usize> {
        let at = self.bump(T::SIZE)?;
        T::set(&mut self.buf, at, value)?;
        Ok(at)
    }

    /// Overwrites a value inside the already written region.
    pub fn set_at<T: Type>(&mut self, offset: usize, value: T::Value) -> Result<()> {
        T::set(&mut self.buf[..self.len], offset, value)
    }

    pub fn get_at<T: Type>(&self, offset: usize) -> Result<T::Value> {
        T::get(self.as_slice(), offset)
    }

    /// Pads with zero bytes until the cursor is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let pad = (alignment - self.len % alignment) % alignment;
        self.bump(pad)?;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.len);
        self.buf
    }
}
