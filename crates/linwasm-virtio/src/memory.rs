//! Guest linear memory as seen by the host.

use linwasm_layout::{Type, U16Le, U32Le, U64Le, U8};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of bounds: addr={addr:#x} len={len} size={size:#x}")]
    OutOfBounds { addr: u64, len: usize, size: u64 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Byte-addressed guest memory starting at address 0.
pub trait GuestMemory {
    fn size(&self) -> u64;

    fn get_slice(&self, addr: u64, len: usize) -> GuestMemoryResult<&[u8]>;

    fn get_slice_mut(&mut self, addr: u64, len: usize) -> GuestMemoryResult<&mut [u8]>;

    fn read(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        dst.copy_from_slice(self.get_slice(addr, dst.len())?);
        Ok(())
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        self.get_slice_mut(addr, src.len())?.copy_from_slice(src);
        Ok(())
    }
}

/// Guest memory backed by a single host allocation.
#[derive(Debug, Clone)]
pub struct GuestRam {
    data: Vec<u8>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, addr: u64, len: usize) -> GuestMemoryResult<core::ops::Range<usize>> {
        let err = GuestMemoryError::OutOfBounds {
            addr,
            len,
            size: self.data.len() as u64,
        };
        let start = usize::try_from(addr).map_err(|_| err)?;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.data.len() {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl GuestMemory for GuestRam {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn get_slice(&self, addr: u64, len: usize) -> GuestMemoryResult<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.data[range])
    }

    fn get_slice_mut(&mut self, addr: u64, len: usize) -> GuestMemoryResult<&mut [u8]> {
        let range = self.range(addr, len)?;
        Ok(&mut self.data[range])
    }
}

/// Reads a fixed-layout value at `addr`.
pub fn read_obj<T: Type>(mem: &dyn GuestMemory, addr: u64) -> GuestMemoryResult<T::Value> {
    let bytes = mem.get_slice(addr, T::SIZE)?;
    T::get(bytes, 0).map_err(|_| GuestMemoryError::OutOfBounds {
        addr,
        len: T::SIZE,
        size: mem.size(),
    })
}

/// Writes a fixed-layout value at `addr`.
pub fn write_obj<T: Type>(
    mem: &mut dyn GuestMemory,
    addr: u64,
    value: T::Value,
) -> GuestMemoryResult<()> {
    let size = mem.size();
    let bytes = mem.get_slice_mut(addr, T::SIZE)?;
    T::set(bytes, 0, value).map_err(|_| GuestMemoryError::OutOfBounds {
        addr,
        len: T::SIZE,
        size,
    })
}

pub fn read_u16_le(mem: &dyn GuestMemory, addr: u64) -> GuestMemoryResult<u16> {
    read_obj::<U16Le>(mem, addr)
}

pub fn read_u32_le(mem: &dyn GuestMemory, addr: u64) -> GuestMemoryResult<u32> {
    read_obj::<U32Le>(mem, addr)
}

pub fn read_u64_le(mem: &dyn GuestMemory, addr: u64) -> GuestMemoryResult<u64> {
    read_obj::<U64Le>(mem, addr)
}

pub fn write_u8(mem: &mut dyn GuestMemory, addr: u64, value: u8) -> GuestMemoryResult<()> {
    write_obj::<U8>(mem, addr, value)
}

pub fn write_u16_le(mem: &mut dyn GuestMemory, addr: u64, value: u16) -> GuestMemoryResult<()> {
    write_obj::<U16Le>(mem, addr, value)
}

pub fn write_u32_le(mem: &mut dyn GuestMemory, addr: u64, value: u32) -> GuestMemoryResult<()> {
    write_obj::<U32Le>(mem, addr, value)
}

pub fn write_u64_le(mem: &mut dyn GuestMemory, addr: u64, value: u64) -> GuestMemoryResult<()> {
    write_obj::<U64Le>(mem, addr, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accesses_are_bounds_checked() {
        let mut mem = GuestRam::new(16);
        write_u32_le(&mut mem, 12, 0xdead_beef).unwrap();
        assert_eq!(read_u32_le(&mem, 12).unwrap(), 0xdead_beef);
        assert_eq!(&mem.as_slice()[12..], &[0xef, 0xbe, 0xad, 0xde]);

        assert_eq!(
            write_u32_le(&mut mem, 13, 0),
            Err(GuestMemoryError::OutOfBounds {
                addr: 13,
                len: 4,
                size: 16
            })
        );
        assert!(mem.get_slice(u64::MAX, 1).is_err());
        assert!(mem.write(16, &[]).is_ok());
    }

    #[test]
    fn u64_fields_are_little_endian() {
        let mut mem = GuestRam::new(16);
        write_u64_le(&mut mem, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(read_u64_le(&mem, 8).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(mem.as_slice()[8], 0x08);
        assert!(read_u64_le(&mem, 9).is_err());
    }
}
