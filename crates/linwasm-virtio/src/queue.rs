//! Packed virtqueues.
//!
//! A packed queue is a single ring of 16-byte descriptors. The driver hands a descriptor to the
//! device by setting its AVAIL bit to the driver's wrap counter and its USED bit to the inverse;
//! the device hands it back by writing both bits equal to the device's wrap counter. Both sides
//! flip their wrap counter every time their cursor wraps around the ring.
//!
//! The queue only stores guest addresses and cursors. Every access goes through [`GuestMemory`].

use std::sync::atomic::{fence, Ordering};

use linwasm_layout::{layout, Type, U16Le, U32Le, U64Le};

use crate::memory::{read_obj, write_obj, GuestMemory, GuestMemoryResult};
use crate::{Result, VirtioError};

pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
pub const VRING_DESC_F_INDIRECT: u16 = 4;
pub const VRING_PACKED_DESC_F_AVAIL: u16 = 1 << 7;
pub const VRING_PACKED_DESC_F_USED: u16 = 1 << 15;

layout! {
    struct RawDescriptor {
        addr: U64Le,
        len: U32Le,
        id: U16Le,
        flags: U16Le,
    }
}

pub const DESCRIPTOR_SIZE: u64 = RawDescriptor::SIZE as u64;

const LEN_OFFSET: u64 = RawDescriptor::OFFSETS[1] as u64;
const ID_OFFSET: u64 = RawDescriptor::OFFSETS[2] as u64;
const FLAGS_OFFSET: u64 = RawDescriptor::OFFSETS[3] as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub id: u16,
    pub flags: u16,
}

impl Descriptor {
    pub fn is_write_only(&self) -> bool {
        self.flags & VRING_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VRING_DESC_F_NEXT != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VRING_DESC_F_INDIRECT != 0
    }

    /// The guest bytes this descriptor points at.
    pub fn bytes<'m>(&self, mem: &'m dyn GuestMemory) -> GuestMemoryResult<&'m [u8]> {
        mem.get_slice(self.addr, self.len as usize)
    }

    pub fn bytes_mut<'m>(&self, mem: &'m mut dyn GuestMemory) -> GuestMemoryResult<&'m mut [u8]> {
        mem.get_slice_mut(self.addr, self.len as usize)
    }
}

impl From<RawDescriptor> for Descriptor {
    fn from(raw: RawDescriptor) -> Self {
        Self {
            addr: raw.addr,
            len: raw.len,
            id: raw.id,
            flags: raw.flags,
        }
    }
}

/// The buffers of one request.
///
/// A chain is not `Clone`: [`Virtqueue::release`] consumes it, so each chain is returned to the
/// driver exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct Chain {
    id: u16,
    skip: u16,
    descriptors: Vec<Descriptor>,
}

impl Chain {
    /// Buffer id reported back to the driver.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Number of ring slots the chain occupied.
    pub fn skip(&self) -> u16 {
        self.skip
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn readable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| !d.is_write_only())
    }

    pub fn writable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.is_write_only())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Virtqueue {
    size: u16,
    desc_addr: u64,
    avail_idx: u16,
    avail_wrap: bool,
    used_idx: u16,
    used_wrap: bool,
}

fn is_available(flags: u16, wrap: bool) -> bool {
    let avail = flags & VRING_PACKED_DESC_F_AVAIL != 0;
    let used = flags & VRING_PACKED_DESC_F_USED != 0;
    avail != used && avail == wrap
}

impl Virtqueue {
    /// The whole ring must be addressable, so slot addresses never overflow afterwards.
    pub fn new(size: u16, desc_addr: u64) -> Result<Self> {
        if size == 0 {
            return Err(VirtioError::InvalidQueueSize(0));
        }
        if desc_addr
            .checked_add(u64::from(size) * DESCRIPTOR_SIZE)
            .is_none()
        {
            return Err(VirtioError::RingOutOfRange { desc_addr, size });
        }
        Ok(Self {
            size,
            desc_addr,
            avail_idx: 0,
            avail_wrap: true,
            used_idx: 0,
            used_wrap: true,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_addr(&self) -> u64 {
        self.desc_addr
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// The device's wrap counter, i.e. the value written into the AVAIL/USED bits on release.
    pub fn wrap(&self) -> bool {
        self.used_wrap
    }

    fn slot_addr(&self, index: u16) -> u64 {
        self.desc_addr + u64::from(index) * DESCRIPTOR_SIZE
    }

    fn advance(&self, index: u16, wrap: bool, by: u16) -> (u16, bool) {
        let next = u32::from(index) + u32::from(by);
        let size = u32::from(self.size);
        if next >= size {
            ((next - size) as u16, !wrap)
        } else {
            (next as u16, wrap)
        }
    }

    /// Takes the next available chain, or `None` if the driver has not made one available.
    ///
    /// The cursor only moves when a whole chain was read successfully.
    pub fn pop(&mut self, mem: &dyn GuestMemory) -> Result<Option<Chain>> {
        let (mut index, mut wrap) = (self.avail_idx, self.avail_wrap);
        let mut descriptors = Vec::new();
        let mut skip = 0u16;

        let id = loop {
            let slot = self.slot_addr(index);
            let flags = read_obj::<U16Le>(mem, slot + FLAGS_OFFSET)?;
            if !is_available(flags, wrap) {
                if skip == 0 {
                    return Ok(None);
                }
                return Err(VirtioError::NoNextDescriptor { index });
            }
            fence(Ordering::Acquire);

            let desc = Descriptor::from(read_obj::<RawDescriptor>(mem, slot)?);
            (index, wrap) = self.advance(index, wrap, 1);
            skip += 1;

            if desc.is_indirect() {
                descriptors.extend(read_indirect(mem, &desc)?);
                break desc.id;
            }
            descriptors.push(desc);
            if !desc.has_next() {
                break desc.id;
            }
            if skip == self.size {
                return Err(VirtioError::NoNextDescriptor { index });
            }
        };

        self.avail_idx = index;
        self.avail_wrap = wrap;
        Ok(Some(Chain {
            id,
            skip,
            descriptors,
        }))
    }

    /// Pops every chain currently available.
    pub fn drain(&mut self, mem: &dyn GuestMemory) -> Result<Vec<Chain>> {
        let mut chains = Vec::new();
        while let Some(chain) = self.pop(mem)? {
            chains.push(chain);
        }
        Ok(chains)
    }

    /// Returns `chain` to the driver, reporting `bytes_written` bytes written into its writable
    /// buffers.
    pub fn release(
        &mut self,
        mem: &mut dyn GuestMemory,
        chain: Chain,
        bytes_written: u32,
    ) -> Result<()> {
        let slot = self.slot_addr(self.used_idx);
        let flags = read_obj::<U16Le>(mem, slot + FLAGS_OFFSET)?;
        if !is_available(flags, self.used_wrap) {
            return Err(VirtioError::RingFull {
                index: self.used_idx,
            });
        }

        write_obj::<U16Le>(mem, slot + ID_OFFSET, chain.id)?;
        write_obj::<U32Le>(mem, slot + LEN_OFFSET, bytes_written)?;

        let mut flags = 0;
        if self.used_wrap {
            flags |= VRING_PACKED_DESC_F_AVAIL | VRING_PACKED_DESC_F_USED;
        }
        if bytes_written > 0 {
            flags |= VRING_DESC_F_WRITE;
        }
        fence(Ordering::Release);
        write_obj::<U16Le>(mem, slot + FLAGS_OFFSET, flags)?;

        (self.used_idx, self.used_wrap) = self.advance(self.used_idx, self.used_wrap, chain.skip);
        Ok(())
    }
}

fn read_indirect(mem: &dyn GuestMemory, desc: &Descriptor) -> Result<Vec<Descriptor>> {
    if desc.len == 0 || u64::from(desc.len) % DESCRIPTOR_SIZE != 0 {
        return Err(VirtioError::MalformedIndirect { len: desc.len });
    }
    // Checks the whole table before reading any of it.
    mem.get_slice(desc.addr, desc.len as usize)?;
    let count = u64::from(desc.len) / DESCRIPTOR_SIZE;
    (0..count)
        .map(|i| {
            let raw = read_obj::<RawDescriptor>(mem, desc.addr + i * DESCRIPTOR_SIZE)?;
            Ok(Descriptor::from(raw))
        })
        .collect()
}
