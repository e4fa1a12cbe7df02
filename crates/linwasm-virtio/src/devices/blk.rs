use core::any::Any;

use linwasm_layout::{layout, U32Le, U64Le};
use thiserror::Error;
use tracing::warn;

use crate::devices::{DeviceCore, InterruptKind, VirtioDevice};
use crate::memory::{read_obj, write_u8, GuestMemory};
use crate::queue::{Chain, Descriptor};
use crate::{Result, VirtioError};

pub const VIRTIO_DEVICE_TYPE_BLK: u32 = 2;

pub const VIRTIO_BLK_SECTOR_SIZE: u64 = 512;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const VIRTIO_BLK_ID_BYTES: usize = 20;

layout! {
    struct RequestHeader {
        kind: U32Le,
        reserved: U32Le,
        sector: U64Le,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockBackendError {
    #[error("out of bounds")]
    OutOfBounds,
    #[error("I/O error")]
    IoError,
}

pub type BackendResult<T> = std::result::Result<T, BlockBackendError>;

/// Storage behind a block device.
pub trait BlockBackend {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> BackendResult<()>;

    fn write_at(&mut self, offset: u64, src: &[u8]) -> BackendResult<()>;

    fn flush(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn device_id(&self) -> [u8; VIRTIO_BLK_ID_BYTES] {
        [0; VIRTIO_BLK_ID_BYTES]
    }
}

/// A disk held entirely in host memory.
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Vec<u8>,
    id: [u8; VIRTIO_BLK_ID_BYTES],
}

impl MemDisk {
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0; size])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut id = [0u8; VIRTIO_BLK_ID_BYTES];
        id[..15].copy_from_slice(b"linwasm-memdisk");
        Self { data, id }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: u64, len: usize) -> BackendResult<core::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| BlockBackendError::OutOfBounds)?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BlockBackendError::OutOfBounds)?;
        Ok(start..end)
    }
}

impl BlockBackend for MemDisk {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> BackendResult<()> {
        let range = self.range(offset, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, src: &[u8]) -> BackendResult<()> {
        let range = self.range(offset, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    fn device_id(&self) -> [u8; VIRTIO_BLK_ID_BYTES] {
        self.id
    }
}

/// virtio-blk with a single request queue.
///
/// Every request is exactly three descriptors: a 16-byte read-only header, one data buffer and a
/// writable status byte.
///
/// Reads that start inside the disk are cut short at its end and report `OK`. A read starting at
/// or past the end reports `IOERR`.
pub struct Blk<B = MemDisk> {
    core: DeviceCore,
    backend: B,
}

impl<B: BlockBackend> Blk<B> {
    pub fn new(backend: B) -> Self {
        Self {
            core: DeviceCore::new(1),
            backend,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: BlockBackend + 'static> VirtioDevice for Blk<B> {
    fn device_id(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_BLK
    }

    /// `struct virtio_blk_config::capacity`, in sectors.
    fn config(&self) -> Vec<u8> {
        (self.backend.len() / VIRTIO_BLK_SECTOR_SIZE)
            .to_le_bytes()
            .to_vec()
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn notify(&mut self, queue: u16, mem: &mut dyn GuestMemory) -> Result<()> {
        let vq = self.core.queue_mut(queue)?;
        let chains = vq.drain(mem)?;
        if chains.is_empty() {
            return Ok(());
        }
        for chain in chains {
            let written = process_request(&mut self.backend, mem, &chain)?;
            vq.release(mem, chain, written)?;
        }
        self.core.trigger(mem, InterruptKind::Vring)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Executes one request and returns the number of bytes written into the chain.
fn process_request<B: BlockBackend>(
    backend: &mut B,
    mem: &mut dyn GuestMemory,
    chain: &Chain,
) -> Result<u32> {
    let [header, data, status] = chain.descriptors() else {
        return Err(VirtioError::MalformedRequest(
            "expected header, data and status descriptors",
        ));
    };
    if header.is_write_only() || header.len < 16 {
        return Err(VirtioError::MalformedRequest("bad request header"));
    }
    if !status.is_write_only() || status.len < 1 {
        return Err(VirtioError::MalformedRequest("bad status descriptor"));
    }

    let req = read_obj::<RequestHeader>(mem, header.addr)?;
    let offset = req.sector.checked_mul(VIRTIO_BLK_SECTOR_SIZE);

    let (code, written) = match req.kind {
        VIRTIO_BLK_T_IN => {
            if !data.is_write_only() {
                return Err(VirtioError::MalformedRequest("IN data must be writable"));
            }
            let copied = match offset {
                Some(offset) if offset < backend.len() => read_clamped(backend, mem, data, offset)?,
                _ => None,
            };
            match copied {
                Some(n) => (VIRTIO_BLK_S_OK, n + 1),
                None => (VIRTIO_BLK_S_IOERR, 1),
            }
        }
        VIRTIO_BLK_T_OUT => {
            if data.is_write_only() {
                return Err(VirtioError::MalformedRequest("OUT data must be readable"));
            }
            let src = data.bytes(mem)?.to_vec();
            let ok = match offset {
                Some(offset) => backend.write_at(offset, &src).is_ok(),
                None => false,
            };
            (if ok { VIRTIO_BLK_S_OK } else { VIRTIO_BLK_S_IOERR }, 1)
        }
        VIRTIO_BLK_T_FLUSH => match backend.flush() {
            Ok(()) => (VIRTIO_BLK_S_OK, 1),
            Err(_) => (VIRTIO_BLK_S_IOERR, 1),
        },
        VIRTIO_BLK_T_GET_ID => {
            if !data.is_write_only() {
                return Err(VirtioError::MalformedRequest("GET_ID data must be writable"));
            }
            let id = backend.device_id();
            let n = id.len().min(data.len as usize);
            mem.write(data.addr, &id[..n])?;
            (VIRTIO_BLK_S_OK, n as u32 + 1)
        }
        other => {
            warn!(kind = other, "unsupported virtio-blk request");
            write_u8(mem, status.addr, VIRTIO_BLK_S_UNSUPP)?;
            return Ok(0);
        }
    };

    write_u8(mem, status.addr, code)?;
    Ok(written)
}

/// Reads into `data` from `offset`, stopping at the end of the backend. Returns `None` if the
/// backend reported an error.
fn read_clamped<B: BlockBackend>(
    backend: &mut B,
    mem: &mut dyn GuestMemory,
    data: &Descriptor,
    offset: u64,
) -> Result<Option<u32>> {
    let len = u64::from(data.len).min(backend.len() - offset) as usize;
    let mut buf = vec![0u8; len];
    if backend.read_at(offset, &mut buf).is_err() {
        return Ok(None);
    }
    mem.write(data.addr, &buf)?;
    Ok(Some(len as u32))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::devices::testing::{line, RecordingSink};
    use crate::memory::{read_u32_le, write_u16_le, write_u32_le, write_u64_le, GuestRam};
    use crate::queue::{Virtqueue, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE, VRING_PACKED_DESC_F_AVAIL};

    const RING: u64 = 0x1000;
    const HEADER: u64 = 0x2000;
    const DATA: u64 = 0x3000;
    const STATUS: u64 = 0x4000;

    fn write_desc(mem: &mut GuestRam, index: u16, addr: u64, len: u32, id: u16, flags: u16) {
        let base = RING + u64::from(index) * 16;
        write_u64_le(mem, base, addr).unwrap();
        write_u32_le(mem, base + 8, len).unwrap();
        write_u16_le(mem, base + 12, id).unwrap();
        write_u16_le(mem, base + 14, flags | VRING_PACKED_DESC_F_AVAIL).unwrap();
    }

    /// Queues one request at ring slot 0 and returns the memory, status byte and used length.
    fn submit(dev: &mut Blk, kind: u32, sector: u64, data_len: u32, data_flags: u16) -> (GuestRam, u8, u32) {
        let mut mem = GuestRam::new(0x8000);
        write_u32_le(&mut mem, HEADER, kind).unwrap();
        write_u64_le(&mut mem, HEADER + 8, sector).unwrap();
        mem.write(DATA, &[0xcc; 64]).unwrap();
        mem.write(STATUS, &[0xaa]).unwrap();

        write_desc(&mut mem, 0, HEADER, 16, 0, VRING_DESC_F_NEXT);
        write_desc(&mut mem, 1, DATA, data_len, 0, data_flags | VRING_DESC_F_NEXT);
        write_desc(&mut mem, 2, STATUS, 1, 4, VRING_DESC_F_WRITE);

        dev.enable(0, Virtqueue::new(8, RING).unwrap()).unwrap();
        dev.notify(0, &mut mem).unwrap();
        let status = mem.as_slice()[STATUS as usize];
        let used_len = read_u32_le(&mem, RING + 8).unwrap();
        (mem, status, used_len)
    }

    fn device(bytes: Vec<u8>) -> (Blk, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let mut dev = Blk::new(MemDisk::from_bytes(bytes));
        dev.setup(line(5, &sink));
        (dev, sink)
    }

    #[test]
    fn read_first_sector() {
        let mut disk = vec![0u8; 1024];
        disk[..2].copy_from_slice(&[0x11, 0x22]);
        let (mut dev, sink) = device(disk);

        let (mem, status, used) = submit(&mut dev, VIRTIO_BLK_T_IN, 0, 2, VRING_DESC_F_WRITE);
        assert_eq!(status, VIRTIO_BLK_S_OK);
        assert_eq!(&mem.as_slice()[DATA as usize..DATA as usize + 3], &[0x11, 0x22, 0xcc]);
        assert_eq!(used, 3);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn reads_are_clamped_to_the_disk() {
        let (mut dev, _) = device(vec![0x5a; 520]);
        let (mem, status, used) = submit(&mut dev, VIRTIO_BLK_T_IN, 1, 64, VRING_DESC_F_WRITE);
        assert_eq!(status, VIRTIO_BLK_S_OK);
        assert_eq!(used, 9);
        let data = &mem.as_slice()[DATA as usize..];
        assert_eq!(&data[..8], &[0x5a; 8]);
        assert_eq!(data[8], 0xcc);

        let (_, status, used) = submit(&mut dev, VIRTIO_BLK_T_IN, 2, 64, VRING_DESC_F_WRITE);
        assert_eq!(status, VIRTIO_BLK_S_IOERR);
        assert_eq!(used, 1);
    }

    #[test]
    fn write_then_flush() {
        let (mut dev, _) = device(vec![0; 1024]);
        let (_, status, used) = submit(&mut dev, VIRTIO_BLK_T_OUT, 1, 4, 0);
        assert_eq!(status, VIRTIO_BLK_S_OK);
        assert_eq!(used, 1);
        assert_eq!(&dev.backend().as_slice()[512..516], &[0xcc; 4]);

        let (_, status, _) = submit(&mut dev, VIRTIO_BLK_T_OUT, 2, 4, 0);
        assert_eq!(status, VIRTIO_BLK_S_IOERR);

        let (_, status, _) = submit(&mut dev, VIRTIO_BLK_T_FLUSH, 0, 0, 0);
        assert_eq!(status, VIRTIO_BLK_S_OK);
    }

    #[test]
    fn get_id_is_truncated_to_buffer() {
        let (mut dev, _) = device(vec![0; 512]);
        let (mem, status, used) = submit(&mut dev, VIRTIO_BLK_T_GET_ID, 0, 8, VRING_DESC_F_WRITE);
        assert_eq!(status, VIRTIO_BLK_S_OK);
        assert_eq!(used, 9);
        assert_eq!(&mem.as_slice()[DATA as usize..DATA as usize + 9], b"linwasm-\xcc");
    }

    #[test]
    fn unknown_request_is_unsupported() {
        let (mut dev, _) = device(vec![0; 512]);
        let (mem, status, used) = submit(&mut dev, 0x42, 0, 8, VRING_DESC_F_WRITE);
        assert_eq!(status, VIRTIO_BLK_S_UNSUPP);
        assert_eq!(used, 0);
        assert_eq!(&mem.as_slice()[DATA as usize..DATA as usize + 8], &[0xcc; 8]);
    }

    #[test]
    fn chains_must_have_three_descriptors() {
        let (mut dev, _) = device(vec![0; 512]);
        let mut mem = GuestRam::new(0x8000);
        write_desc(&mut mem, 0, HEADER, 16, 0, VRING_DESC_F_NEXT);
        write_desc(&mut mem, 1, STATUS, 1, 1, VRING_DESC_F_WRITE);
        dev.enable(0, Virtqueue::new(8, RING).unwrap()).unwrap();

        assert!(matches!(
            dev.notify(0, &mut mem),
            Err(VirtioError::MalformedRequest(_))
        ));
    }

    #[test]
    fn read_only_in_buffer_is_malformed_even_past_the_end() {
        for sector in [0, 4] {
            let (mut dev, sink) = device(vec![0; 1024]);
            let mut mem = GuestRam::new(0x8000);
            write_u32_le(&mut mem, HEADER, VIRTIO_BLK_T_IN).unwrap();
            write_u64_le(&mut mem, HEADER + 8, sector).unwrap();
            write_desc(&mut mem, 0, HEADER, 16, 0, VRING_DESC_F_NEXT);
            write_desc(&mut mem, 1, DATA, 8, 0, VRING_DESC_F_NEXT);
            write_desc(&mut mem, 2, STATUS, 1, 2, VRING_DESC_F_WRITE);
            dev.enable(0, Virtqueue::new(8, RING).unwrap()).unwrap();

            assert!(matches!(
                dev.notify(0, &mut mem),
                Err(VirtioError::MalformedRequest(_))
            ));
            assert_eq!(mem.as_slice()[STATUS as usize], 0);
            assert_eq!(sink.count(), 0);
        }
    }

    #[test]
    fn config_is_capacity_in_sectors() {
        let dev = Blk::new(MemDisk::new(4096));
        assert_eq!(dev.config(), 8u64.to_le_bytes());
    }
}
