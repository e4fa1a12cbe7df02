use core::any::Any;

use futures_util::{Stream, StreamExt};
use tracing::warn;

use crate::devices::{DeviceCore, InterruptKind, VirtioDevice};
use crate::memory::GuestMemory;
use crate::Result;

pub const VIRTIO_DEVICE_TYPE_CONSOLE: u32 = 3;

pub const RECEIVEQ: u16 = 0;
pub const TRANSMITQ: u16 = 1;

/// Receives everything the guest writes to the console.
pub trait ConsoleSink {
    fn write(&mut self, bytes: &[u8]);
}

impl ConsoleSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// virtio-console with a single port.
pub struct Console {
    core: DeviceCore,
    sink: Box<dyn ConsoleSink>,
    cols: u16,
    rows: u16,
}

impl Console {
    pub fn new(sink: Box<dyn ConsoleSink>) -> Self {
        Self {
            core: DeviceCore::new(2),
            sink,
            cols: 80,
            rows: 25,
        }
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn sink_mut(&mut self) -> &mut dyn ConsoleSink {
        self.sink.as_mut()
    }

    /// Copies `bytes` into the guest's receive buffers and returns how many were delivered.
    ///
    /// Input that does not fit in the available buffers is dropped.
    pub fn receive(&mut self, mem: &mut dyn GuestMemory, bytes: &[u8]) -> Result<usize> {
        let vq = self.core.queue_mut(RECEIVEQ)?;
        let mut rest = bytes;
        let mut used = false;

        while !rest.is_empty() {
            let Some(chain) = vq.pop(mem)? else {
                break;
            };
            let mut written = 0usize;
            for desc in chain.writable() {
                if rest.is_empty() {
                    break;
                }
                let n = rest.len().min(desc.len as usize);
                mem.write(desc.addr, &rest[..n])?;
                rest = &rest[n..];
                written += n;
            }
            vq.release(mem, chain, written as u32)?;
            used = true;
        }

        if !rest.is_empty() {
            warn!(dropped = rest.len(), "console receive buffers exhausted");
        }
        if used {
            self.core.trigger(mem, InterruptKind::Vring)?;
        }
        Ok(bytes.len() - rest.len())
    }
}

impl VirtioDevice for Console {
    fn device_id(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_CONSOLE
    }

    /// `struct virtio_console_config`: cols, rows, max_nr_ports, emerg_wr.
    fn config(&self) -> Vec<u8> {
        let mut cfg = Vec::with_capacity(12);
        cfg.extend_from_slice(&self.cols.to_le_bytes());
        cfg.extend_from_slice(&self.rows.to_le_bytes());
        cfg.extend_from_slice(&1u32.to_le_bytes());
        cfg.extend_from_slice(&0u32.to_le_bytes());
        cfg
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn notify(&mut self, queue: u16, mem: &mut dyn GuestMemory) -> Result<()> {
        let vq = self.core.queue_mut(queue)?;
        if queue != TRANSMITQ {
            // New receive buffers are picked up by the next `receive`.
            return Ok(());
        }

        let chains = vq.drain(mem)?;
        if chains.is_empty() {
            return Ok(());
        }
        for chain in chains {
            for desc in chain.readable() {
                self.sink.write(desc.bytes(mem)?);
            }
            vq.release(mem, chain, 0)?;
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

/// Forwards host input chunks to `deliver` until `input` ends. Returns the number of bytes
/// `deliver` accepted.
pub async fn pump_input<S, F>(mut input: S, mut deliver: F) -> Result<usize>
where
    S: Stream<Item = Vec<u8>> + Unpin,
    F: FnMut(&[u8]) -> Result<usize>,
{
    let mut total = 0;
    while let Some(chunk) = input.next().await {
        total += deliver(&chunk)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures_util::stream;

    use super::*;
    use crate::devices::testing::{line, RecordingSink};
    use crate::memory::{read_u32_le, write_u16_le, write_u32_le, write_u64_le, GuestRam};
    use crate::queue::{Virtqueue, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE, VRING_PACKED_DESC_F_AVAIL};

    const RX_RING: u64 = 0x1000;
    const TX_RING: u64 = 0x1800;

    fn write_desc(mem: &mut GuestRam, ring: u64, index: u16, addr: u64, len: u32, id: u16, flags: u16) {
        let base = ring + u64::from(index) * 16;
        write_u64_le(mem, base, addr).unwrap();
        write_u32_le(mem, base + 8, len).unwrap();
        write_u16_le(mem, base + 12, id).unwrap();
        write_u16_le(mem, base + 14, flags | VRING_PACKED_DESC_F_AVAIL).unwrap();
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl ConsoleSink for Captured {
        fn write(&mut self, bytes: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(bytes);
        }
    }

    fn console() -> (Console, Captured, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let captured = Captured::default();
        let mut dev = Console::new(Box::new(captured.clone()));
        dev.setup(line(9, &sink));
        dev.enable(RECEIVEQ, Virtqueue::new(4, RX_RING).unwrap()).unwrap();
        dev.enable(TRANSMITQ, Virtqueue::new(4, TX_RING).unwrap()).unwrap();
        (dev, captured, sink)
    }

    #[test]
    fn transmit_forwards_readable_bytes() {
        let mut mem = GuestRam::new(0x4000);
        let (mut dev, captured, sink) = console();
        mem.write(0x2000, b"hello, ").unwrap();
        mem.write(0x2100, b"world").unwrap();
        write_desc(&mut mem, TX_RING, 0, 0x2000, 7, 0, VRING_DESC_F_NEXT);
        write_desc(&mut mem, TX_RING, 1, 0x2100, 5, 1, 0);

        dev.notify(TRANSMITQ, &mut mem).unwrap();
        assert_eq!(*captured.0.lock().unwrap(), b"hello, world");
        assert_eq!(read_u32_le(&mem, TX_RING + 8).unwrap(), 0);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn receive_drops_what_does_not_fit() {
        let mut mem = GuestRam::new(0x4000);
        let (mut dev, _, sink) = console();
        write_desc(&mut mem, RX_RING, 0, 0x3000, 4, 0, VRING_DESC_F_WRITE);

        assert_eq!(dev.receive(&mut mem, b"abcdef").unwrap(), 4);
        assert_eq!(&mem.as_slice()[0x3000..0x3004], b"abcd");
        assert_eq!(read_u32_le(&mem, RX_RING + 8).unwrap(), 4);
        assert_eq!(sink.count(), 1);

        // No buffers left: nothing delivered, no interrupt.
        assert_eq!(dev.receive(&mut mem, b"gh").unwrap(), 0);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn pump_delivers_every_chunk() {
        let mut mem = GuestRam::new(0x4000);
        let (mut dev, _, _) = console();
        write_desc(&mut mem, RX_RING, 0, 0x3000, 8, 0, VRING_DESC_F_WRITE);
        write_desc(&mut mem, RX_RING, 1, 0x3100, 8, 1, VRING_DESC_F_WRITE);

        let input = stream::iter(vec![b"ls\n".to_vec(), b"pwd\n".to_vec()]);
        let total = pollster::block_on(pump_input(input, |chunk| dev.receive(&mut mem, chunk))).unwrap();

        assert_eq!(total, 7);
        assert_eq!(&mem.as_slice()[0x3000..0x3003], b"ls\n");
        assert_eq!(&mem.as_slice()[0x3100..0x3104], b"pwd\n");
    }

    #[test]
    fn host_output_shares_the_guest_sink() {
        let mut mem = GuestRam::new(0x4000);
        let (mut dev, captured, _) = console();
        dev.sink_mut().write(b"[boot] ");
        mem.write(0x2000, b"login: ").unwrap();
        write_desc(&mut mem, TX_RING, 0, 0x2000, 7, 0, 0);

        dev.notify(TRANSMITQ, &mut mem).unwrap();
        assert_eq!(*captured.0.lock().unwrap(), b"[boot] login: ");
    }

    #[test]
    fn config_reports_geometry() {
        let dev = Console::new(Box::new(Vec::new())).with_size(132, 43);
        let cfg = dev.config();
        assert_eq!(&cfg[..4], &[132, 0, 43, 0]);
        assert_eq!(cfg.len(), 12);
    }
}
