//! The device table behind the guest's `virtio` imports.
//!
//! Devices are addressed by their index in the table, which is also the `host-id` advertised in
//! the devicetree.

use std::sync::Arc;

use linwasm_fdt::DeviceTreeNode;
use tracing::info;

use crate::devices::console::{Console, VIRTIO_DEVICE_TYPE_CONSOLE};
use crate::devices::{InterruptLine, IrqSink, VirtioDevice};
use crate::memory::GuestMemory;
use crate::queue::Virtqueue;
use crate::{Result, VirtioError};

/// Size of the config window the guest driver reserves per device.
pub const CONFIG_SPACE_SIZE: u32 = 0x100;

pub struct VirtioHost {
    devices: Vec<Option<Box<dyn VirtioDevice>>>,
    irq_sink: Arc<dyn IrqSink>,
}

impl VirtioHost {
    pub fn new(irq_sink: Arc<dyn IrqSink>) -> Self {
        Self {
            devices: Vec::new(),
            irq_sink,
        }
    }

    /// Adds a device and returns its index.
    pub fn add(&mut self, device: Box<dyn VirtioDevice>) -> u32 {
        self.devices.push(Some(device));
        (self.devices.len() - 1) as u32
    }

    /// Removes a device. Its index is not reused.
    pub fn remove(&mut self, dev: u32) -> Result<Box<dyn VirtioDevice>> {
        self.devices
            .get_mut(dev as usize)
            .and_then(Option::take)
            .ok_or(VirtioError::NoSuchDevice(dev))
    }

    pub fn len(&self) -> usize {
        self.devices.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self, dev: u32) -> Result<&dyn VirtioDevice> {
        match self.devices.get(dev as usize) {
            Some(Some(device)) => Ok(device.as_ref()),
            _ => Err(VirtioError::NoSuchDevice(dev)),
        }
    }

    pub fn device_mut(&mut self, dev: u32) -> Result<&mut dyn VirtioDevice> {
        match self.devices.get_mut(dev as usize) {
            Some(Some(device)) => Ok(device.as_mut()),
            _ => Err(VirtioError::NoSuchDevice(dev)),
        }
    }

    /// Devices in index order, skipping removed slots.
    pub fn devices(&self) -> impl Iterator<Item = (u32, &dyn VirtioDevice)> {
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_deref().map(|d| (i as u32, d)))
    }

    pub fn set_features(&mut self, dev: u32, features: u64) -> Result<()> {
        self.device_mut(dev)?.set_features(features)
    }

    pub fn enable_vring(&mut self, dev: u32, queue: u32, size: u32, desc: u64) -> Result<()> {
        let device = self.device_mut(dev)?;
        let queue = queue_index(device, queue)?;
        let size = u16::try_from(size).map_err(|_| VirtioError::InvalidQueueSize(size))?;
        device.enable(queue, Virtqueue::new(size, desc)?)
    }

    pub fn disable_vring(&mut self, dev: u32, queue: u32) -> Result<()> {
        let device = self.device_mut(dev)?;
        let queue = queue_index(device, queue)?;
        device.disable(queue)
    }

    pub fn notify(&mut self, dev: u32, queue: u32, mem: &mut dyn GuestMemory) -> Result<()> {
        let device = self.device_mut(dev)?;
        let queue = queue_index(device, queue)?;
        device.notify(queue, mem)
    }

    /// Installs the interrupt line and copies the device config into guest memory, truncated to
    /// `config_len` bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn setup(
        &mut self,
        dev: u32,
        irq: u32,
        config_flag_addr: u64,
        vring_flag_addr: u64,
        config_addr: u64,
        config_len: u32,
        mem: &mut dyn GuestMemory,
    ) -> Result<()> {
        let sink = self.irq_sink.clone();
        let device = self.device_mut(dev)?;

        let config = device.config();
        let len = config.len().min(config_len as usize);
        mem.write(config_addr, &config[..len])?;

        device.setup(InterruptLine {
            irq,
            config_flag_addr,
            vring_flag_addr,
            sink,
        });
        info!(
            device = dev,
            device_id = device.device_id(),
            irq,
            config_len = len,
            "virtio device set up"
        );
        Ok(())
    }

    /// Delivers host input to a console device.
    pub fn console_receive(
        &mut self,
        dev: u32,
        mem: &mut dyn GuestMemory,
        bytes: &[u8],
    ) -> Result<usize> {
        let device = self.device_mut(dev)?;
        let actual = device.device_id();
        let console = device
            .as_any_mut()
            .downcast_mut::<Console>()
            .ok_or(VirtioError::WrongDeviceType {
                device: dev,
                expected: VIRTIO_DEVICE_TYPE_CONSOLE,
                actual,
            })?;
        console.receive(mem, bytes)
    }

    /// One `virtio<N>` devicetree node per device, keyed by node name.
    pub fn devicetree_nodes(&self) -> Vec<(String, DeviceTreeNode)> {
        self.devices()
            .map(|(i, device)| {
                let node = DeviceTreeNode::new()
                    .with("compatible", "virtio,wasm")
                    .with("host-id", i)
                    .with("virtio-device-id", device.device_id())
                    .with("features", device.device_features())
                    .with("config", device.config());
                (format!("virtio{i}"), node)
            })
            .collect()
    }
}

fn queue_index(device: &dyn VirtioDevice, queue: u32) -> Result<u16> {
    match u16::try_from(queue) {
        Ok(q) if q < device.num_queues() => Ok(q),
        _ => Err(VirtioError::NoSuchQueue { queue }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::blk::{Blk, MemDisk};
    use crate::devices::entropy::Entropy;
    use crate::devices::testing::RecordingSink;
    use crate::devices::DEFAULT_FEATURES;
    use crate::import_result;
    use crate::memory::GuestRam;
    use linwasm_fdt::DeviceTreeValue;

    fn host() -> (VirtioHost, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (VirtioHost::new(sink.clone()), sink)
    }

    #[test]
    fn unknown_indices_map_to_errno() {
        let (mut host, _) = host();
        let dev = host.add(Box::new(Entropy::new()));

        assert_eq!(import_result(host.set_features(7, 0)).unwrap(), -19);
        assert_eq!(import_result(host.enable_vring(dev, 1, 8, 0x1000)).unwrap(), -22);
        assert_eq!(import_result(host.enable_vring(dev, 0, 8, 0x1000)).unwrap(), 0);
        assert!(matches!(
            host.enable_vring(dev, 0, 0x1_0000, 0x1000),
            Err(VirtioError::InvalidQueueSize(0x1_0000))
        ));
    }

    #[test]
    fn ring_near_top_of_memory_is_refused() {
        let (mut host, sink) = host();
        let dev = host.add(Box::new(Entropy::new()));
        let mut mem = GuestRam::new(0x1000);

        assert!(matches!(
            host.enable_vring(dev, 0, 8, u64::MAX - 8),
            Err(VirtioError::RingOutOfRange { .. })
        ));
        // The queue never came up, so the guest's kick has nothing to walk.
        assert!(matches!(
            host.notify(dev, 0, &mut mem),
            Err(VirtioError::QueueNotEnabled { queue: 0 })
        ));
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn removed_devices_keep_their_index() {
        let (mut host, _) = host();
        let a = host.add(Box::new(Entropy::new()));
        let b = host.add(Box::new(Entropy::new()));
        host.remove(a).unwrap();

        assert!(matches!(host.device(a), Err(VirtioError::NoSuchDevice(0))));
        assert!(host.device(b).is_ok());
        assert_eq!(host.add(Box::new(Entropy::new())), 2);
        assert_eq!(host.len(), 2);
    }

    #[test]
    fn setup_copies_truncated_config() {
        let (mut host, _) = host();
        let dev = host.add(Box::new(Blk::new(MemDisk::new(0x10_0000))));
        let mut mem = GuestRam::new(0x1000);
        mem.write(0x200, &[0xee; 8]).unwrap();

        host.setup(dev, 12, 0x100, 0x101, 0x200, 4, &mut mem).unwrap();
        // 2048 sectors, little-endian, cut to four bytes.
        assert_eq!(&mem.as_slice()[0x200..0x208], &[0x00, 0x08, 0, 0, 0xee, 0xee, 0xee, 0xee]);
        assert_eq!(host.device(dev).unwrap().core().interrupt().map(|l| l.irq), Some(12));
    }

    #[test]
    fn console_receive_requires_a_console() {
        let (mut host, _) = host();
        let dev = host.add(Box::new(Entropy::new()));
        let mut mem = GuestRam::new(0x1000);
        assert!(matches!(
            host.console_receive(dev, &mut mem, b"x"),
            Err(VirtioError::WrongDeviceType {
                expected: 3,
                actual: 4,
                ..
            })
        ));
    }

    #[test]
    fn devicetree_nodes_describe_each_device() {
        let (mut host, _) = host();
        host.add(Box::new(Entropy::new()));
        host.add(Box::new(Blk::new(MemDisk::new(1024))));

        let nodes = host.devicetree_nodes();
        let names: Vec<_> = nodes.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["virtio0", "virtio1"]);

        let blk = &nodes[1].1;
        assert_eq!(blk.get("host-id"), Some(&DeviceTreeValue::Int(1)));
        assert_eq!(blk.get("virtio-device-id"), Some(&DeviceTreeValue::Int(2)));
        assert_eq!(blk.get("features"), Some(&DeviceTreeValue::U64(DEFAULT_FEATURES)));
        assert_eq!(
            blk.get("config"),
            Some(&DeviceTreeValue::Bytes(2u64.to_le_bytes().to_vec()))
        );
    }
}
