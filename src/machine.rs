use std::sync::Arc;

use linwasm_fdt::{encode, DeviceTreeNode, DeviceTreeValue, MemoryReservation};
use linwasm_virtio::devices::{IrqSink, VirtioDevice};
use linwasm_virtio::host::VirtioHost;
use linwasm_virtio::memory::GuestMemory;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::{BootError, MachineConfig, Result};

/// Length of `/chosen/rng-seed`.
pub const RNG_SEED_BYTES: usize = 64;

const BOOT_CPU: u32 = 0;

/// A configured machine: its device table, initrd image and the devicetree handed to the kernel.
pub struct Machine {
    config: MachineConfig,
    memory_bytes: u32,
    initrd: Option<Vec<u8>>,
    host: VirtioHost,
    devicetree: Option<Vec<u8>>,
}

impl Machine {
    /// Validates `config` and reads the initrd image it names, if any.
    pub fn new(config: MachineConfig, irq_sink: Arc<dyn IrqSink>) -> Result<Self> {
        config.validate()?;
        let memory_bytes = config.memory_bytes()?;
        let initrd = match &config.initrd {
            Some(path) => Some(std::fs::read(path).map_err(|source| BootError::Io {
                path: path.clone(),
                source,
            })?),
            None => None,
        };
        let mut machine = Self {
            config,
            memory_bytes,
            initrd: None,
            host: VirtioHost::new(irq_sink),
            devicetree: None,
        };
        if let Some(image) = initrd {
            machine.set_initrd(image)?;
        }
        Ok(machine)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Replaces the initrd image. It must fit in guest memory at the configured address.
    pub fn set_initrd(&mut self, image: Vec<u8>) -> Result<()> {
        let end = u64::from(self.config.initrd_address) + image.len() as u64;
        if end > u64::from(self.memory_bytes) {
            return Err(BootError::InvalidConfig(format!(
                "initrd of {} bytes at {:#x} ends past guest memory ({:#x})",
                image.len(),
                self.config.initrd_address,
                self.memory_bytes
            )));
        }
        self.initrd = Some(image);
        self.devicetree = None;
        Ok(())
    }

    pub fn initrd(&self) -> Option<&[u8]> {
        self.initrd.as_deref()
    }

    pub fn host(&self) -> &VirtioHost {
        &self.host
    }

    /// The device table. Changes to the set of devices are picked up by the next devicetree.
    pub fn host_mut(&mut self) -> &mut VirtioHost {
        self.devicetree = None;
        &mut self.host
    }

    pub fn add_device(&mut self, device: Box<dyn VirtioDevice>) -> u32 {
        self.host_mut().add(device)
    }

    fn initrd_range(&self) -> Option<(u32, u32)> {
        let image = self.initrd.as_ref()?;
        let start = self.config.initrd_address;
        // `set_initrd` keeps the image below `memory_bytes`.
        Some((start, start + image.len() as u32))
    }

    /// Memory reservations written into the blob header.
    pub fn reservations(&self) -> Vec<MemoryReservation> {
        self.initrd_range()
            .map(|(start, end)| MemoryReservation {
                address: start.into(),
                size: u64::from(end - start),
            })
            .into_iter()
            .collect()
    }

    /// Builds the root node the kernel boots with. `rng` supplies `/chosen/rng-seed`.
    pub fn build_devicetree<R: RngCore + ?Sized>(&self, rng: &mut R) -> Result<DeviceTreeNode> {
        let mut seed = vec![0u8; RNG_SEED_BYTES];
        rng.try_fill_bytes(&mut seed)?;

        let mut chosen = DeviceTreeNode::new()
            .with("rng-seed", seed)
            .with("bootargs", self.config.cmdline.as_str())
            .with("ncpus", self.config.cpus);
        if let Some((start, end)) = self.initrd_range() {
            chosen.insert("linux,initrd-start", start);
            chosen.insert("linux,initrd-end", end);
        }

        let mut root = DeviceTreeNode::new()
            .with("#address-cells", 1u32)
            .with("#size-cells", 1u32)
            .with("chosen", chosen)
            .with("aliases", DeviceTreeNode::new())
            .with(
                "memory",
                DeviceTreeNode::new()
                    .with("device_type", "memory")
                    .with("reg", [0, self.memory_bytes]),
            )
            .with(
                "reserved-memory",
                DeviceTreeNode::new()
                    .with("#address-cells", 1u32)
                    .with("#size-cells", 1u32)
                    .with("ranges", DeviceTreeValue::Empty),
            );

        let devices = self
            .host
            .devicetree_nodes()
            .into_iter()
            .fold(DeviceTreeNode::new(), |tree, (name, node)| tree.with(name, node));
        root.merge(devices)?;
        Ok(root)
    }

    /// The encoded devicetree. Built on first use with an `OsRng` seed and cached until the
    /// device table or initrd changes.
    pub fn devicetree(&mut self) -> Result<&[u8]> {
        let blob = match self.devicetree.take() {
            Some(blob) => blob,
            None => {
                let tree = self.build_devicetree(&mut OsRng)?;
                let blob = encode(&tree, &self.reservations(), BOOT_CPU)?;
                info!(
                    bytes = blob.len(),
                    devices = self.host.len(),
                    "devicetree built"
                );
                blob
            }
        };
        Ok(self.devicetree.insert(blob).as_slice())
    }

    /// Copies the devicetree blob to `buf` in guest memory. `size` is the room the guest has
    /// reserved there.
    pub fn get_devicetree(&mut self, mem: &mut dyn GuestMemory, buf: u64, size: u32) -> Result<()> {
        let blob = self.devicetree()?;
        if (size as usize) < blob.len() {
            return Err(BootError::DevicetreeTruncated {
                needed: blob.len(),
                size,
            });
        }
        mem.write(buf, blob)?;
        debug!(buf, bytes = blob.len(), "devicetree copied to guest");
        Ok(())
    }

    /// Copies the initrd image to its configured address. No-op without an initrd.
    pub fn load_initrd(&self, mem: &mut dyn GuestMemory) -> Result<()> {
        if let Some(image) = &self.initrd {
            mem.write(self.config.initrd_address.into(), image)?;
        }
        Ok(())
    }
}
