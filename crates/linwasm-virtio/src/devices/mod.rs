use core::any::Any;
use core::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::memory::{write_u8, GuestMemory};
use crate::queue::Virtqueue;
use crate::{Result, VirtioError};

pub mod blk;
pub mod console;
pub mod entropy;

pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
pub const VIRTIO_F_RING_PACKED: u64 = 1 << 34;

/// Transport features every device offers.
pub const DEFAULT_FEATURES: u64 =
    VIRTIO_F_VERSION_1 | VIRTIO_F_RING_PACKED | VIRTIO_F_RING_INDIRECT_DESC;

/// Delivers interrupts to guest CPUs.
pub trait IrqSink {
    fn trigger_irq_for_cpu(&self, cpu: u32, irq: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// The device configuration changed.
    Config,
    /// A queue has used buffers.
    Vring,
}

/// Where a device reports interrupts. The guest reads the two flag bytes from its handler to
/// find out why it was interrupted.
#[derive(Clone)]
pub struct InterruptLine {
    pub irq: u32,
    pub config_flag_addr: u64,
    pub vring_flag_addr: u64,
    pub sink: Arc<dyn IrqSink>,
}

impl fmt::Debug for InterruptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptLine")
            .field("irq", &self.irq)
            .field("config_flag_addr", &self.config_flag_addr)
            .field("vring_flag_addr", &self.vring_flag_addr)
            .finish_non_exhaustive()
    }
}

impl InterruptLine {
    pub fn raise(&self, mem: &mut dyn GuestMemory, kind: InterruptKind) -> Result<()> {
        write_u8(mem, self.config_flag_addr, u8::from(kind == InterruptKind::Config))?;
        write_u8(mem, self.vring_flag_addr, u8::from(kind == InterruptKind::Vring))?;
        // TODO: spread device interrupts across CPUs once the guest brings up more than one.
        self.sink.trigger_irq_for_cpu(0, self.irq);
        Ok(())
    }
}

/// State shared by every device: enabled queues and the interrupt line.
#[derive(Debug, Default)]
pub struct DeviceCore {
    queues: Vec<Option<Virtqueue>>,
    interrupt: Option<InterruptLine>,
}

impl DeviceCore {
    pub fn new(num_queues: u16) -> Self {
        Self {
            queues: vec![None; usize::from(num_queues)],
            interrupt: None,
        }
    }

    pub fn queue(&self, queue: u16) -> Option<&Virtqueue> {
        self.queues.get(usize::from(queue)).and_then(Option::as_ref)
    }

    /// The enabled queue at `queue`.
    pub fn queue_mut(&mut self, queue: u16) -> Result<&mut Virtqueue> {
        match self.queues.get_mut(usize::from(queue)) {
            Some(Some(vq)) => Ok(vq),
            Some(None) => Err(VirtioError::QueueNotEnabled { queue }),
            None => Err(VirtioError::NoSuchQueue {
                queue: u32::from(queue),
            }),
        }
    }

    fn slot(&mut self, queue: u16) -> Result<&mut Option<Virtqueue>> {
        self.queues
            .get_mut(usize::from(queue))
            .ok_or(VirtioError::NoSuchQueue {
                queue: u32::from(queue),
            })
    }

    pub fn interrupt(&self) -> Option<&InterruptLine> {
        self.interrupt.as_ref()
    }

    pub fn trigger(&self, mem: &mut dyn GuestMemory, kind: InterruptKind) -> Result<()> {
        self.interrupt
            .as_ref()
            .ok_or(VirtioError::InterruptNotConfigured)?
            .raise(mem, kind)
    }
}

/// A virtio device backend.
///
/// Implementors provide identity, configuration and queue processing; queue lifecycle and
/// interrupt delivery are provided on top of [`DeviceCore`].
pub trait VirtioDevice: Any {
    fn device_id(&self) -> u32;

    fn device_features(&self) -> u64 {
        DEFAULT_FEATURES
    }

    /// Device-specific configuration space.
    fn config(&self) -> Vec<u8>;

    fn num_queues(&self) -> u16;

    fn core(&self) -> &DeviceCore;

    fn core_mut(&mut self) -> &mut DeviceCore;

    /// The guest made buffers available on `queue`.
    fn notify(&mut self, queue: u16, mem: &mut dyn GuestMemory) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Only the exact offered feature set is accepted.
    fn set_features(&mut self, features: u64) -> Result<()> {
        let offered = self.device_features();
        if features != offered {
            return Err(VirtioError::FeatureMismatch {
                offered,
                requested: features,
            });
        }
        Ok(())
    }

    fn enable(&mut self, queue: u16, vq: Virtqueue) -> Result<()> {
        debug!(
            device = self.device_id(),
            queue,
            size = vq.size(),
            desc = vq.desc_addr(),
            "enable vring"
        );
        *self.core_mut().slot(queue)? = Some(vq);
        Ok(())
    }

    fn disable(&mut self, queue: u16) -> Result<()> {
        debug!(device = self.device_id(), queue, "disable vring");
        *self.core_mut().slot(queue)? = None;
        Ok(())
    }

    fn setup(&mut self, line: InterruptLine) {
        self.core_mut().interrupt = Some(line);
    }

    fn trigger(&self, mem: &mut dyn GuestMemory, kind: InterruptKind) -> Result<()> {
        self.core().trigger(mem, kind)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every interrupt instead of delivering it.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub raised: Mutex<Vec<(u32, u32)>>,
    }

    impl RecordingSink {
        pub fn count(&self) -> usize {
            self.raised.lock().unwrap().len()
        }
    }

    impl IrqSink for RecordingSink {
        fn trigger_irq_for_cpu(&self, cpu: u32, irq: u32) {
            self.raised.lock().unwrap().push((cpu, irq));
        }
    }

    pub const CONFIG_FLAG: u64 = 0x100;
    pub const VRING_FLAG: u64 = 0x101;

    pub fn line(irq: u32, sink: &Arc<RecordingSink>) -> InterruptLine {
        InterruptLine {
            irq,
            config_flag_addr: CONFIG_FLAG,
            vring_flag_addr: VRING_FLAG,
            sink: sink.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::devices::entropy::Entropy;
    use crate::memory::GuestRam;

    #[test]
    fn features_must_match_exactly() {
        let mut dev = Entropy::new();
        assert!(dev.set_features(DEFAULT_FEATURES).is_ok());
        assert!(matches!(
            dev.set_features(VIRTIO_F_VERSION_1),
            Err(VirtioError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn queue_lifecycle() {
        let mut dev = Entropy::new();
        assert!(matches!(
            dev.enable(1, Virtqueue::new(8, 0).unwrap()),
            Err(VirtioError::NoSuchQueue { queue: 1 })
        ));
        dev.enable(0, Virtqueue::new(8, 0x1000).unwrap()).unwrap();
        assert_eq!(dev.core().queue(0).map(Virtqueue::size), Some(8));
        dev.disable(0).unwrap();
        assert!(matches!(
            dev.core_mut().queue_mut(0),
            Err(VirtioError::QueueNotEnabled { queue: 0 })
        ));
    }

    #[test]
    fn trigger_writes_reason_flags() {
        let mut mem = GuestRam::new(0x1000);
        let sink = Arc::new(RecordingSink::default());
        let mut dev = Entropy::new();

        assert!(matches!(
            dev.trigger(&mut mem, InterruptKind::Vring),
            Err(VirtioError::InterruptNotConfigured)
        ));

        dev.setup(line(7, &sink));
        dev.trigger(&mut mem, InterruptKind::Config).unwrap();
        assert_eq!(&mem.as_slice()[0x100..0x102], &[1, 0]);
        dev.trigger(&mut mem, InterruptKind::Vring).unwrap();
        assert_eq!(&mem.as_slice()[0x100..0x102], &[0, 1]);
        assert_eq!(*sink.raised.lock().unwrap(), vec![(0, 7), (0, 7)]);
    }
}
