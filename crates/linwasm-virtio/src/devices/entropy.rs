use core::any::Any;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::devices::{DeviceCore, InterruptKind, VirtioDevice};
use crate::memory::GuestMemory;
use crate::Result;

pub const VIRTIO_DEVICE_TYPE_ENTROPY: u32 = 4;

/// Random bytes are produced into a staging buffer of this size and copied into guest memory.
const FILL_CHUNK: usize = 4096;

/// virtio-rng: fills guest buffers with random bytes.
pub struct Entropy<R = OsRng> {
    core: DeviceCore,
    rng: R,
}

impl Entropy {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }
}

impl Default for Entropy {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> Entropy<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            core: DeviceCore::new(1),
            rng,
        }
    }
}

impl<R: RngCore + 'static> VirtioDevice for Entropy<R> {
    fn device_id(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_ENTROPY
    }

    fn config(&self) -> Vec<u8> {
        Vec::new()
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

    /// Services a single request per notification.
    fn notify(&mut self, queue: u16, mem: &mut dyn GuestMemory) -> Result<()> {
        let vq = self.core.queue_mut(queue)?;
        let Some(chain) = vq.pop(mem)? else {
            return Ok(());
        };

        let mut total = 0u32;
        let mut buf = [0u8; FILL_CHUNK];
        for desc in chain.writable() {
            let dst = desc.bytes_mut(mem)?;
            for piece in dst.chunks_mut(FILL_CHUNK) {
                let staged = &mut buf[..piece.len()];
                self.rng.try_fill_bytes(staged)?;
                piece.copy_from_slice(staged);
            }
            total = total.saturating_add(desc.len);
        }
        vq.release(mem, chain, total)?;

        self.core.trigger(mem, InterruptKind::Vring)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
