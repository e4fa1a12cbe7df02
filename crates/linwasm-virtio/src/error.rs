use thiserror::Error;

use crate::memory::GuestMemoryError;

pub type Result<T> = std::result::Result<T, VirtioError>;

pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;

#[derive(Debug, Error)]
pub enum VirtioError {
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),

    #[error("invalid queue size {0}")]
    InvalidQueueSize(u32),

    #[error("descriptor ring of {size} entries at {desc_addr:#x} runs past the end of the address space")]
    RingOutOfRange { desc_addr: u64, size: u16 },

    #[error("descriptor {index} has NEXT set but the following slot is not available")]
    NoNextDescriptor { index: u16 },

    #[error("indirect descriptor table length {len} is not a non-zero multiple of 16")]
    MalformedIndirect { len: u32 },

    #[error("no used slot available at index {index}")]
    RingFull { index: u16 },

    #[error("no such device {0}")]
    NoSuchDevice(u32),

    #[error("no such queue {queue}")]
    NoSuchQueue { queue: u32 },

    #[error("queue {queue} is not enabled")]
    QueueNotEnabled { queue: u16 },

    #[error("driver features {requested:#x} do not match offered features {offered:#x}")]
    FeatureMismatch { offered: u64, requested: u64 },

    #[error("interrupt triggered before setup")]
    InterruptNotConfigured,

    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    #[error("device {device} has type {actual}, expected {expected}")]
    WrongDeviceType {
        device: u32,
        expected: u32,
        actual: u32,
    },

    #[error("entropy source failed")]
    Entropy(#[from] rand::Error),
}

impl VirtioError {
    /// Negative errno reported back to the guest, for errors the guest can recover from.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::NoSuchDevice(_) => Some(-ENODEV),
            Self::NoSuchQueue { .. } => Some(-EINVAL),
            _ => None,
        }
    }
}

/// Converts the outcome of an imported call into the value returned to the guest.
///
/// Index errors become a negative errno; anything else is fatal and propagates.
pub fn import_result(result: Result<()>) -> Result<i32> {
    match result {
        Ok(()) => Ok(0),
        Err(err) => match err.errno() {
            Some(errno) => Ok(errno),
            None => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_errors_map_to_errno() {
        assert_eq!(import_result(Ok(())).unwrap(), 0);
        assert_eq!(import_result(Err(VirtioError::NoSuchDevice(3))).unwrap(), -19);
        assert_eq!(
            import_result(Err(VirtioError::NoSuchQueue { queue: 9 })).unwrap(),
            -22
        );
        assert!(matches!(
            import_result(Err(VirtioError::RingFull { index: 0 })),
            Err(VirtioError::RingFull { .. })
        ));
    }
}
