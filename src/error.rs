use std::path::PathBuf;

use linwasm_fdt::FdtError;
use linwasm_virtio::memory::GuestMemoryError;
use linwasm_virtio::VirtioError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BootError>;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("invalid machine config: {0}")]
    InvalidConfig(String),

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse machine config")]
    ParseConfig(#[from] serde_json::Error),

    #[error("devicetree truncated: blob is {needed} bytes, buffer holds {size}")]
    DevicetreeTruncated { needed: usize, size: u32 },

    #[error(transparent)]
    Fdt(#[from] FdtError),

    #[error(transparent)]
    Virtio(#[from] VirtioError),

    #[error(transparent)]
    Memory(#[from] GuestMemoryError),

    #[error("entropy source failed")]
    Entropy(#[from] rand::Error),
}
