use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BootError, Result};

pub const DEFAULT_CMDLINE: &str = "no_hash_pointers";
pub const DEFAULT_MEMORY_MIB: u32 = 128;
pub const DEFAULT_INITRD_ADDRESS: u32 = 0x20_0000;

const BYTES_PER_MIB: u64 = 0x10_0000;

/// Machine shape, loadable from JSON. Every field is optional.
///
/// ```json
/// { "cmdline": "console=hvc0", "memory_mib": 256, "cpus": 2, "initrd": "init.cpio" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    /// Kernel command line (`/chosen/bootargs`).
    pub cmdline: String,
    pub memory_mib: u32,
    pub cpus: u32,
    /// Image copied into guest memory at `initrd_address` and reserved from the kernel.
    pub initrd: Option<PathBuf>,
    pub initrd_address: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cmdline: DEFAULT_CMDLINE.to_owned(),
            memory_mib: DEFAULT_MEMORY_MIB,
            cpus: 1,
            initrd: None,
            initrd_address: DEFAULT_INITRD_ADDRESS,
        }
    }
}

impl MachineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| BootError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Guest memory size in bytes. Memory is described with one address cell, so it must stay
    /// below 4 GiB.
    pub fn memory_bytes(&self) -> Result<u32> {
        u32::try_from(u64::from(self.memory_mib) * BYTES_PER_MIB).map_err(|_| {
            BootError::InvalidConfig(format!(
                "memory_mib {} does not fit in 32-bit addresses",
                self.memory_mib
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_mib == 0 {
            return Err(BootError::InvalidConfig("memory_mib must be positive".into()));
        }
        self.memory_bytes()?;
        if self.cpus == 0 {
            return Err(BootError::InvalidConfig("cpus must be positive".into()));
        }
        Ok(())
    }
}
