//! Host side of a Linux kernel booted inside a WebAssembly sandbox.
//!
//! - [`MachineConfig`]: memory size, CPU count, command line and initrd placement
//! - [`Machine`]: owns the virtio device table and produces the boot devicetree
//!
//! The building blocks live in their own crates and are re-exported here:
//! [`fdt`] (devicetree encoding), [`virtio`] (packed virtqueues and devices) and [`layout`]
//! (byte-layout primitives).

#![forbid(unsafe_code)]

mod config;
mod error;
mod machine;

pub use config::{MachineConfig, DEFAULT_CMDLINE, DEFAULT_INITRD_ADDRESS, DEFAULT_MEMORY_MIB};
pub use error::{BootError, Result};
pub use machine::{Machine, RNG_SEED_BYTES};

pub use linwasm_fdt as fdt;
pub use linwasm_layout as layout;
pub use linwasm_virtio as virtio;
