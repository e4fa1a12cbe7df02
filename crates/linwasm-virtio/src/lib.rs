//! Virtio devices for a kernel running inside a WebAssembly sandbox.
//!
//! The guest driver and the host share linear memory. Each device exposes packed virtqueues
//! ([`queue::Virtqueue`]) which the host drains when the guest notifies, then signals completion
//! through an interrupt line installed at setup time. [`host::VirtioHost`] is the table of devices
//! the guest addresses through its imported `virtio` functions.

#![forbid(unsafe_code)]

pub mod devices;
pub mod error;
pub mod host;
pub mod memory;
pub mod queue;

pub use error::{import_result, Result, VirtioError};
