//! Flattened Device Tree (FDT) blobs.
//!
//! The kernel boot path expects a v17 devicetree blob describing memory, the command line and the
//! virtio devices the host provides. This crate provides:
//!
//! - [`DeviceTreeNode`] / [`DeviceTreeValue`]: an ordered, explicitly typed configuration tree
//! - [`encode`] / [`encode_with`]: serialization into the binary format
//! - [`Fdt::parse`]: a reader for blobs produced by the encoder (or any other v16+ producer)
//!
//! See <https://devicetree-specification.readthedocs.io/en/stable/flattened-format.html>.

#![forbid(unsafe_code)]

mod encode;
mod error;
mod parse;
mod tree;

pub use encode::{
    encode, encode_with, EncodeOptions, FdtHeader, FdtReserveEntry, MemoryReservation,
    DEFAULT_INITIAL_CAPACITY, FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION,
    FDT_MAGIC, FDT_NOP, FDT_PROP, FDT_VERSION, NODE_NAME_MAX_LEN, PROPERTY_NAME_MAX_LEN,
};
pub use error::{FdtError, NameKind, Result};
pub use parse::Fdt;
pub use tree::{DeviceTreeNode, DeviceTreeValue};
