//! Typed views over byte buffers.
//!
//! Both the devicetree encoder and the virtqueue engine read and write binary records at fixed
//! offsets inside byte buffers they do not own. This crate provides:
//!
//! - [`Type`]: a fixed-width value with `get`/`set` at an offset (integers in either endianness,
//!   [`FixedArray`]s, and C-like structs declared with [`layout!`])
//! - [`ByteArena`]: a fixed-capacity output buffer written through a monotonically increasing
//!   cursor
//!
//! Every access is bounds checked against the slice it is given and fails with
//! [`LayoutError::OutOfBounds`]. Callers that size buffers optimistically (the FDT encoder) rely on
//! that error being distinguishable from everything else.

#![forbid(unsafe_code)]

mod arena;
mod error;
mod types;

pub use arena::ByteArena;
pub use error::{LayoutError, Result};
pub use types::{check_range, FixedArray, Type, U16Be, U16Le, U32Be, U32Le, U64Be, U64Le, U8};
