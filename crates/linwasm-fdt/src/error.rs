use core::fmt;

use linwasm_layout::LayoutError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FdtError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Node,
    Property,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Property => write!(f, "property"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FdtError {
    /// The output buffer is too small. The encoder handles this internally by growing the buffer;
    /// it only escapes from lower-level helpers.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("{kind} name too long ({len} > {max} bytes): {name:?}")]
    NameTooLong {
        kind: NameKind,
        name: String,
        len: usize,
        max: usize,
    },

    #[error("string contains a NUL byte: {0:?}")]
    InvalidString(String),

    #[error("value of property {0:?} does not fit in 32 bits")]
    ValueTooLarge(String),

    #[error("devicetree blob does not fit in 32 bits")]
    TotalSizeTooLarge,

    #[error("{0:?} is a node on one side of a merge and a property on the other")]
    MergeConflict(String),

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported devicetree version {version} (last compatible {last_comp_version})")]
    UnsupportedVersion { version: u32, last_comp_version: u32 },

    #[error("devicetree blob truncated")]
    Truncated,

    #[error("unexpected token {token:#x} at offset {offset}")]
    UnexpectedToken { token: u32, offset: usize },

    #[error("string offset {0} is outside the strings block")]
    BadStringOffset(u32),

    #[error("name is not valid UTF-8")]
    InvalidUtf8,
}
