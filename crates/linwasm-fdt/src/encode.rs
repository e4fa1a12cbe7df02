use std::collections::HashMap;

use linwasm_layout::{layout, ByteArena, LayoutError, Type, U32Be, U64Be, U8};
use tracing::debug;

use crate::{DeviceTreeNode, FdtError, NameKind, Result};

pub const FDT_MAGIC: u32 = 0xd00d_feed;
pub const FDT_VERSION: u32 = 17;
pub const FDT_LAST_COMP_VERSION: u32 = 16;

pub const FDT_BEGIN_NODE: u32 = 0x1;
pub const FDT_END_NODE: u32 = 0x2;
pub const FDT_PROP: u32 = 0x3;
pub const FDT_NOP: u32 = 0x4;
pub const FDT_END: u32 = 0x9;

/// Longest node or property name the kernel accepts, in bytes, excluding the terminator.
pub const NODE_NAME_MAX_LEN: usize = 31;
pub const PROPERTY_NAME_MAX_LEN: usize = 31;

pub const DEFAULT_INITIAL_CAPACITY: usize = 1024;

layout! {
    pub struct FdtHeader {
        pub magic: U32Be,
        pub totalsize: U32Be,
        pub off_dt_struct: U32Be,
        pub off_dt_strings: U32Be,
        pub off_mem_rsvmap: U32Be,
        pub version: U32Be,
        pub last_comp_version: U32Be,
        pub boot_cpuid_phys: U32Be,
        pub size_dt_strings: U32Be,
        pub size_dt_struct: U32Be,
    }
}

layout! {
    pub struct FdtReserveEntry {
        pub address: U64Be,
        pub size: U64Be,
    }
}

layout! {
    pub(crate) struct FdtPropHeader {
        pub(crate) len: U32Be,
        pub(crate) nameoff: U32Be,
    }
}

/// A physical memory range the kernel must not allocate from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReservation {
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOptions {
    pub reservations: Vec<MemoryReservation>,
    pub boot_cpu_id: u32,
    /// Size of the first output buffer. The buffer is doubled and the encode restarted for as long
    /// as the blob does not fit, so this only affects performance.
    pub initial_capacity: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            reservations: Vec::new(),
            boot_cpu_id: 0,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }
}

/// Encodes `tree` as the root node of a devicetree blob.
pub fn encode(
    tree: &DeviceTreeNode,
    reservations: &[MemoryReservation],
    boot_cpu_id: u32,
) -> Result<Vec<u8>> {
    encode_with(
        tree,
        &EncodeOptions {
            reservations: reservations.to_vec(),
            boot_cpu_id,
            ..EncodeOptions::default()
        },
    )
}

pub fn encode_with(tree: &DeviceTreeNode, options: &EncodeOptions) -> Result<Vec<u8>> {
    let mut capacity = options.initial_capacity.max(1);
    loop {
        match Encoder::new(capacity).run(tree, options) {
            Err(FdtError::Layout(LayoutError::OutOfBounds { .. })) => {
                let next = capacity
                    .checked_mul(2)
                    .ok_or(FdtError::TotalSizeTooLarge)?;
                debug!(capacity, next, "devicetree buffer too small, restarting encode");
                capacity = next;
            }
            result => return result,
        }
    }
}

/// Property names in first-use order. Offsets are final as soon as a name is interned.
#[derive(Default)]
struct StringTable {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    fn intern(&mut self, name: &str) -> Result<u32> {
        if let Some(&offset) = self.offsets.get(name) {
            return Ok(offset);
        }
        let offset = to_u32(self.bytes.len())?;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_owned(), offset);
        Ok(offset)
    }
}

struct Encoder {
    out: ByteArena,
    strings: StringTable,
}

impl Encoder {
    fn new(capacity: usize) -> Self {
        Self {
            out: ByteArena::with_capacity(capacity),
            strings: StringTable::default(),
        }
    }

    fn run(mut self, tree: &DeviceTreeNode, options: &EncodeOptions) -> Result<Vec<u8>> {
        let mut header = FdtHeader {
            magic: FDT_MAGIC,
            totalsize: 0,
            off_dt_struct: 0,
            off_dt_strings: 0,
            off_mem_rsvmap: 0,
            version: FDT_VERSION,
            last_comp_version: FDT_LAST_COMP_VERSION,
            boot_cpuid_phys: options.boot_cpu_id,
            size_dt_strings: 0,
            size_dt_struct: 0,
        };
        let header_at = self.out.alloc::<FdtHeader>(header)?;

        self.out.align(8)?;
        header.off_mem_rsvmap = to_u32(self.out.len())?;
        for r in &options.reservations {
            self.out.alloc::<FdtReserveEntry>(FdtReserveEntry {
                address: r.address,
                size: r.size,
            })?;
        }
        self.out
            .alloc::<FdtReserveEntry>(FdtReserveEntry { address: 0, size: 0 })?;

        let struct_start = self.out.len();
        header.off_dt_struct = to_u32(struct_start)?;
        self.node("", tree)?;
        self.token(FDT_END)?;
        header.size_dt_struct = to_u32(self.out.len() - struct_start)?;

        header.off_dt_strings = to_u32(self.out.len())?;
        header.size_dt_strings = to_u32(self.strings.bytes.len())?;
        let strings = std::mem::take(&mut self.strings.bytes);
        self.out.append(&strings)?;

        header.totalsize = to_u32(self.out.len())?;
        self.out.set_at::<FdtHeader>(header_at, header)?;
        Ok(self.out.into_bytes())
    }

    fn token(&mut self, token: u32) -> Result<()> {
        self.out.align(4)?;
        self.out.alloc::<U32Be>(token)?;
        Ok(())
    }

    fn node(&mut self, name: &str, node: &DeviceTreeNode) -> Result<()> {
        check_name(NameKind::Node, name, NODE_NAME_MAX_LEN)?;
        self.token(FDT_BEGIN_NODE)?;
        self.out.append(name.as_bytes())?;
        self.out.alloc::<U8>(0)?;
        self.out.align(4)?;

        for (key, value) in node.properties() {
            check_name(NameKind::Property, key, PROPERTY_NAME_MAX_LEN)?;
            let payload = value.to_bytes()?;
            let len = u32::try_from(payload.len())
                .map_err(|_| FdtError::ValueTooLarge(key.to_owned()))?;
            let nameoff = self.strings.intern(key)?;

            self.token(FDT_PROP)?;
            self.out.alloc::<FdtPropHeader>(FdtPropHeader { len, nameoff })?;
            self.out.append(&payload)?;
            self.out.align(4)?;
        }

        for (key, child) in node.children() {
            self.node(key, child)?;
        }

        self.token(FDT_END_NODE)
    }
}

fn check_name(kind: NameKind, name: &str, max: usize) -> Result<()> {
    if name.len() > max {
        return Err(FdtError::NameTooLong {
            kind,
            name: name.to_owned(),
            len: name.len(),
            max,
        });
    }
    if name.contains('\0') {
        return Err(FdtError::InvalidString(name.to_owned()));
    }
    Ok(())
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| FdtError::TotalSizeTooLarge)
}

const _: () = assert!(FdtHeader::SIZE == 40);
const _: () = assert!(FdtReserveEntry::SIZE == 16);
