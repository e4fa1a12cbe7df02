use linwasm_layout::{Type, U32Be};

use crate::encode::FdtPropHeader;
use crate::{
    DeviceTreeNode, DeviceTreeValue, FdtError, FdtHeader, FdtReserveEntry, MemoryReservation,
    Result, FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_NOP,
    FDT_PROP, FDT_VERSION,
};

/// A decoded devicetree blob.
///
/// Property values carry no type information in the binary format, so every property comes back
/// as [`DeviceTreeValue::Bytes`]. Compare against [`DeviceTreeNode::to_raw`] of the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fdt {
    pub header: FdtHeader,
    pub reservations: Vec<MemoryReservation>,
    pub root: DeviceTreeNode,
}

impl Fdt {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let header = FdtHeader::get(blob, 0).map_err(|_| FdtError::Truncated)?;
        if header.magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(header.magic));
        }
        if header.version < FDT_LAST_COMP_VERSION || header.last_comp_version > FDT_VERSION {
            return Err(FdtError::UnsupportedVersion {
                version: header.version,
                last_comp_version: header.last_comp_version,
            });
        }
        let blob = blob
            .get(..header.totalsize as usize)
            .ok_or(FdtError::Truncated)?;

        let reservations = read_reservations(blob, header.off_mem_rsvmap as usize)?;

        let strings_start = header.off_dt_strings as usize;
        let strings = strings_start
            .checked_add(header.size_dt_strings as usize)
            .and_then(|end| blob.get(strings_start..end))
            .ok_or(FdtError::Truncated)?;

        let mut cursor = Cursor {
            blob,
            pos: header.off_dt_struct as usize,
            strings,
        };
        let root = match cursor.token()? {
            (FDT_BEGIN_NODE, _) => {
                cursor.name()?;
                cursor.node()?
            }
            (token, offset) => return Err(FdtError::UnexpectedToken { token, offset }),
        };
        match cursor.token()? {
            (FDT_END, _) => {}
            (token, offset) => return Err(FdtError::UnexpectedToken { token, offset }),
        }

        Ok(Self {
            header,
            reservations,
            root,
        })
    }
}

fn read_reservations(blob: &[u8], mut at: usize) -> Result<Vec<MemoryReservation>> {
    let mut out = Vec::new();
    loop {
        let entry = FdtReserveEntry::get(blob, at).map_err(|_| FdtError::Truncated)?;
        if entry.address == 0 && entry.size == 0 {
            return Ok(out);
        }
        out.push(MemoryReservation {
            address: entry.address,
            size: entry.size,
        });
        at += FdtReserveEntry::SIZE;
    }
}

struct Cursor<'a> {
    blob: &'a [u8],
    pos: usize,
    strings: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn align(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    fn u32(&mut self) -> Result<u32> {
        let v = U32Be::get(self.blob, self.pos).map_err(|_| FdtError::Truncated)?;
        self.pos += 4;
        Ok(v)
    }

    /// Next token other than NOP, with its offset.
    fn token(&mut self) -> Result<(u32, usize)> {
        loop {
            self.align();
            let offset = self.pos;
            let token = self.u32()?;
            if token != FDT_NOP {
                return Ok((token, offset));
            }
        }
    }

    fn name(&mut self) -> Result<&'a str> {
        let rest = self.blob.get(self.pos..).ok_or(FdtError::Truncated)?;
        let name = cstr(rest).ok_or(FdtError::Truncated)?;
        self.pos += name.len() + 1;
        std::str::from_utf8(name).map_err(|_| FdtError::InvalidUtf8)
    }

    fn string_at(&self, nameoff: u32) -> Result<&'a str> {
        let rest = self
            .strings
            .get(nameoff as usize..)
            .ok_or(FdtError::BadStringOffset(nameoff))?;
        let name = cstr(rest).ok_or(FdtError::BadStringOffset(nameoff))?;
        std::str::from_utf8(name).map_err(|_| FdtError::InvalidUtf8)
    }

    /// Reads the body of a node whose BEGIN_NODE token and name have been consumed.
    fn node(&mut self) -> Result<DeviceTreeNode> {
        let mut node = DeviceTreeNode::new();
        loop {
            match self.token()? {
                (FDT_PROP, _) => {
                    let prop = FdtPropHeader::get(self.blob, self.pos)
                        .map_err(|_| FdtError::Truncated)?;
                    self.pos += FdtPropHeader::SIZE;
                    let end = self
                        .pos
                        .checked_add(prop.len as usize)
                        .ok_or(FdtError::Truncated)?;
                    let value = self.blob.get(self.pos..end).ok_or(FdtError::Truncated)?;
                    self.pos = end;
                    let name = self.string_at(prop.nameoff)?;
                    node.insert(name, DeviceTreeValue::Bytes(value.to_vec()));
                }
                (FDT_BEGIN_NODE, _) => {
                    let name = self.name()?;
                    let child = self.node()?;
                    node.insert(name, child);
                }
                (FDT_END_NODE, _) => return Ok(node),
                (token, offset) => return Err(FdtError::UnexpectedToken { token, offset }),
            }
        }
    }
}

fn cstr(bytes: &[u8]) -> Option<&[u8]> {
    let nul = bytes.iter().position(|&b| b == 0)?;
    Some(&bytes[..nul])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    #[test]
    fn rejects_foreign_blobs() {
        assert_eq!(Fdt::parse(&[0; 8]), Err(FdtError::Truncated));
        assert_eq!(Fdt::parse(&[0; 64]), Err(FdtError::BadMagic(0)));

        let mut blob = encode(&DeviceTreeNode::new(), &[], 0).unwrap();
        blob.pop();
        assert_eq!(Fdt::parse(&blob), Err(FdtError::Truncated));
    }

    #[test]
    fn skips_nops_and_reports_bad_tokens() {
        let tree = DeviceTreeNode::new().with("a", 1u32);
        let mut blob = encode(&tree, &[], 0).unwrap();
        let header = FdtHeader::get(&blob, 0).unwrap();
        let root = header.off_dt_struct as usize;

        // Root name is empty, so the first property token follows at +8. Token, len, nameoff
        // and one cell span four words.
        assert_eq!(U32Be::get(&blob, root + 8).unwrap(), FDT_PROP);
        let mut nops = blob.clone();
        for word in 0..4 {
            U32Be::set(&mut nops, root + 8 + word * 4, FDT_NOP).unwrap();
        }
        assert!(Fdt::parse(&nops).unwrap().root.is_empty());

        U32Be::set(&mut blob, root + 8, 0x7).unwrap();
        assert_eq!(
            Fdt::parse(&blob),
            Err(FdtError::UnexpectedToken {
                token: 0x7,
                offset: root + 8
            })
        );
    }

    #[test]
    fn bad_string_offset() {
        let tree = DeviceTreeNode::new().with("a", 1u32);
        let mut blob = encode(&tree, &[], 0).unwrap();
        let header = FdtHeader::get(&blob, 0).unwrap();
        // nameoff of the only property
        let nameoff_at = header.off_dt_struct as usize + 8 + 4 + 4;
        U32Be::set(&mut blob, nameoff_at, 100).unwrap();
        assert_eq!(Fdt::parse(&blob), Err(FdtError::BadStringOffset(100)));
    }
}
