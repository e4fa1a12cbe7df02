use crate::{FdtError, Result};

/// A devicetree node: properties and child nodes keyed by name, in insertion order.
///
/// Inserting a key that already exists replaces the value in its original slot, so the emitted
/// order never depends on how often a key was overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTreeNode {
    entries: Vec<(String, DeviceTreeValue)>,
}

/// A devicetree entry. `Node` is a child node; every other variant is a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTreeValue {
    Node(DeviceTreeNode),
    /// One big-endian cell.
    Int(u32),
    /// Two big-endian cells.
    U64(u64),
    /// NUL-terminated string.
    String(String),
    /// Raw bytes, emitted as-is.
    Bytes(Vec<u8>),
    /// One big-endian cell per element.
    IntArray(Vec<u32>),
    /// Zero-length property (a boolean flag such as `ranges;`).
    Empty,
}

impl DeviceTreeNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`DeviceTreeNode::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DeviceTreeValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<DeviceTreeValue>,
    ) -> Option<DeviceTreeValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<DeviceTreeValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn get(&self, key: &str) -> Option<&DeviceTreeValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn child(&self, name: &str) -> Option<&DeviceTreeNode> {
        match self.get(name) {
            Some(DeviceTreeValue::Node(node)) => Some(node),
            _ => None,
        }
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut DeviceTreeNode> {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some((_, DeviceTreeValue::Node(node))) => Some(node),
            _ => None,
        }
    }

    /// Looks up a descendant by `/`-separated path. The empty path is `self`.
    pub fn find(&self, path: &str) -> Option<&DeviceTreeNode> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self, |node, part| node.child(part))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &DeviceTreeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Property entries in insertion order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &DeviceTreeValue)> {
        self.entries()
            .filter(|(_, v)| !v.is_node())
    }

    /// Child nodes in insertion order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &DeviceTreeNode)> {
        self.entries().filter_map(|(k, v)| match v {
            DeviceTreeValue::Node(node) => Some((k, node)),
            _ => None,
        })
    }

    /// Deep-merges `other` into `self`: child nodes present on both sides are merged
    /// recursively and properties from `other` overwrite. A node and a property may not share a
    /// name.
    pub fn merge(&mut self, other: DeviceTreeNode) -> Result<()> {
        for (key, value) in other.entries {
            match value {
                DeviceTreeValue::Node(node) => match self.entries.iter_mut().find(|(k, _)| *k == key)
                {
                    Some((_, DeviceTreeValue::Node(existing))) => existing.merge(node)?,
                    Some(_) => return Err(FdtError::MergeConflict(key)),
                    None => self.entries.push((key, DeviceTreeValue::Node(node))),
                },
                value => match self.entries.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, DeviceTreeValue::Node(_))) => {
                        return Err(FdtError::MergeConflict(key))
                    }
                    Some((_, slot)) => *slot = value,
                    None => self.entries.push((key, value)),
                },
            }
        }
        Ok(())
    }

    /// Returns a copy of the tree with every property replaced by its encoded bytes, which is
    /// the form [`crate::Fdt::parse`] produces.
    pub fn to_raw(&self) -> Result<DeviceTreeNode> {
        let mut out = DeviceTreeNode::new();
        for (key, value) in self.entries() {
            let raw = match value {
                DeviceTreeValue::Node(node) => DeviceTreeValue::Node(node.to_raw()?),
                value => DeviceTreeValue::Bytes(value.to_bytes()?),
            };
            out.entries.push((key.to_owned(), raw));
        }
        Ok(out)
    }
}

impl DeviceTreeValue {
    /// Native-endian bytes of a `u16` sequence.
    pub fn from_u16s(words: &[u16]) -> Self {
        Self::Bytes(words.iter().flat_map(|w| w.to_ne_bytes()).collect())
    }

    /// Native-endian bytes of a `u64` sequence.
    pub fn from_u64s(words: &[u64]) -> Self {
        Self::Bytes(words.iter().flat_map(|w| w.to_ne_bytes()).collect())
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Self::Node(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Property payload as it appears in the structure block.
    ///
    /// Nodes have no payload and encode as an empty slice.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Node(_) | Self::Empty => Vec::new(),
            Self::Int(v) => v.to_be_bytes().to_vec(),
            Self::U64(v) => v.to_be_bytes().to_vec(),
            Self::String(s) => {
                if s.contains('\0') {
                    return Err(FdtError::InvalidString(s.clone()));
                }
                let mut out = Vec::with_capacity(s.len() + 1);
                out.extend_from_slice(s.as_bytes());
                out.push(0);
                out
            }
            Self::Bytes(bytes) => bytes.clone(),
            Self::IntArray(cells) => cells.iter().flat_map(|c| c.to_be_bytes()).collect(),
        })
    }
}

impl From<DeviceTreeNode> for DeviceTreeValue {
    fn from(node: DeviceTreeNode) -> Self {
        Self::Node(node)
    }
}

impl From<u32> for DeviceTreeValue {
    fn from(v: u32) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for DeviceTreeValue {
    fn from(v: i32) -> Self {
        Self::Int(v as u32)
    }
}

impl From<u64> for DeviceTreeValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<&str> for DeviceTreeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for DeviceTreeValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for DeviceTreeValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for DeviceTreeValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u32>> for DeviceTreeValue {
    fn from(cells: Vec<u32>) -> Self {
        Self::IntArray(cells)
    }
}

impl<const N: usize> From<[u32; N]> for DeviceTreeValue {
    fn from(cells: [u32; N]) -> Self {
        Self::IntArray(cells.to_vec())
    }
}

impl From<()> for DeviceTreeValue {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}
