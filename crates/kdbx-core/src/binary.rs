//! Attachment payloads shared between entries

use crate::crypto::sha256;
use std::collections::HashMap;
use std::fmt;

/// Content address of an attachment payload (SHA-256)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinaryId([u8; 32]);

impl BinaryId {
    pub fn of(data: &[u8]) -> Self {
        Self(sha256(&[data]))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One stored payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub data: Vec<u8>,
    /// Flagged for in-memory protection in the KDBX 4 inner header
    pub protected: bool,
}

/// Deduplicated attachment store. Entries hold [`BinaryId`]s; identical
/// payloads are stored once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryPool {
    items: HashMap<BinaryId, Binary>,
}

impl BinaryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data`, returning its id. Re-inserting the same payload only
    /// upgrades its protection flag.
    pub fn insert(&mut self, data: Vec<u8>, protected: bool) -> BinaryId {
        let id = BinaryId::of(&data);
        self.items
            .entry(id)
            .and_modify(|existing| existing.protected |= protected)
            .or_insert(Binary { data, protected });
        id
    }

    pub fn get(&self, id: &BinaryId) -> Option<&Binary> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &BinaryId) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total payload bytes
    pub fn total_size(&self) -> usize {
        self.items.values().map(|b| b.data.len()).sum()
    }

    /// Drop payloads no entry references any more
    pub fn retain_referenced<'a>(&mut self, referenced: impl IntoIterator<Item = &'a BinaryId>) {
        let keep: std::collections::HashSet<&BinaryId> = referenced.into_iter().collect();
        self.items.retain(|id, _| keep.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_content() {
        let mut pool = BinaryPool::new();
        let a = pool.insert(b"same bytes".to_vec(), false);
        let b = pool.insert(b"same bytes".to_vec(), true);
        let c = pool.insert(b"other".to_vec(), false);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
        assert!(pool.get(&a).unwrap().protected);
        assert_eq!(pool.total_size(), 15);
    }

    #[test]
    fn test_retain_referenced() {
        let mut pool = BinaryPool::new();
        let kept = pool.insert(vec![1, 2, 3], false);
        let dropped = pool.insert(vec![4, 5, 6], false);
        pool.retain_referenced([&kept]);
        assert!(pool.contains(&kept));
        assert!(!pool.contains(&dropped));
    }
}
