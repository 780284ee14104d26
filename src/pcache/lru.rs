use std::collections::BTreeMap;

/// Least-recently-used order over arena slots.
///
/// Each member is keyed by the stamp it was (re)inserted with; the smallest stamp is the least
/// recently used.
#[derive(Debug, Default)]
pub(super) struct Lru {
    order: BTreeMap<u64, usize>,
}

impl Lru {
    pub(super) fn insert(&mut self, stamp: u64, slot: usize) {
        let prev = self.order.insert(stamp, slot);
        debug_assert!(prev.is_none(), "duplicate LRU stamp");
    }

    pub(super) fn remove(&mut self, stamp: u64) -> Option<usize> {
        self.order.remove(&stamp)
    }

    /// Slots from least to most recently used.
    pub(super) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.values().copied()
    }

    pub(super) fn len(&self) -> usize {
        self.order.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
