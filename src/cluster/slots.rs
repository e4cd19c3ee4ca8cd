use std::collections::BTreeMap;

use super::node::NodeRef;

/// Ordered slot -> owning-node index.
///
/// Keys are the big-endian encoding of the slot number, so byte order and
/// numeric order coincide and a `>=` seek lands on the lowest-numbered entry
/// at or above the queried slot. A contiguous run of slots owned by one node
/// is stored sparsely as its two endpoints, both pointing at that node, which
/// keeps the index at no more than two entries per range while preserving
/// logarithmic point lookups.
#[derive(Default)]
pub struct SlotIndex {
    map: BTreeMap<[u8; 4], NodeRef>,
}

fn slot_key(slot: u16) -> [u8; 4] {
    u32::from(slot).to_be_bytes()
}

impl SlotIndex {
    /// Record `node` as the owner entry for `slot`.
    pub fn map_slot(&mut self, slot: u16, node: NodeRef) {
        self.map.insert(slot_key(slot), node);
    }

    /// Owning node of `slot`: the value of the first entry at or after it.
    ///
    /// Any slot inside a stored range is answered by the range's upper
    /// endpoint; an exact single-slot entry answers itself. An unassigned
    /// slot past the last entry yields `None`.
    pub fn node_for_slot(&self, slot: u16) -> Option<NodeRef> {
        self.map
            .range(slot_key(slot)..)
            .next()
            .map(|(_, node)| node.clone())
    }

    /// Node of the smallest mapped slot, if any.
    pub fn first_node(&self) -> Option<NodeRef> {
        self.map.values().next().cloned()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&[u8; 4], &NodeRef)> {
        self.map.iter()
    }

    pub(crate) fn insert_key(&mut self, key: [u8; 4], node: NodeRef) {
        self.map.insert(key, node);
    }
}
