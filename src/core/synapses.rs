//! Records stored by `Connections` for cells, segments and synapses.
//!
//! A `Synapse` connects a segment (a dendrite branch owned by a cell) to one presynaptic cell.
//! Its permanence says how established the connection is. If the permanence is at or above the
//! connected threshold, the synapse is "connected" and counts toward the segment's connected
//! activity, otherwise it is only "potential".
//!
//! The records live in flat arenas inside `Connections` and refer to each other by index:
//! - a cell owns the ordered list of its segments,
//! - a segment owns the ordered list of its synapses and caches how many of them are connected,
//! - a synapse knows its segment, its presynaptic cell and its slot in the presynaptic reverse index.
//!
//! `PresynapticList` is the reverse index entry for one presynaptic cell. It supports O(1) removal
//! by swapping the removed element with the last one, the caller then fixes the stored slot of the
//! element that moved.

use serde::{Deserialize, Serialize};

/// Index of a cell.
pub type CellIdx = u32;

/// Index of a segment in the segment arena.
pub type Segment = u32;

/// Index of a synapse in the synapse arena.
pub type Synapse = u32;

/// Position of a segment within its cell.
pub type SegmentIdx = u16;

/// Count or position of synapses within one segment.
pub type SynapseIdx = u16;

/// Strength of a synapse, kept within [`MIN_PERMANENCE`, `MAX_PERMANENCE`].
pub type Permanence = f32;

pub const MIN_PERMANENCE: Permanence = 0.0;
pub const MAX_PERMANENCE: Permanence = 1.0;

/// Tolerance for permanence comparisons. The connected threshold is stored lowered by it.
pub const EPSILON: Permanence = 1e-6;

/// A single synapse record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynapseData {
    /// The cell this synapse listens to.
    pub presynaptic_cell: CellIdx,

    /// Current strength of the connection.
    pub permanence: Permanence,

    /// The segment owning this synapse.
    pub segment: Segment,

    /// Slot of this synapse in the reverse index of `presynaptic_cell`.
    pub presynaptic_map_index: usize,

    pub(crate) destroyed: bool,
}

/// A single dendrite segment record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    /// Synapses of this segment, in creation order.
    pub synapses: Vec<Synapse>,

    /// Number of synapses at or above the connected threshold.
    pub num_connected: SynapseIdx,

    /// The cell owning this segment.
    pub cell: CellIdx,

    pub(crate) destroyed: bool,
}

impl SegmentData {
    pub(crate) fn new(cell: CellIdx) -> Self {
        Self {
            cell,
            ..Self::default()
        }
    }
}

/// A single cell record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellData {
    /// Segments of this cell, ordered by creation ordinal.
    pub segments: Vec<Segment>,
}

/// Synapses on one presynaptic cell, together with the segments they belong to.
///
/// `synapses[i]` belongs to `segments[i]`. Each synapse stores `i` as its `presynaptic_map_index`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresynapticList {
    synapses: Vec<Synapse>,
    segments: Vec<Segment>,
}

impl PresynapticList {
    /// Appends an entry and returns its slot.
    #[inline]
    pub fn push(&mut self, synapse: Synapse, segment: Segment) -> usize {
        self.synapses.push(synapse);
        self.segments.push(segment);
        self.synapses.len() - 1
    }

    /// Removes the entry at `slot` by moving the last entry into it.
    /// Returns the synapse that moved into `slot`, if any, so its stored slot can be updated.
    #[inline]
    pub fn swap_remove(&mut self, slot: usize) -> Option<Synapse> {
        self.synapses.swap_remove(slot);
        self.segments.swap_remove(slot);
        self.synapses.get(slot).copied()
    }

    #[inline]
    pub fn synapses(&self) -> &[Synapse] {
        &self.synapses
    }

    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.synapses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.synapses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_remove_reports_moved_entry() {
        let mut list = PresynapticList::default();
        assert_eq!(list.push(10, 1), 0);
        assert_eq!(list.push(11, 1), 1);
        assert_eq!(list.push(12, 2), 2);

        assert_eq!(list.swap_remove(0), Some(12));
        assert_eq!(list.synapses(), &[12, 11]);
        assert_eq!(list.segments(), &[2, 1]);

        assert_eq!(list.swap_remove(1), None);
        assert_eq!(list.swap_remove(0), None);
        assert!(list.is_empty());
    }
}
