//! The `Connections` struct stores the cell/segment/synapse graph that HTM algorithms learn on.
//!
//! Each cell owns dendrite segments and each segment owns synapses onto presynaptic cells.
//! Records live in flat arenas and are addressed by index. Destroyed records go onto a free list
//! and their index is handed out again before the arenas grow, so a live index never changes.
//! Every segment and synapse also receives an ordinal at creation time. Ordinals are never reused
//! and give a stable age order independent of slot reuse.
//!
//! For each presynaptic cell two reverse indices are kept:
//! - the **connected** list: synapses with permanence at or above the connected threshold,
//! - the **potential** list: every other synapse.
//!
//! A synapse is in exactly one of them at any time. When a permanence update crosses the threshold,
//! the synapse moves from one list to the other and its segment's `num_connected` is adjusted.
//! `compute_activity` walks only the reverse index entries of the active cells, which makes it
//! proportional to the activity rather than to the size of the graph.
//!
//! In `timeseries` mode `adapt_segment` remembers the permanence change applied to each synapse in
//! the previous step and skips re-applying an identical change. `raise_permanences_to_threshold`,
//! `synapse_competition` and `bump_segment` never consult these buffers.

use crate::core::sdr::Sdr;
use crate::core::serialization::{self, TokenReader};
use crate::core::synapses::{
    CellData, CellIdx, Permanence, PresynapticList, Segment, SegmentData, SegmentIdx, Synapse,
    SynapseData, SynapseIdx, EPSILON, MAX_PERMANENCE, MIN_PERMANENCE,
};
use crate::error::{HtmError, Result};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, Read, Write};
use tracing::{debug, warn};

const CONNECTIONS_VERSION: u32 = 2;

/// Receives notifications about structural changes of a `Connections` instance.
/// Every method defaults to doing nothing.
pub trait ConnectionsEventHandler {
    /// Called after a segment has been created.
    fn on_create_segment(&mut self, _segment: Segment) {}

    /// Called after a synapse has been created, before its permanence is set.
    fn on_create_synapse(&mut self, _synapse: Synapse) {}

    /// Called before a segment is destroyed.
    fn on_destroy_segment(&mut self, _segment: Segment) {}

    /// Called before a synapse is destroyed.
    fn on_destroy_synapse(&mut self, _synapse: Synapse) {}

    /// Called after a permanence update moved a synapse between connected and potential.
    fn on_update_synapse_permanence(&mut self, _synapse: Synapse, _permanence: Permanence) {}
}

/// Subscribed handlers, keyed by their token. They are owned by the registry until unsubscribed.
/// Handlers are neither serialized nor cloned.
#[derive(Default)]
struct EventHandlers {
    handlers: BTreeMap<u32, Box<dyn ConnectionsEventHandler>>,
    next_token: u32,
}

impl EventHandlers {
    fn each(&mut self, mut notify: impl FnMut(&mut dyn ConnectionsEventHandler)) {
        for handler in self.handlers.values_mut() {
            notify(handler.as_mut());
        }
    }
}

impl Clone for EventHandlers {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

/// Synapse graph with potential and connected reverse indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connections {
    cells: Vec<CellData>,
    segments: Vec<SegmentData>,
    destroyed_segments: Vec<Segment>,
    synapses: Vec<SynapseData>,
    destroyed_synapses: Vec<Synapse>,

    potential: FxHashMap<CellIdx, PresynapticList>,
    connected: FxHashMap<CellIdx, PresynapticList>,

    segment_ordinals: Vec<u64>,
    synapse_ordinals: Vec<u64>,
    next_segment_ordinal: u64,
    next_synapse_ordinal: u64,

    /// The threshold as given by the caller.
    connected_threshold: Permanence,
    /// The threshold lowered by `EPSILON`, used for every comparison.
    threshold: Permanence,

    timeseries: bool,
    previous_updates: Vec<Permanence>,
    current_updates: Vec<Permanence>,

    #[serde(skip)]
    handlers: EventHandlers,
}

fn remove_from_presynaptic_map(
    map: &mut FxHashMap<CellIdx, PresynapticList>,
    synapses: &mut [SynapseData],
    presynaptic_cell: CellIdx,
    slot: usize,
) {
    if let Some(list) = map.get_mut(&presynaptic_cell) {
        if let Some(moved) = list.swap_remove(slot) {
            synapses[moved as usize].presynaptic_map_index = slot;
        }
        if list.is_empty() {
            map.remove(&presynaptic_cell);
        }
    }
}

impl Connections {
    /// Creates an empty graph of `num_cells` cells.
    pub fn new(num_cells: CellIdx, connected_threshold: Permanence, timeseries: bool) -> Result<Self> {
        let mut connections = Self {
            cells: Vec::new(),
            segments: Vec::new(),
            destroyed_segments: Vec::new(),
            synapses: Vec::new(),
            destroyed_synapses: Vec::new(),
            potential: FxHashMap::default(),
            connected: FxHashMap::default(),
            segment_ordinals: Vec::new(),
            synapse_ordinals: Vec::new(),
            next_segment_ordinal: 0,
            next_synapse_ordinal: 0,
            connected_threshold,
            threshold: connected_threshold - EPSILON,
            timeseries,
            previous_updates: Vec::new(),
            current_updates: Vec::new(),
            handlers: EventHandlers::default(),
        };
        connections.initialize(num_cells, connected_threshold, timeseries)?;
        Ok(connections)
    }

    /// Discards every segment, synapse and subscribed handler and starts over with `num_cells`
    /// empty cells.
    pub fn initialize(
        &mut self,
        num_cells: CellIdx,
        connected_threshold: Permanence,
        timeseries: bool,
    ) -> Result<()> {
        if !(MIN_PERMANENCE..=MAX_PERMANENCE).contains(&connected_threshold) {
            return Err(HtmError::invalid(
                "connected_threshold",
                format!("must be within [0, 1], got {connected_threshold}"),
            ));
        }

        self.cells = vec![CellData::default(); num_cells as usize];
        self.segments.clear();
        self.destroyed_segments.clear();
        self.synapses.clear();
        self.destroyed_synapses.clear();
        self.potential.clear();
        self.connected.clear();
        self.segment_ordinals.clear();
        self.synapse_ordinals.clear();
        self.next_segment_ordinal = 0;
        self.next_synapse_ordinal = 0;
        self.connected_threshold = connected_threshold;
        self.threshold = connected_threshold - EPSILON;
        self.timeseries = timeseries;
        self.previous_updates.clear();
        self.current_updates.clear();
        self.handlers = EventHandlers::default();

        Ok(())
    }

    /// Registers an event handler and returns the token to unsubscribe it with.
    pub fn subscribe(&mut self, handler: Box<dyn ConnectionsEventHandler>) -> u32 {
        let token = self.handlers.next_token;
        self.handlers.next_token += 1;
        self.handlers.handlers.insert(token, handler);
        token
    }

    /// Removes an event handler and hands it back to the caller.
    pub fn unsubscribe(&mut self, token: u32) -> Result<Box<dyn ConnectionsEventHandler>> {
        self.handlers.handlers.remove(&token).ok_or_else(|| {
            HtmError::invalid("token", format!("no event handler subscribed as {token}"))
        })
    }

    fn check_cell(&self, cell: CellIdx) -> Result<&CellData> {
        self.cells
            .get(cell as usize)
            .ok_or_else(|| HtmError::out_of_range("cell", cell as usize, self.cells.len()))
    }

    fn check_segment(&self, segment: Segment) -> Result<&SegmentData> {
        match self.segments.get(segment as usize) {
            Some(data) if !data.destroyed => Ok(data),
            Some(_) => Err(HtmError::invalid(
                "segment",
                format!("segment {segment} has been destroyed"),
            )),
            None => Err(HtmError::out_of_range(
                "segment",
                segment as usize,
                self.segments.len(),
            )),
        }
    }

    fn check_synapse(&self, synapse: Synapse) -> Result<&SynapseData> {
        match self.synapses.get(synapse as usize) {
            Some(data) if !data.destroyed => Ok(data),
            Some(_) => Err(HtmError::invalid(
                "synapse",
                format!("synapse {synapse} has been destroyed"),
            )),
            None => Err(HtmError::out_of_range(
                "synapse",
                synapse as usize,
                self.synapses.len(),
            )),
        }
    }

    /// Creates a segment on `cell`, reusing a destroyed segment's index when one is available.
    pub fn create_segment(&mut self, cell: CellIdx) -> Result<Segment> {
        if self.check_cell(cell)?.segments.len() >= SegmentIdx::MAX as usize {
            return Err(HtmError::CapacityExhausted("segments per cell"));
        }

        let segment = match self.destroyed_segments.pop() {
            Some(segment) => segment,
            None => {
                if self.segments.len() >= Segment::MAX as usize {
                    return Err(HtmError::CapacityExhausted("segment index space"));
                }
                self.segments.push(SegmentData::default());
                self.segment_ordinals.push(0);
                (self.segments.len() - 1) as Segment
            }
        };

        self.segments[segment as usize] = SegmentData::new(cell);
        self.segment_ordinals[segment as usize] = self.next_segment_ordinal;
        self.next_segment_ordinal += 1;
        // The newest ordinal is the largest, so pushing keeps the cell's list in ordinal order.
        self.cells[cell as usize].segments.push(segment);

        self.handlers.each(|h| h.on_create_segment(segment));

        Ok(segment)
    }

    /// Creates a synapse on `segment` listening to `presynaptic_cell`.
    ///
    /// The synapse starts out disconnected and is then moved to `permanence`, so it lands in the
    /// right reverse index straight away. The presynaptic cell may lie outside of this graph's
    /// cells, e.g. for external inputs.
    pub fn create_synapse(
        &mut self,
        segment: Segment,
        presynaptic_cell: CellIdx,
        permanence: Permanence,
    ) -> Result<Synapse> {
        if self.check_segment(segment)?.synapses.len() >= SynapseIdx::MAX as usize {
            return Err(HtmError::CapacityExhausted("synapses per segment"));
        }

        let synapse = match self.destroyed_synapses.pop() {
            Some(synapse) => synapse,
            None => {
                if self.synapses.len() >= Synapse::MAX as usize {
                    return Err(HtmError::CapacityExhausted("synapse index space"));
                }
                self.synapses.push(SynapseData {
                    presynaptic_cell: 0,
                    permanence: MIN_PERMANENCE,
                    segment: 0,
                    presynaptic_map_index: 0,
                    destroyed: false,
                });
                self.synapse_ordinals.push(0);
                (self.synapses.len() - 1) as Synapse
            }
        };

        let slot = self
            .potential
            .entry(presynaptic_cell)
            .or_default()
            .push(synapse, segment);
        self.synapses[synapse as usize] = SynapseData {
            presynaptic_cell,
            permanence: self.threshold - 1.0,
            segment,
            presynaptic_map_index: slot,
            destroyed: false,
        };
        self.synapse_ordinals[synapse as usize] = self.next_synapse_ordinal;
        self.next_synapse_ordinal += 1;
        self.segments[segment as usize].synapses.push(synapse);

        self.handlers.each(|h| h.on_create_synapse(synapse));

        self.update_permanence(synapse, permanence);

        Ok(synapse)
    }

    /// Destroys a segment and all of its synapses. The index goes onto the free list.
    pub fn destroy_segment(&mut self, segment: Segment) -> Result<()> {
        self.check_segment(segment)?;
        self.handlers.each(|h| h.on_destroy_segment(segment));

        while let Some(&synapse) = self.segments[segment as usize].synapses.last() {
            self.destroy_synapse_unchecked(synapse);
        }

        let cell = self.segments[segment as usize].cell;
        let ordinals = &self.segment_ordinals;
        let on_cell = &mut self.cells[cell as usize].segments;
        if let Ok(position) =
            on_cell.binary_search_by_key(&ordinals[segment as usize], |&s| ordinals[s as usize])
        {
            on_cell.remove(position);
        }

        self.segments[segment as usize].destroyed = true;
        self.destroyed_segments.push(segment);

        Ok(())
    }

    /// Destroys a single synapse. The index goes onto the free list.
    pub fn destroy_synapse(&mut self, synapse: Synapse) -> Result<()> {
        self.check_synapse(synapse)?;
        self.destroy_synapse_unchecked(synapse);
        Ok(())
    }

    fn destroy_synapse_unchecked(&mut self, synapse: Synapse) {
        self.handlers.each(|h| h.on_destroy_synapse(synapse));

        let data = self.synapses[synapse as usize];
        let map = if data.permanence >= self.threshold {
            self.segments[data.segment as usize].num_connected -= 1;
            &mut self.connected
        } else {
            &mut self.potential
        };
        remove_from_presynaptic_map(
            map,
            &mut self.synapses,
            data.presynaptic_cell,
            data.presynaptic_map_index,
        );

        let ordinals = &self.synapse_ordinals;
        let on_segment = &mut self.segments[data.segment as usize].synapses;
        if let Ok(position) =
            on_segment.binary_search_by_key(&ordinals[synapse as usize], |&s| ordinals[s as usize])
        {
            on_segment.remove(position);
        }

        self.synapses[synapse as usize].destroyed = true;
        self.destroyed_synapses.push(synapse);
    }

    /// Sets a synapse's permanence, clamped to [0, 1].
    pub fn update_synapse_permanence(
        &mut self,
        synapse: Synapse,
        permanence: Permanence,
    ) -> Result<()> {
        self.check_synapse(synapse)?;
        self.update_permanence(synapse, permanence);
        Ok(())
    }

    fn update_permanence(&mut self, synapse: Synapse, permanence: Permanence) {
        let permanence = permanence.min(MAX_PERMANENCE).max(MIN_PERMANENCE);

        let data = &mut self.synapses[synapse as usize];
        let before = data.permanence >= self.threshold;
        let after = permanence >= self.threshold;
        data.permanence = permanence;

        if before == after {
            return;
        }

        let SynapseData {
            presynaptic_cell,
            segment,
            presynaptic_map_index,
            ..
        } = *data;

        let (from, to) = if after {
            (&mut self.potential, &mut self.connected)
        } else {
            (&mut self.connected, &mut self.potential)
        };
        remove_from_presynaptic_map(from, &mut self.synapses, presynaptic_cell, presynaptic_map_index);
        let slot = to.entry(presynaptic_cell).or_default().push(synapse, segment);
        self.synapses[synapse as usize].presynaptic_map_index = slot;

        let segment_data = &mut self.segments[segment as usize];
        if after {
            segment_data.num_connected += 1;
        } else {
            segment_data.num_connected -= 1;
        }

        self.handlers
            .each(|h| h.on_update_synapse_permanence(synapse, permanence));
    }

    /// Segments of a cell, ordered by creation.
    pub fn segments_for_cell(&self, cell: CellIdx) -> Result<&[Segment]> {
        Ok(&self.check_cell(cell)?.segments)
    }

    /// The `idx`-th segment of a cell.
    pub fn get_segment(&self, cell: CellIdx, idx: SegmentIdx) -> Result<Segment> {
        let segments = &self.check_cell(cell)?.segments;
        segments
            .get(idx as usize)
            .copied()
            .ok_or_else(|| HtmError::out_of_range("segment on cell", idx as usize, segments.len()))
    }

    /// Synapses of a segment, ordered by creation.
    pub fn synapses_for_segment(&self, segment: Segment) -> Result<&[Synapse]> {
        Ok(&self.check_segment(segment)?.synapses)
    }

    pub fn cell_for_segment(&self, segment: Segment) -> Result<CellIdx> {
        Ok(self.check_segment(segment)?.cell)
    }

    /// Position of a segment within its cell's segment list.
    pub fn idx_on_cell_for_segment(&self, segment: Segment) -> Result<SegmentIdx> {
        let cell = self.check_segment(segment)?.cell;
        let position = self.cells[cell as usize]
            .segments
            .iter()
            .position(|&s| s == segment)
            .ok_or(HtmError::InvalidState("segment missing from its cell"))?;
        Ok(position as SegmentIdx)
    }

    pub fn segment_for_synapse(&self, synapse: Synapse) -> Result<Segment> {
        Ok(self.check_synapse(synapse)?.segment)
    }

    pub fn data_for_segment(&self, segment: Segment) -> Result<&SegmentData> {
        self.check_segment(segment)
    }

    pub fn data_for_synapse(&self, synapse: Synapse) -> Result<&SynapseData> {
        self.check_synapse(synapse)
    }

    /// Every synapse listening to `presynaptic_cell`: the potential ones, then the connected ones.
    pub fn synapses_for_presynaptic_cell(&self, presynaptic_cell: CellIdx) -> Vec<Synapse> {
        self.potential
            .get(&presynaptic_cell)
            .into_iter()
            .chain(self.connected.get(&presynaptic_cell))
            .flat_map(|list| list.synapses().iter().copied())
            .collect()
    }

    /// Orders two segments by owning cell, then by age.
    pub fn compare_segments(&self, a: Segment, b: Segment) -> Result<Ordering> {
        self.check_segment(a)?;
        self.check_segment(b)?;
        Ok(self.segment_order(a, b))
    }

    /// `compare_segments` for indices known to be live.
    #[inline]
    pub(crate) fn segment_order(&self, a: Segment, b: Segment) -> Ordering {
        let cell_a = self.segments[a as usize].cell;
        let cell_b = self.segments[b as usize].cell;
        cell_a.cmp(&cell_b).then_with(|| {
            self.segment_ordinals[a as usize].cmp(&self.segment_ordinals[b as usize])
        })
    }

    /// Creation ordinal of a segment. Ordinals are never reused, unlike indices.
    pub fn segment_ordinal(&self, segment: Segment) -> Result<u64> {
        self.check_segment(segment)?;
        Ok(self.segment_ordinals[segment as usize])
    }

    #[inline]
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Number of live segments.
    #[inline]
    pub fn num_segments(&self) -> usize {
        self.segments.len() - self.destroyed_segments.len()
    }

    pub fn num_segments_for_cell(&self, cell: CellIdx) -> Result<usize> {
        Ok(self.check_cell(cell)?.segments.len())
    }

    /// Number of live synapses.
    #[inline]
    pub fn num_synapses(&self) -> usize {
        self.synapses.len() - self.destroyed_synapses.len()
    }

    pub fn num_synapses_for_segment(&self, segment: Segment) -> Result<usize> {
        Ok(self.check_segment(segment)?.synapses.len())
    }

    /// Length a per-segment buffer needs to be indexable by every segment, live or destroyed.
    #[inline]
    pub fn segment_flat_list_length(&self) -> usize {
        self.segments.len()
    }

    /// The connected threshold as it was given.
    #[inline]
    pub fn connected_threshold(&self) -> Permanence {
        self.connected_threshold
    }

    #[inline]
    pub fn timeseries(&self) -> bool {
        self.timeseries
    }

    /// Clears the timeseries update history. Only meaningful in timeseries mode.
    pub fn reset(&mut self) {
        if !self.timeseries {
            warn!("Connections::reset called with timeseries disabled");
        }
        self.previous_updates.clear();
        self.current_updates.clear();
    }

    /// Adds, for every active presynaptic cell, one to the count of each segment with a connected
    /// synapse on that cell. The counts are not zeroed first.
    pub fn compute_activity(
        &mut self,
        num_active_connected: &mut [SynapseIdx],
        active_presynaptic_cells: &[CellIdx],
    ) -> Result<()> {
        self.check_activity_buffer(num_active_connected)?;

        if self.timeseries {
            std::mem::swap(&mut self.previous_updates, &mut self.current_updates);
            self.current_updates.clear();
        }

        for cell in active_presynaptic_cells {
            if let Some(list) = self.connected.get(cell) {
                for &segment in list.segments() {
                    let count = &mut num_active_connected[segment as usize];
                    *count = count.saturating_add(1);
                }
            }
        }

        Ok(())
    }

    /// Like [`Connections::compute_activity`], and additionally fills `num_active_potential`
    /// with the connected counts plus the activity of the potential synapses.
    pub fn compute_activity_potential(
        &mut self,
        num_active_connected: &mut [SynapseIdx],
        num_active_potential: &mut [SynapseIdx],
        active_presynaptic_cells: &[CellIdx],
    ) -> Result<()> {
        self.check_activity_buffer(num_active_potential)?;
        self.compute_activity(num_active_connected, active_presynaptic_cells)?;

        num_active_potential.copy_from_slice(num_active_connected);
        for cell in active_presynaptic_cells {
            if let Some(list) = self.potential.get(cell) {
                for &segment in list.segments() {
                    let count = &mut num_active_potential[segment as usize];
                    *count = count.saturating_add(1);
                }
            }
        }

        Ok(())
    }

    fn check_activity_buffer(&self, buffer: &[SynapseIdx]) -> Result<()> {
        if buffer.len() != self.segments.len() {
            return Err(HtmError::invalid(
                "activity buffer",
                format!(
                    "length {} does not match the segment flat list length {}",
                    buffer.len(),
                    self.segments.len()
                ),
            ));
        }
        Ok(())
    }

    fn check_inputs_cover_segment(&self, segment: Segment, inputs: &Sdr) -> Result<()> {
        let size = inputs.size();
        for &synapse in &self.segments[segment as usize].synapses {
            let presynaptic_cell = self.synapses[synapse as usize].presynaptic_cell;
            if presynaptic_cell as usize >= size {
                return Err(HtmError::out_of_range(
                    "presynaptic cell",
                    presynaptic_cell as usize,
                    size,
                ));
            }
        }
        Ok(())
    }

    /// Reinforces a segment: synapses on active inputs gain `increment`, all others lose
    /// `decrement`. `inputs` must cover every presynaptic cell of the segment.
    ///
    /// In timeseries mode a synapse is only changed if its change differs from the one it received
    /// in the previous step.
    pub fn adapt_segment(
        &mut self,
        segment: Segment,
        inputs: &Sdr,
        increment: Permanence,
        decrement: Permanence,
    ) -> Result<()> {
        self.check_segment(segment)?;
        self.check_inputs_cover_segment(segment, inputs)?;
        let active = inputs.get_dense();

        if self.timeseries {
            self.previous_updates.resize(self.synapses.len(), 0.0);
            self.current_updates.resize(self.synapses.len(), 0.0);

            for i in 0..self.segments[segment as usize].synapses.len() {
                let synapse = self.segments[segment as usize].synapses[i];
                let data = self.synapses[synapse as usize];

                let update = if active[data.presynaptic_cell as usize] != 0 {
                    increment
                } else {
                    -decrement
                };

                if update != self.previous_updates[synapse as usize] {
                    self.update_permanence(synapse, data.permanence + update);
                }
                self.current_updates[synapse as usize] = update;
            }
        } else {
            for i in 0..self.segments[segment as usize].synapses.len() {
                let synapse = self.segments[segment as usize].synapses[i];
                let data = self.synapses[synapse as usize];

                let permanence = if active[data.presynaptic_cell as usize] != 0 {
                    data.permanence + increment
                } else {
                    data.permanence - decrement
                };

                self.update_permanence(synapse, permanence);
            }
        }

        Ok(())
    }

    /// Permanence of the synapse at `index` when the segment's synapses are ordered from the
    /// strongest to the weakest.
    fn nth_strongest_permanence(&self, segment: Segment, index: usize) -> Permanence {
        let mut permanences: Vec<Permanence> = self.segments[segment as usize]
            .synapses
            .iter()
            .map(|&s| self.synapses[s as usize].permanence)
            .collect();
        let (_, nth, _) = permanences.select_nth_unstable_by(index, |a, b| b.total_cmp(a));
        *nth
    }

    /// Raises every permanence on a segment uniformly until at least `segment_threshold`
    /// synapses (or all of them, if there are fewer) are connected.
    pub fn raise_permanences_to_threshold(
        &mut self,
        segment: Segment,
        segment_threshold: u32,
    ) -> Result<()> {
        let data = self.check_segment(segment)?;
        if segment_threshold == 0
            || u32::from(data.num_connected) >= segment_threshold
            || data.synapses.is_empty()
        {
            return Ok(());
        }

        let n = (segment_threshold as usize).min(data.synapses.len());
        let increment = self.threshold - self.nth_strongest_permanence(segment, n - 1);
        if increment <= 0.0 {
            return Ok(());
        }

        self.bump(segment, increment);
        Ok(())
    }

    /// Shifts every permanence on a segment uniformly so that the number of connected synapses
    /// lies within `[minimum_synapses, maximum_synapses]`, as far as the segment's size allows.
    pub fn synapse_competition(
        &mut self,
        segment: Segment,
        minimum_synapses: SynapseIdx,
        maximum_synapses: SynapseIdx,
    ) -> Result<()> {
        if minimum_synapses > maximum_synapses {
            return Err(HtmError::invalid(
                "minimum_synapses",
                format!("{minimum_synapses} exceeds the maximum {maximum_synapses}"),
            ));
        }

        let data = self.check_segment(segment)?;
        if data.synapses.is_empty() {
            return Ok(());
        }

        let target = if data.num_connected < minimum_synapses {
            minimum_synapses
        } else if data.num_connected > maximum_synapses {
            maximum_synapses
        } else {
            return Ok(());
        };
        let target = (target as usize).min(data.synapses.len());

        let mut delta = self.threshold - self.nth_strongest_permanence(segment, target.saturating_sub(1));
        if maximum_synapses == 0 {
            delta -= EPSILON;
        }

        self.bump(segment, delta);
        Ok(())
    }

    /// Adds `delta` to every permanence on a segment.
    pub fn bump_segment(&mut self, segment: Segment, delta: Permanence) -> Result<()> {
        self.check_segment(segment)?;
        self.bump(segment, delta);
        Ok(())
    }

    fn bump(&mut self, segment: Segment, delta: Permanence) {
        for i in 0..self.segments[segment as usize].synapses.len() {
            let synapse = self.segments[segment as usize].synapses[i];
            let permanence = self.synapses[synapse as usize].permanence;
            self.update_permanence(synapse, permanence + delta);
        }
    }

    /// Destroys the `n` weakest synapses of a segment, never touching synapses whose presynaptic
    /// cell is set in `exclude_cells`.
    pub fn destroy_min_permanence_synapses(
        &mut self,
        segment: Segment,
        n: usize,
        exclude_cells: &Sdr,
    ) -> Result<()> {
        self.check_segment(segment)?;
        self.check_inputs_cover_segment(segment, exclude_cells)?;

        let mut candidates: Vec<Synapse> = {
            let excluded = exclude_cells.get_dense();
            self.segments[segment as usize]
                .synapses
                .iter()
                .copied()
                .filter(|&s| excluded[self.synapses[s as usize].presynaptic_cell as usize] == 0)
                .collect()
        };

        let n = n.min(candidates.len());
        if n < candidates.len() {
            let synapses = &self.synapses;
            candidates.select_nth_unstable_by(n, |&a, &b| {
                synapses[a as usize]
                    .permanence
                    .total_cmp(&synapses[b as usize].permanence)
            });
        }

        for &synapse in &candidates[..n] {
            self.destroy_synapse_unchecked(synapse);
        }

        Ok(())
    }

    /// Writes the graph in the tagged text format: per cell its segment count, per segment its
    /// synapse count, per synapse its presynaptic cell and permanence.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "Connections")?;
        writeln!(out, "{CONNECTIONS_VERSION}")?;
        writeln!(out, "{} ", self.cells.len())?;
        writeln!(out, "{} ", self.connected_threshold)?;

        for cell in &self.cells {
            write!(out, "{} ", cell.segments.len())?;
            for &segment in &cell.segments {
                let synapses = &self.segments[segment as usize].synapses;
                write!(out, "{} ", synapses.len())?;
                for &synapse in synapses {
                    let data = &self.synapses[synapse as usize];
                    write!(out, "{} {} ", data.presynaptic_cell, data.permanence)?;
                }
                writeln!(out)?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
        writeln!(out, "~Connections")?;

        debug!(
            cells = self.cells.len(),
            segments = self.num_segments(),
            synapses = self.num_synapses(),
            "saved connections"
        );
        Ok(())
    }

    /// Reads a graph written by [`Connections::save`] by replaying segment and synapse creation.
    /// The result is equal to the saved graph, though indices may differ.
    pub fn load<R: BufRead>(input: &mut TokenReader<R>) -> Result<Self> {
        input.expect_marker("Connections")?;
        input.expect_version(CONNECTIONS_VERSION)?;

        let num_cells = input.parse::<CellIdx>()?;
        let connected_threshold = input.parse::<Permanence>()?;
        let mut connections = Self::new(num_cells, connected_threshold, false)?;

        for cell in 0..num_cells {
            let num_segments = input.parse::<usize>()?;
            for _ in 0..num_segments {
                let segment = connections.create_segment(cell)?;
                let num_synapses = input.parse::<usize>()?;
                for _ in 0..num_synapses {
                    let presynaptic_cell = input.parse::<CellIdx>()?;
                    let permanence = input.parse::<Permanence>()?;
                    connections.create_synapse(segment, presynaptic_cell, permanence)?;
                }
            }
        }

        input.expect_marker("~Connections")?;

        debug!(
            cells = connections.cells.len(),
            segments = connections.num_segments(),
            synapses = connections.num_synapses(),
            "loaded connections"
        );
        Ok(connections)
    }

    /// Writes a binary snapshot of the complete state, free lists and ordinals included.
    pub fn save_binary<W: Write>(&self, out: &mut W) -> Result<()> {
        serialization::save_binary(out, "Connections", CONNECTIONS_VERSION, self)
    }

    /// Reads a snapshot written by [`Connections::save_binary`]. The restored graph is
    /// index-identical to the saved one.
    pub fn load_binary<R: Read>(input: &mut R) -> Result<Self> {
        let connections: Self = serialization::load_binary(input, "Connections", CONNECTIONS_VERSION)?;
        debug!(
            segments = connections.num_segments(),
            synapses = connections.num_synapses(),
            "loaded connections snapshot"
        );
        Ok(connections)
    }
}

impl PartialEq for Connections {
    /// Structural comparison: cells in order, each cell's segments and each segment's synapses in
    /// creation order, comparing presynaptic cells and permanences. Raw indices are ignored.
    fn eq(&self, other: &Self) -> bool {
        if self.cells.len() != other.cells.len() {
            return false;
        }

        self.cells.iter().zip(&other.cells).all(|(cell, other_cell)| {
            cell.segments.len() == other_cell.segments.len()
                && cell.segments.iter().zip(&other_cell.segments).all(|(&a, &b)| {
                    let a = &self.segments[a as usize];
                    let b = &other.segments[b as usize];

                    a.cell == b.cell
                        && a.synapses.len() == b.synapses.len()
                        && a.synapses.iter().zip(&b.synapses).all(|(&x, &y)| {
                            let x = &self.synapses[x as usize];
                            let y = &other.synapses[y as usize];
                            x.presynaptic_cell == y.presynaptic_cell && x.permanence == y.permanence
                        })
                })
        })
    }
}

impl fmt::Display for Connections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let num_segments = self.num_segments().max(1) as f32;
        let num_synapses = self.num_synapses().max(1) as f32;

        let mut segments_min = usize::MAX;
        let mut segments_max = 0;
        let mut segments_sum = 0;
        let mut potential_min = usize::MAX;
        let mut potential_max = 0;
        let mut potential_sum = 0;
        let mut connected_min = SynapseIdx::MAX;
        let mut connected_max = 0;
        let mut connected_sum = 0usize;
        let mut dead = 0;
        let mut saturated = 0;

        for cell in &self.cells {
            segments_min = segments_min.min(cell.segments.len());
            segments_max = segments_max.max(cell.segments.len());
            segments_sum += cell.segments.len();

            for &segment in &cell.segments {
                let data = &self.segments[segment as usize];
                potential_min = potential_min.min(data.synapses.len());
                potential_max = potential_max.max(data.synapses.len());
                potential_sum += data.synapses.len();
                connected_min = connected_min.min(data.num_connected);
                connected_max = connected_max.max(data.num_connected);
                connected_sum += data.num_connected as usize;

                for &synapse in &data.synapses {
                    let permanence = self.synapses[synapse as usize].permanence;
                    if permanence == MIN_PERMANENCE {
                        dead += 1;
                    } else if permanence == MAX_PERMANENCE {
                        saturated += 1;
                    }
                }
            }
        }

        if self.cells.is_empty() {
            segments_min = 0;
        }
        if self.num_segments() == 0 {
            potential_min = 0;
            connected_min = 0;
        }

        writeln!(f, "Connections:")?;
        writeln!(
            f,
            "    Inputs ({}) ~> Outputs ({}) via Segments ({})",
            self.potential.len(),
            self.cells.len(),
            self.num_segments()
        )?;
        writeln!(
            f,
            "    Segments on Cell Min/Mean/Max {} / {} / {}",
            segments_min,
            segments_sum as f32 / self.cells.len().max(1) as f32,
            segments_max
        )?;
        writeln!(
            f,
            "    Potential Synapses on Segment Min/Mean/Max {} / {} / {}",
            potential_min,
            potential_sum as f32 / num_segments,
            potential_max
        )?;
        writeln!(
            f,
            "    Connected Synapses on Segment Min/Mean/Max {} / {} / {}",
            connected_min,
            connected_sum as f32 / num_segments,
            connected_max
        )?;
        writeln!(
            f,
            "    Synapses Dead ({}%) Saturated ({}%)",
            dead as f32 / num_synapses,
            saturated as f32 / num_synapses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    /// Checks that every live synapse sits in exactly the reverse index its permanence calls for,
    /// at the slot it records, and that `num_connected` is accurate.
    fn assert_consistent(c: &Connections) {
        let mut indexed = 0;
        for list in c.potential.values().chain(c.connected.values()) {
            assert!(!list.is_empty());
            indexed += list.len();
        }
        assert_eq!(indexed, c.num_synapses());

        for (segment, data) in c.segments.iter().enumerate() {
            if data.destroyed {
                continue;
            }
            let mut connected = 0;
            for &synapse in &data.synapses {
                let syn = &c.synapses[synapse as usize];
                assert_eq!(syn.segment as usize, segment);

                let is_connected = syn.permanence >= c.threshold;
                let (home, other) = if is_connected {
                    connected += 1;
                    (&c.connected, &c.potential)
                } else {
                    (&c.potential, &c.connected)
                };
                let list = &home[&syn.presynaptic_cell];
                assert_eq!(list.synapses()[syn.presynaptic_map_index], synapse);
                assert_eq!(list.segments()[syn.presynaptic_map_index] as usize, segment);
                assert!(other
                    .get(&syn.presynaptic_cell)
                    .map_or(true, |l| !l.synapses().contains(&synapse)));
            }
            assert_eq!(data.num_connected, connected);
        }
    }

    #[test]
    fn crossing_the_threshold_moves_the_synapse() {
        let mut c = Connections::new(10, 0.5, false).unwrap();
        let segment = c.create_segment(3).unwrap();
        let synapse = c.create_synapse(segment, 7, 0.6).unwrap();

        assert_eq!(c.data_for_segment(segment).unwrap().num_connected, 1);
        assert_eq!(c.connected[&7].synapses(), &[synapse]);
        assert!(!c.potential.contains_key(&7));

        c.update_synapse_permanence(synapse, 0.3).unwrap();
        assert_eq!(c.data_for_segment(segment).unwrap().num_connected, 0);
        assert_eq!(c.potential[&7].synapses(), &[synapse]);
        assert!(!c.connected.contains_key(&7));
        assert_eq!(c.synapses_for_presynaptic_cell(7), vec![synapse]);
        assert_consistent(&c);
    }

    #[test]
    fn permanence_is_clamped_and_threshold_reported_unadjusted() {
        let mut c = Connections::new(4, 0.5, false).unwrap();
        let segment = c.create_segment(0).unwrap();
        let a = c.create_synapse(segment, 1, 1.7).unwrap();
        let b = c.create_synapse(segment, 2, -0.3).unwrap();
        let exact = c.create_synapse(segment, 3, 0.5).unwrap();

        assert_eq!(c.data_for_synapse(a).unwrap().permanence, 1.0);
        assert_eq!(c.data_for_synapse(b).unwrap().permanence, 0.0);
        assert_eq!(c.connected[&3].synapses(), &[exact]);
        assert_eq!(c.connected_threshold(), 0.5);
        assert!(Connections::new(4, 1.5, false).is_err());
    }

    #[test]
    fn destroyed_indices_are_reused_with_fresh_ordinals() {
        let mut c = Connections::new(5, 0.5, false).unwrap();
        let first = c.create_segment(1).unwrap();
        c.create_synapse(first, 0, 0.7).unwrap();
        c.create_synapse(first, 2, 0.2).unwrap();
        let old_ordinal = c.segment_ordinal(first).unwrap();

        c.destroy_segment(first).unwrap();
        assert_eq!(c.num_segments(), 0);
        assert_eq!(c.num_synapses(), 0);
        assert!(c.synapses_for_segment(first).is_err());
        assert!(c.potential.is_empty() && c.connected.is_empty());

        let second = c.create_segment(4).unwrap();
        assert_eq!(second, first);
        assert!(c.synapses_for_segment(second).unwrap().is_empty());
        assert_ne!(c.segment_ordinal(second).unwrap(), old_ordinal);
        assert_eq!(c.cell_for_segment(second).unwrap(), 4);
        assert!(c.segments_for_cell(1).unwrap().is_empty());
        assert_eq!(c.segment_flat_list_length(), 1);
    }

    #[test]
    fn destroying_a_synapse_keeps_creation_order() {
        let mut c = Connections::new(3, 0.5, false).unwrap();
        let segment = c.create_segment(0).unwrap();
        let s0 = c.create_synapse(segment, 0, 0.1).unwrap();
        let s1 = c.create_synapse(segment, 1, 0.9).unwrap();
        let s2 = c.create_synapse(segment, 2, 0.1).unwrap();

        c.destroy_synapse(s1).unwrap();
        assert_eq!(c.synapses_for_segment(segment).unwrap(), &[s0, s2]);
        assert!(c.destroy_synapse(s1).is_err());

        let s3 = c.create_synapse(segment, 1, 0.4).unwrap();
        assert_eq!(s3, s1);
        assert_eq!(c.synapses_for_segment(segment).unwrap(), &[s0, s2, s3]);
        assert_eq!(c.segment_for_synapse(s3).unwrap(), segment);
        assert_consistent(&c);
    }

    #[test]
    fn accessors_reject_bad_indices() {
        let mut c = Connections::new(2, 0.5, false).unwrap();
        assert!(matches!(c.create_segment(2), Err(HtmError::IndexOutOfRange { .. })));
        assert!(c.synapses_for_segment(0).is_err());
        assert!(c.data_for_synapse(0).is_err());
        assert!(c.create_synapse(9, 0, 0.5).is_err());

        let segment = c.create_segment(1).unwrap();
        assert!(c.get_segment(1, 1).is_err());
        assert_eq!(c.get_segment(1, 0).unwrap(), segment);
        assert_eq!(c.idx_on_cell_for_segment(segment).unwrap(), 0);
    }

    #[test]
    fn segments_compare_by_cell_then_age() {
        let mut c = Connections::new(4, 0.5, false).unwrap();
        let late_low = {
            c.create_segment(2).unwrap();
            c.create_segment(1).unwrap()
        };
        let s2 = c.get_segment(2, 0).unwrap();
        let s2b = c.create_segment(2).unwrap();

        assert_eq!(c.compare_segments(late_low, s2).unwrap(), Ordering::Less);
        assert_eq!(c.compare_segments(s2, s2b).unwrap(), Ordering::Less);
        assert_eq!(c.compare_segments(s2b, s2).unwrap(), Ordering::Greater);
    }

    #[test]
    fn compute_activity_counts_connected_and_potential() {
        let mut c = Connections::new(8, 0.5, false).unwrap();
        let a = c.create_segment(0).unwrap();
        let b = c.create_segment(1).unwrap();
        c.create_synapse(a, 4, 0.6).unwrap();
        c.create_synapse(a, 5, 0.4).unwrap();
        c.create_synapse(b, 4, 0.3).unwrap();
        c.create_synapse(b, 6, 0.9).unwrap();

        let mut connected = vec![0; c.segment_flat_list_length()];
        let mut potential = vec![0; c.segment_flat_list_length()];
        c.compute_activity_potential(&mut connected, &mut potential, &[4, 5, 7])
            .unwrap();

        assert_eq!(connected, vec![1, 0]);
        assert_eq!(potential, vec![2, 1]);

        c.compute_activity(&mut connected, &[6]).unwrap();
        assert_eq!(connected, vec![1, 1]);

        let mut short = vec![0; 1];
        assert!(c.compute_activity(&mut short, &[4]).is_err());
    }

    #[test]
    fn adapt_segment_moves_permanences() {
        let mut c = Connections::new(4, 0.5, false).unwrap();
        let segment = c.create_segment(0).unwrap();
        let on = c.create_synapse(segment, 1, 0.45).unwrap();
        let off = c.create_synapse(segment, 2, 0.55).unwrap();
        let inputs = Sdr::from_sparse(&[4], &[1]).unwrap();

        c.adapt_segment(segment, &inputs, 0.1, 0.1).unwrap();

        assert!(c.data_for_synapse(on).unwrap().permanence > 0.5);
        assert!(c.data_for_synapse(off).unwrap().permanence < 0.5);
        assert_eq!(c.connected[&1].synapses(), &[on]);
        assert_eq!(c.potential[&2].synapses(), &[off]);

        let too_small = Sdr::new(&[2]).unwrap();
        assert!(c.adapt_segment(segment, &too_small, 0.1, 0.1).is_err());
        assert_consistent(&c);
    }

    #[test]
    fn timeseries_adapt_skips_repeated_updates() {
        let mut c = Connections::new(2, 0.5, true).unwrap();
        let segment = c.create_segment(0).unwrap();
        let synapse = c.create_synapse(segment, 1, 0.5).unwrap();
        let active = Sdr::from_sparse(&[2], &[1]).unwrap();
        let inactive = Sdr::new(&[2]).unwrap();
        let mut counts = vec![0; 1];
        let permanence = |c: &Connections| c.data_for_synapse(synapse).unwrap().permanence;

        c.compute_activity(&mut counts, &[1]).unwrap();
        c.adapt_segment(segment, &active, 0.25, 0.125).unwrap();
        assert_eq!(permanence(&c), 0.75);

        c.compute_activity(&mut counts, &[1]).unwrap();
        c.adapt_segment(segment, &active, 0.25, 0.125).unwrap();
        assert_eq!(permanence(&c), 0.75);

        c.compute_activity(&mut counts, &[]).unwrap();
        c.adapt_segment(segment, &inactive, 0.25, 0.125).unwrap();
        assert_eq!(permanence(&c), 0.625);

        c.reset();
        c.compute_activity(&mut counts, &[]).unwrap();
        c.adapt_segment(segment, &inactive, 0.25, 0.125).unwrap();
        assert_eq!(permanence(&c), 0.5);
    }

    #[test]
    fn raise_permanences_reaches_threshold() {
        let mut c = Connections::new(4, 0.5, false).unwrap();
        let segment = c.create_segment(0).unwrap();
        c.create_synapse(segment, 1, 0.3).unwrap();
        c.create_synapse(segment, 2, 0.35).unwrap();
        c.create_synapse(segment, 3, 0.1).unwrap();

        c.raise_permanences_to_threshold(segment, 2).unwrap();
        assert_eq!(c.data_for_segment(segment).unwrap().num_connected, 2);

        c.raise_permanences_to_threshold(segment, 0).unwrap();
        c.raise_permanences_to_threshold(segment, 1).unwrap();
        assert_eq!(c.data_for_segment(segment).unwrap().num_connected, 2);
        assert_consistent(&c);
    }

    #[test]
    fn synapse_competition_limits_connected_count() {
        let mut c = Connections::new(5, 0.5, false).unwrap();
        let segment = c.create_segment(0).unwrap();
        for (cell, permanence) in [(1, 0.6), (2, 0.7), (3, 0.8), (4, 0.2)] {
            c.create_synapse(segment, cell, permanence).unwrap();
        }
        assert_eq!(c.data_for_segment(segment).unwrap().num_connected, 3);

        c.synapse_competition(segment, 1, 2).unwrap();
        assert_eq!(c.data_for_segment(segment).unwrap().num_connected, 2);

        c.synapse_competition(segment, 0, 0).unwrap();
        assert_eq!(c.data_for_segment(segment).unwrap().num_connected, 0);

        assert!(c.synapse_competition(segment, 3, 2).is_err());
        assert_consistent(&c);
    }

    #[test]
    fn destroy_min_permanence_respects_exclusions() {
        let mut c = Connections::new(6, 0.5, false).unwrap();
        let segment = c.create_segment(0).unwrap();
        let weakest = c.create_synapse(segment, 1, 0.05).unwrap();
        let weak = c.create_synapse(segment, 2, 0.1).unwrap();
        let mid = c.create_synapse(segment, 3, 0.3).unwrap();
        let strong = c.create_synapse(segment, 4, 0.9).unwrap();
        let exclude = Sdr::from_sparse(&[6], &[1]).unwrap();

        c.destroy_min_permanence_synapses(segment, 2, &exclude).unwrap();
        assert_eq!(c.synapses_for_segment(segment).unwrap(), &[weakest, strong]);
        assert!(c.data_for_synapse(weak).is_err());
        assert!(c.data_for_synapse(mid).is_err());

        c.destroy_min_permanence_synapses(segment, 10, &exclude).unwrap();
        assert_eq!(c.synapses_for_segment(segment).unwrap(), &[weakest]);
        assert_consistent(&c);
    }

    #[derive(Default)]
    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl ConnectionsEventHandler for Recorder {
        fn on_create_segment(&mut self, segment: Segment) {
            self.0.borrow_mut().push(format!("create segment {segment}"));
        }

        fn on_create_synapse(&mut self, synapse: Synapse) {
            self.0.borrow_mut().push(format!("create synapse {synapse}"));
        }

        fn on_destroy_segment(&mut self, segment: Segment) {
            self.0.borrow_mut().push(format!("destroy segment {segment}"));
        }

        fn on_destroy_synapse(&mut self, synapse: Synapse) {
            self.0.borrow_mut().push(format!("destroy synapse {synapse}"));
        }

        fn on_update_synapse_permanence(&mut self, synapse: Synapse, _permanence: Permanence) {
            self.0.borrow_mut().push(format!("update synapse {synapse}"));
        }
    }

    #[test]
    fn event_handlers_see_every_change() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut c = Connections::new(3, 0.5, false).unwrap();
        let token = c.subscribe(Box::new(Recorder(Rc::clone(&log))));

        let segment = c.create_segment(0).unwrap();
        let synapse = c.create_synapse(segment, 1, 0.9).unwrap();
        c.update_synapse_permanence(synapse, 0.8).unwrap();
        c.destroy_segment(segment).unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                "create segment 0",
                "create synapse 0",
                "update synapse 0",
                "destroy segment 0",
                "destroy synapse 0",
            ]
        );

        c.unsubscribe(token).unwrap();
        assert!(c.unsubscribe(token).is_err());
        c.create_segment(1).unwrap();
        assert_eq!(log.borrow().len(), 5);
    }

    fn sample_graph() -> Connections {
        let mut c = Connections::new(6, 0.5, false).unwrap();
        let a = c.create_segment(0).unwrap();
        c.create_synapse(a, 3, 0.125).unwrap();
        c.create_synapse(a, 4, 0.6).unwrap();
        let b = c.create_segment(0).unwrap();
        c.create_synapse(b, 5, 0.51).unwrap();
        let gone = c.create_segment(2).unwrap();
        c.create_synapse(gone, 1, 0.3).unwrap();
        c.destroy_segment(gone).unwrap();
        let d = c.create_segment(5).unwrap();
        c.create_synapse(d, 0, 1.0).unwrap();
        c
    }

    #[test]
    fn text_round_trip_is_structurally_equal() {
        let c = sample_graph();
        let mut buffer = Vec::new();
        c.save(&mut buffer).unwrap();

        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("Connections\n2\n6 \n0.5 \n2 2 3 0.125 4 0.6 \n1 5 0.51 \n"));
        assert!(text.trim_end().ends_with("~Connections"));

        let loaded = Connections::load(&mut TokenReader::new(Cursor::new(buffer))).unwrap();
        assert_eq!(loaded, c);
        assert_eq!(loaded.num_synapses(), 4);
        assert_consistent(&loaded);

        let bad = text.replacen("Connections\n2", "Connections\n3", 1);
        assert!(Connections::load(&mut TokenReader::new(Cursor::new(bad))).is_err());
    }

    #[test]
    fn binary_round_trip_keeps_free_lists() {
        let mut c = sample_graph();
        let first = c.get_segment(0, 0).unwrap();
        c.destroy_segment(first).unwrap();
        let mut buffer = Vec::new();
        c.save_binary(&mut buffer).unwrap();

        let mut loaded = Connections::load_binary(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(loaded, c);
        assert_eq!(loaded.destroyed_segments, vec![first]);
        assert_eq!(loaded.destroyed_synapses, c.destroyed_synapses);

        let mut original = c.clone();
        assert_eq!(loaded.create_segment(1).unwrap(), first);
        assert_eq!(original.create_segment(1).unwrap(), first);
    }

    #[test]
    fn equality_ignores_raw_indices() {
        let mut a = Connections::new(3, 0.5, false).unwrap();
        let scratch = a.create_segment(1).unwrap();
        a.destroy_segment(scratch).unwrap();
        let filler = a.create_segment(2).unwrap();
        let seg = a.create_segment(0).unwrap();
        a.create_synapse(seg, 2, 0.4).unwrap();
        a.destroy_segment(filler).unwrap();

        let mut b = Connections::new(3, 0.5, false).unwrap();
        let seg = b.create_segment(0).unwrap();
        b.create_synapse(seg, 2, 0.4).unwrap();

        assert_eq!(a, b);
        b.create_segment(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn display_summarizes_the_graph() {
        let text = sample_graph().to_string();
        assert!(text.starts_with("Connections:\n"));
        assert!(text.contains("via Segments (3)"));
        assert!(text.contains("Segments on Cell Min/Mean/Max 0 / 0.5 / 2"));

        let empty = Connections::new(2, 0.5, false).unwrap().to_string();
        assert!(empty.contains("via Segments (0)"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        CreateSegment(u32),
        CreateSynapse(usize, u32, f32),
        Update(usize, f32),
        DestroySynapse(usize),
        DestroySegment(usize),
        Adapt(usize, Vec<u32>),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..8).prop_map(Op::CreateSegment),
            (any::<usize>(), 0u32..12, 0.0f32..1.0).prop_map(|(s, p, v)| Op::CreateSynapse(s, p, v)),
            (any::<usize>(), -0.2f32..1.2).prop_map(|(s, v)| Op::Update(s, v)),
            any::<usize>().prop_map(Op::DestroySynapse),
            any::<usize>().prop_map(Op::DestroySegment),
            (any::<usize>(), proptest::collection::vec(0u32..12, 0..6)).prop_map(|(s, a)| Op::Adapt(s, a)),
        ]
    }

    fn live_segments(c: &Connections) -> Vec<Segment> {
        (0..c.num_cells() as CellIdx)
            .flat_map(|cell| c.segments_for_cell(cell).unwrap().to_vec())
            .collect()
    }

    fn live_synapses(c: &Connections) -> Vec<Synapse> {
        live_segments(c)
            .into_iter()
            .flat_map(|s| c.synapses_for_segment(s).unwrap().to_vec())
            .collect()
    }

    proptest! {
        #[test]
        fn reverse_indices_stay_consistent(ops in proptest::collection::vec(op(), 1..120)) {
            let mut c = Connections::new(8, 0.5, false).unwrap();

            for op in ops {
                let segments = live_segments(&c);
                let synapses = live_synapses(&c);
                match op {
                    Op::CreateSegment(cell) => {
                        c.create_segment(cell).unwrap();
                    }
                    Op::CreateSynapse(i, presyn, permanence) if !segments.is_empty() => {
                        c.create_synapse(segments[i % segments.len()], presyn, permanence).unwrap();
                    }
                    Op::Update(i, permanence) if !synapses.is_empty() => {
                        c.update_synapse_permanence(synapses[i % synapses.len()], permanence).unwrap();
                    }
                    Op::DestroySynapse(i) if !synapses.is_empty() => {
                        c.destroy_synapse(synapses[i % synapses.len()]).unwrap();
                    }
                    Op::DestroySegment(i) if !segments.is_empty() => {
                        c.destroy_segment(segments[i % segments.len()]).unwrap();
                    }
                    Op::Adapt(i, active) if !segments.is_empty() => {
                        let mut inputs = Sdr::new(&[12]).unwrap();
                        let mut active = active;
                        active.sort_unstable();
                        active.dedup();
                        inputs.set_sparse(&active).unwrap();
                        c.adapt_segment(segments[i % segments.len()], &inputs, 0.1, 0.05).unwrap();
                    }
                    _ => {}
                }
                assert_consistent(&c);
            }

            let live: usize = live_segments(&c).len();
            prop_assert_eq!(live, c.num_segments());
            prop_assert_eq!(live_synapses(&c).len(), c.num_synapses());
        }
    }
}
