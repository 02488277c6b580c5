//! The `TemporalMemory` module implements a core component of HTM that learns and predicts temporal sequences.
//!
//! At a high level, it models a set of columns, where each column contains multiple cells.
//! Each cell can form multiple dendritic segments, which in turn consist of synapses.
//! The whole cell/segment/synapse graph is stored in a `Connections` instance owned by the memory.
//!
//! Column:
//! - A group of cells that share common feed-forward input.
//! - Cell `c` belongs to column `c / cells_per_column`.
//!
//! Cell:
//! - An individual processing unit within a column.
//! - Cells are responsible for representing different contexts of the same input.
//!
//! Dendritic Segment (Segment):
//! - A cluster of synapses on a cell that detects patterns of activity from other cells.
//! - A segment is **active** if at least `activation_threshold` of its connected synapses see an active cell.
//! - A segment is **matching** if at least `min_threshold` of all its synapses see an active cell.
//!
//! Synapse:
//! - A connection from a presynaptic cell to a dendritic segment.
//! - Each synapse has a permanence, it is connected once the permanence reaches `connected_permanence`.
//!
//! Bursting:
//! - When a column becomes active but none of its cells was predicted, all cells in the column are activated.
//! - One cell is picked as winner, the owner of the best matching segment or else the least used cell.
//!
//! Winner Cells:
//! - The cells that represent a column in the next step. New synapses only grow towards previous winners.
//!
//! Extra inputs:
//! - With `extra > 0`, callers can supply additional active and winner cells from outside the memory.
//! - They are addressed as `num_cells + i` and can be grown onto like any other presynaptic cell.
//!
//! How It Works:
//! - Each time step first calls `activate_dendrites`, which computes the active and matching segments from the
//!   previously active cells. Calling it twice in the same step has no further effect.
//! - Then `activate_cells` walks the active columns in ascending order. A column with active segments activates
//!   the predicted cells. A column without active segments bursts.
//! - When learning, segments that predicted correctly are reinforced and grown towards the previous winner cells,
//!   bursting columns create or reinforce a segment on the winner cell, and matching segments in inactive columns
//!   are punished by `predicted_segment_decrement`.
//! - Synapses whose permanence drops to zero are destroyed, as are segments left without synapses.
//! - `compute` performs both phases and records the raw anomaly score of the step.

use crate::core::anomaly::compute_raw_anomaly_score;
use crate::core::connections::Connections;
use crate::core::random::Random;
use crate::core::sdr::Sdr;
use crate::core::serialization::{self, write_vec, TokenReader};
use crate::core::synapses::{
    CellIdx, Permanence, Segment, SegmentIdx, Synapse, SynapseIdx, EPSILON, MAX_PERMANENCE,
    MIN_PERMANENCE,
};
use crate::error::{HtmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io::{BufRead, Read, Write};
use std::mem;
use tracing::{debug, trace};

const TM_VERSION: u32 = 2;

/// Holds the parameters required for the Temporal Memory algorithm's learning and activation.
///
/// `Default` yields the usual configuration for 2048 columns of 32 cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemporalMemoryParams {
    /// Shape of the column space. Active column SDRs must have exactly these dimensions.
    pub column_dimensions: Vec<u32>,
    pub cells_per_column: u32,
    /// Active connected synapses needed for a segment to become active.
    pub activation_threshold: SynapseIdx,
    /// Permanence of newly grown synapses.
    pub initial_permanence: Permanence,
    pub connected_permanence: Permanence,
    /// Active potential synapses needed for a segment to be matching.
    pub min_threshold: SynapseIdx,
    /// Upper bound on the number of synapses grown on a segment in one step.
    pub max_new_synapse_count: SynapseIdx,
    pub permanence_increment: Permanence,
    pub permanence_decrement: Permanence,
    /// Punishment for matching segments in columns that did not become active. Zero disables it.
    pub predicted_segment_decrement: Permanence,
    pub seed: u64,
    pub max_segments_per_cell: SegmentIdx,
    pub max_synapses_per_segment: SynapseIdx,
    /// Reject unsorted or duplicate active column indices.
    pub check_inputs: bool,
    /// Number of external input cells addressed past the memory's own cells.
    pub extra: u32,
}

impl Default for TemporalMemoryParams {
    fn default() -> Self {
        Self {
            column_dimensions: vec![2048],
            cells_per_column: 32,
            activation_threshold: 13,
            initial_permanence: 0.21,
            connected_permanence: 0.5,
            min_threshold: 10,
            max_new_synapse_count: 20,
            permanence_increment: 0.10,
            permanence_decrement: 0.10,
            predicted_segment_decrement: 0.0,
            seed: 42,
            max_segments_per_cell: 255,
            max_synapses_per_segment: 255,
            check_inputs: true,
            extra: 0,
        }
    }
}

fn check_permanence(name: &'static str, value: Permanence) -> Result<()> {
    if !(MIN_PERMANENCE..=MAX_PERMANENCE).contains(&value) {
        return Err(HtmError::invalid(name, format!("must be within [0, 1], got {value}")));
    }
    Ok(())
}

fn check_thresholds(min_threshold: SynapseIdx, activation_threshold: SynapseIdx) -> Result<()> {
    if min_threshold > activation_threshold {
        return Err(HtmError::invalid(
            "min_threshold",
            format!("{min_threshold} exceeds the activation threshold {activation_threshold}"),
        ));
    }
    Ok(())
}

impl TemporalMemoryParams {
    /// Checks every constraint between the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.column_dimensions.is_empty() {
            return Err(HtmError::invalid("column_dimensions", "must not be empty"));
        }
        if self.column_dimensions.contains(&0) {
            return Err(HtmError::invalid(
                "column_dimensions",
                format!("dimensions must be non-zero, got {:?}", self.column_dimensions),
            ));
        }
        if self.cells_per_column == 0 {
            return Err(HtmError::invalid("cells_per_column", "must be at least 1"));
        }

        check_permanence("initial_permanence", self.initial_permanence)?;
        check_permanence("connected_permanence", self.connected_permanence)?;
        check_permanence("permanence_increment", self.permanence_increment)?;
        check_permanence("permanence_decrement", self.permanence_decrement)?;
        check_permanence("predicted_segment_decrement", self.predicted_segment_decrement)?;
        check_thresholds(self.min_threshold, self.activation_threshold)?;

        if self.max_segments_per_cell == 0 {
            return Err(HtmError::invalid("max_segments_per_cell", "must be at least 1"));
        }
        if self.max_synapses_per_segment == 0 {
            return Err(HtmError::invalid("max_synapses_per_segment", "must be at least 1"));
        }

        self.cell_counts().map(|_| ())
    }

    /// Number of columns and number of cells, failing if either overflows a cell index.
    fn cell_counts(&self) -> Result<(u32, u32)> {
        let num_columns = self
            .column_dimensions
            .iter()
            .try_fold(1u32, |acc, &d| acc.checked_mul(d))
            .ok_or(HtmError::CapacityExhausted("column index space"))?;
        let num_cells = num_columns
            .checked_mul(self.cells_per_column)
            .ok_or(HtmError::CapacityExhausted("cell index space"))?;
        // External cells are addressed past the memory's own cells.
        num_cells
            .checked_add(self.extra)
            .ok_or(HtmError::CapacityExhausted("cell index space"))?;
        Ok((num_columns, num_cells))
    }
}

/// Implements the Temporal Memory algorithm which models the activation and learning of temporal sequences.
///
/// The Temporal Memory processes feed-forward input by activating columns and cells, predicting future activity
/// based on past patterns, and adapting synapse permanences through Hebbian-like learning rules. It operates in
/// discrete time steps and incorporates phases such as activating predicted cells, bursting columns without predictions,
/// and punishing erroneous predictions to gradually learn the temporal structure of the input data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemporalMemory {
    column_dimensions: Vec<u32>,
    num_columns: u32,
    cells_per_column: u32,

    // Learning and activation parameters.
    activation_threshold: SynapseIdx,
    initial_permanence: Permanence,
    connected_permanence: Permanence,
    min_threshold: SynapseIdx,
    max_new_synapse_count: SynapseIdx,
    check_inputs: bool,
    permanence_increment: Permanence,
    permanence_decrement: Permanence,
    predicted_segment_decrement: Permanence,
    extra: u32,
    max_segments_per_cell: SegmentIdx,
    max_synapses_per_segment: SynapseIdx,

    // Cells of the current step. Extra cells are appended past `num_cells` by `activate_dendrites`.
    active_cells: Vec<CellIdx>,
    winner_cells: Vec<CellIdx>,

    // Derived from the previous step's cells by `activate_dendrites`.
    segments_valid: bool,
    active_segments: Vec<Segment>,
    matching_segments: Vec<Segment>,
    num_active_connected: Vec<SynapseIdx>,
    num_active_potential: Vec<SynapseIdx>,

    last_used_iteration: Vec<u64>,
    iteration: u64,
    anomaly: f32,

    rng: Random,
    connections: Connections,
}

/// Index just past the run of entries equal to `column` starting at `start`.
#[inline]
fn group_end(columns: &[u32], start: usize, column: u32) -> usize {
    start + columns[start..].iter().take_while(|&&c| c == column).count()
}

impl TemporalMemory {
    /// Creates a temporal memory with empty connections.
    pub fn new(params: TemporalMemoryParams) -> Result<Self> {
        params.validate()?;
        let (num_columns, num_cells) = params.cell_counts()?;

        Ok(Self {
            connections: Connections::new(num_cells, params.connected_permanence, false)?,
            rng: Random::new(params.seed),
            num_columns,
            column_dimensions: params.column_dimensions,
            cells_per_column: params.cells_per_column,
            activation_threshold: params.activation_threshold,
            initial_permanence: params.initial_permanence,
            connected_permanence: params.connected_permanence,
            min_threshold: params.min_threshold,
            max_new_synapse_count: params.max_new_synapse_count,
            check_inputs: params.check_inputs,
            permanence_increment: params.permanence_increment,
            permanence_decrement: params.permanence_decrement,
            predicted_segment_decrement: params.predicted_segment_decrement,
            extra: params.extra,
            max_segments_per_cell: params.max_segments_per_cell,
            max_synapses_per_segment: params.max_synapses_per_segment,
            active_cells: Vec::new(),
            winner_cells: Vec::new(),
            segments_valid: false,
            active_segments: Vec::new(),
            matching_segments: Vec::new(),
            num_active_connected: Vec::new(),
            num_active_potential: Vec::new(),
            last_used_iteration: Vec::new(),
            iteration: 0,
            anomaly: -1.0,
        })
    }

    /// The current configuration. `seed` is the seed the generator was created with.
    pub fn params(&self) -> TemporalMemoryParams {
        TemporalMemoryParams {
            column_dimensions: self.column_dimensions.clone(),
            cells_per_column: self.cells_per_column,
            activation_threshold: self.activation_threshold,
            initial_permanence: self.initial_permanence,
            connected_permanence: self.connected_permanence,
            min_threshold: self.min_threshold,
            max_new_synapse_count: self.max_new_synapse_count,
            permanence_increment: self.permanence_increment,
            permanence_decrement: self.permanence_decrement,
            predicted_segment_decrement: self.predicted_segment_decrement,
            seed: self.rng.seed(),
            max_segments_per_cell: self.max_segments_per_cell,
            max_synapses_per_segment: self.max_synapses_per_segment,
            check_inputs: self.check_inputs,
            extra: self.extra,
        }
    }

    /// Runs one time step: `activate_dendrites`, the anomaly score of `active_columns` against the
    /// predicted columns, then `activate_cells`.
    pub fn compute(&mut self, active_columns: &Sdr, learn: bool) -> Result<()> {
        self.check_column_dimensions(active_columns)?;
        self.activate_dendrites_inner(learn, None)?;
        self.finish_step(active_columns, learn)
    }

    /// Like [`TemporalMemory::compute`], with external active and winner cells for this step.
    pub fn compute_with_extra(
        &mut self,
        active_columns: &Sdr,
        learn: bool,
        extra_active: &Sdr,
        extra_winners: &Sdr,
    ) -> Result<()> {
        self.check_column_dimensions(active_columns)?;
        self.activate_dendrites_inner(learn, Some((extra_active, extra_winners)))?;
        self.finish_step(active_columns, learn)
    }

    fn finish_step(&mut self, active_columns: &Sdr, learn: bool) -> Result<()> {
        let predicted_columns = self.cells_to_columns(&self.get_predictive_cells()?)?;
        self.anomaly = compute_raw_anomaly_score(active_columns, &predicted_columns)?;
        self.activate_cells(active_columns, learn)?;

        trace!(
            iteration = self.iteration,
            active_columns = active_columns.get_sum(),
            active_cells = self.active_cells.len(),
            winner_cells = self.winner_cells.len(),
            anomaly = self.anomaly,
            "temporal memory step"
        );
        Ok(())
    }

    /// Computes the active and matching segments from the current active cells.
    ///
    /// Has no effect when the segments are already up to date for this step. With `learn`, every
    /// active segment is marked as used in the current iteration and the iteration advances.
    pub fn activate_dendrites(&mut self, learn: bool) -> Result<()> {
        self.activate_dendrites_inner(learn, None)
    }

    /// Like [`TemporalMemory::activate_dendrites`], adding external cells to the active and winner cells.
    ///
    /// Both SDRs must have `extra` bits and `extra_winners` must be a subset of `extra_active`.
    /// Without extra inputs configured, both SDRs must be empty.
    pub fn activate_dendrites_with_extra(
        &mut self,
        learn: bool,
        extra_active: &Sdr,
        extra_winners: &Sdr,
    ) -> Result<()> {
        self.activate_dendrites_inner(learn, Some((extra_active, extra_winners)))
    }

    fn check_extra_inputs(&self, extra_active: &Sdr, extra_winners: &Sdr) -> Result<()> {
        if self.extra == 0 {
            if extra_active.get_sum() != 0 || extra_winners.get_sum() != 0 {
                return Err(HtmError::invalid(
                    "extra",
                    "extra inputs were supplied but the memory has no extra input cells",
                ));
            }
            return Ok(());
        }

        for sdr in [extra_active, extra_winners] {
            if sdr.size() != self.extra as usize {
                return Err(HtmError::DimensionMismatch {
                    expected: vec![self.extra],
                    actual: sdr.dimensions().to_vec(),
                });
            }
        }
        if extra_active.dimensions() != extra_winners.dimensions() {
            return Err(HtmError::DimensionMismatch {
                expected: extra_active.dimensions().to_vec(),
                actual: extra_winners.dimensions().to_vec(),
            });
        }

        let active = extra_active.get_dense();
        if let Some(&cell) = extra_winners.get_sparse().iter().find(|&&c| active[c as usize] == 0) {
            return Err(HtmError::invalid(
                "extra_winners",
                format!("extra winner cell {cell} is not an extra active cell"),
            ));
        }
        Ok(())
    }

    fn activate_dendrites_inner(&mut self, learn: bool, extra: Option<(&Sdr, &Sdr)>) -> Result<()> {
        if let Some((extra_active, extra_winners)) = extra {
            self.check_extra_inputs(extra_active, extra_winners)?;
        }

        if self.segments_valid {
            return Ok(());
        }

        if let Some((extra_active, extra_winners)) = extra {
            let offset = self.number_of_cells();
            self.active_cells
                .extend(extra_active.get_sparse().iter().map(|&c| c + offset));
            self.winner_cells
                .extend(extra_winners.get_sparse().iter().map(|&c| c + offset));
        }

        let len = self.connections.segment_flat_list_length();
        self.num_active_connected.clear();
        self.num_active_connected.resize(len, 0);
        self.num_active_potential.clear();
        self.num_active_potential.resize(len, 0);
        if self.last_used_iteration.len() < len {
            self.last_used_iteration.resize(len, 0);
        }

        self.connections.compute_activity_potential(
            &mut self.num_active_connected,
            &mut self.num_active_potential,
            &self.active_cells,
        )?;

        let connections = &self.connections;
        let live = |segment: Segment| connections.data_for_segment(segment).is_ok();

        let mut active_segments: Vec<Segment> = (0..len as Segment)
            .filter(|&s| self.num_active_connected[s as usize] >= self.activation_threshold && live(s))
            .collect();
        active_segments.sort_unstable_by(|&a, &b| connections.segment_order(a, b));

        let mut matching_segments: Vec<Segment> = (0..len as Segment)
            .filter(|&s| self.num_active_potential[s as usize] >= self.min_threshold && live(s))
            .collect();
        matching_segments.sort_unstable_by(|&a, &b| connections.segment_order(a, b));

        if learn {
            for &segment in &active_segments {
                self.last_used_iteration[segment as usize] = self.iteration;
            }
            self.iteration += 1;
        }

        self.active_segments = active_segments;
        self.matching_segments = matching_segments;
        self.segments_valid = true;
        Ok(())
    }

    /// Activates the cells of `active_columns` and, with `learn`, adapts the segments involved.
    ///
    /// Active columns with active segments activate the predicted cells, the other active columns
    /// burst. Matching segments of inactive columns are punished when learning.
    pub fn activate_cells(&mut self, active_columns: &Sdr, learn: bool) -> Result<()> {
        self.check_column_dimensions(active_columns)?;
        let mut columns = active_columns.get_sparse().to_vec();
        columns.sort_unstable();

        if self.check_inputs {
            if let Some(w) = columns.windows(2).find(|w| w[0] == w[1]) {
                return Err(HtmError::invalid(
                    "active_columns",
                    format!("column {} is listed more than once", w[0]),
                ));
            }
        }

        let total_cells = self.number_of_cells() + self.extra;
        let mut prev_active_cells = Sdr::new(&[total_cells])?;
        prev_active_cells.set_sparse(&self.active_cells)?;
        self.active_cells.clear();
        let prev_winner_cells = mem::take(&mut self.winner_cells);

        // Without a fresh `activate_dendrites` there is nothing predicted or matching.
        let (active_segments, matching_segments) = if self.segments_valid {
            (self.active_segments.clone(), self.matching_segments.clone())
        } else {
            (Vec::new(), Vec::new())
        };
        let active_segment_columns = self.segment_columns(&active_segments)?;
        let matching_segment_columns = self.segment_columns(&matching_segments)?;

        // Active segments are always matching, so the active columns together with the
        // columns of matching segments cover every column that needs work.
        let (mut c, mut a, mut m) = (0, 0, 0);
        let mut bursting = 0usize;
        loop {
            let column = match (columns.get(c), matching_segment_columns.get(m)) {
                (Some(&x), Some(&y)) => x.min(y),
                (Some(&x), None) => x,
                (None, Some(&y)) => y,
                (None, None) => break,
            };

            let is_active = columns.get(c) == Some(&column);
            if is_active {
                c += 1;
            }

            // Active segments of inactive columns are skipped along the way.
            while a < active_segment_columns.len() && active_segment_columns[a] < column {
                a += 1;
            }
            let a_end = group_end(&active_segment_columns, a, column);
            let m_end = group_end(&matching_segment_columns, m, column);

            if is_active {
                if a_end > a {
                    self.activate_predicted_column(
                        &active_segments[a..a_end],
                        &prev_active_cells,
                        &prev_winner_cells,
                        learn,
                    )?;
                } else {
                    bursting += 1;
                    self.burst_column(
                        column,
                        &matching_segments[m..m_end],
                        &prev_active_cells,
                        &prev_winner_cells,
                        learn,
                    )?;
                }
            } else if learn {
                self.punish_predicted_column(&matching_segments[m..m_end], &prev_active_cells)?;
            }

            a = a_end;
            m = m_end;
        }

        self.segments_valid = false;

        trace!(
            active_columns = columns.len(),
            bursting_columns = bursting,
            learn,
            "activated cells"
        );
        Ok(())
    }

    fn segment_columns(&self, segments: &[Segment]) -> Result<Vec<u32>> {
        segments
            .iter()
            .map(|&s| Ok(self.connections.cell_for_segment(s)? / self.cells_per_column))
            .collect()
    }

    /// Activates every cell with an active segment and reinforces those segments.
    fn activate_predicted_column(
        &mut self,
        column_active_segments: &[Segment],
        prev_active_cells: &Sdr,
        prev_winner_cells: &[CellIdx],
        learn: bool,
    ) -> Result<()> {
        let cells = column_active_segments
            .iter()
            .map(|&s| self.connections.cell_for_segment(s))
            .collect::<Result<Vec<_>>>()?;

        for (i, (&segment, &cell)) in column_active_segments.iter().zip(&cells).enumerate() {
            if i == 0 || cells[i - 1] != cell {
                self.active_cells.push(cell);
                self.winner_cells.push(cell);
            }
            if learn {
                self.learn_on_segment(segment, prev_active_cells, prev_winner_cells)?;
            }
        }

        Ok(())
    }

    /// Activates every cell of an unpredicted column and picks its winner cell.
    fn burst_column(
        &mut self,
        column: u32,
        column_matching_segments: &[Segment],
        prev_active_cells: &Sdr,
        prev_winner_cells: &[CellIdx],
        learn: bool,
    ) -> Result<()> {
        let first = column * self.cells_per_column;
        self.active_cells.extend(first..first + self.cells_per_column);

        // First segment with the highest potential overlap.
        let mut best_matching: Option<Segment> = None;
        for &segment in column_matching_segments {
            let overlap = self.num_active_potential[segment as usize];
            if best_matching.map_or(true, |best| overlap > self.num_active_potential[best as usize]) {
                best_matching = Some(segment);
            }
        }

        let winner = match best_matching {
            Some(segment) => self.connections.cell_for_segment(segment)?,
            None => self.least_used_cell(column)?,
        };
        self.winner_cells.push(winner);

        if learn {
            match best_matching {
                Some(segment) => self.learn_on_segment(segment, prev_active_cells, prev_winner_cells)?,
                None => {
                    let n_grow = (self.max_new_synapse_count as usize).min(prev_winner_cells.len());
                    if n_grow > 0 {
                        let segment = self.create_segment(winner)?;
                        self.grow_synapses(segment, n_grow, prev_winner_cells)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Weakens the matching segments of a column that was predicted but did not become active.
    fn punish_predicted_column(
        &mut self,
        column_matching_segments: &[Segment],
        prev_active_cells: &Sdr,
    ) -> Result<()> {
        if self.predicted_segment_decrement > 0.0 {
            for &segment in column_matching_segments {
                self.adapt_segment(segment, prev_active_cells, -self.predicted_segment_decrement, 0.0)?;
            }
        }
        Ok(())
    }

    /// Reinforces a segment and tops it up with synapses to previous winner cells.
    fn learn_on_segment(
        &mut self,
        segment: Segment,
        prev_active_cells: &Sdr,
        prev_winner_cells: &[CellIdx],
    ) -> Result<()> {
        let n_grow = i32::from(self.max_new_synapse_count)
            - i32::from(self.num_active_potential[segment as usize]);

        let alive = self.adapt_segment(
            segment,
            prev_active_cells,
            self.permanence_increment,
            self.permanence_decrement,
        )?;

        if alive && n_grow > 0 {
            self.grow_synapses(segment, n_grow as usize, prev_winner_cells)?;
        }
        Ok(())
    }

    /// Adapts a segment, then destroys its synapses that fell to zero permanence and the segment
    /// itself if nothing is left. Returns whether the segment still exists.
    fn adapt_segment(
        &mut self,
        segment: Segment,
        prev_active_cells: &Sdr,
        increment: Permanence,
        decrement: Permanence,
    ) -> Result<bool> {
        self.connections
            .adapt_segment(segment, prev_active_cells, increment, decrement)?;

        let weak: Vec<Synapse> = self
            .connections
            .synapses_for_segment(segment)?
            .iter()
            .copied()
            .filter(|&s| {
                self.connections
                    .data_for_synapse(s)
                    .map_or(false, |data| data.permanence < EPSILON)
            })
            .collect();
        for synapse in weak {
            self.connections.destroy_synapse(synapse)?;
        }

        if self.connections.num_synapses_for_segment(segment)? == 0 {
            self.connections.destroy_segment(segment)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Grows up to `n_desired` synapses from `segment` to randomly chosen previous winner cells the
    /// segment is not yet connected to. Makes room by destroying the weakest synapses if the
    /// segment would exceed `max_synapses_per_segment`.
    fn grow_synapses(
        &mut self,
        segment: Segment,
        n_desired: usize,
        prev_winner_cells: &[CellIdx],
    ) -> Result<()> {
        let mut candidates = prev_winner_cells.to_vec();
        candidates.sort_unstable();

        let mut present: Vec<CellIdx> = self
            .connections
            .synapses_for_segment(segment)?
            .iter()
            .map(|&s| self.connections.data_for_synapse(s).map(|d| d.presynaptic_cell))
            .collect::<Result<_>>()?;
        present.sort_unstable();
        candidates.retain(|cell| present.binary_search(cell).is_err());

        let n_actual = n_desired.min(candidates.len());
        let max_synapses = self.max_synapses_per_segment as usize;

        let num_synapses = self.connections.num_synapses_for_segment(segment)?;
        let overrun = (num_synapses + n_actual).saturating_sub(max_synapses);
        if overrun > 0 {
            let mut protected = Sdr::new(&[self.number_of_cells() + self.extra])?;
            protected.set_sparse_owned(prev_winner_cells.to_vec())?;
            self.connections
                .destroy_min_permanence_synapses(segment, overrun, &protected)?;
        }

        let num_synapses = self.connections.num_synapses_for_segment(segment)?;
        let n_actual = n_actual.min(max_synapses.saturating_sub(num_synapses));

        for _ in 0..n_actual {
            let i = self.rng.get_u32(candidates.len() as u32) as usize;
            self.connections
                .create_synapse(segment, candidates[i], self.initial_permanence)?;
            candidates.remove(i);
        }

        Ok(())
    }

    /// The cell of `column` with the fewest segments. Ties are broken uniformly at random.
    fn least_used_cell(&mut self, column: u32) -> Result<CellIdx> {
        let first = column * self.cells_per_column;
        let cells = first..first + self.cells_per_column;

        let counts = cells
            .clone()
            .map(|cell| self.connections.num_segments_for_cell(cell))
            .collect::<Result<Vec<_>>>()?;
        let fewest = counts.iter().copied().min().unwrap_or(0);
        let tied = counts.iter().filter(|&&n| n == fewest).count();

        let pick = self.rng.get_u32(tied as u32) as usize;
        cells
            .zip(counts)
            .filter(|&(_, n)| n == fewest)
            .nth(pick)
            .map(|(cell, _)| cell)
            .ok_or(HtmError::InvalidState("column has no cells"))
    }

    /// Creates a segment on `cell`. If the cell already has `max_segments_per_cell` segments, the
    /// least recently used ones are destroyed first.
    pub fn create_segment(&mut self, cell: CellIdx) -> Result<Segment> {
        let len = self.connections.segment_flat_list_length();
        if self.last_used_iteration.len() < len {
            self.last_used_iteration.resize(len, 0);
        }

        while self.connections.num_segments_for_cell(cell)? >= self.max_segments_per_cell as usize {
            let oldest = self
                .connections
                .segments_for_cell(cell)?
                .iter()
                .copied()
                .min_by_key(|&s| self.last_used_iteration[s as usize])
                .ok_or(HtmError::InvalidState("cell at capacity has no segments"))?;

            debug!(
                cell,
                segment = oldest,
                last_used = self.last_used_iteration[oldest as usize],
                "evicting least recently used segment"
            );
            self.connections.destroy_segment(oldest)?;
        }

        let segment = self.connections.create_segment(cell)?;
        let len = self.connections.segment_flat_list_length();
        self.last_used_iteration.resize(len, 0);
        self.last_used_iteration[segment as usize] = self.iteration;

        Ok(segment)
    }

    /// Clears all per-step state, so the next input is not treated as a continuation.
    pub fn reset(&mut self) {
        self.active_cells.clear();
        self.winner_cells.clear();
        self.active_segments.clear();
        self.matching_segments.clear();
        self.segments_valid = false;
        self.anomaly = -1.0;
    }

    fn check_column_dimensions(&self, active_columns: &Sdr) -> Result<()> {
        if active_columns.dimensions() != self.column_dimensions.as_slice() {
            return Err(HtmError::DimensionMismatch {
                expected: self.column_dimensions.clone(),
                actual: active_columns.dimensions().to_vec(),
            });
        }
        Ok(())
    }

    fn cell_dimensions(&self) -> Vec<u32> {
        let mut dims = self.column_dimensions.clone();
        dims.push(self.cells_per_column);
        dims
    }

    /// Maps an SDR over the cells (column dimensions plus cells per column) to the SDR of the
    /// columns containing at least one set cell.
    pub fn cells_to_columns(&self, cells: &Sdr) -> Result<Sdr> {
        let expected = self.cell_dimensions();
        if cells.dimensions() != expected.as_slice() {
            return Err(HtmError::DimensionMismatch {
                expected,
                actual: cells.dimensions().to_vec(),
            });
        }

        let mut columns: Vec<u32> = cells
            .get_sparse()
            .iter()
            .map(|&cell| cell / self.cells_per_column)
            .collect();
        columns.sort_unstable();
        columns.dedup();

        Sdr::from_sparse(&self.column_dimensions, &columns)
    }

    /// The cells of `column`.
    pub fn cells_for_column(&self, column: u32) -> Result<Vec<CellIdx>> {
        if column >= self.num_columns {
            return Err(HtmError::out_of_range("column", column as usize, self.num_columns as usize));
        }
        let first = column * self.cells_per_column;
        Ok((first..first + self.cells_per_column).collect())
    }

    pub fn column_for_cell(&self, cell: CellIdx) -> Result<u32> {
        if cell >= self.number_of_cells() {
            return Err(HtmError::out_of_range("cell", cell as usize, self.number_of_cells() as usize));
        }
        Ok(cell / self.cells_per_column)
    }

    fn own_cells(&self, cells: &[CellIdx]) -> Result<Sdr> {
        let num_cells = self.number_of_cells();
        let own: Vec<CellIdx> = cells.iter().copied().filter(|&c| c < num_cells).collect();
        Sdr::from_sparse(&self.cell_dimensions(), &own)
    }

    /// Active cells of the current step, external cells excluded.
    pub fn get_active_cells(&self) -> Result<Sdr> {
        self.own_cells(&self.active_cells)
    }

    /// Winner cells of the current step, external cells excluded.
    pub fn get_winner_cells(&self) -> Result<Sdr> {
        self.own_cells(&self.winner_cells)
    }

    /// Raw active cell list, including external cells once `activate_dendrites` appended them.
    pub fn active_cells(&self) -> &[CellIdx] {
        &self.active_cells
    }

    pub fn winner_cells(&self) -> &[CellIdx] {
        &self.winner_cells
    }

    /// Cells with at least one active segment, i.e. the prediction for the next input.
    /// Only available between `activate_dendrites` and `activate_cells`.
    pub fn get_predictive_cells(&self) -> Result<Sdr> {
        let segments = self.valid_segments(&self.active_segments)?;

        let mut cells: Vec<CellIdx> = Vec::with_capacity(segments.len());
        for &segment in segments {
            let cell = self.connections.cell_for_segment(segment)?;
            if cells.last() != Some(&cell) {
                cells.push(cell);
            }
        }

        Sdr::from_sparse(&self.cell_dimensions(), &cells)
    }

    /// Active segments, ordered by cell and age.
    pub fn get_active_segments(&self) -> Result<&[Segment]> {
        self.valid_segments(&self.active_segments)
    }

    /// Matching segments, ordered by cell and age.
    pub fn get_matching_segments(&self) -> Result<&[Segment]> {
        self.valid_segments(&self.matching_segments)
    }

    fn valid_segments<'a>(&self, segments: &'a [Segment]) -> Result<&'a [Segment]> {
        if !self.segments_valid {
            return Err(HtmError::InvalidState(
                "segments are only available after activate_dendrites",
            ));
        }
        Ok(segments)
    }

    /// Active potential synapses of a segment, as counted by the last `activate_dendrites`.
    pub fn num_active_potential_synapses(&self, segment: Segment) -> Result<SynapseIdx> {
        self.num_active_potential
            .get(segment as usize)
            .copied()
            .ok_or_else(|| {
                HtmError::out_of_range("segment", segment as usize, self.num_active_potential.len())
            })
    }

    /// Raw anomaly score of the last `compute`, or -1 after `reset` and before the first step.
    #[inline]
    pub fn anomaly(&self) -> f32 {
        self.anomaly
    }

    #[inline]
    pub fn number_of_columns(&self) -> u32 {
        self.num_columns
    }

    /// Number of cells owned by the memory, external cells excluded.
    #[inline]
    pub fn number_of_cells(&self) -> u32 {
        self.num_columns * self.cells_per_column
    }

    #[inline]
    pub fn column_dimensions(&self) -> &[u32] {
        &self.column_dimensions
    }

    #[inline]
    pub fn cells_per_column(&self) -> u32 {
        self.cells_per_column
    }

    #[inline]
    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Direct access to the graph, e.g. to subscribe event handlers.
    #[inline]
    pub fn connections_mut(&mut self) -> &mut Connections {
        &mut self.connections
    }

    #[inline]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    #[inline]
    pub fn version(&self) -> u32 {
        TM_VERSION
    }

    pub fn activation_threshold(&self) -> SynapseIdx {
        self.activation_threshold
    }

    pub fn set_activation_threshold(&mut self, activation_threshold: SynapseIdx) -> Result<()> {
        check_thresholds(self.min_threshold, activation_threshold)?;
        self.activation_threshold = activation_threshold;
        Ok(())
    }

    pub fn initial_permanence(&self) -> Permanence {
        self.initial_permanence
    }

    pub fn set_initial_permanence(&mut self, initial_permanence: Permanence) -> Result<()> {
        check_permanence("initial_permanence", initial_permanence)?;
        self.initial_permanence = initial_permanence;
        Ok(())
    }

    pub fn connected_permanence(&self) -> Permanence {
        self.connected_permanence
    }

    pub fn min_threshold(&self) -> SynapseIdx {
        self.min_threshold
    }

    pub fn set_min_threshold(&mut self, min_threshold: SynapseIdx) -> Result<()> {
        check_thresholds(min_threshold, self.activation_threshold)?;
        self.min_threshold = min_threshold;
        Ok(())
    }

    pub fn max_new_synapse_count(&self) -> SynapseIdx {
        self.max_new_synapse_count
    }

    pub fn set_max_new_synapse_count(&mut self, max_new_synapse_count: SynapseIdx) {
        self.max_new_synapse_count = max_new_synapse_count;
    }

    pub fn check_inputs(&self) -> bool {
        self.check_inputs
    }

    pub fn set_check_inputs(&mut self, check_inputs: bool) {
        self.check_inputs = check_inputs;
    }

    pub fn permanence_increment(&self) -> Permanence {
        self.permanence_increment
    }

    pub fn set_permanence_increment(&mut self, permanence_increment: Permanence) -> Result<()> {
        check_permanence("permanence_increment", permanence_increment)?;
        self.permanence_increment = permanence_increment;
        Ok(())
    }

    pub fn permanence_decrement(&self) -> Permanence {
        self.permanence_decrement
    }

    pub fn set_permanence_decrement(&mut self, permanence_decrement: Permanence) -> Result<()> {
        check_permanence("permanence_decrement", permanence_decrement)?;
        self.permanence_decrement = permanence_decrement;
        Ok(())
    }

    pub fn predicted_segment_decrement(&self) -> Permanence {
        self.predicted_segment_decrement
    }

    pub fn set_predicted_segment_decrement(&mut self, decrement: Permanence) -> Result<()> {
        check_permanence("predicted_segment_decrement", decrement)?;
        self.predicted_segment_decrement = decrement;
        Ok(())
    }

    pub fn max_segments_per_cell(&self) -> SegmentIdx {
        self.max_segments_per_cell
    }

    pub fn max_synapses_per_segment(&self) -> SynapseIdx {
        self.max_synapses_per_segment
    }

    pub fn extra(&self) -> u32 {
        self.extra
    }

    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    fn write_segments<W: Write>(&self, out: &mut W, segments: &[Segment], counts: &[SynapseIdx]) -> Result<()> {
        write!(out, "{} ", segments.len())?;
        for &segment in segments {
            let cell = self.connections.cell_for_segment(segment)?;
            let idx = self.connections.idx_on_cell_for_segment(segment)?;
            let count = counts.get(segment as usize).copied().unwrap_or(0);
            write!(out, "{idx} {cell} {count} ")?;
        }
        writeln!(out)?;
        Ok(())
    }

    /// Writes the memory in the tagged text format. The graph is stored through
    /// [`Connections::save`], so a loaded memory is equal but not necessarily index-identical.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "TemporalMemory")?;
        writeln!(out, "{TM_VERSION}")?;

        write!(
            out,
            "{} {} {} {} {} {} {} {} ",
            self.num_columns,
            self.cells_per_column,
            self.activation_threshold,
            self.initial_permanence,
            self.connected_permanence,
            self.min_threshold,
            self.max_new_synapse_count,
            u8::from(self.check_inputs),
        )?;
        write!(
            out,
            "{} {} {} {} {} {} {} {} ",
            self.permanence_increment,
            self.permanence_decrement,
            self.predicted_segment_decrement,
            self.anomaly,
            self.extra,
            self.max_segments_per_cell,
            self.max_synapses_per_segment,
            self.iteration,
        )?;
        writeln!(out)?;

        self.connections.save(out)?;
        writeln!(out)?;
        self.rng.save(out)?;

        write_vec(out, &self.column_dimensions)?;
        write_vec(out, &self.active_cells)?;
        write_vec(out, &self.winner_cells)?;

        write!(out, "{} ", u8::from(self.segments_valid))?;
        self.write_segments(out, &self.active_segments, &self.num_active_connected)?;
        self.write_segments(out, &self.matching_segments, &self.num_active_potential)?;

        writeln!(out, "~TemporalMemory")?;

        debug!(
            iteration = self.iteration,
            segments = self.connections.num_segments(),
            "saved temporal memory"
        );
        Ok(())
    }

    /// Reads a memory written by [`TemporalMemory::save`]. Streams of version 1, which also list
    /// predictive and matching cells, are accepted as well.
    pub fn load<R: BufRead>(input: &mut TokenReader<R>) -> Result<Self> {
        input.expect_marker("TemporalMemory")?;
        let version = input.parse::<u32>()?;
        if version > TM_VERSION {
            return Err(HtmError::Serialization(format!(
                "unsupported TemporalMemory version {version}, expected at most {TM_VERSION}"
            )));
        }

        let num_columns = input.parse::<u32>()?;
        let cells_per_column = input.parse::<u32>()?;
        let activation_threshold = input.parse::<SynapseIdx>()?;
        let initial_permanence = input.parse::<Permanence>()?;
        let connected_permanence = input.parse::<Permanence>()?;
        let min_threshold = input.parse::<SynapseIdx>()?;
        let max_new_synapse_count = input.parse::<SynapseIdx>()?;
        let check_inputs = input.parse_bool()?;
        let permanence_increment = input.parse::<Permanence>()?;
        let permanence_decrement = input.parse::<Permanence>()?;
        let predicted_segment_decrement = input.parse::<Permanence>()?;
        let anomaly = input.parse::<f32>()?;
        let extra = input.parse::<u32>()?;
        let max_segments_per_cell = input.parse::<SegmentIdx>()?;
        let max_synapses_per_segment = input.parse::<SynapseIdx>()?;
        let iteration = input.parse::<u64>()?;

        let connections = Connections::load(input)?;
        let rng = Random::load(input)?;

        let len = connections.segment_flat_list_length();
        let mut tm = Self {
            column_dimensions: input.parse_vec::<u32>()?,
            num_columns,
            cells_per_column,
            activation_threshold,
            initial_permanence,
            connected_permanence,
            min_threshold,
            max_new_synapse_count,
            check_inputs,
            permanence_increment,
            permanence_decrement,
            predicted_segment_decrement,
            extra,
            max_segments_per_cell,
            max_synapses_per_segment,
            active_cells: Vec::new(),
            winner_cells: Vec::new(),
            segments_valid: false,
            active_segments: Vec::new(),
            matching_segments: Vec::new(),
            num_active_connected: vec![0; len],
            num_active_potential: vec![0; len],
            last_used_iteration: vec![0; len],
            iteration,
            anomaly,
            rng,
            connections,
        };

        let described = tm
            .column_dimensions
            .iter()
            .try_fold(1u32, |acc, &d| acc.checked_mul(d));
        if described != Some(num_columns) {
            return Err(HtmError::Serialization(format!(
                "column dimensions {:?} do not describe {num_columns} columns",
                tm.column_dimensions
            )));
        }
        let num_cells = num_columns.checked_mul(cells_per_column);
        if num_cells.map(|n| n as usize) != Some(tm.connections.num_cells()) {
            return Err(HtmError::Serialization(format!(
                "connections hold {} cells, expected {num_columns} columns of {cells_per_column} cells",
                tm.connections.num_cells()
            )));
        }

        tm.active_cells = input.parse_vec::<CellIdx>()?;
        if version < 2 {
            input.parse_vec::<CellIdx>()?;
        }
        tm.winner_cells = input.parse_vec::<CellIdx>()?;

        tm.segments_valid = input.parse_bool()?;
        tm.active_segments = tm.read_segments(input, version, true)?;
        tm.matching_segments = tm.read_segments(input, version, false)?;
        if version < 2 {
            input.parse_vec::<CellIdx>()?;
        }

        input.expect_marker("~TemporalMemory")?;

        debug!(
            iteration = tm.iteration,
            segments = tm.connections.num_segments(),
            "loaded temporal memory"
        );
        Ok(tm)
    }

    fn read_segments<R: BufRead>(
        &mut self,
        input: &mut TokenReader<R>,
        version: u32,
        connected: bool,
    ) -> Result<Vec<Segment>> {
        let count = input.parse::<usize>()?;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = input.parse::<SegmentIdx>()?;
            let cell = input.parse::<CellIdx>()?;
            let segment = self.connections.get_segment(cell, idx)?;

            // Older streams did not record the activity counts.
            let activity = if version < 2 { 0 } else { input.parse::<SynapseIdx>()? };
            if connected {
                self.num_active_connected[segment as usize] = activity;
            } else {
                self.num_active_potential[segment as usize] = activity;
            }
            segments.push(segment);
        }
        Ok(segments)
    }

    /// Writes a binary snapshot of the complete state, including segment usage and the generator.
    pub fn save_binary<W: Write>(&self, out: &mut W) -> Result<()> {
        serialization::save_binary(out, "TemporalMemory", TM_VERSION, self)
    }

    /// Reads a snapshot written by [`TemporalMemory::save_binary`].
    pub fn load_binary<R: Read>(input: &mut R) -> Result<Self> {
        let tm: Self = serialization::load_binary(input, "TemporalMemory", TM_VERSION)?;
        debug!(iteration = tm.iteration, "loaded temporal memory snapshot");
        Ok(tm)
    }

    /// Segments as `(cell, index on cell)` pairs, which survive a text round trip.
    fn comparable_segments(&self, segments: &[Segment]) -> Option<BTreeSet<(CellIdx, SegmentIdx)>> {
        segments
            .iter()
            .map(|&s| {
                let cell = self.connections.cell_for_segment(s).ok()?;
                let idx = self.connections.idx_on_cell_for_segment(s).ok()?;
                Some((cell, idx))
            })
            .collect()
    }
}

impl PartialEq for TemporalMemory {
    fn eq(&self, other: &Self) -> bool {
        let same_params = self.num_columns == other.num_columns
            && self.column_dimensions == other.column_dimensions
            && self.cells_per_column == other.cells_per_column
            && self.activation_threshold == other.activation_threshold
            && self.min_threshold == other.min_threshold
            && self.max_new_synapse_count == other.max_new_synapse_count
            && self.initial_permanence == other.initial_permanence
            && self.connected_permanence == other.connected_permanence
            && self.permanence_increment == other.permanence_increment
            && self.permanence_decrement == other.permanence_decrement
            && self.predicted_segment_decrement == other.predicted_segment_decrement
            && self.max_segments_per_cell == other.max_segments_per_cell
            && self.max_synapses_per_segment == other.max_synapses_per_segment
            && self.extra == other.extra;

        let same_state = self.active_cells == other.active_cells
            && self.winner_cells == other.winner_cells
            && self.iteration == other.iteration
            && self.anomaly == other.anomaly;

        if !(same_params && same_state) || self.connections != other.connections {
            return false;
        }

        match (
            self.comparable_segments(&self.active_segments),
            other.comparable_segments(&other.active_segments),
            self.comparable_segments(&self.matching_segments),
            other.comparable_segments(&other.matching_segments),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => a == b && c == d,
            _ => false,
        }
    }
}

impl fmt::Display for TemporalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TemporalMemory parameters")?;
        writeln!(f, "  version                     = {}", TM_VERSION)?;
        writeln!(f, "  column_dimensions           = {:?}", self.column_dimensions)?;
        writeln!(f, "  number_of_columns           = {}", self.num_columns)?;
        writeln!(f, "  cells_per_column            = {}", self.cells_per_column)?;
        writeln!(f, "  activation_threshold        = {}", self.activation_threshold)?;
        writeln!(f, "  initial_permanence          = {}", self.initial_permanence)?;
        writeln!(f, "  connected_permanence        = {}", self.connected_permanence)?;
        writeln!(f, "  min_threshold               = {}", self.min_threshold)?;
        writeln!(f, "  max_new_synapse_count       = {}", self.max_new_synapse_count)?;
        writeln!(f, "  permanence_increment        = {}", self.permanence_increment)?;
        writeln!(f, "  permanence_decrement        = {}", self.permanence_decrement)?;
        writeln!(f, "  predicted_segment_decrement = {}", self.predicted_segment_decrement)?;
        writeln!(f, "  max_segments_per_cell       = {}", self.max_segments_per_cell)?;
        writeln!(f, "  max_synapses_per_segment    = {}", self.max_synapses_per_segment)?;
        write!(f, "  extra                       = {}", self.extra)
    }
}
