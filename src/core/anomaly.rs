//! Raw anomaly score: the fraction of active columns that were not predicted.

use crate::core::sdr::Sdr;
use crate::error::{HtmError, Result};

/// Computes `(|active| - |active ∩ predicted|) / |active|`, or 0 if nothing is active.
///
/// - A score of 0 means every active column was predicted.
/// - A score of 1 means none of them was.
///
/// Both SDRs must have the same dimensions.
pub fn compute_raw_anomaly_score(active: &Sdr, predicted: &Sdr) -> Result<f32> {
    if active.dimensions() != predicted.dimensions() {
        return Err(HtmError::DimensionMismatch {
            expected: active.dimensions().to_vec(),
            actual: predicted.dimensions().to_vec(),
        });
    }

    let num_active = active.get_sum();
    if num_active == 0 {
        return Ok(0.0);
    }

    let both = active.overlap(predicted)?;
    Ok((num_active - both) as f32 / num_active as f32)
}
