use crate::{
    backend::traits::{draw_unit, RandomSource},
    error::AttributionError,
    impressions::impression::Impression,
};

/// Step B: last-N-touch ranking. Sorts the matched pool by
/// `(priority DESC, timestamp DESC)` and keeps the first
/// `min(credit_len, pool len)` impressions. The sort is stable, so equal
/// keys keep storage order.
pub fn rank_impressions(
    mut pool: Vec<Impression>,
    credit_len: usize,
) -> Vec<Impression> {
    pool.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.timestamp.cmp(&a.timestamp))
    });
    pool.truncate(credit_len);
    pool
}

/// Step C: converts a positive real-valued credit split into an integer
/// vector of the same length whose sum is exactly `value` and whose
/// per-entry expectation is `value · credit[i] / Σ credit`.
///
/// Walks the weights with a pairwise randomized rounding: at each step one
/// of the pair is snapped to an integer and the other (the leader) carries
/// the combined fractional mass forward. Snapped entries are exact
/// integers, so floating-point drift can only accumulate in the leader,
/// which is finally recovered as `value − Σ(others)` in integer
/// arithmetic.
pub fn fairly_allocate_credit<R: RandomSource>(
    credit: &[f64],
    value: u64,
    rng: &mut R,
) -> Result<Vec<u64>, AttributionError> {
    if credit.is_empty() {
        return Err(AttributionError::InvalidState(
            "credit allocation over an empty pool".to_string(),
        ));
    }

    let total: f64 = credit.iter().sum();
    let mut weights: Vec<f64> = credit
        .iter()
        .map(|c| value as f64 * c / total)
        .collect();

    let mut leader = 0;
    for i in 1..weights.len() {
        let leader_fract = weights[leader].fract();
        let other_fract = weights[i].fract();
        if leader_fract == 0.0 && other_fract == 0.0 {
            continue;
        }

        // Residuals toward rounding both up when the fractions overflow a
        // unit, both down otherwise.
        let (leader_residual, other_residual) =
            if leader_fract + other_fract > 1.0 {
                (1.0 - leader_fract, 1.0 - other_fract)
            } else {
                (-leader_fract, -other_fract)
            };

        let r = draw_unit(rng)?;
        if r < other_residual / (leader_residual + other_residual) {
            // The leader rounds to an integer; index i inherits its
            // fractional mass and becomes the new leader.
            weights[leader] = (weights[leader] + leader_residual).round();
            weights[i] -= leader_residual;
            leader = i;
        } else {
            // Index i rounds to an integer; the leader absorbs its mass.
            weights[i] = (weights[i] + other_residual).round();
            weights[leader] -= other_residual;
        }
    }

    let mut allocated: Vec<u64> =
        weights.iter().map(|w| w.round() as u64).collect();

    // Every non-leader entry is an exact integer; make the total exact by
    // reconstructing the leader from the integer remainder.
    let others: u64 = allocated
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader)
        .map(|(_, v)| *v)
        .sum();
    if others > value {
        return Err(AttributionError::InvalidState(format!(
            "allocated credit {others} exceeds conversion value {value}"
        )));
    }
    allocated[leader] = value - others;

    Ok(allocated)
}

/// Step D: adds each retained impression's allocated credit to its
/// histogram slot. Impressions whose index falls outside the requested
/// size contribute nothing: they were admitted under a larger configured
/// maximum and are kept rather than dropped on config change.
pub fn fill_histogram(
    ranked: &[Impression],
    allocated: &[u64],
    histogram_size: usize,
    value: u64,
) -> Result<Vec<u64>, AttributionError> {
    let mut histogram = vec![0u64; histogram_size];
    for (impression, credit) in ranked.iter().zip(allocated) {
        if let Ok(index) = usize::try_from(impression.histogram_index) {
            if index < histogram_size {
                histogram[index] += credit;
            }
        }
    }

    let l1_norm: u64 = histogram.iter().sum();
    if l1_norm > value {
        return Err(AttributionError::InvalidState(format!(
            "histogram L1-norm {l1_norm} exceeds conversion value {value}"
        )));
    }
    Ok(histogram)
}
