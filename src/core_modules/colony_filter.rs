// THEORY:
// The `ColonyFilter` removes candidates that are not plausibly one colony.
// Its policy is **reject, never split**: a blob that looks like two colonies
// fused together is dropped whole. Splitting would invent sub-colonies whose
// boundaries nobody observed, and those would then be tracked and reported
// as if they were real.
//
// A candidate is rejected when any of these holds:
// 1.  **Shape**: it is too elongated (`eccentricity`) or has a waist
//     (`solidity`). These are per-candidate tests.
// 2.  **Size**: its area exceeds `area_multiplier` times the median area of the
//     timepoint. This is a population test, so removing a giant can change the
//     median and expose the next one. The size tests are therefore repeated
//     until nothing more is removed. Because the result is a fixed point,
//     filtering an already filtered set returns it unchanged.
// 3.  **Outlier** (optional): its area is a high-side outlier by modified
//     z-score, `0.6745 * (area - median) / MAD`. Skipped when the MAD is zero.
//
// The element at the median is never rejected by a size test, so a non-empty
// input never filters down to nothing through the size tests alone.

use crate::config::FilterConfig;
use crate::core_modules::colony::Colony;
use crate::core_modules::utils::stats;
use tracing::debug;

/// Consistency constant relating the MAD to a normal standard deviation.
const MODIFIED_Z_SCALE: f64 = 0.6745;

/// Returns the candidates that look like single colonies, in their input order.
pub fn filter_colonies(candidates: Vec<Colony>, config: &FilterConfig) -> Vec<Colony> {
    let total = candidates.len();
    let mut kept: Vec<Colony> = candidates
        .into_iter()
        .filter(|colony| has_plausible_shape(colony, config))
        .collect();
    let shape_rejected = total - kept.len();

    let mut size_rejected = 0;
    loop {
        let areas: Vec<f64> = kept.iter().map(|colony| colony.area).collect();
        let Some(median) = stats::median(&areas) else {
            break;
        };
        let area_limit = median * config.area_multiplier;
        let mad = stats::median_absolute_deviation(&areas).unwrap_or(0.0);

        let before = kept.len();
        kept.retain(|colony| {
            colony.area <= area_limit && !is_area_outlier(colony.area, median, mad, config.outlier_z_threshold)
        });
        let removed = before - kept.len();
        if removed == 0 {
            break;
        }
        size_rejected += removed;
    }

    if shape_rejected + size_rejected > 0 {
        debug!(total, shape_rejected, size_rejected, "rejected merged or implausible colonies");
    }
    kept
}

fn has_plausible_shape(colony: &Colony, config: &FilterConfig) -> bool {
    colony.shape.eccentricity <= config.max_eccentricity && colony.shape.solidity >= config.min_solidity
}

fn is_area_outlier(area: f64, median: f64, mad: f64, threshold: Option<f64>) -> bool {
    let Some(threshold) = threshold else {
        return false;
    };
    if mad <= f64::EPSILON || area <= median {
        return false;
    }
    MODIFIED_Z_SCALE * (area - median) / mad > threshold
}
