// THEORY:
// The `growth` module is the last analytical layer. It turns each
// `ColonyTrack` (a list of observations) into a `GrowthRecord` (a list of
// rates), ready for plotting and export by whoever consumes the report.
//
// Key principles:
// 1.  **Rates per step**: for every consecutive pair of observations the rate
//     is `(v2 - v1) / (t2 - t1)`, in units per second, for area and for mean
//     intensity.
// 2.  **Undefined is a value**: a zero time step, a prior value within
//     `epsilon` of zero, or a non-finite quotient produce
//     `GrowthRate::Undefined(reason)`. The division is never performed in the
//     first two cases, so NaN and infinity cannot reach a consumer.
// 3.  **Curve estimate**: each record carries a coarse growth curve estimate
//     (lag time, maximum growth rate, carrying capacity, doubling time) read
//     directly off the area series.
// 4.  **Curve fit**: the estimate seeds a Levenberg-Marquardt fit of the
//     Gompertz model of Zwietering et al. (1990). A fit that does not converge
//     is reported with every parameter zeroed rather than with a half-fitted
//     curve.

use crate::config::GrowthConfig;
use crate::core_modules::colony::Colony;
use crate::core_modules::tracker::ColonyTrack;
use crate::core_modules::utils::lm_optimizer::{self, LmConfig, LmModel};
use crate::core_modules::utils::stats;
use serde::{Deserialize, Serialize};
use std::f64::consts::{E, LN_2};
use std::time::Duration;

/// Number of free parameters of the Gompertz model.
const GOMPERTZ_PARAMETERS: usize = 4;

/// Why a growth rate could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndefinedReason {
    /// The two observations share a timestamp.
    ZeroTimeDelta,
    /// The earlier value is within `epsilon` of zero.
    ZeroPriorValue,
    /// The quotient overflowed or an input was not finite.
    NonFinite,
}

/// Growth between two consecutive observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GrowthRate {
    Defined(f64),
    Undefined(UndefinedReason),
}

impl GrowthRate {
    pub fn value(&self) -> Option<f64> {
        match self {
            GrowthRate::Defined(rate) => Some(*rate),
            GrowthRate::Undefined(_) => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, GrowthRate::Defined(_))
    }
}

/// Computes `(v2 - v1) / (t2 - t1)` with the undefined guards applied first.
pub fn growth_rate(v1: f64, t1: Duration, v2: f64, t2: Duration, epsilon: f64) -> GrowthRate {
    if t2 <= t1 {
        return GrowthRate::Undefined(UndefinedReason::ZeroTimeDelta);
    }
    if !v1.is_finite() || !v2.is_finite() {
        return GrowthRate::Undefined(UndefinedReason::NonFinite);
    }
    if v1.abs() <= epsilon {
        return GrowthRate::Undefined(UndefinedReason::ZeroPriorValue);
    }
    let rate = (v2 - v1) / (t2 - t1).as_secs_f64();
    if rate.is_finite() {
        GrowthRate::Defined(rate)
    } else {
        GrowthRate::Undefined(UndefinedReason::NonFinite)
    }
}

/// Coarse growth curve parameters estimated from a track's area series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthCurveEstimate {
    /// Timestamp just before growth takes off.
    pub lag_time: Duration,
    /// Largest defined area rate around and after the take-off, per second.
    pub max_growth_rate: f64,
    /// Area the colony levels off at.
    pub carrying_capacity: f64,
    /// `ln 2 / max_growth_rate` when the rate is positive.
    pub doubling_time: Option<Duration>,
}

/// Gompertz parameters fitted to a track's area series.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GrowthCurveFit {
    /// Baseline area the curve starts from.
    pub initial_size: f64,
    /// λ: where the tangent at the inflection point crosses the baseline.
    /// Negative fitted values are reported as zero.
    pub lag_time: Duration,
    /// μmax: slope at the inflection point, area per second.
    pub max_growth_rate: f64,
    /// A: the rise from the baseline to the plateau.
    pub carrying_capacity: f64,
    /// `ln 2 / max_growth_rate` when the rate is positive.
    pub doubling_time: Option<Duration>,
    /// False when the fit diverged; every parameter is then zero.
    pub converged: bool,
}

impl GrowthCurveFit {
    fn diverged() -> Self {
        Self::default()
    }
}

/// A colony track annotated with its growth series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthRecord {
    pub track: ColonyTrack,
    /// One entry per consecutive observation pair: `observations.len() - 1` entries.
    pub area_rates: Vec<GrowthRate>,
    pub intensity_rates: Vec<GrowthRate>,
    /// Present when the track has at least two observations.
    pub curve: Option<GrowthCurveEstimate>,
    /// Present when fitting is enabled and the track has at least four observations.
    pub fit: Option<GrowthCurveFit>,
}

impl GrowthRecord {
    pub fn defined_area_rates(&self) -> impl Iterator<Item = f64> + '_ {
        self.area_rates.iter().filter_map(GrowthRate::value)
    }
}

/// Builds the growth record of one track.
pub fn aggregate(track: ColonyTrack, config: &GrowthConfig) -> GrowthRecord {
    let series = |value: fn(&Colony) -> f64| -> Vec<GrowthRate> {
        track
            .observations
            .windows(2)
            .map(|pair| {
                growth_rate(
                    value(&pair[0].colony),
                    pair[0].timestamp,
                    value(&pair[1].colony),
                    pair[1].timestamp,
                    config.epsilon,
                )
            })
            .collect()
    };
    let area_rates = series(|colony| colony.area);
    let intensity_rates = series(|colony| colony.mean_intensity);

    let timestamps: Vec<Duration> = track.observations.iter().map(|o| o.timestamp).collect();
    let areas: Vec<f64> = track.observations.iter().map(|o| o.colony.area).collect();
    let curve = estimate_curve(&timestamps, &areas, &area_rates);
    let fit = match curve {
        Some(estimate) if config.fit_curve => fit_growth_curve(&timestamps, &areas, &estimate, config.max_fit_iterations),
        _ => None,
    };

    GrowthRecord {
        track,
        area_rates,
        intensity_rates,
        curve,
        fit,
    }
}

/// Builds the growth records of all tracks, preserving their order.
pub fn aggregate_all(tracks: Vec<ColonyTrack>, config: &GrowthConfig) -> Vec<GrowthRecord> {
    tracks.into_iter().map(|track| aggregate(track, config)).collect()
}

/// Estimates lag time, maximum growth rate and carrying capacity.
///
/// * Carrying capacity: the first measurement within one standard deviation
///   of the step differences from the final measurement.
/// * Take-off: the first step `i` whose difference exceeds the mean
///   difference plus one standard deviation. A take-off on the very first
///   step counts as step 1.
/// * Lag time: the timestamp at which step `i - 1` starts. Zero when no
///   step takes off.
/// * Maximum growth rate: the largest defined rate of steps `i - 1` up to,
///   but not including, the last step. Zero when no step takes off.
fn estimate_curve(timestamps: &[Duration], measurements: &[f64], rates: &[GrowthRate]) -> Option<GrowthCurveEstimate> {
    if measurements.len() < 2 || timestamps.len() != measurements.len() {
        return None;
    }
    let diffs: Vec<f64> = measurements.windows(2).map(|pair| pair[1] - pair[0]).collect();
    let (mean, std) = stats::mean_std(&diffs)?;

    let last = *measurements.last()?;
    let carrying_capacity = measurements
        .iter()
        .copied()
        .find(|m| (last - std..=last + std).contains(m))
        .unwrap_or(last);

    let inflection = mean + std;
    let (lag_time, max_growth_rate) = match diffs.iter().position(|d| *d > inflection) {
        Some(take_off) => {
            let start = take_off.max(1) - 1;
            let max_rate = rates[start..rates.len() - 1]
                .iter()
                .filter_map(GrowthRate::value)
                .fold(None, |best: Option<f64>, rate| Some(best.map_or(rate, |b| b.max(rate))))
                .unwrap_or(0.0);
            (timestamps[start], max_rate)
        }
        None => (Duration::ZERO, 0.0),
    };

    Some(GrowthCurveEstimate {
        lag_time,
        max_growth_rate,
        carrying_capacity,
        doubling_time: doubling_time(max_growth_rate),
    })
}

fn doubling_time(rate: f64) -> Option<Duration> {
    (rate > 0.0).then(|| Duration::try_from_secs_f64(LN_2 / rate).ok()).flatten()
}

/// The Gompertz growth model in Zwietering's parametrisation, on a baseline:
/// `initial_size + A * exp(-exp(μ * e / A * (λ - t) + 1))`.
pub fn gompertz(elapsed: f64, initial_size: f64, lag_time: f64, growth_rate: f64, carrying_capacity: f64) -> f64 {
    let exponent = growth_rate * E / carrying_capacity * (lag_time - elapsed) + 1.0;
    initial_size + carrying_capacity * (-exponent.exp()).exp()
}

/// Parameters: `[initial_size, lag_time, growth_rate, carrying_capacity]`.
struct GompertzModel;

impl LmModel<GOMPERTZ_PARAMETERS> for GompertzModel {
    fn evaluate(&self, t: f64, params: &[f64; GOMPERTZ_PARAMETERS]) -> f64 {
        let [initial_size, lag_time, growth_rate, carrying_capacity] = *params;
        gompertz(t, initial_size, lag_time, growth_rate, carrying_capacity)
    }

    fn jacobian_row(&self, t: f64, params: &[f64; GOMPERTZ_PARAMETERS]) -> [f64; GOMPERTZ_PARAMETERS] {
        let [_, lag_time, growth_rate, capacity] = *params;
        let tail = lag_time - t;
        let inner = (growth_rate * E / capacity * tail + 1.0).exp();
        let outer = (-inner).exp();
        // inner * outer vanishes where inner overflows.
        let slope = match inner * outer {
            product if product.is_finite() => product,
            _ => 0.0,
        };
        [
            1.0,
            -growth_rate * E * slope,
            -E * tail * slope,
            outer + slope * growth_rate * E * tail / capacity,
        ]
    }

    fn constrain(&self, params: &mut [f64; GOMPERTZ_PARAMETERS]) {
        if params[3].abs() < 1e-9 {
            params[3] = 1e-9;
        }
    }
}

/// Fits the Gompertz model to `measurements`, seeded from `estimate`.
///
/// `None` when there are fewer observations than model parameters. A fit
/// that does not converge, or converges to non-finite values, comes back
/// zeroed with `converged == false`.
pub fn fit_growth_curve(
    timestamps: &[Duration],
    measurements: &[f64],
    estimate: &GrowthCurveEstimate,
    max_iterations: usize,
) -> Option<GrowthCurveFit> {
    if measurements.len() < GOMPERTZ_PARAMETERS || timestamps.len() != measurements.len() {
        return None;
    }
    if measurements.iter().any(|m| !m.is_finite()) {
        return Some(GrowthCurveFit::diverged());
    }

    let seconds: Vec<f64> = timestamps.iter().map(Duration::as_secs_f64).collect();
    let initial_size = measurements.iter().copied().fold(f64::INFINITY, f64::min);
    let seed = [
        initial_size,
        estimate.lag_time.as_secs_f64(),
        estimate.max_growth_rate,
        estimate.carrying_capacity,
    ];
    let config = LmConfig {
        max_iterations,
        ..LmConfig::default()
    };
    let result = lm_optimizer::optimize(&GompertzModel, &seconds, measurements, seed, &config);

    let [initial_size, lag_time, rate, carrying_capacity] = result.params;
    if !result.converged || result.params.iter().any(|p| !p.is_finite()) {
        return Some(GrowthCurveFit::diverged());
    }
    Some(GrowthCurveFit {
        initial_size,
        lag_time: Duration::try_from_secs_f64(lag_time.max(0.0)).unwrap_or(Duration::MAX),
        max_growth_rate: rate,
        carrying_capacity,
        doubling_time: doubling_time(rate),
        converged: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::colony::{GroupKey, Point, ShapeDescriptors};
    use crate::core_modules::frame::Region;
    use crate::core_modules::tracker::{Observation, TrackState};
    use std::path::PathBuf;

    fn track(points: &[(u64, f64)]) -> ColonyTrack {
        ColonyTrack {
            id: 0,
            group: GroupKey::new("g", 1),
            observations: points
                .iter()
                .map(|&(seconds, area)| Observation {
                    timestamp: Duration::from_secs(seconds),
                    source: PathBuf::from(format!("{seconds}.png")),
                    colony: Colony {
                        center: Point::new(10.0, 10.0),
                        area,
                        mean_intensity: area * 2.0,
                        mean_color: [0.0; 3],
                        bounding_box: Region::default(),
                        shape: ShapeDescriptors::default(),
                    },
                })
                .collect(),
            state: TrackState::Active,
            missed_timepoints: 0,
        }
    }

    #[test]
    fn rates_follow_area_deltas() {
        let record = aggregate(track(&[(1, 50.0), (2, 80.0), (3, 120.0)]), &GrowthConfig::default());
        assert_eq!(record.area_rates, vec![GrowthRate::Defined(30.0), GrowthRate::Defined(40.0)]);
        assert_eq!(record.intensity_rates, vec![GrowthRate::Defined(60.0), GrowthRate::Defined(80.0)]);
    }

    #[test]
    fn zero_time_delta_is_undefined() {
        let rate = growth_rate(10.0, Duration::from_secs(4), 20.0, Duration::from_secs(4), 1e-9);
        assert_eq!(rate, GrowthRate::Undefined(UndefinedReason::ZeroTimeDelta));
    }

    #[test]
    fn near_zero_prior_value_is_undefined() {
        let rate = growth_rate(1e-12, Duration::ZERO, 5.0, Duration::from_secs(1), 1e-9);
        assert_eq!(rate, GrowthRate::Undefined(UndefinedReason::ZeroPriorValue));
        let rate = growth_rate(0.0, Duration::ZERO, 0.0, Duration::from_secs(1), 0.0);
        assert_eq!(rate, GrowthRate::Undefined(UndefinedReason::ZeroPriorValue));
    }

    #[test]
    fn non_finite_inputs_never_leak() {
        let rate = growth_rate(f64::NAN, Duration::ZERO, 1.0, Duration::from_secs(1), 1e-9);
        assert_eq!(rate, GrowthRate::Undefined(UndefinedReason::NonFinite));
        let rate = growth_rate(1.0, Duration::ZERO, f64::MAX, Duration::from_nanos(1), 1e-9);
        assert_eq!(rate, GrowthRate::Undefined(UndefinedReason::NonFinite));
    }

    #[test]
    fn every_degenerate_step_is_a_sentinel() {
        let record = aggregate(
            track(&[(0, 0.0), (1, 10.0), (1, 12.0), (3, 0.0), (4, 8.0)]),
            &GrowthConfig::default(),
        );
        assert_eq!(record.area_rates.len(), 4);
        for rate in &record.area_rates {
            if let GrowthRate::Defined(value) = rate {
                assert!(value.is_finite());
            }
        }
        assert_eq!(record.area_rates[0], GrowthRate::Undefined(UndefinedReason::ZeroPriorValue));
        assert_eq!(record.area_rates[1], GrowthRate::Undefined(UndefinedReason::ZeroTimeDelta));
        assert_eq!(record.area_rates[2], GrowthRate::Defined(-6.0));
        assert_eq!(record.area_rates[3], GrowthRate::Undefined(UndefinedReason::ZeroPriorValue));
    }

    #[test]
    fn single_observation_has_no_rates_or_curve() {
        let record = aggregate(track(&[(0, 5.0)]), &GrowthConfig::default());
        assert!(record.area_rates.is_empty());
        assert!(record.curve.is_none());
    }

    #[test]
    fn curve_estimate_finds_lag_and_plateau() {
        let record = aggregate(
            track(&[(0, 10.0), (10, 11.0), (20, 12.0), (30, 60.0), (40, 100.0), (50, 104.0), (60, 105.0)]),
            &GrowthConfig::default(),
        );
        let curve = record.curve.expect("enough observations");
        // Diffs: 1, 1, 48, 40, 4, 1. The first step above mean + std is 12 -> 60,
        // so the lag ends where the step before it starts, at 10 s, and the
        // rate is the best of steps 1..=4 (0.1, 4.8, 4.0, 0.4 per second).
        assert_eq!(curve.lag_time, Duration::from_secs(10));
        assert!((curve.max_growth_rate - 4.8).abs() < 1e-9);
        assert_eq!(curve.carrying_capacity, 100.0);
        let doubling = curve.doubling_time.expect("positive rate");
        assert!((doubling.as_secs_f64() - std::f64::consts::LN_2 / 4.8).abs() < 1e-6);
    }

    #[test]
    fn take_off_on_the_first_step_counts_as_step_one() {
        // Diffs: 50, 2, 1, 1. Step 0 takes off, so the rate excludes only the last step.
        let record = aggregate(
            track(&[(0, 10.0), (10, 60.0), (20, 62.0), (30, 63.0), (40, 64.0)]),
            &GrowthConfig::default(),
        );
        let curve = record.curve.unwrap();
        assert_eq!(curve.lag_time, Duration::ZERO);
        assert!((curve.max_growth_rate - 5.0).abs() < 1e-9);
    }

    #[test]
    fn late_take_off_ignores_the_last_step() {
        // Diffs: 1, 1, 1, 1, 20, 30. The take-off is step 5; steps 4..5 leave only step 4.
        let record = aggregate(
            track(&[(0, 10.0), (1, 11.0), (2, 12.0), (3, 13.0), (4, 14.0), (5, 34.0), (6, 64.0)]),
            &GrowthConfig::default(),
        );
        let curve = record.curve.unwrap();
        assert_eq!(curve.lag_time, Duration::from_secs(4));
        assert!((curve.max_growth_rate - 20.0).abs() < 1e-9);
    }

    #[test]
    fn flat_series_has_no_doubling_time() {
        let record = aggregate(track(&[(0, 10.0), (1, 10.0), (2, 10.0)]), &GrowthConfig::default());
        let curve = record.curve.unwrap();
        assert_eq!(curve.max_growth_rate, 0.0);
        assert_eq!(curve.doubling_time, None);
        assert_eq!(curve.lag_time, Duration::ZERO);
        assert_eq!(curve.carrying_capacity, 10.0);
    }

    const SYNTHETIC: (f64, f64, f64, f64) = (20.0, 3_600.0, 0.05, 400.0);

    fn synthetic_series() -> Vec<(u64, f64)> {
        let (initial, lag, rate, capacity) = SYNTHETIC;
        (0..=20)
            .map(|i| {
                let seconds = 900 * i;
                (seconds, gompertz(seconds as f64, initial, lag, rate, capacity))
            })
            .collect()
    }

    #[test]
    fn gompertz_passes_its_landmarks() {
        let (initial, lag, rate, capacity) = SYNTHETIC;
        assert!((gompertz(lag, initial, lag, rate, capacity) - (initial + capacity * (-E).exp())).abs() < 1e-9);
        assert!((gompertz(1e7, initial, lag, rate, capacity) - (initial + capacity)).abs() < 1e-6);
        // Far before the lag the inner exponential overflows; the curve is just the baseline.
        assert_eq!(gompertz(-1e9, initial, lag, rate, capacity), initial);
    }

    #[test]
    fn fit_recovers_a_synthetic_gompertz_curve() {
        let record = aggregate(track(&synthetic_series()), &GrowthConfig::default());
        let estimate = record.curve.unwrap();
        let fit = record.fit.expect("21 observations are enough to fit");
        let (initial, lag, rate, capacity) = SYNTHETIC;

        assert!(fit.converged);
        assert!((fit.initial_size - initial).abs() < 0.05, "{fit:?}");
        assert!((fit.lag_time.as_secs_f64() - lag).abs() < 1.0, "{fit:?}");
        assert!((fit.max_growth_rate - rate).abs() < 1e-5, "{fit:?}");
        assert!((fit.carrying_capacity - capacity).abs() < 0.05, "{fit:?}");
        // The fit improves on its own seed.
        assert!((fit.max_growth_rate - rate).abs() < (estimate.max_growth_rate - rate).abs());
        let doubling = fit.doubling_time.unwrap().as_secs_f64();
        assert!((doubling - LN_2 / rate).abs() < 0.1);
    }

    #[test]
    fn fit_that_cannot_converge_is_zeroed() {
        let record = aggregate(track(&[(0, 10.0), (1, 10.0), (2, 10.0), (3, 10.0)]), &GrowthConfig::default());
        let fit = record.fit.expect("four observations are fitted");
        assert!(!fit.converged);
        assert_eq!(fit, GrowthCurveFit::default());
        assert_eq!(fit.lag_time, Duration::ZERO);
        assert_eq!(fit.doubling_time, None);
    }

    #[test]
    fn short_or_disabled_series_are_not_fitted() {
        let record = aggregate(track(&[(0, 10.0), (1, 20.0), (2, 40.0)]), &GrowthConfig::default());
        assert!(record.curve.is_some());
        assert!(record.fit.is_none());

        let config = GrowthConfig {
            fit_curve: false,
            ..GrowthConfig::default()
        };
        assert!(aggregate(track(&synthetic_series()), &config).fit.is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn any_value() -> impl Strategy<Value = f64> {
            prop_oneof![
                prop::num::f64::ANY,
                -1e6f64..1e6,
                Just(0.0),
                Just(f64::MIN_POSITIVE),
                Just(f64::MAX),
            ]
        }

        proptest! {
            #[test]
            fn growth_rate_is_never_a_non_finite_number(
                v1 in any_value(),
                v2 in any_value(),
                t1 in 0u64..1_000_000_000_000,
                step in prop_oneof![Just(0u64), 1u64..10, 0u64..1_000_000_000_000],
                epsilon in prop_oneof![Just(0.0f64), 0.0f64..1.0],
            ) {
                let t1 = Duration::from_nanos(t1);
                let t2 = t1 + Duration::from_nanos(step);
                match growth_rate(v1, t1, v2, t2, epsilon) {
                    GrowthRate::Defined(rate) => prop_assert!(rate.is_finite(), "Defined({rate})"),
                    GrowthRate::Undefined(_) => {}
                }
                // Going back in time is never a rate.
                prop_assert!(!growth_rate(v1, t2, v2, t1, epsilon).is_defined());
            }
        }
    }
}
