// THEORY:
// Every tunable number the analyser depends on lives here rather than as a
// constant buried in an algorithm. The merge heuristic and the matching
// distance in particular are defaults, not facts, and a user must be able to
// override them from a TOML file.
//
// Each section carries `#[serde(default)]`, so a config file only has to name
// the values it changes. `validate` is the single gate that turns nonsense
// (negative distances, a lattice with zero rows, NaN thresholds) into a fatal
// `InvalidConfig` before any image is touched.

use crate::error::{ColonyError, ColonyResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root of the analyser configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub plate: PlateConfig,
    pub segmentation: SegmentationConfig,
    pub filter: FilterConfig,
    pub tracking: TrackingConfig,
    pub growth: GrowthConfig,
    pub workers: WorkerConfig,
}

/// Plate location settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateConfig {
    /// When false, every lattice cell is used as-is as the plate region.
    pub enabled: bool,
    /// Number of plate rows in a multi-plate image.
    pub lattice_rows: u32,
    /// Number of plate columns in a multi-plate image.
    pub lattice_columns: u32,
    /// Minimum luminance difference from the border background for a pixel to
    /// count as part of the plate.
    pub min_contrast: f64,
    /// Fraction of a row/column that must be foreground for it to belong to the plate extent.
    pub min_occupancy: f64,
    /// The located plate must span at least this fraction of its cell in both dimensions.
    pub min_plate_fraction: f64,
    /// Fraction of the plate extent trimmed from every side to drop the rim.
    pub edge_margin: f64,
    /// Register every image against the earliest one of the run by
    /// translation, and reuse the plates located on that reference.
    pub align_to_reference: bool,
    /// Larger shifts (in pixels, on either axis) fail the image.
    pub max_alignment_shift: u32,
}

impl Default for PlateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lattice_rows: 1,
            lattice_columns: 1,
            min_contrast: 20.0,
            min_occupancy: 0.05,
            min_plate_fraction: 0.25,
            edge_margin: 0.02,
            align_to_reference: false,
            max_alignment_shift: 64,
        }
    }
}

/// Colony segmentation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Minimum luminance difference from the plate median for a colony pixel.
    pub colony_contrast: f64,
    /// Components smaller than this many pixels are treated as noise.
    pub min_colony_area: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            colony_contrast: 30.0,
            min_colony_area: 4,
        }
    }
}

/// Merged-colony rejection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// A candidate larger than `area_multiplier` times the median area is rejected.
    pub area_multiplier: f64,
    /// Candidates more elongated than this are rejected.
    pub max_eccentricity: f64,
    /// Candidates less convex than this are rejected.
    pub min_solidity: f64,
    /// Optional modified z-score cutoff for high-side area outliers.
    pub outlier_z_threshold: Option<f64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            area_multiplier: 5.0,
            max_eccentricity: 0.95,
            min_solidity: 0.9,
            outlier_z_threshold: None,
        }
    }
}

/// Cross-timepoint matching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Observations strictly closer than this (in pixels) to a track's last centroid extend it.
    pub max_distance: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { max_distance: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    /// Prior values within this distance of zero make a growth rate undefined.
    pub epsilon: f64,
    /// Fit a Gompertz curve to each track's area series.
    pub fit_curve: bool,
    /// Levenberg-Marquardt iteration cap for the curve fit.
    pub max_fit_iterations: usize,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-9,
            fit_curve: true,
            max_fit_iterations: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Size of the worker pool. Defaults to the number of logical CPUs.
    pub worker_count: Option<usize>,
}

impl WorkerConfig {
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(num_cpus::get).max(1)
    }
}

impl AnalysisConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> ColonyResult<Self> {
        let config: AnalysisConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ColonyResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ColonyResult<()> {
        let plate = &self.plate;
        if plate.lattice_rows == 0 || plate.lattice_columns == 0 {
            return invalid("plate lattice must have at least one row and one column");
        }
        require_non_negative("plate.min_contrast", plate.min_contrast)?;
        require_fraction("plate.min_occupancy", plate.min_occupancy)?;
        require_fraction("plate.min_plate_fraction", plate.min_plate_fraction)?;
        if !(0.0..0.5).contains(&plate.edge_margin) {
            return invalid("plate.edge_margin must be in [0, 0.5)");
        }
        if plate.align_to_reference && plate.max_alignment_shift == 0 {
            return invalid("plate.max_alignment_shift must be at least 1 when alignment is enabled");
        }

        require_non_negative("segmentation.colony_contrast", self.segmentation.colony_contrast)?;

        let filter = &self.filter;
        if !filter.area_multiplier.is_finite() || filter.area_multiplier < 1.0 {
            return invalid("filter.area_multiplier must be a finite value >= 1");
        }
        require_fraction("filter.max_eccentricity", filter.max_eccentricity)?;
        require_fraction("filter.min_solidity", filter.min_solidity)?;
        if let Some(z) = filter.outlier_z_threshold {
            if !z.is_finite() || z <= 0.0 {
                return invalid("filter.outlier_z_threshold must be a finite value > 0");
            }
        }

        if !self.tracking.max_distance.is_finite() || self.tracking.max_distance <= 0.0 {
            return invalid("tracking.max_distance must be a finite value > 0");
        }
        require_non_negative("growth.epsilon", self.growth.epsilon)?;
        if self.growth.fit_curve && self.growth.max_fit_iterations == 0 {
            return invalid("growth.max_fit_iterations must be at least 1 when fitting is enabled");
        }

        if self.workers.worker_count == Some(0) {
            return invalid("workers.worker_count must be at least 1");
        }
        Ok(())
    }
}

fn invalid<T>(message: &str) -> ColonyResult<T> {
    Err(ColonyError::InvalidConfig(message.to_string()))
}

fn require_non_negative(name: &str, value: f64) -> ColonyResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ColonyError::InvalidConfig(format!("{name} must be a finite value >= 0")))
    }
}

fn require_fraction(name: &str, value: f64) -> ColonyResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ColonyError::InvalidConfig(format!("{name} must be in [0, 1]")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AnalysisConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AnalysisConfig::from_toml_str(
            r#"
            [tracking]
            max_distance = 2.5

            [workers]
            worker_count = 3
            "#,
        )
        .expect("valid config");
        assert_eq!(config.tracking.max_distance, 2.5);
        assert_eq!(config.workers.resolved_worker_count(), 3);
        assert_eq!(config.filter, FilterConfig::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = AnalysisConfig::default();
        config.filter.area_multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ColonyError::InvalidConfig(_))));

        let mut config = AnalysisConfig::default();
        config.tracking.max_distance = 0.0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.plate.lattice_columns = 0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.workers.worker_count = Some(0);
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.plate.align_to_reference = true;
        config.plate.max_alignment_shift = 0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.growth.max_fit_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn alignment_is_opt_in() {
        let config = AnalysisConfig::from_toml_str("[plate]\nalign_to_reference = true").unwrap();
        assert!(config.plate.align_to_reference);
        assert_eq!(config.plate.max_alignment_shift, 64);
        assert!(!AnalysisConfig::default().plate.align_to_reference);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let result = AnalysisConfig::from_toml_str("[tracking]\nmax_distance = \"far\"");
        assert!(matches!(result, Err(ColonyError::ConfigParse(_))));
    }
}
