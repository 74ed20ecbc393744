// THEORY:
// The `pipeline` module is the top-level, single-threaded API of the analyser.
// It stitches the core modules together in two halves that the parallel
// pipeline runs on different sides of its worker boundary:
//
// 1.  **Per image** (`ColonyPipeline::process_image`): locate the plates,
//     segment each plate, filter the candidates. The result is one plain
//     `Timepoint` per plate, with no reference back to the pixels, plus the
//     lattice cells that held no plate.
// 2.  **Per run** (`ColonyPipeline::analyse`): sort every timepoint into
//     capture order, link them into tracks and turn the tracks into growth
//     records. This half is order-sensitive and therefore never parallel.
//
// With `plate.align_to_reference` the pipeline is first anchored to the
// earliest image of the run: plates are located once on that frame and every
// image is translated onto it before segmentation.
//
// A run in which no image produced a single colony ends with the graceful
// `EmptyColonySet` outcome instead of an empty report.

use crate::config::AnalysisConfig;
use crate::core_modules::aligner::FrameAligner;
use crate::core_modules::blob_detector::blob_detector;
use crate::core_modules::colony::{GroupKey, Timepoint};
use crate::core_modules::colony_filter::filter_colonies;
use crate::core_modules::frame::{Image, ImageDescriptor};
use crate::core_modules::growth::{self, GrowthRecord};
use crate::core_modules::plate_locator::{MissingPlate, PlateSearch, locate_plates};
use crate::core_modules::tracker::match_timepoints;
use crate::error::{ColonyError, ColonyResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::growth::{GrowthCurveEstimate, GrowthCurveFit, GrowthRate, UndefinedReason};
pub use crate::core_modules::tracker::{ColonyTrack, Observation, TrackState};

/// An image, or one plate of it, that was left out of the run, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedImage {
    pub path: PathBuf,
    /// Set when only one lattice cell of the image was left out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_id: Option<u32>,
    pub reason: String,
}

impl SkippedImage {
    /// The whole image was contained at the worker boundary.
    pub fn image(path: impl Into<PathBuf>, error: &ColonyError) -> Self {
        Self {
            path: path.into(),
            plate_id: None,
            reason: error.to_string(),
        }
    }

    /// One lattice cell of the image held no plate.
    pub fn plate(path: impl Into<PathBuf>, missing: &MissingPlate) -> Self {
        Self {
            path: path.into(),
            plate_id: Some(missing.plate_id),
            reason: format!("plate {}: no plate found: {}", missing.plate_id, missing.reason),
        }
    }
}

/// What one image contributes to a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageAnalysis {
    /// One per located plate.
    pub timepoints: Vec<Timepoint>,
    /// Lattice cells in which no plate was found.
    pub missing_plates: Vec<MissingPlate>,
}

impl ImageAnalysis {
    pub fn colony_count(&self) -> usize {
        self.timepoints.iter().map(|t| t.colonies.len()).sum()
    }

    /// The missing plates as skip entries for `path`.
    pub fn skipped_plates<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = SkippedImage> + 'a {
        self.missing_plates.iter().map(move |missing| SkippedImage::plate(path, missing))
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// One record per colony track, ordered by plate group and then by track creation.
    pub records: Vec<GrowthRecord>,
    /// Images and plates contained at the worker boundary, in capture order.
    pub skipped: Vec<SkippedImage>,
    /// Number of plate timepoints fed to the matcher.
    pub timepoints_processed: usize,
}

/// Orders timepoints the way the matcher must consume them.
pub fn sort_timepoints(timepoints: &mut [Timepoint]) {
    timepoints.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.group.plate_id.cmp(&b.group.plate_id))
    });
}

/// Capture order of images: timestamp, then path.
pub fn capture_order(a: &ImageDescriptor, b: &ImageDescriptor) -> Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path))
}

/// The frame a run is registered against.
#[derive(Debug)]
struct ReferenceFrame {
    source: PathBuf,
    aligner: FrameAligner,
    layout: PlateSearch,
}

/// The main, top-level struct for the analyser.
#[derive(Debug, Clone)]
pub struct ColonyPipeline {
    config: AnalysisConfig,
    reference: Option<Arc<ReferenceFrame>>,
}

impl ColonyPipeline {
    /// Validates `config` once so neither half has to.
    pub fn new(config: AnalysisConfig) -> ColonyResult<Self> {
        config.validate()?;
        Ok(Self { config, reference: None })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Path of the frame this pipeline aligns to, if anchored.
    pub fn reference(&self) -> Option<&Path> {
        self.reference.as_deref().map(|reference| reference.source.as_path())
    }

    /// A copy of this pipeline that locates plates once on `reference` and
    /// aligns every later image to it. Fails when `reference` has no plate.
    pub fn anchored_to(&self, reference: &Image) -> ColonyResult<Self> {
        let layout = locate_plates(reference, &self.config.plate)?;
        let aligner = FrameAligner::new(reference, self.config.plate.max_alignment_shift);
        info!(
            path = %reference.descriptor.path.display(),
            plates = layout.plates.len(),
            "alignment reference chosen"
        );
        Ok(Self {
            config: self.config.clone(),
            reference: Some(Arc::new(ReferenceFrame {
                source: reference.descriptor.path.clone(),
                aligner,
                layout,
            })),
        })
    }

    /// Anchors to the earliest candidate that has a plate. Falls back to an
    /// unanchored copy when none does.
    pub fn anchored_to_earliest<'a>(&self, candidates: impl IntoIterator<Item = &'a Image>) -> Self {
        let mut ordered: Vec<&Image> = candidates.into_iter().collect();
        ordered.sort_by(|a, b| capture_order(&a.descriptor, &b.descriptor));
        for image in ordered {
            match self.anchored_to(image) {
                Ok(anchored) => return anchored,
                Err(error) => warn!(path = %image.descriptor.path.display(), %error, "unusable alignment reference"),
            }
        }
        warn!("no image can serve as alignment reference; processing unaligned");
        self.clone()
    }

    /// Locate, segment and filter one image. Fails with `NoPlateFound` when
    /// no plate can be located, or `AlignmentFailed` when the image cannot be
    /// registered against the reference.
    pub fn process_image(&self, image: &Image) -> ColonyResult<ImageAnalysis> {
        let (image, search) = match &self.reference {
            Some(reference) => (Cow::Owned(reference.aligner.align(image)?), reference.layout.clone()),
            None => (Cow::Borrowed(image), locate_plates(image, &self.config.plate)?),
        };
        let descriptor = &image.descriptor;

        let timepoints = search
            .plates
            .iter()
            .map(|plate| {
                let candidates = blob_detector::find_colonies(&image, plate, &self.config.segmentation);
                let candidate_count = candidates.len();
                let colonies = filter_colonies(candidates, &self.config.filter);
                debug!(
                    path = %descriptor.path.display(),
                    plate_id = plate.plate_id,
                    candidates = candidate_count,
                    colonies = colonies.len(),
                    "plate segmented"
                );
                Timepoint {
                    timestamp: descriptor.timestamp,
                    source: descriptor.path.clone(),
                    group: GroupKey::new(descriptor.group_id.clone(), plate.plate_id),
                    colonies,
                }
            })
            .collect();
        Ok(ImageAnalysis {
            timepoints,
            missing_plates: search.missing,
        })
    }

    /// Matches and aggregates the timepoints of a whole run.
    ///
    /// Timepoints may arrive in any order; they are sorted by
    /// `(timestamp, path, plate_id)` first.
    pub fn analyse(&self, mut timepoints: Vec<Timepoint>, skipped: Vec<SkippedImage>) -> ColonyResult<AnalysisReport> {
        if timepoints.iter().all(Timepoint::is_empty) {
            warn!(
                timepoints = timepoints.len(),
                skipped = skipped.len(),
                "no colonies found in any image"
            );
            return Err(ColonyError::EmptyColonySet);
        }

        sort_timepoints(&mut timepoints);
        let timepoints_processed = timepoints.len();
        let tracks = match_timepoints(timepoints, self.config.tracking.max_distance)?;
        let records = growth::aggregate_all(tracks, &self.config.growth);

        info!(
            timepoints = timepoints_processed,
            tracks = records.len(),
            skipped = skipped.len(),
            "analysis complete"
        );
        Ok(AnalysisReport {
            records,
            skipped,
            timepoints_processed,
        })
    }

    /// Processes already-decoded images one after another.
    ///
    /// Per-image faults and missing plates are recorded as skipped, exactly
    /// as the parallel pipeline does.
    pub fn run_sequential(&self, images: impl IntoIterator<Item = Image>) -> ColonyResult<AnalysisReport> {
        let mut images: Vec<Image> = images.into_iter().collect();
        images.sort_by(|a, b| capture_order(&a.descriptor, &b.descriptor));
        let pipeline = match self.reference {
            None if self.config.plate.align_to_reference => Cow::Owned(self.anchored_to_earliest(&images)),
            _ => Cow::Borrowed(self),
        };

        let mut timepoints = Vec::new();
        let mut skipped = Vec::new();
        for image in &images {
            let path = &image.descriptor.path;
            match pipeline.process_image(image) {
                Ok(analysis) => {
                    skipped.extend(analysis.skipped_plates(path));
                    timepoints.extend(analysis.timepoints);
                }
                Err(error) if error.is_per_image() => {
                    warn!(path = %path.display(), %error, "image skipped");
                    skipped.push(SkippedImage::image(path, &error));
                }
                Err(error) => return Err(error),
            }
        }
        pipeline.analyse(timepoints, skipped)
    }
}
