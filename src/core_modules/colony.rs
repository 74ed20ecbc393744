// THEORY:
// The `colony` module holds the snapshot types of the analyser: what a single
// image says about a single plate.
//
// Key architectural principles:
// 1.  **Observation, not identity**: a `Colony` is one blob seen in one image.
//     It knows where it is, how big and bright it is, and what shape it has.
//     It knows nothing about earlier or later images; linking observations
//     into a physical colony over time is the tracker's job.
// 2.  **Fixed fields**: every measurement the filter, the tracker and the
//     growth aggregator rely on is an explicit field. Nothing is attached
//     after construction.
// 3.  **Append-only**: once a `Timepoint` is built its colonies are never
//     mutated. Tracks and growth records clone observations, they do not
//     edit them.

use crate::core_modules::frame::Region;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::PathBuf;
use std::time::Duration;

/// A sub-pixel 2D position in plate-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance. Coordinates are never rounded before comparison.
    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Shape measurements used to recognise merged colonies.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeDescriptors {
    /// Number of component pixels touching the outside (4-neighbourhood).
    pub perimeter: f64,
    /// Eccentricity of the ellipse with the same second moments: 0 is a
    /// circle, values near 1 are elongated.
    pub eccentricity: f64,
    /// Area divided by convex hull area. Two touching discs have a waist and
    /// score noticeably below a single disc.
    pub solidity: f64,
    /// 4π·area/perimeter², kept for reporting.
    pub circularity: f64,
}

/// A single colony candidate detected in one plate of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Colony {
    /// Centroid in plate-local pixel coordinates.
    pub center: Point,
    /// Number of pixels in the blob.
    pub area: f64,
    /// Mean luminance of the blob's pixels.
    pub mean_intensity: f64,
    /// Mean RGB colour of the blob's pixels.
    pub mean_color: [f64; 3],
    /// Bounding box in plate-local coordinates.
    pub bounding_box: Region,
    pub shape: ShapeDescriptors,
}

impl Colony {
    /// Diameter of the circle with the same area.
    pub fn diameter(&self) -> f64 {
        2.0 * (self.area / PI).sqrt()
    }
}

/// Identifies the plate that a sequence of timepoints belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub group_id: String,
    pub plate_id: u32,
}

impl GroupKey {
    pub fn new(group_id: impl Into<String>, plate_id: u32) -> Self {
        Self {
            group_id: group_id.into(),
            plate_id,
        }
    }
}

/// The filtered colonies of one plate in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timepoint {
    pub timestamp: Duration,
    pub source: PathBuf,
    pub group: GroupKey,
    pub colonies: Vec<Colony>,
}

impl Timepoint {
    pub fn is_empty(&self) -> bool {
        self.colonies.is_empty()
    }
}
