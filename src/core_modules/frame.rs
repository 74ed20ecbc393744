// THEORY:
// The `frame` module defines what a worker is handed and what it holds while
// it works. The two are deliberately different types:
//
// 1.  **`ImageDescriptor`** is the unit of work. It is small, plain and
//     cloneable: a path, a capture timestamp and a group id. Descriptors are
//     what travel through the task queue, so queuing a thousand images costs
//     a thousand paths, not a thousand pixel buffers.
// 2.  **`Image`** is the decoded frame. It owns its RGBA buffer and exists only
//     inside a worker, between loading and the end of that image's processing.
//     This is what keeps peak memory proportional to the worker count.
// 3.  **`Region`** is a pixel rectangle used for lattice cells, plate bounds and
//     colony bounding boxes alike.

use crate::core_modules::pixel::pixel::{Luminance, Pixel};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to find, order and group one image, without its pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Where the image came from. Also the tie-breaker when two images share a timestamp.
    pub path: PathBuf,
    /// Capture time, as elapsed time since the start of the experiment.
    pub timestamp: Duration,
    /// The plate group (scanner, experiment or dish set) this image belongs to.
    pub group_id: String,
}

impl ImageDescriptor {
    pub fn new(path: impl Into<PathBuf>, timestamp: Duration, group_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            timestamp,
            group_id: group_id.into(),
        }
    }
}

/// A decoded image. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Image {
    pub descriptor: ImageDescriptor,
    pub pixels: RgbaImage,
}

impl Image {
    pub fn new(descriptor: ImageDescriptor, pixels: RgbaImage) -> Self {
        Self { descriptor, pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width(), self.height())
    }

    pub fn pixel(&self, x: u32, y: u32) -> Pixel {
        Pixel::from(*self.pixels.get_pixel(x, y))
    }

    pub fn luminance(&self, x: u32, y: u32) -> Luminance {
        self.pixel(x, y).luminance()
    }
}

/// An axis-aligned pixel rectangle. `width`/`height` of zero is an empty region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Builds the region covering the inclusive pixel span `min..=max`.
    pub fn from_corners(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Shrinks the region by `margin` times its size on every side.
    pub fn inset(&self, margin: f64) -> Region {
        let dx = (self.width as f64 * margin).floor() as u32;
        let dy = (self.height as f64 * margin).floor() as u32;
        Region::new(
            self.x + dx,
            self.y + dy,
            self.width.saturating_sub(2 * dx),
            self.height.saturating_sub(2 * dy),
        )
    }
}
