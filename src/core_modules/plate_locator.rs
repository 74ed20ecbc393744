// THEORY:
// The `PlateLocator` answers one question per image: where is the agar?
// Photographs of plates are rarely perfectly framed. The dish may sit off
// centre, the crop may clip a little, and several dishes may share one frame.
// The locator therefore never assumes a fixed geometry.
//
// Key principles:
// 1.  **Lattice first**: a multi-plate image is split into a `rows x columns`
//     lattice, one cell per dish. Plate ids are 1-based and row-major, so plate
//     3 in a 2x2 lattice is row 2, column 1.
// 2.  **Background from the border**: inside each cell the border pixels are
//     assumed to be background. Their median luminance is the reference, and
//     anything differing from it by more than `min_contrast` is plate.
// 3.  **Profiles, not outlines**: rather than trace the dish edge, the locator
//     counts foreground pixels per row and per column. Rows/columns with enough
//     occupancy define the plate extent. A scratch or label that lights up a
//     few pixels cannot drag the extent outwards.
// 4.  **Trim the rim**: the dish wall is bright and often mistaken for
//     colonies, so the extent is shrunk by `edge_margin` on every side.
// 5.  **Soft failure**: a cell with no plausible plate is reported as a
//     `MissingPlate` next to the plates that were found. Only when every cell
//     comes up empty does the whole image fail with `NoPlateFound`. Either way
//     the orchestrator records the loss as skipped and the run continues.

use crate::config::PlateConfig;
use crate::core_modules::frame::{Image, Region};
use crate::core_modules::utils::stats;
use crate::error::{ColonyError, ColonyResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A `rows x columns` arrangement of plates within one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lattice {
    pub rows: u32,
    pub columns: u32,
}

impl Lattice {
    pub fn new(rows: u32, columns: u32) -> Self {
        Self { rows, columns }
    }

    pub fn len(&self) -> u32 {
        self.rows * self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts a 1-based, row-major plate index into a 1-based `(row, column)`.
    pub fn index_to_coordinate(&self, index: u32) -> ColonyResult<(u32, u32)> {
        if index < 1 || self.is_empty() {
            return Err(ColonyError::InvalidConfig(format!(
                "plate index {index} and lattice {}x{} must all be greater than zero",
                self.rows, self.columns
            )));
        }
        let row = (index - 1) / self.columns + 1;
        let column = (index - 1) % self.columns + 1;
        if row > self.rows {
            return Err(ColonyError::InvalidConfig(format!(
                "plate index {index} exceeds the {}x{} lattice",
                self.rows, self.columns
            )));
        }
        Ok((row, column))
    }

    /// Inverse of [`Lattice::index_to_coordinate`].
    pub fn coordinate_to_index(&self, row: u32, column: u32) -> ColonyResult<u32> {
        if row < 1 || column < 1 || row > self.rows || column > self.columns {
            return Err(ColonyError::InvalidConfig(format!(
                "coordinate ({row}, {column}) is outside the {}x{} lattice",
                self.rows, self.columns
            )));
        }
        Ok((row - 1) * self.columns + column)
    }

    /// The pixel cell of the 1-based `(row, column)` within `frame`.
    pub fn cell(&self, frame: Region, row: u32, column: u32) -> Region {
        let split = |origin: u32, span: u32, parts: u32, part: u32| {
            let start = origin + (span as u64 * (part - 1) as u64 / parts as u64) as u32;
            let end = origin + (span as u64 * part as u64 / parts as u64) as u32;
            (start, end - start)
        };
        let (x, width) = split(frame.x, frame.width, self.columns, column);
        let (y, height) = split(frame.y, frame.height, self.rows, row);
        Region::new(x, y, width, height)
    }
}

/// A located plate within one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plate {
    /// 1-based, row-major position in the lattice.
    pub plate_id: u32,
    /// 1-based `(row, column)` position in the lattice.
    pub lattice_position: (u32, u32),
    /// The plate's region of interest in image coordinates, rim already trimmed.
    pub bounds: Region,
}

/// A lattice cell in which no plate was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPlate {
    pub plate_id: u32,
    pub reason: String,
}

/// Outcome of locating the plates of one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlateSearch {
    /// Located plates in plate id order.
    pub plates: Vec<Plate>,
    /// Cells that came up empty while at least one other cell did not.
    pub missing: Vec<MissingPlate>,
}

/// Finds every plate in the image.
///
/// Cells without a plausible plate are returned as `missing`. If no cell
/// yields a plate, the whole image fails with `NoPlateFound`.
pub fn locate_plates(image: &Image, config: &PlateConfig) -> ColonyResult<PlateSearch> {
    let lattice = Lattice::new(config.lattice_rows, config.lattice_columns);
    let frame = image.bounds();
    let mut plates = Vec::with_capacity(lattice.len() as usize);
    let mut missing = Vec::new();
    let mut last_failure = None;

    for plate_id in 1..=lattice.len() {
        let (row, column) = lattice.index_to_coordinate(plate_id)?;
        let cell = lattice.cell(frame, row, column);
        match locate_in_cell(image, cell, config) {
            Ok(bounds) => {
                debug!(plate_id, ?bounds, "plate located");
                plates.push(Plate {
                    plate_id,
                    lattice_position: (row, column),
                    bounds,
                });
            }
            Err(error) => {
                let reason = match &error {
                    ColonyError::NoPlateFound { reason } => reason.clone(),
                    other => other.to_string(),
                };
                missing.push(MissingPlate { plate_id, reason });
                last_failure = Some(error);
            }
        }
    }

    match (plates.is_empty(), last_failure) {
        (true, Some(error)) => Err(error),
        (true, None) => Err(ColonyError::NoPlateFound {
            reason: "lattice contains no cells".to_string(),
        }),
        (false, _) => {
            for cell in &missing {
                warn!(plate_id = cell.plate_id, path = %image.descriptor.path.display(), reason = %cell.reason, "plate missing from lattice cell");
            }
            Ok(PlateSearch { plates, missing })
        }
    }
}

/// Locates the plate extent inside one lattice cell.
fn locate_in_cell(image: &Image, cell: Region, config: &PlateConfig) -> ColonyResult<Region> {
    if cell.is_empty() {
        return no_plate(format!("lattice cell {cell:?} is empty"));
    }
    if !config.enabled {
        return Ok(cell);
    }

    let background = border_background(image, cell).unwrap_or(0.0);

    // --- Row and column occupancy profiles ---
    let mut row_counts = vec![0u32; cell.height as usize];
    let mut column_counts = vec![0u32; cell.width as usize];
    let mut total_foreground = 0u64;
    for dy in 0..cell.height {
        for dx in 0..cell.width {
            let luminance = image.luminance(cell.x + dx, cell.y + dy);
            if (luminance - background).abs() > config.min_contrast {
                row_counts[dy as usize] += 1;
                column_counts[dx as usize] += 1;
                total_foreground += 1;
            }
        }
    }
    if total_foreground == 0 {
        return no_plate(format!(
            "no pixel differs from the background ({background:.1}) by more than {}",
            config.min_contrast
        ));
    }

    let Some((min_y, max_y)) = occupied_span(&row_counts, cell.width as f64 * config.min_occupancy) else {
        return no_plate("no row is sufficiently covered by plate pixels".to_string());
    };
    let Some((min_x, max_x)) = occupied_span(&column_counts, cell.height as f64 * config.min_occupancy) else {
        return no_plate("no column is sufficiently covered by plate pixels".to_string());
    };
    let extent = Region::from_corners(cell.x + min_x, cell.y + min_y, cell.x + max_x, cell.y + max_y);

    let min_width = cell.width as f64 * config.min_plate_fraction;
    let min_height = cell.height as f64 * config.min_plate_fraction;
    if (extent.width as f64) < min_width || (extent.height as f64) < min_height {
        return no_plate(format!(
            "located region {}x{} is smaller than the minimum {min_width:.0}x{min_height:.0}",
            extent.width, extent.height
        ));
    }

    let bounds = extent.inset(config.edge_margin);
    if bounds.is_empty() {
        return no_plate("plate region vanished after trimming the rim".to_string());
    }
    Ok(bounds)
}

/// Median luminance of the one-pixel border of `cell`.
fn border_background(image: &Image, cell: Region) -> Option<f64> {
    let right = cell.x + cell.width - 1;
    let bottom = cell.y + cell.height - 1;
    let mut samples = Vec::with_capacity(2 * (cell.width + cell.height) as usize);
    for x in cell.x..=right {
        samples.push(image.luminance(x, cell.y));
        if bottom != cell.y {
            samples.push(image.luminance(x, bottom));
        }
    }
    for y in (cell.y + 1)..bottom {
        samples.push(image.luminance(cell.x, y));
        if right != cell.x {
            samples.push(image.luminance(right, y));
        }
    }
    stats::median(&samples)
}

/// First and last index whose count reaches `min_count` (and is non-zero).
fn occupied_span(counts: &[u32], min_count: f64) -> Option<(u32, u32)> {
    let occupied = |count: &u32| *count > 0 && *count as f64 >= min_count;
    let first = counts.iter().position(occupied)?;
    let last = counts.iter().rposition(occupied)?;
    Some((first as u32, last as u32))
}

fn no_plate<T>(reason: String) -> ColonyResult<T> {
    Err(ColonyError::NoPlateFound { reason })
}
