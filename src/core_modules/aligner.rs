// THEORY:
// Plates move between scans. A lid is lifted, a dish is nudged, the scanner
// bed settles. Colony positions are plate-local, so any jitter in where the
// plate is found in each frame moves every colony with it, and the tracker's
// one-pixel matching distance does not forgive that.
//
// The `FrameAligner` removes the jitter by registering each frame against one
// reference frame of the run (the earliest) with phase correlation:
//
// 1.  **Background to zero**: luminance minus the median of the frame border,
//     zero-padded to a square power-of-two size. A shift of the content is
//     then a shift of the padded signal.
// 2.  **Whitened cross-power**: `F_target * conj(F_ref)`, normalised to unit
//     magnitude. Its inverse FFT is a sharp peak at the translation.
// 3.  **Parabolic refinement**: the peak's neighbours give a sub-sample
//     position, which matters only when large frames are decimated first.
// 4.  **Integer resampling**: the target is shifted back by the rounded
//     translation with edge clamping. No interpolation touches colony pixels.
//
// Only translation is estimated. The reference spectrum is computed once and
// shared read-only by every worker.

use crate::core_modules::frame::Image;
use crate::core_modules::utils::stats;
use crate::error::{ColonyError, ColonyResult};
use image::RgbaImage;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// Frames larger than this on their long side are block-averaged first.
const MAX_FFT_SIZE: usize = 1024;
/// Correlation peaks below this are indistinguishable from noise.
const MIN_PEAK: f64 = 0.05;

/// How far a frame's content sits from the reference, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Translation {
    pub dx: i64,
    pub dy: i64,
    /// Height of the correlation peak, 1.0 for a perfect match.
    pub peak: f64,
}

pub struct FrameAligner {
    width: u32,
    height: u32,
    /// Block size used to decimate frames before the FFT.
    step: usize,
    fft_size: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
    reference_spectrum: Vec<Complex<f64>>,
    max_shift: u32,
}

impl fmt::Debug for FrameAligner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAligner")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("step", &self.step)
            .field("fft_size", &self.fft_size)
            .field("max_shift", &self.max_shift)
            .finish_non_exhaustive()
    }
}

impl FrameAligner {
    /// Prepares registration against `reference`. Shifts beyond `max_shift`
    /// pixels on either axis are refused.
    pub fn new(reference: &Image, max_shift: u32) -> Self {
        let (width, height) = (reference.width(), reference.height());
        let long_side = width.max(height).max(1) as usize;
        let step = long_side.div_ceil(MAX_FFT_SIZE);
        let fft_size = long_side.div_ceil(step).next_power_of_two();

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        let mut aligner = Self {
            width,
            height,
            step,
            fft_size,
            forward,
            inverse,
            reference_spectrum: Vec::new(),
            max_shift,
        };
        aligner.reference_spectrum = aligner.spectrum(reference);
        aligner
    }

    /// Translation of `image` relative to the reference: content at `(x, y)`
    /// in the reference is at `(x + dx, y + dy)` in `image`.
    pub fn estimate(&self, image: &Image) -> ColonyResult<Translation> {
        if image.width() != self.width || image.height() != self.height {
            return misaligned(format!(
                "frame is {}x{} but the reference is {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            ));
        }

        let n = self.fft_size;
        let mut cross_power: Vec<Complex<f64>> = self
            .spectrum(image)
            .iter()
            .zip(&self.reference_spectrum)
            .map(|(&target, &reference)| {
                let product = target * reference.conj();
                let magnitude = product.norm();
                if magnitude > 1e-12 {
                    product / magnitude
                } else {
                    Complex::new(0.0, 0.0)
                }
            })
            .collect();
        self.transform_2d(&mut cross_power, &self.inverse);
        let scale = 1.0 / (n * n) as f64;
        let correlation: Vec<f64> = cross_power.iter().map(|c| c.re * scale).collect();

        let (peak_index, peak) = correlation
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
        if peak.is_nan() || peak < MIN_PEAK {
            return misaligned(format!("no correlation peak (best {peak:.3})"));
        }

        let (peak_x, peak_y) = (peak_index % n, peak_index / n);
        let (sub_x, sub_y) = subpixel_parabolic(&correlation, n, peak_x, peak_y);
        let translation = Translation {
            dx: (sub_x * self.step as f64).round() as i64,
            dy: (sub_y * self.step as f64).round() as i64,
            peak,
        };

        let limit = self.max_shift as i64;
        if translation.dx.abs() > limit || translation.dy.abs() > limit {
            return misaligned(format!(
                "shift ({}, {}) exceeds {} pixels",
                translation.dx, translation.dy, self.max_shift
            ));
        }
        Ok(translation)
    }

    /// Returns a copy of `image` moved onto the reference's pixel grid.
    pub fn align(&self, image: &Image) -> ColonyResult<Image> {
        let translation = self.estimate(image)?;
        if translation.dx == 0 && translation.dy == 0 {
            return Ok(image.clone());
        }
        let (max_x, max_y) = (self.width as i64 - 1, self.height as i64 - 1);
        let pixels = RgbaImage::from_fn(self.width, self.height, |x, y| {
            let source_x = (x as i64 + translation.dx).clamp(0, max_x) as u32;
            let source_y = (y as i64 + translation.dy).clamp(0, max_y) as u32;
            *image.pixels.get_pixel(source_x, source_y)
        });
        Ok(Image::new(image.descriptor.clone(), pixels))
    }

    /// Forward 2D spectrum of the decimated, background-subtracted luminance.
    fn spectrum(&self, image: &Image) -> Vec<Complex<f64>> {
        let n = self.fft_size;
        let step = self.step;
        let (width, height) = (self.width as usize, self.height as usize);
        let (columns, rows) = (width.div_ceil(step), height.div_ceil(step));

        let mut blocks = vec![0.0f64; columns * rows];
        let mut counts = vec![0u32; columns * rows];
        for y in 0..height {
            for x in 0..width {
                let cell = (y / step) * columns + x / step;
                blocks[cell] += image.luminance(x as u32, y as u32);
                counts[cell] += 1;
            }
        }
        for (value, count) in blocks.iter_mut().zip(&counts) {
            *value /= (*count).max(1) as f64;
        }

        let background = border_median(&blocks, columns, rows);
        let mut data = vec![Complex::new(0.0, 0.0); n * n];
        for row in 0..rows {
            for column in 0..columns {
                data[row * n + column] = Complex::new(blocks[row * columns + column] - background, 0.0);
            }
        }
        self.transform_2d(&mut data, &self.forward);
        data
    }

    /// Row-column 2D transform in place.
    fn transform_2d(&self, data: &mut [Complex<f64>], fft: &Arc<dyn Fft<f64>>) {
        let n = self.fft_size;
        for row in data.chunks_exact_mut(n) {
            fft.process(row);
        }
        transpose_inplace(data, n);
        for row in data.chunks_exact_mut(n) {
            fft.process(row);
        }
        transpose_inplace(data, n);
    }
}

fn misaligned<T>(reason: String) -> ColonyResult<T> {
    Err(ColonyError::AlignmentFailed { reason })
}

fn border_median(values: &[f64], columns: usize, rows: usize) -> f64 {
    let border: Vec<f64> = (0..rows)
        .flat_map(|row| (0..columns).map(move |column| (row, column)))
        .filter(|&(row, column)| row == 0 || column == 0 || row + 1 == rows || column + 1 == columns)
        .map(|(row, column)| values[row * columns + column])
        .collect();
    stats::median(&border).unwrap_or(0.0)
}

/// Peak position as a signed offset, refined with a parabola through the
/// peak and its two neighbours on each axis.
fn subpixel_parabolic(correlation: &[f64], n: usize, peak_x: usize, peak_y: usize) -> (f64, f64) {
    let at = |x: usize, y: usize| correlation[(y % n) * n + x % n];
    let center = at(peak_x, peak_y);
    let refine = |before: f64, after: f64| {
        let denominator = 2.0 * (before + after - 2.0 * center);
        if denominator.abs() > 1e-12 {
            (before - after) / denominator
        } else {
            0.0
        }
    };
    let offset_x = refine(at(peak_x + n - 1, peak_y), at(peak_x + 1, peak_y));
    let offset_y = refine(at(peak_x, peak_y + n - 1), at(peak_x, peak_y + 1));

    let wrap = |peak: usize| if peak > n / 2 { peak as f64 - n as f64 } else { peak as f64 };
    (wrap(peak_x) + offset_x, wrap(peak_y) + offset_y)
}

fn transpose_inplace(data: &mut [Complex<f64>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::ImageDescriptor;
    use image::Rgba;
    use std::time::Duration;

    /// An 80x80 frame: dark surround, agar square, three colonies, all moved by `(dx, dy)`.
    fn scan(dx: i64, dy: i64) -> Image {
        let inside = |x: i64, y: i64, (cx, cy, r): (i64, i64, i64)| (x - cx).pow(2) + (y - cy).pow(2) <= r * r;
        let pixels = RgbaImage::from_fn(80, 80, |x, y| {
            let (x, y) = (x as i64 - dx, y as i64 - dy);
            if [(25, 30, 4), (50, 22, 3), (40, 52, 5)].into_iter().any(|c| inside(x, y, c)) {
                Rgba([230, 230, 230, 255])
            } else if (10..70).contains(&x) && (10..70).contains(&y) {
                Rgba([60, 60, 60, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        });
        Image::new(ImageDescriptor::new("scan.png", Duration::ZERO, "g"), pixels)
    }

    #[test]
    fn identical_frames_need_no_shift() {
        let aligner = FrameAligner::new(&scan(0, 0), 16);
        let translation = aligner.estimate(&scan(0, 0)).unwrap();
        assert_eq!((translation.dx, translation.dy), (0, 0));
        assert!(translation.peak > 0.9);
    }

    #[test]
    fn shifted_frame_is_moved_back_onto_the_reference() {
        let reference = scan(0, 0);
        let aligner = FrameAligner::new(&reference, 16);
        let shifted = scan(3, -2);

        let translation = aligner.estimate(&shifted).unwrap();
        assert_eq!((translation.dx, translation.dy), (3, -2));

        let aligned = aligner.align(&shifted).unwrap();
        assert_eq!(aligned.pixels, reference.pixels);
    }

    #[test]
    fn shift_beyond_the_limit_fails_the_frame() {
        let aligner = FrameAligner::new(&scan(0, 0), 2);
        let error = aligner.estimate(&scan(5, 0)).unwrap_err();
        assert!(matches!(error, ColonyError::AlignmentFailed { .. }));
        assert!(error.to_string().contains("exceeds 2 pixels"));
    }

    #[test]
    fn featureless_or_mismatched_frames_fail() {
        let aligner = FrameAligner::new(&scan(0, 0), 16);
        let blank = Image::new(
            ImageDescriptor::new("blank.png", Duration::ZERO, "g"),
            RgbaImage::from_pixel(80, 80, Rgba([0, 0, 0, 255])),
        );
        assert!(aligner.estimate(&blank).is_err());

        let small = Image::new(
            ImageDescriptor::new("small.png", Duration::ZERO, "g"),
            RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 255])),
        );
        let error = aligner.align(&small).unwrap_err();
        assert!(error.to_string().contains("reference is 80x80"));
    }

    #[test]
    fn transpose_swaps_rows_and_columns() {
        let mut data: Vec<Complex<f64>> = (0..4).map(|i| Complex::new(i as f64, 0.0)).collect();
        transpose_inplace(&mut data, 2);
        let real: Vec<f64> = data.iter().map(|c| c.re).collect();
        assert_eq!(real, [0.0, 2.0, 1.0, 3.0]);
    }
}
