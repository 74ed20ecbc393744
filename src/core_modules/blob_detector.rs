// THEORY:
// The `BlobDetector` is the engine of colony segmentation. It turns one plate
// region of one image into a list of `Colony` candidates.
//
// Key architectural principles & algorithm steps:
// 1.  **Agar Reference**: The median luminance of the plate region is taken as
//     the agar level. Colonies cover a small share of the plate, so the median
//     lands on agar even on crowded plates, and it adapts to every image's
//     exposure without a global constant.
// 2.  **Thresholding**: A pixel is a colony pixel when its luminance differs
//     from the agar level by more than `colony_contrast`. Both lighter and
//     darker colonies are picked up.
// 3.  **Region Growing**: Colony pixels are grouped with an iterative flood
//     fill over the 8-neighbourhood. Components are discovered in raster order,
//     which makes the output order deterministic for a given input.
// 4.  **Noise Floor**: Components smaller than `min_colony_area` are dust or
//     sensor noise and are dropped here.
// 5.  **Measurement**: Each surviving component is summarised as a `Colony`:
//     centroid, area, mean intensity and colour, bounding box, and the shape
//     descriptors the filter needs to recognise merged colonies.
// 6.  **Stateless Utility**: Like the plate locator, the detector has no memory
//     of earlier images. An empty plate yields an empty list, not an error.

use crate::config::SegmentationConfig;
use crate::core_modules::colony::{Colony, Point, ShapeDescriptors};
use crate::core_modules::frame::{Image, Region};
use crate::core_modules::plate_locator::Plate;
use crate::core_modules::utils::stats;

pub mod blob_detector {
    use super::*;

    const UNLABELLED: u32 = 0;

    /// Detects colony candidates inside `plate`. Coordinates are plate-local.
    pub fn find_colonies(image: &Image, plate: &Plate, config: &SegmentationConfig) -> Vec<Colony> {
        let region = plate.bounds;
        if region.is_empty() {
            return Vec::new();
        }
        let width = region.width as usize;
        let height = region.height as usize;

        // --- 1. Luminance plane and agar reference ---
        let mut luminance = Vec::with_capacity(width * height);
        for y in 0..region.height {
            for x in 0..region.width {
                luminance.push(image.luminance(region.x + x, region.y + y));
            }
        }
        let Some(agar) = stats::median(&luminance) else {
            return Vec::new();
        };

        // --- 2. Thresholding ---
        let mask: Vec<bool> = luminance
            .iter()
            .map(|value| (value - agar).abs() > config.colony_contrast)
            .collect();

        // --- 3. Region growing in raster order ---
        let mut labels = vec![UNLABELLED; width * height];
        let mut colonies = Vec::new();
        let mut next_label = 1u32;

        for start in 0..mask.len() {
            if !mask[start] || labels[start] != UNLABELLED {
                continue;
            }
            let component = grow_component(start, &mask, &mut labels, next_label, width, height);

            // --- 4. Noise floor ---
            if component.len() >= config.min_colony_area.max(1) {
                colonies.push(measure(image, region, &component, &labels, next_label, &luminance));
            }
            next_label += 1;
        }

        colonies
    }

    /// Iterative flood fill over the 8-neighbourhood. Returns flat indices.
    fn grow_component(
        start: usize,
        mask: &[bool],
        labels: &mut [u32],
        label: u32,
        width: usize,
        height: usize,
    ) -> Vec<usize> {
        let mut component = Vec::new();
        let mut queue = vec![start];
        labels[start] = label;

        while let Some(current) = queue.pop() {
            component.push(current);
            let cx = (current % width) as i64;
            let cy = (current / width) as i64;

            for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = cx + dx;
                    let ny = cy + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let neighbour = ny as usize * width + nx as usize;
                    if mask[neighbour] && labels[neighbour] == UNLABELLED {
                        labels[neighbour] = label;
                        queue.push(neighbour);
                    }
                }
            }
        }

        component.sort_unstable();
        component
    }

    /// Summarises one labelled component as a `Colony`.
    fn measure(
        image: &Image,
        region: Region,
        component: &[usize],
        labels: &[u32],
        label: u32,
        luminance: &[f64],
    ) -> Colony {
        let width = region.width as usize;
        let height = region.height as usize;
        let count = component.len() as f64;

        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0;
        let mut max_y = 0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_luminance = 0.0;
        let mut sum_color = [0.0f64; 3];
        let mut perimeter = 0usize;
        let mut coords = Vec::with_capacity(component.len());

        for &index in component {
            let x = (index % width) as u32;
            let y = (index / width) as u32;
            coords.push((x as i64, y as i64));

            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            sum_x += x as f64;
            sum_y += y as f64;
            sum_luminance += luminance[index];

            let pixel = image.pixel(region.x + x, region.y + y);
            sum_color[0] += pixel.red as f64;
            sum_color[1] += pixel.green as f64;
            sum_color[2] += pixel.blue as f64;

            let outside = |nx: i64, ny: i64| {
                nx < 0
                    || ny < 0
                    || nx >= width as i64
                    || ny >= height as i64
                    || labels[ny as usize * width + nx as usize] != label
            };
            let (xi, yi) = (x as i64, y as i64);
            if outside(xi - 1, yi) || outside(xi + 1, yi) || outside(xi, yi - 1) || outside(xi, yi + 1) {
                perimeter += 1;
            }
        }

        let center = Point::new(sum_x / count, sum_y / count);

        // --- Second central moments ---
        let (mut mu20, mut mu02, mut mu11) = (0.0, 0.0, 0.0);
        for &(x, y) in &coords {
            let dx = x as f64 - center.x;
            let dy = y as f64 - center.y;
            mu20 += dx * dx;
            mu02 += dy * dy;
            mu11 += dx * dy;
        }
        let eccentricity = eccentricity(mu20 / count, mu02 / count, mu11 / count);

        let hull_pixels = convex_hull_pixel_count(&coords);
        let solidity = if hull_pixels > 0 {
            (count / hull_pixels as f64).min(1.0)
        } else {
            1.0
        };
        let perimeter = perimeter as f64;
        let circularity = if perimeter > 0.0 {
            4.0 * std::f64::consts::PI * count / (perimeter * perimeter)
        } else {
            0.0
        };

        Colony {
            center,
            area: count,
            mean_intensity: sum_luminance / count,
            mean_color: sum_color.map(|sum| sum / count),
            bounding_box: Region::from_corners(min_x, min_y, max_x, max_y),
            shape: ShapeDescriptors {
                perimeter,
                eccentricity,
                solidity,
                circularity,
            },
        }
    }

    /// Eccentricity of the ellipse with the given normalised central moments.
    pub(crate) fn eccentricity(mu20: f64, mu02: f64, mu11: f64) -> f64 {
        let half_trace = (mu20 + mu02) / 2.0;
        let spread = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
        let major = half_trace + spread;
        let minor = (half_trace - spread).max(0.0);
        if major <= f64::EPSILON {
            return 0.0;
        }
        (1.0 - minor / major).clamp(0.0, 1.0).sqrt()
    }

    /// Number of lattice points inside or on the convex hull of `points`.
    ///
    /// Uses Pick's theorem on the hull polygon, so a digital disc scores about
    /// its own pixel count and solidity stays near 1 for single colonies.
    pub(crate) fn convex_hull_pixel_count(points: &[(i64, i64)]) -> u64 {
        let hull = convex_hull(points);
        match hull.len() {
            0 => 0,
            1 => 1,
            _ => {
                let mut twice_area = 0i64;
                let mut boundary = 0i64;
                for i in 0..hull.len() {
                    let (x1, y1) = hull[i];
                    let (x2, y2) = hull[(i + 1) % hull.len()];
                    twice_area += x1 * y2 - x2 * y1;
                    boundary += gcd((x2 - x1).abs(), (y2 - y1).abs());
                }
                ((twice_area.abs() + boundary) / 2 + 1) as u64
            }
        }
    }

    /// Andrew's monotone chain. Collinear points are dropped from the hull.
    fn convex_hull(points: &[(i64, i64)]) -> Vec<(i64, i64)> {
        let mut sorted = points.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() < 3 {
            return sorted;
        }

        let cross = |o: (i64, i64), a: (i64, i64), b: (i64, i64)| (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0);
        let mut hull: Vec<(i64, i64)> = Vec::with_capacity(sorted.len() * 2);
        for &point in &sorted {
            while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], point) <= 0 {
                hull.pop();
            }
            hull.push(point);
        }
        let lower_len = hull.len() + 1;
        for &point in sorted.iter().rev().skip(1) {
            while hull.len() >= lower_len && cross(hull[hull.len() - 2], hull[hull.len() - 1], point) <= 0 {
                hull.pop();
            }
            hull.push(point);
        }
        hull.pop();
        hull
    }

    fn gcd(mut a: i64, mut b: i64) -> i64 {
        while b != 0 {
            (a, b) = (b, a % b);
        }
        a
    }
}

#[cfg(test)]
mod tests {
    use super::blob_detector::*;
    use super::*;
    use crate::core_modules::frame::ImageDescriptor;
    use image::{Rgba, RgbaImage};
    use std::time::Duration;

    const AGAR: Rgba<u8> = Rgba([100, 100, 100, 255]);
    const COLONY: Rgba<u8> = Rgba([220, 200, 180, 255]);

    fn plate_of(width: u32, height: u32) -> (RgbaImage, Plate) {
        let pixels = RgbaImage::from_pixel(width, height, AGAR);
        let plate = Plate {
            plate_id: 1,
            lattice_position: (1, 1),
            bounds: Region::new(0, 0, width, height),
        };
        (pixels, plate)
    }

    fn disc(pixels: &mut RgbaImage, cx: i64, cy: i64, radius: i64) {
        for y in (cy - radius)..=(cy + radius) {
            for x in (cx - radius)..=(cx + radius) {
                if (x - cx).pow(2) + (y - cy).pow(2) <= radius * radius {
                    pixels.put_pixel(x as u32, y as u32, COLONY);
                }
            }
        }
    }

    fn image(pixels: RgbaImage) -> Image {
        Image::new(ImageDescriptor::new("t.png", Duration::ZERO, "g"), pixels)
    }

    #[test]
    fn empty_plate_yields_no_colonies() {
        let (pixels, plate) = plate_of(40, 40);
        assert!(find_colonies(&image(pixels), &plate, &SegmentationConfig::default()).is_empty());
    }

    #[test]
    fn measures_a_single_disc() {
        let (mut pixels, plate) = plate_of(40, 40);
        disc(&mut pixels, 20, 15, 4);
        let colonies = find_colonies(&image(pixels), &plate, &SegmentationConfig::default());

        assert_eq!(colonies.len(), 1);
        let colony = &colonies[0];
        assert_eq!(colony.area, 49.0);
        assert!((colony.center.x - 20.0).abs() < 1e-9);
        assert!((colony.center.y - 15.0).abs() < 1e-9);
        assert_eq!(colony.bounding_box, Region::new(16, 11, 9, 9));
        assert_eq!(colony.mean_color, [220.0, 200.0, 180.0]);
        assert!(colony.shape.eccentricity < 0.2);
        assert!(colony.shape.solidity > 0.95);
        assert!(colony.shape.perimeter > 0.0 && colony.shape.perimeter < 49.0);
    }

    #[test]
    fn centroids_are_plate_local() {
        let mut pixels = RgbaImage::from_pixel(60, 60, AGAR);
        disc(&mut pixels, 30, 30, 3);
        let plate = Plate {
            plate_id: 1,
            lattice_position: (1, 1),
            bounds: Region::new(20, 20, 30, 30),
        };
        let colonies = find_colonies(&image(pixels), &plate, &SegmentationConfig::default());
        assert_eq!(colonies.len(), 1);
        assert_eq!(colonies[0].center, Point::new(10.0, 10.0));
    }

    #[test]
    fn separate_discs_are_separate_colonies_in_raster_order() {
        let (mut pixels, plate) = plate_of(60, 40);
        disc(&mut pixels, 45, 10, 3);
        disc(&mut pixels, 10, 25, 3);
        let colonies = find_colonies(&image(pixels), &plate, &SegmentationConfig::default());
        assert_eq!(colonies.len(), 2);
        assert_eq!(colonies[0].center, Point::new(45.0, 10.0));
        assert_eq!(colonies[1].center, Point::new(10.0, 25.0));
    }

    #[test]
    fn specks_below_minimum_area_are_noise() {
        let (mut pixels, plate) = plate_of(30, 30);
        pixels.put_pixel(5, 5, COLONY);
        pixels.put_pixel(6, 5, COLONY);
        let config = SegmentationConfig {
            min_colony_area: 4,
            ..SegmentationConfig::default()
        };
        assert!(find_colonies(&image(pixels), &plate, &config).is_empty());
    }

    #[test]
    fn touching_discs_look_merged() {
        let (mut pixels, plate) = plate_of(60, 40);
        disc(&mut pixels, 20, 20, 6);
        disc(&mut pixels, 32, 20, 6);
        let colonies = find_colonies(&image(pixels), &plate, &SegmentationConfig::default());
        assert_eq!(colonies.len(), 1);
        let shape = colonies[0].shape;
        assert!(shape.eccentricity > 0.8, "eccentricity {}", shape.eccentricity);
        assert!(shape.solidity < 0.97, "solidity {}", shape.solidity);
    }

    #[test]
    fn eccentricity_of_lines_and_circles() {
        assert_eq!(eccentricity(0.0, 0.0, 0.0), 0.0);
        assert!((eccentricity(2.0, 2.0, 0.0)).abs() < 1e-12);
        assert!((eccentricity(4.0, 0.0, 0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hull_pixel_count_matches_lattice_shapes() {
        let square: Vec<(i64, i64)> = (0..3).flat_map(|y| (0..3).map(move |x| (x, y))).collect();
        assert_eq!(convex_hull_pixel_count(&square), 9);
        assert_eq!(convex_hull_pixel_count(&[(0, 0), (4, 0)]), 5);
        assert_eq!(convex_hull_pixel_count(&[(2, 2)]), 1);
        // An L shape's hull adds no lattice points.
        assert_eq!(convex_hull_pixel_count(&[(0, 0), (1, 0), (2, 0), (0, 1)]), 4);
        // A diagonal spur adds the lattice points along it.
        assert_eq!(convex_hull_pixel_count(&[(0, 0), (1, 0), (0, 1), (1, 1), (3, 3)]), 6);
    }
}
