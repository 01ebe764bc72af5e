//! Oriented FAST and rotated BRIEF.

use crate::detector::{DetectorOutput, Keypoint};
use crate::features_data::Descriptors;
use crate::image::{gaussian_blur, GrayFloatImage};
use crate::FeaturesConfig;
use float_ord::FloatOrd;
use log::*;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::cmp::Reverse;

/// Descriptor length in bytes.
pub const DESCRIPTOR_BYTES: usize = 32;
const NUM_PAIRS: usize = DESCRIPTOR_BYTES * 8;
/// Seed of the BRIEF sampling pattern. Changing it changes every descriptor.
const PATTERN_SEED: u64 = 0x6f72_625f_7061_7474;

/// Bresenham circle of radius 3 used by FAST, starting at the top and going clockwise.
const FAST_CIRCLE: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];
/// Contiguous arc length of FAST-9.
const FAST_ARC: usize = 9;

#[derive(Debug, Clone)]
pub struct Orb {
    pub num_levels: usize,
    pub scale_factor: f32,
    /// FAST intensity threshold on unit images.
    pub fast_threshold: f32,
    /// Keypoints closer than this to a level border are dropped.
    pub edge_threshold: usize,
    /// Side of the oriented patch, also the keypoint size at level 0.
    pub patch_size: usize,
    pub harris_block_size: usize,
    pub harris_k: f32,
    pub blur_sigma: f32,
    /// Point pairs compared by each descriptor bit, relative to the keypoint.
    pub pattern: Vec<[(i32, i32); 2]>,
}

impl Default for Orb {
    fn default() -> Self {
        Self {
            num_levels: 8,
            scale_factor: 1.2,
            fast_threshold: 20.0 / 255.0,
            edge_threshold: 31,
            patch_size: 31,
            harris_block_size: 7,
            harris_k: 0.04,
            blur_sigma: 2.0,
            pattern: sampling_pattern(15),
        }
    }
}

/// Uniformly distributed test pairs within a square of the given half side.
fn sampling_pattern(half_patch: i32) -> Vec<[(i32, i32); 2]> {
    let mut rng = Pcg32::seed_from_u64(PATTERN_SEED);
    let mut point = move || {
        (
            rng.gen_range(-half_patch..=half_patch),
            rng.gen_range(-half_patch..=half_patch),
        )
    };
    (0..NUM_PAIRS).map(|_| [point(), point()]).collect()
}

/// Number of features requested from each level, summing to `total`.
///
/// Levels get a geometrically decreasing share and the last level takes the rest.
pub fn features_per_level(total: usize, num_levels: usize, scale_factor: f32) -> Vec<usize> {
    if num_levels == 0 {
        return vec![];
    }
    let factor = 1.0 / f64::from(scale_factor);
    let mut desired = total as f64 * (1.0 - factor) / (1.0 - factor.powi(num_levels as i32));
    let mut allotted = Vec::with_capacity(num_levels);
    let mut sum = 0;
    for _ in 0..num_levels - 1 {
        let count = (desired.round() as usize).min(total - sum);
        allotted.push(count);
        sum += count;
        desired *= factor;
    }
    allotted.push(total - sum);
    allotted
}

/// FAST-9 score of a pixel, or `None` when it is not a corner.
///
/// The score is the summed absolute difference beyond the threshold over the
/// brighter or darker arc, whichever is larger.
fn fast_score(image: &GrayFloatImage, x: usize, y: usize, threshold: f32) -> Option<f32> {
    let center = image.get(x, y);
    let ring: Vec<f32> = FAST_CIRCLE
        .iter()
        .map(|&(dx, dy)| image.get((x as isize + dx) as usize, (y as isize + dy) as usize))
        .collect();
    let has_arc = |test: &dyn Fn(f32) -> bool| {
        let mut run = 0;
        // Walk the circle twice so arcs wrapping around the start are found.
        for i in 0..2 * ring.len() {
            if test(ring[i % ring.len()]) {
                run += 1;
                if run >= FAST_ARC {
                    return true;
                }
            } else {
                run = 0;
            }
        }
        false
    };
    let brighter = has_arc(&|v| v > center + threshold);
    let darker = has_arc(&|v| v < center - threshold);
    if !brighter && !darker {
        return None;
    }
    let bright_sum: f32 = ring.iter().map(|&v| (v - center - threshold).max(0.0)).sum();
    let dark_sum: f32 = ring.iter().map(|&v| (center - v - threshold).max(0.0)).sum();
    Some(bright_sum.max(dark_sum))
}

/// FAST corners with 3x3 non-maximum suppression on their scores.
pub fn fast_corners(
    image: &GrayFloatImage,
    threshold: f32,
    border: usize,
) -> Vec<(usize, usize, f32)> {
    let (width, height) = (image.width(), image.height());
    let border = border.max(3);
    if width <= 2 * border || height <= 2 * border {
        return vec![];
    }
    let mut scores = Array2::<f32>::zeros((height, width));
    for y in border..height - border {
        for x in border..width - border {
            if let Some(score) = fast_score(image, x, y, threshold) {
                scores[(y, x)] = score;
            }
        }
    }
    let mut corners = vec![];
    for y in border..height - border {
        for x in border..width - border {
            let score = scores[(y, x)];
            if score <= 0.0 {
                continue;
            }
            let is_max = (y - 1..=y + 1).all(|ny| {
                (x - 1..=x + 1).all(|nx| {
                    let other = scores[(ny, nx)];
                    (nx, ny) == (x, y) || score > other || (score == other && (ny, nx) > (y, x))
                })
            });
            if is_max {
                corners.push((x, y, score));
            }
        }
    }
    corners
}

/// Harris corner measure over a square block centered on a pixel.
fn harris_response(image: &GrayFloatImage, x: usize, y: usize, block_size: usize, k: f32) -> f32 {
    let r = (block_size / 2) as isize;
    let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
    for dy in -r..=r {
        for dx in -r..=r {
            let (px, py) = (x as isize + dx, y as isize + dy);
            let ix = (image.get_clamped(px + 1, py) - image.get_clamped(px - 1, py)) * 0.5;
            let iy = (image.get_clamped(px, py + 1) - image.get_clamped(px, py - 1)) * 0.5;
            a += ix * ix;
            b += iy * iy;
            c += ix * iy;
        }
    }
    a * b - c * c - k * (a + b) * (a + b)
}

/// Intensity centroid orientation in degrees, in `[0, 360)`.
fn intensity_centroid_angle(image: &GrayFloatImage, x: usize, y: usize, radius: isize) -> f32 {
    let (mut m01, mut m10) = (0f32, 0f32);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let value = image.get_clamped(x as isize + dx, y as isize + dy);
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10).to_degrees().rem_euclid(360.0)
}

impl Orb {
    /// Oriented keypoints of one level, in level pixels, with the best Harris responses.
    fn detect_level(&self, image: &GrayFloatImage, count: usize) -> Vec<Keypoint> {
        let mut corners = fast_corners(image, self.fast_threshold, self.edge_threshold);
        corners.sort_by_key(|&(_, _, score)| Reverse(FloatOrd(score)));
        corners.truncate(2 * count);
        let mut keypoints: Vec<Keypoint> = corners
            .into_iter()
            .map(|(x, y, _)| Keypoint {
                x: x as f32,
                y: y as f32,
                size: self.patch_size as f32,
                angle: 0.0,
                response: harris_response(image, x, y, self.harris_block_size, self.harris_k),
            })
            .collect();
        keypoints.sort_by_key(|kp| Reverse(FloatOrd(kp.response)));
        keypoints.truncate(count);
        let radius = (self.patch_size / 2) as isize;
        for keypoint in keypoints.iter_mut() {
            let (x, y) = (keypoint.x as usize, keypoint.y as usize);
            keypoint.angle = intensity_centroid_angle(image, x, y, radius);
        }
        keypoints
    }

    /// Rotated BRIEF descriptor of a keypoint on a smoothed level.
    fn describe_keypoint(
        &self,
        smoothed: &GrayFloatImage,
        keypoint: &Keypoint,
    ) -> [u8; DESCRIPTOR_BYTES] {
        let (sin_a, cos_a) = keypoint.angle.to_radians().sin_cos();
        let (cx, cy) = (keypoint.x as isize, keypoint.y as isize);
        let sample = |(px, py): (i32, i32)| {
            let (px, py) = (px as f32, py as f32);
            let col = (px * cos_a - py * sin_a).round() as isize;
            let row = (px * sin_a + py * cos_a).round() as isize;
            smoothed.get_clamped(cx + col, cy + row)
        };
        let mut descriptor = [0u8; DESCRIPTOR_BYTES];
        for (bit, [p, q]) in self.pattern.iter().enumerate() {
            if sample(*p) < sample(*q) {
                descriptor[bit / 8] |= 1 << (bit % 8);
            }
        }
        descriptor
    }

    /// Detect up to `target_count` keypoints over the pyramid and describe them.
    ///
    /// Coordinates and sizes are returned in input pixels, angles in degrees.
    pub fn extract(
        &self,
        image: &GrayFloatImage,
        target_count: usize,
    ) -> (Vec<Keypoint>, Array2<u8>) {
        let allotment = features_per_level(target_count, self.num_levels, self.scale_factor);
        let mut keypoints = vec![];
        let mut rows: Vec<[u8; DESCRIPTOR_BYTES]> = vec![];
        for (level, &count) in allotment.iter().enumerate() {
            let scale = self.scale_factor.powi(level as i32);
            let width = (image.width() as f32 / scale).round() as usize;
            let height = (image.height() as f32 / scale).round() as usize;
            if count == 0 || width.min(height) <= 2 * self.edge_threshold {
                continue;
            }
            let level_image = if level == 0 {
                image.clone()
            } else {
                image.resize_area(width, height)
            };
            let detected = self.detect_level(&level_image, count);
            trace!("ORB level {} kept {} of {} keypoints", level, detected.len(), count);
            let smoothed = gaussian_blur(&level_image, self.blur_sigma);
            for keypoint in detected {
                rows.push(self.describe_keypoint(&smoothed, &keypoint));
                keypoints.push(Keypoint {
                    x: keypoint.x * scale,
                    y: keypoint.y * scale,
                    size: keypoint.size * scale,
                    ..keypoint
                });
            }
        }
        let descriptors =
            Array2::from_shape_fn((rows.len(), DESCRIPTOR_BYTES), |(i, j)| rows[i][j]);
        (keypoints, descriptors)
    }
}

/// Run ORB with a budget of `target_count` keypoints.
pub fn extract(
    image: &GrayFloatImage,
    _config: &FeaturesConfig,
    target_count: usize,
) -> DetectorOutput {
    let orb = Orb::default();
    let (keypoints, descriptors) = orb.extract(image, target_count);
    debug!("ORB found {} of {} requested keypoints", keypoints.len(), target_count);
    DetectorOutput::new(&keypoints, Descriptors::Byte(descriptors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeatureType;

    fn squares() -> GrayFloatImage {
        GrayFloatImage(Array2::from_shape_fn((240, 240), |(y, x)| {
            let in_square = |x0: usize, y0: usize, side: usize| {
                x >= x0 && x < x0 + side && y >= y0 && y < y0 + side
            };
            if in_square(50, 50, 40) || in_square(130, 60, 50) || in_square(70, 140, 60) {
                0.9
            } else {
                0.1
            }
        }))
    }

    #[test]
    fn allotment_sums_to_total() {
        for &total in &[0, 1, 7, 500, 4000] {
            let levels = features_per_level(total, 8, 1.2);
            assert_eq!(levels.len(), 8);
            assert_eq!(levels.iter().sum::<usize>(), total);
        }
        let levels = features_per_level(1000, 8, 1.2);
        assert!(levels[0] > levels[1] && levels[1] > levels[2]);
    }

    #[test]
    fn pattern_is_deterministic_and_bounded() {
        let a = sampling_pattern(15);
        let b = sampling_pattern(15);
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        assert!(a.iter().flatten().all(|&(x, y)| x.abs() <= 15 && y.abs() <= 15));
    }

    #[test]
    fn fast_finds_square_corners_only() {
        let mut image = GrayFloatImage(Array2::from_elem((40, 40), 0.1));
        for y in 15..40 {
            for x in 15..40 {
                image.put(x, y, 0.9);
            }
        }
        let corners = fast_corners(&image, 20.0 / 255.0, 3);
        assert!(!corners.is_empty());
        assert!(corners
            .iter()
            .all(|&(x, y, _)| (x as isize - 15).abs() <= 2 && (y as isize - 15).abs() <= 2));
        let flat = GrayFloatImage(Array2::from_elem((40, 40), 0.5));
        assert!(fast_corners(&flat, 20.0 / 255.0, 3).is_empty());
    }

    #[test]
    fn centroid_points_towards_the_bright_side() {
        let ramp = GrayFloatImage(Array2::from_shape_fn((40, 40), |(y, _)| y as f32 / 40.0));
        let angle = intensity_centroid_angle(&ramp, 20, 20, 15);
        assert!((angle - 90.0).abs() < 1.0);
    }

    #[test]
    fn extract_respects_the_budget() {
        let config = FeaturesConfig::new(FeatureType::Orb);
        let output = extract(&squares(), &config, 20);
        assert!(!output.is_empty());
        assert!(output.len() <= 20);
        assert!(output.descriptors.is_byte());
        assert_eq!(output.descriptors.width(), DESCRIPTOR_BYTES);
        for row in output.points.rows() {
            assert!(row[3] >= 0.0 && row[3] < 360.0);
            assert!(row[2] >= 31.0);
        }
    }

    #[test]
    fn flat_image_gives_empty_rank_two_output() {
        let config = FeaturesConfig::new(FeatureType::Orb);
        let flat = GrayFloatImage(Array2::from_elem((100, 100), 0.5));
        let output = extract(&flat, &config, 50);
        assert_eq!(output.points.dim(), (0, 4));
        assert_eq!(output.descriptors.width(), DESCRIPTOR_BYTES);
    }
}
