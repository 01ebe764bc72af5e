use crate::detector::{
    adaptive::AdaptiveThreshold,
    scale_space::{difference_of_gaussians, is_extremum, refine_extremum, GaussianPyramid},
    DetectorOutput, Keypoint,
};
use crate::features_data::Descriptors;
use crate::image::GrayFloatImage;
use crate::root::root_feature;
use crate::FeaturesConfig;
use log::*;
use ndarray::Array2;

const SCALES_PER_OCTAVE: usize = 3;
const SIGMA: f64 = 1.6;
const ASSUMED_BLUR: f64 = 0.5;
const IMAGE_BORDER: usize = 5;
const ORIENTATION_BINS: usize = 36;
const ORIENTATION_PEAK_RATIO: f32 = 0.8;
const ORIENTATION_SIGMA_FACTOR: f32 = 1.5;
const ORIENTATION_RADIUS_FACTOR: f32 = 3.0 * ORIENTATION_SIGMA_FACTOR;
const DESCRIPTOR_HISTOGRAMS: usize = 4;
const DESCRIPTOR_BINS: usize = 8;
const DESCRIPTOR_SCALE_FACTOR: f32 = 3.0;
const DESCRIPTOR_MAGNITUDE_CAP: f32 = 0.2;
/// Scale that maps unit descriptors to the byte range.
const DESCRIPTOR_BYTE_SCALE: f32 = 512.0;

pub const DESCRIPTOR_SIZE: usize = DESCRIPTOR_HISTOGRAMS * DESCRIPTOR_HISTOGRAMS * DESCRIPTOR_BINS;

/// A SIFT keypoint along with where it lives in the scale space.
#[derive(Debug, Clone, Copy)]
pub struct SiftKeypoint {
    pub keypoint: Keypoint,
    pub octave: usize,
    pub level: usize,
    /// Location in octave pixels.
    pub octave_x: f32,
    pub octave_y: f32,
    /// Blur of the keypoint in octave pixels.
    pub octave_sigma: f32,
}

/// Difference-of-Gaussians detector with 128-d gradient histogram descriptors.
///
/// The contrast threshold is chosen per call to [`Sift::detect`].
#[derive(Debug, Clone, Copy)]
pub struct Sift {
    /// Maximum ratio of principal curvatures.
    pub edge_threshold: f64,
}

impl Sift {
    pub fn new(edge_threshold: f64) -> Self {
        Self { edge_threshold }
    }
}

/// Precomputed scale space that can be searched at any contrast threshold.
pub struct SiftScaleSpace {
    pub pyramid: GaussianPyramid,
    pub dog: Vec<Vec<GrayFloatImage>>,
}

impl SiftScaleSpace {
    pub fn new(image: &GrayFloatImage) -> Self {
        let pyramid = GaussianPyramid::build(
            image,
            SIGMA,
            ASSUMED_BLUR,
            SCALES_PER_OCTAVE,
            true,
            2 * IMAGE_BORDER + 3,
        );
        let dog = difference_of_gaussians(&pyramid);
        Self { pyramid, dog }
    }
}

impl Sift {
    /// Find oriented keypoints at `peak_threshold`.
    pub fn detect(&self, space: &SiftScaleSpace, peak_threshold: f64) -> Vec<SiftKeypoint> {
        let prelim = (0.5 * peak_threshold / SCALES_PER_OCTAVE as f64) as f32;
        let mut keypoints = vec![];
        for (octave, (levels, dogs)) in space.pyramid.octaves.iter().zip(&space.dog).enumerate() {
            let (width, height) = (dogs[0].width(), dogs[0].height());
            if width <= 2 * IMAGE_BORDER || height <= 2 * IMAGE_BORDER {
                continue;
            }
            for layer in 1..=SCALES_PER_OCTAVE {
                let stack = [&dogs[layer - 1], &dogs[layer], &dogs[layer + 1]];
                for y in IMAGE_BORDER..height - IMAGE_BORDER {
                    for x in IMAGE_BORDER..width - IMAGE_BORDER {
                        let value = dogs[layer].get(x, y);
                        if value.abs() <= prelim || !is_extremum(stack, x, y, value) {
                            continue;
                        }
                        let refined = match refine_extremum(dogs, layer, x, y, IMAGE_BORDER) {
                            Some(refined) => refined,
                            None => continue,
                        };
                        if refined.value.abs() * (SCALES_PER_OCTAVE as f64) < peak_threshold
                            || !refined.passes_edge_test(self.edge_threshold)
                        {
                            continue;
                        }
                        let octave_x = (refined.x as f64 + refined.dx) as f32;
                        let octave_y = (refined.y as f64 + refined.dy) as f32;
                        let octave_sigma =
                            space.pyramid.level_sigma(refined.level as f64 + refined.dlevel) as f32;
                        let pixel = space.pyramid.pixel_size(octave) as f32;
                        let histogram = orientation_histogram(
                            &levels[refined.level],
                            refined.x,
                            refined.y,
                            (ORIENTATION_RADIUS_FACTOR * octave_sigma).round() as usize,
                            ORIENTATION_SIGMA_FACTOR * octave_sigma,
                        );
                        for angle in dominant_orientations(&histogram, ORIENTATION_PEAK_RATIO) {
                            keypoints.push(SiftKeypoint {
                                keypoint: Keypoint {
                                    x: octave_x * pixel,
                                    y: octave_y * pixel,
                                    size: 2.0 * octave_sigma * pixel,
                                    angle,
                                    response: refined.value.abs() as f32,
                                },
                                octave,
                                level: refined.level,
                                octave_x,
                                octave_y,
                                octave_sigma,
                            });
                        }
                    }
                }
            }
        }
        keypoints
    }

    /// Compute byte-range descriptors for the given keypoints.
    pub fn describe(&self, space: &SiftScaleSpace, keypoints: &[SiftKeypoint]) -> Array2<f32> {
        let mut descriptors = Array2::zeros((keypoints.len(), DESCRIPTOR_SIZE));
        for (kp, mut row) in keypoints.iter().zip(descriptors.rows_mut()) {
            let image = &space.pyramid.octaves[kp.octave][kp.level];
            let descriptor = sift_descriptor(
                image,
                kp.octave_x,
                kp.octave_y,
                kp.keypoint.angle,
                kp.octave_sigma,
            );
            for (out, value) in row.iter_mut().zip(descriptor.iter()) {
                *out = (value * DESCRIPTOR_BYTE_SCALE).round().min(255.0);
            }
        }
        descriptors
    }
}

/// Run SIFT with adaptive peak threshold search.
pub fn extract(
    image: &GrayFloatImage,
    config: &FeaturesConfig,
    target_count: usize,
) -> DetectorOutput {
    let sift = Sift::new(config.sift_edge_threshold);
    let space = SiftScaleSpace::new(image);
    trace!("SIFT scale space has {} octaves", space.pyramid.octaves.len());
    let search = AdaptiveThreshold::new(
        config.sift_peak_threshold,
        config.feature_adaptive_threshold_floor,
    );
    let result = search.search(target_count, |threshold| sift.detect(&space, threshold));
    let keypoints = result.detections;
    let mut descriptors = sift.describe(&space, &keypoints);
    if config.feature_root {
        descriptors = root_feature(&descriptors, false);
    }
    let points: Vec<Keypoint> = keypoints.iter().map(|kp| kp.keypoint).collect();
    DetectorOutput::new(&points, Descriptors::Float(descriptors))
}

/// Gradient orientation histogram around `(x, y)`, smoothed circularly.
///
/// Bin `i` covers orientations around `i * 360 / bins` degrees, where orientations
/// are measured with the y axis pointing up.
pub(crate) fn orientation_histogram(
    image: &GrayFloatImage,
    x: usize,
    y: usize,
    radius: usize,
    sigma: f32,
) -> [f32; ORIENTATION_BINS] {
    let n = ORIENTATION_BINS;
    let mut raw = [0f32; ORIENTATION_BINS];
    let exp_scale = -1.0 / (2.0 * sigma * sigma);
    let radius = radius as isize;
    let (width, height) = (image.width() as isize, image.height() as isize);
    for i in -radius..=radius {
        let yy = y as isize + i;
        if yy <= 0 || yy >= height - 1 {
            continue;
        }
        for j in -radius..=radius {
            let xx = x as isize + j;
            if xx <= 0 || xx >= width - 1 {
                continue;
            }
            let (xu, yu) = (xx as usize, yy as usize);
            let dx = image.get(xu + 1, yu) - image.get(xu - 1, yu);
            let dy = image.get(xu, yu - 1) - image.get(xu, yu + 1);
            let weight = (((i * i + j * j) as f32) * exp_scale).exp();
            let angle = dy.atan2(dx).to_degrees();
            let mut bin = (angle * n as f32 / 360.0).round() as isize;
            bin = bin.rem_euclid(n as isize);
            raw[bin as usize] += weight * (dx * dx + dy * dy).sqrt();
        }
    }
    let mut hist = [0f32; ORIENTATION_BINS];
    for i in 0..n {
        let at = |offset: isize| raw[(i as isize + offset).rem_euclid(n as isize) as usize];
        hist[i] = (at(-2) + at(2)) * (1.0 / 16.0)
            + (at(-1) + at(1)) * (4.0 / 16.0)
            + at(0) * (6.0 / 16.0);
    }
    hist
}

/// Angles in degrees of all histogram peaks within `peak_ratio` of the maximum.
///
/// Peaks are interpolated with a parabola. Angles are reported clockwise with the
/// y axis pointing down, in `[0, 360)`.
pub(crate) fn dominant_orientations(hist: &[f32], peak_ratio: f32) -> Vec<f32> {
    let n = hist.len();
    let max = hist.iter().copied().fold(0f32, f32::max);
    if max <= 0.0 {
        return vec![];
    }
    let threshold = max * peak_ratio;
    (0..n)
        .filter_map(|j| {
            let left = hist[(j + n - 1) % n];
            let right = hist[(j + 1) % n];
            let value = hist[j];
            if !(value > left && value > right && value >= threshold) {
                return None;
            }
            let mut bin = j as f32 + 0.5 * (left - right) / (left - 2.0 * value + right);
            if bin < 0.0 {
                bin += n as f32;
            } else if bin >= n as f32 {
                bin -= n as f32;
            }
            let angle = 360.0 - 360.0 / n as f32 * bin;
            Some(if (angle - 360.0).abs() < f32::EPSILON { 0.0 } else { angle })
        })
        .collect()
}

/// 4x4x8 histogram of gradient orientations, normalized to unit length after
/// clamping large components.
///
/// `(x, y)` and `sigma` are in pixels of `image`; `angle` is in degrees as produced
/// by [`dominant_orientations`].
pub(crate) fn sift_descriptor(
    image: &GrayFloatImage,
    x: f32,
    y: f32,
    angle: f32,
    sigma: f32,
) -> [f32; DESCRIPTOR_SIZE] {
    let d = DESCRIPTOR_HISTOGRAMS;
    let n = DESCRIPTOR_BINS;
    let (cx, cy) = (x.round() as isize, y.round() as isize);
    let angle = 360.0 - angle;
    let (sin_t, cos_t) = angle.to_radians().sin_cos();
    let bins_per_degree = n as f32 / 360.0;
    let exp_scale = -2.0 / (d * d) as f32;
    let hist_width = DESCRIPTOR_SCALE_FACTOR * sigma;
    let (width, height) = (image.width() as isize, image.height() as isize);
    let max_radius = ((width * width + height * height) as f32).sqrt();
    let radius = (hist_width * std::f32::consts::SQRT_2 * (d + 1) as f32 * 0.5)
        .round()
        .min(max_radius) as isize;
    let (cos_t, sin_t) = (cos_t / hist_width, sin_t / hist_width);

    let stride_c = n + 2;
    let stride_r = (d + 2) * stride_c;
    let mut hist = vec![0f32; (d + 2) * stride_r];
    for i in -radius..=radius {
        for j in -radius..=radius {
            let c_rot = j as f32 * cos_t - i as f32 * sin_t;
            let r_rot = j as f32 * sin_t + i as f32 * cos_t;
            let rbin = r_rot + (d / 2) as f32 - 0.5;
            let cbin = c_rot + (d / 2) as f32 - 0.5;
            let (r, c) = (cy + i, cx + j);
            if !(rbin > -1.0 && rbin < d as f32 && cbin > -1.0 && cbin < d as f32)
                || r <= 0
                || r >= height - 1
                || c <= 0
                || c >= width - 1
            {
                continue;
            }
            let (ru, cu) = (r as usize, c as usize);
            let dx = image.get(cu + 1, ru) - image.get(cu - 1, ru);
            let dy = image.get(cu, ru - 1) - image.get(cu, ru + 1);
            let weight = ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let magnitude = (dx * dx + dy * dy).sqrt() * weight;
            let orientation = dy.atan2(dx).to_degrees().rem_euclid(360.0);
            let obin = (orientation - angle) * bins_per_degree;

            let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
            let (fr, fc, fo) = (rbin - r0, cbin - c0, obin - o0);
            let o0 = (o0 as isize).rem_euclid(n as isize) as usize;
            let (row, col) = ((r0 as isize + 1) as usize, (c0 as isize + 1) as usize);
            let base = row * stride_r + col * stride_c + o0;
            for (dr, wr) in [(0, 1.0 - fr), (1, fr)] {
                for (dc, wc) in [(0, 1.0 - fc), (1, fc)] {
                    for (dob, wo) in [(0, 1.0 - fo), (1, fo)] {
                        let bin = base + dr * stride_r + dc * stride_c + dob;
                        hist[bin] += magnitude * wr * wc * wo;
                    }
                }
            }
        }
    }

    let mut descriptor = [0f32; DESCRIPTOR_SIZE];
    for i in 0..d {
        for j in 0..d {
            let idx = (i + 1) * stride_r + (j + 1) * stride_c;
            hist[idx] += hist[idx + n];
            hist[idx + 1] += hist[idx + n + 1];
            descriptor[(i * d + j) * n..(i * d + j + 1) * n].copy_from_slice(&hist[idx..idx + n]);
        }
    }
    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    let cap = norm * DESCRIPTOR_MAGNITUDE_CAP;
    for v in descriptor.iter_mut() {
        *v = v.min(cap);
    }
    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
    for v in descriptor.iter_mut() {
        *v /= norm;
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn blob_image() -> GrayFloatImage {
        GrayFloatImage(Array2::from_shape_fn((64, 64), |(y, x)| {
            let (dx, dy) = (x as f32 - 32.0, y as f32 - 30.0);
            (-(dx * dx + dy * dy) / (2.0 * 16.0)).exp()
        }))
    }

    #[test]
    fn detects_a_gaussian_blob() {
        let space = SiftScaleSpace::new(&blob_image());
        let keypoints = Sift::new(10.0).detect(&space, 0.02);
        assert!(!keypoints.is_empty());
        let nearest = keypoints
            .iter()
            .map(|kp| ((kp.keypoint.x - 32.0).powi(2) + (kp.keypoint.y - 30.0).powi(2)).sqrt())
            .fold(f32::INFINITY, f32::min);
        assert!(nearest < 1.5, "closest keypoint {} px away", nearest);
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let space = SiftScaleSpace::new(&GrayFloatImage(Array2::from_elem((48, 48), 0.5)));
        assert!(Sift::new(10.0).detect(&space, 1e-6).is_empty());
    }

    #[test]
    fn ramp_orientation_points_along_gradient() {
        // Intensity increases towards +x, so the gradient points at 0 degrees.
        let ramp = GrayFloatImage(Array2::from_shape_fn((21, 21), |(_, x)| x as f32 / 20.0));
        let hist = orientation_histogram(&ramp, 10, 10, 6, 3.0);
        let angles = dominant_orientations(&hist, 0.8);
        assert_eq!(angles.len(), 1);
        assert!(angles[0] < 1.0 || angles[0] > 359.0);
    }

    #[test]
    fn descriptor_is_unit_length_with_capped_components() {
        let image = blob_image();
        let descriptor = sift_descriptor(&image, 32.0, 30.0, 0.0, 4.0);
        let norm: f32 = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-4);
        assert!(descriptor.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn extract_returns_rank_two_arrays_for_flat_images() {
        let config = FeaturesConfig::new(crate::FeatureType::Sift);
        let output = extract(&GrayFloatImage(Array2::from_elem((40, 40), 0.2)), &config, 100);
        assert_eq!(output.points.dim(), (0, 4));
        assert_eq!(output.descriptors.len(), 0);
        assert_eq!(output.descriptors.width(), DESCRIPTOR_SIZE);
    }
}
