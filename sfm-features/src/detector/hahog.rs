//! Hessian-affine keypoints with histogram of oriented gradients descriptors.
//!
//! Blobs are maxima of the scale normalized Hessian determinant. Each one gets an
//! affine shape from the second moment matrix of its neighborhood, and the
//! descriptor is a SIFT histogram computed on the patch warped to a circle.

use crate::detector::scale_space::{is_extremum, refine_extremum, GaussianPyramid, Refined};
use crate::detector::sift::{
    dominant_orientations, orientation_histogram, sift_descriptor, DESCRIPTOR_SIZE,
};
use crate::detector::{DetectorOutput, Keypoint};
use crate::features_data::Descriptors;
use crate::image::GrayFloatImage;
use crate::FeaturesConfig;
use float_ord::FloatOrd;
use log::*;
use nalgebra::{Matrix2, SymmetricEigen, Vector2};
use ndarray::Array2;
use std::cmp::Reverse;

const SCALES_PER_OCTAVE: usize = 3;
const SIGMA: f64 = 1.6;
const ASSUMED_BLUR: f64 = 0.5;
const IMAGE_BORDER: usize = 5;

/// Shape adaptation samples `2 * resolution + 1` pixels over `extent` scales.
const ADAPTATION_RESOLUTION: usize = 20;
const ADAPTATION_EXTENT: f64 = 9.0;
/// Window of the second moment matrix, in keypoint scales.
const INTEGRATION_SIGMA: f64 = 3.0;
const MAX_ADAPTATION_ITERATIONS: usize = 10;
/// Eigenvalue ratio of the second moment matrix at which a shape is isotropic.
const ISOTROPY_RATIO: f64 = 0.95;
/// Largest accepted ratio between the axes of an affine shape.
const MAX_ANISOTROPY: f64 = 5.0;

/// The descriptor patch covers `PATCH_EXTENT` scales with `2 * resolution + 1` pixels.
const PATCH_RESOLUTION: usize = 15;
const PATCH_EXTENT: f64 = 7.5;
/// Gaussian of the descriptor histograms, in patch pixels.
const PATCH_DESCRIPTOR_SIGMA: f32 = 2.0;
const ORIENTATION_SIGMA: f32 = 1.5 * PATCH_DESCRIPTOR_SIGMA;

/// Byte scaling of unit descriptors, and of their square roots.
const UCHAR_SCALING: f32 = 512.0;
const ROOT_UCHAR_SCALING: f32 = 362.0;

/// A Hessian-affine frame before description.
#[derive(Debug, Clone, Copy)]
pub struct HahogKeypoint {
    pub keypoint: Keypoint,
    pub octave: usize,
    pub level: usize,
    /// Location in octave pixels.
    pub octave_x: f32,
    pub octave_y: f32,
    /// Scale in octave pixels.
    pub octave_sigma: f32,
    /// Unit determinant affine shape mapping the normalized patch to the image.
    pub shape: Matrix2<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Hahog {
    pub peak_threshold: f64,
    pub edge_threshold: f64,
}

/// Gaussian pyramid along with its Hessian determinant responses.
pub struct HahogScaleSpace {
    pub pyramid: GaussianPyramid,
    pub responses: Vec<Vec<GrayFloatImage>>,
}

impl HahogScaleSpace {
    pub fn new(image: &GrayFloatImage) -> Self {
        let pyramid = GaussianPyramid::build(
            image,
            SIGMA,
            ASSUMED_BLUR,
            SCALES_PER_OCTAVE,
            false,
            2 * IMAGE_BORDER + 3,
        );
        let responses = pyramid
            .octaves
            .iter()
            .map(|levels| {
                levels
                    .iter()
                    .enumerate()
                    .map(|(level, image)| {
                        hessian_response(image, pyramid.level_sigma(level as f64))
                    })
                    .collect()
            })
            .collect();
        Self { pyramid, responses }
    }
}

/// Second derivatives by central differences.
fn hessian_at(image: &GrayFloatImage, x: usize, y: usize) -> (f64, f64, f64) {
    let at = |dx: isize, dy: isize| {
        f64::from(image.get((x as isize + dx) as usize, (y as isize + dy) as usize))
    };
    let center = at(0, 0);
    let dxx = at(1, 0) + at(-1, 0) - 2.0 * center;
    let dyy = at(0, 1) + at(0, -1) - 2.0 * center;
    let dxy = (at(1, 1) - at(-1, 1) - at(1, -1) + at(-1, -1)) * 0.25;
    (dxx, dyy, dxy)
}

/// Determinant of the Hessian times `sigma^4`. Border pixels respond with zero.
fn hessian_response(image: &GrayFloatImage, sigma: f64) -> GrayFloatImage {
    let (width, height) = (image.width(), image.height());
    let normalization = sigma.powi(4);
    GrayFloatImage(Array2::from_shape_fn((height, width), |(y, x)| {
        if x == 0 || y == 0 || x + 1 >= width || y + 1 >= height {
            return 0.0;
        }
        let (dxx, dyy, dxy) = hessian_at(image, x, y);
        ((dxx * dyy - dxy * dxy) * normalization) as f32
    }))
}

/// Sample a `2 * resolution + 1` square patch through an affine transform.
///
/// Patch pixel `p`, relative to the patch center, reads the image at
/// `center + transform * p * step`.
fn extract_patch(
    image: &GrayFloatImage,
    center: (f64, f64),
    transform: &Matrix2<f64>,
    resolution: usize,
    step: f64,
) -> GrayFloatImage {
    let side = 2 * resolution + 1;
    let r = resolution as f64;
    GrayFloatImage(Array2::from_shape_fn((side, side), |(py, px)| {
        let q = transform * (Vector2::new(px as f64 - r, py as f64 - r) * step);
        image.sample_bilinear((center.0 + q.x) as f32, (center.1 + q.y) as f32)
    }))
}

/// Gaussian weighted second moment matrix of the patch gradients.
fn second_moment(patch: &GrayFloatImage, sigma: f64) -> Matrix2<f64> {
    let side = patch.width();
    let c = (side as f64 - 1.0) * 0.5;
    let mut moment = Matrix2::zeros();
    for y in 1..side - 1 {
        for x in 1..side - 1 {
            let gx = f64::from(patch.get(x + 1, y) - patch.get(x - 1, y)) * 0.5;
            let gy = f64::from(patch.get(x, y + 1) - patch.get(x, y - 1)) * 0.5;
            let d2 = (x as f64 - c).powi(2) + (y as f64 - c).powi(2);
            let weight = (-d2 / (2.0 * sigma * sigma)).exp();
            moment += Matrix2::new(gx * gx, gx * gy, gx * gy, gy * gy) * weight;
        }
    }
    moment
}

/// Iterate the affine shape until the warped neighborhood is isotropic.
///
/// Returns `None` for flat neighborhoods and shapes that become too elongated.
fn adapt_shape(image: &GrayFloatImage, center: (f64, f64), sigma: f64) -> Option<Matrix2<f64>> {
    let step = ADAPTATION_EXTENT / ADAPTATION_RESOLUTION as f64;
    let mut shape = Matrix2::identity();
    for _ in 0..MAX_ADAPTATION_ITERATIONS {
        let patch = extract_patch(image, center, &(shape * sigma), ADAPTATION_RESOLUTION, step);
        let eigen = SymmetricEigen::new(second_moment(&patch, INTEGRATION_SIGMA / step));
        let (l_min, l_max) = (eigen.eigenvalues.min(), eigen.eigenvalues.max());
        if !(l_min > 0.0) {
            return None;
        }
        if l_min / l_max >= ISOTROPY_RATIO {
            break;
        }
        let inverse_sqrt = eigen.eigenvectors
            * Matrix2::from_diagonal(&eigen.eigenvalues.map(|l| 1.0 / l.sqrt()))
            * eigen.eigenvectors.transpose();
        shape *= inverse_sqrt;
        shape /= shape.determinant().abs().sqrt();
        let axes = shape.singular_values();
        if axes.max() > MAX_ANISOTROPY * axes.min() {
            return None;
        }
    }
    Some(shape)
}

impl Hahog {
    pub fn new(peak_threshold: f64, edge_threshold: f64) -> Self {
        Self {
            peak_threshold,
            edge_threshold,
        }
    }

    /// Affine adapted Hessian keypoints, strongest first.
    pub fn detect(&self, space: &HahogScaleSpace) -> Vec<HahogKeypoint> {
        let prelim = (0.8 * self.peak_threshold) as f32;
        let mut keypoints = vec![];
        let octaves = space.pyramid.octaves.iter().zip(&space.responses);
        for (octave, (levels, responses)) in octaves.enumerate() {
            let (width, height) = (responses[0].width(), responses[0].height());
            if width <= 2 * IMAGE_BORDER || height <= 2 * IMAGE_BORDER {
                continue;
            }
            let pixel = space.pyramid.pixel_size(octave) as f32;
            for level in 1..=SCALES_PER_OCTAVE {
                let stack = [&responses[level - 1], &responses[level], &responses[level + 1]];
                for y in IMAGE_BORDER..height - IMAGE_BORDER {
                    for x in IMAGE_BORDER..width - IMAGE_BORDER {
                        let value = responses[level].get(x, y);
                        if value <= prelim || !is_extremum(stack, x, y, value) {
                            continue;
                        }
                        let refined = match refine_extremum(responses, level, x, y, IMAGE_BORDER) {
                            Some(refined) => refined,
                            None => continue,
                        };
                        if refined.value < self.peak_threshold {
                            continue;
                        }
                        let image = &levels[refined.level];
                        let (dxx, dyy, dxy) = hessian_at(image, refined.x, refined.y);
                        let curvature = Refined { dxx, dyy, dxy, ..refined };
                        if !curvature.passes_edge_test(self.edge_threshold) {
                            continue;
                        }
                        let octave_x = refined.x as f64 + refined.dx;
                        let octave_y = refined.y as f64 + refined.dy;
                        let octave_sigma =
                            space.pyramid.level_sigma(refined.level as f64 + refined.dlevel);
                        let shape = match adapt_shape(image, (octave_x, octave_y), octave_sigma) {
                            Some(shape) => shape,
                            None => continue,
                        };
                        keypoints.push(HahogKeypoint {
                            keypoint: Keypoint {
                                x: octave_x as f32 * pixel,
                                y: octave_y as f32 * pixel,
                                size: octave_sigma as f32 * pixel,
                                angle: 0.0,
                                response: refined.value as f32,
                            },
                            octave,
                            level: refined.level,
                            octave_x: octave_x as f32,
                            octave_y: octave_y as f32,
                            octave_sigma: octave_sigma as f32,
                            shape,
                        });
                    }
                }
            }
        }
        keypoints.sort_by_key(|kp| Reverse(FloatOrd(kp.keypoint.response)));
        keypoints
    }

    /// Orient the keypoints and compute unit length descriptors.
    ///
    /// The returned keypoints carry the orientation of their affine frame in degrees.
    pub fn describe(
        &self,
        space: &HahogScaleSpace,
        keypoints: &[HahogKeypoint],
    ) -> (Vec<Keypoint>, Array2<f32>) {
        let mut descriptors = Array2::zeros((keypoints.len(), DESCRIPTOR_SIZE));
        let mut oriented = Vec::with_capacity(keypoints.len());
        let center = PATCH_RESOLUTION as f32;
        for (kp, mut row) in keypoints.iter().zip(descriptors.rows_mut()) {
            let image = &space.pyramid.octaves[kp.octave][kp.level];
            let transform = kp.shape * f64::from(kp.octave_sigma);
            let patch = extract_patch(
                image,
                (f64::from(kp.octave_x), f64::from(kp.octave_y)),
                &transform,
                PATCH_RESOLUTION,
                PATCH_EXTENT / PATCH_RESOLUTION as f64,
            );
            let histogram = orientation_histogram(
                &patch,
                PATCH_RESOLUTION,
                PATCH_RESOLUTION,
                (3.0 * ORIENTATION_SIGMA).round() as usize,
                ORIENTATION_SIGMA,
            );
            let angle = dominant_orientations(&histogram, 1.0).first().copied().unwrap_or(0.0);
            let descriptor = sift_descriptor(&patch, center, center, angle, PATCH_DESCRIPTOR_SIGMA);
            for (out, value) in row.iter_mut().zip(descriptor.iter()) {
                *out = *value;
            }
            // Direction of the patch orientation once mapped back to the image.
            let (sin_t, cos_t) = f64::from(angle).to_radians().sin_cos();
            let direction = kp.shape * Vector2::new(cos_t, sin_t);
            let image_angle = direction.y.atan2(direction.x).to_degrees().rem_euclid(360.0);
            oriented.push(Keypoint {
                angle: image_angle as f32,
                ..kp.keypoint
            });
        }
        (oriented, descriptors)
    }
}

/// Square root and byte scaling of unit descriptors.
fn post_process(descriptors: &mut Array2<f32>, root: bool, normalize_to_uchar: bool) {
    let scaling = if root {
        descriptors.mapv_inplace(f32::sqrt);
        ROOT_UCHAR_SCALING
    } else {
        UCHAR_SCALING
    };
    if normalize_to_uchar {
        descriptors.mapv_inplace(|v| (scaling * v).clamp(0.0, 255.0).round());
    }
}

/// Run HAHOG keeping the `target_count` strongest keypoints.
pub fn extract(
    image: &GrayFloatImage,
    config: &FeaturesConfig,
    target_count: usize,
) -> DetectorOutput {
    let hahog = Hahog::new(config.hahog_peak_threshold, config.hahog_edge_threshold);
    let space = HahogScaleSpace::new(image);
    let mut keypoints = hahog.detect(&space);
    debug!("{} Hessian-affine frames detected", keypoints.len());
    if target_count > 0 {
        keypoints.truncate(target_count);
    }
    let (keypoints, mut descriptors) = hahog.describe(&space, &keypoints);
    post_process(&mut descriptors, config.feature_root, config.hahog_normalize_to_uchar);
    DetectorOutput::new(&keypoints, Descriptors::Float(descriptors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeatureType;
    use approx::assert_relative_eq;

    fn gaussian_image(size: usize, cx: f32, cy: f32, sx: f32, sy: f32) -> GrayFloatImage {
        GrayFloatImage(Array2::from_shape_fn((size, size), |(y, x)| {
            let dx = (x as f32 - cx) / sx;
            let dy = (y as f32 - cy) / sy;
            0.1 + 0.8 * (-(dx * dx + dy * dy) / 2.0).exp()
        }))
    }

    #[test]
    fn isotropic_blob_keeps_a_round_shape() {
        let image = gaussian_image(128, 64.0, 64.0, 4.0, 4.0);
        let shape = adapt_shape(&image, (64.0, 64.0), 4.0).map(|s| s.singular_values());
        let axes = shape.unwrap_or_else(|| panic!("shape adaptation failed"));
        assert!(axes.max() / axes.min() < 1.2);
    }

    #[test]
    fn elongated_blob_gets_an_elongated_shape() {
        let image = gaussian_image(160, 80.0, 80.0, 6.0, 3.0);
        let shape = adapt_shape(&image, (80.0, 80.0), (6.0f64 * 3.0).sqrt());
        let shape = shape.unwrap_or_else(|| panic!("shape adaptation failed"));
        assert!(shape[(0, 0)].abs() > shape[(1, 1)].abs());
        let axes = shape.singular_values();
        assert!(axes.max() / axes.min() > 1.2);
        assert_relative_eq!(shape.determinant().abs(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn flat_neighborhoods_are_rejected() {
        let flat = GrayFloatImage(Array2::from_elem((64, 64), 0.5));
        assert!(adapt_shape(&flat, (32.0, 32.0), 2.0).is_none());
    }

    #[test]
    fn detects_a_blob_with_unit_descriptor() {
        let config = FeaturesConfig {
            hahog_normalize_to_uchar: false,
            feature_root: false,
            ..FeaturesConfig::new(FeatureType::Hahog)
        };
        let output = extract(&gaussian_image(128, 64.0, 60.0, 4.0, 4.0), &config, 5);
        assert!(!output.is_empty() && output.len() <= 5);
        let (x, y) = (output.points[(0, 0)], output.points[(0, 1)]);
        assert!((x - 64.0).abs() < 2.0 && (y - 60.0).abs() < 2.0);
        let norm: f32 = output.descriptors.to_float().row(0).iter().map(|v| v * v).sum();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn uchar_post_processing_rounds_to_byte_range() {
        let mut descriptors = Array2::from_shape_vec((1, 3), vec![0.0f32, 0.25, 0.9]).unwrap();
        post_process(&mut descriptors, false, true);
        assert_eq!(descriptors.row(0).to_vec(), vec![0.0, 128.0, 255.0]);

        let mut descriptors = Array2::from_shape_vec((1, 2), vec![0.25f32, 0.04]).unwrap();
        post_process(&mut descriptors, true, true);
        assert_eq!(descriptors.row(0).to_vec(), vec![181.0, 72.0]);

        let mut descriptors = Array2::from_shape_vec((1, 1), vec![0.25f32]).unwrap();
        post_process(&mut descriptors, true, false);
        assert_relative_eq!(descriptors[(0, 0)], 0.5);
    }

    #[test]
    fn flat_image_gives_empty_rank_two_output() {
        let config = FeaturesConfig::new(FeatureType::Hahog);
        let flat = GrayFloatImage(Array2::from_elem((64, 64), 0.5));
        let output = extract(&flat, &config, 100);
        assert_eq!(output.points.dim(), (0, 4));
        assert_eq!(output.descriptors.width(), DESCRIPTOR_SIZE);
    }
}
