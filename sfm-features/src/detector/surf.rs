//! Speeded-up robust features.
//!
//! Hessian responses are approximated with box filters on an integral image of
//! the 0 to 255 intensities. Each octave doubles both the filter sizes and the
//! sampling step, so all layers of an octave share one grid.

use crate::detector::adaptive::AdaptiveThreshold;
use crate::detector::msurf::{self, SurfLayout};
use crate::detector::{DetectorOutput, Keypoint};
use crate::features_data::Descriptors;
use crate::image::GrayFloatImage;
use crate::root::root_feature_surf;
use crate::FeaturesConfig;
use log::*;
use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;

/// Side of the smallest box filter, approximating a Gaussian of sigma 1.2.
const BASE_FILTER_SIZE: usize = 9;
/// Growth of the filter side between consecutive layers of the first octave.
const FILTER_SIZE_INCREMENT: usize = 6;
/// Relative weight of the mixed derivative in the determinant.
const DXY_WEIGHT: f32 = 0.81;

/// A weighted box, in filter coordinates of the 9x9 base filter.
type HaarBox = (usize, usize, usize, usize, f32);

const DXX_PATTERN: [HaarBox; 3] = [(0, 2, 3, 7, 1.0), (3, 2, 6, 7, -2.0), (6, 2, 9, 7, 1.0)];
const DYY_PATTERN: [HaarBox; 3] = [(2, 0, 7, 3, 1.0), (2, 3, 7, 6, -2.0), (2, 6, 7, 9, 1.0)];
const DXY_PATTERN: [HaarBox; 4] = [
    (1, 1, 4, 4, 1.0),
    (5, 1, 8, 4, -1.0),
    (1, 5, 4, 8, -1.0),
    (5, 5, 8, 8, 1.0),
];

/// Summed area table with one row and column of zero padding.
#[derive(Debug, Clone)]
pub struct IntegralImage {
    sums: Array2<f64>,
}

impl IntegralImage {
    /// Integral of the image scaled to 0 to 255 intensities.
    pub fn new(image: &GrayFloatImage) -> Self {
        let (height, width) = image.dim();
        let mut sums = Array2::zeros((height + 1, width + 1));
        for y in 0..height {
            let mut row_sum = 0.0;
            for x in 0..width {
                row_sum += f64::from(image.get(x, y)) * 255.0;
                sums[(y + 1, x + 1)] = sums[(y, x + 1)] + row_sum;
            }
        }
        Self { sums }
    }

    pub fn width(&self) -> usize {
        self.sums.ncols() - 1
    }

    pub fn height(&self) -> usize {
        self.sums.nrows() - 1
    }

    /// Sum over the pixels `x0..x1` and `y0..y1`.
    pub fn box_sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        self.sums[(y1, x1)] - self.sums[(y0, x1)] - self.sums[(y1, x0)] + self.sums[(y0, x0)]
    }

    /// Sum of `boxes`, each weighted and divided by its area, placed at `(left, top)`.
    fn haar(&self, left: usize, top: usize, boxes: &[(usize, usize, usize, usize, f32)]) -> f32 {
        boxes
            .iter()
            .map(|&(x0, y0, x1, y1, w)| {
                let area = ((x1 - x0) * (y1 - y0)) as f64;
                f64::from(w) * self.box_sum(left + x0, top + y0, left + x1, top + y1) / area
            })
            .sum::<f64>() as f32
    }

    /// Horizontal and vertical Haar wavelet responses of side `size` centered on a pixel.
    ///
    /// Wavelets that do not fit in the image respond with zero.
    pub fn haar_responses(&self, x: f32, y: f32, size: usize) -> (f32, f32) {
        let left = (x - (size as f32 - 1.0) * 0.5).round();
        let top = (y - (size as f32 - 1.0) * 0.5).round();
        if left < 0.0
            || top < 0.0
            || left as usize + size > self.width()
            || top as usize + size > self.height()
        {
            return (0.0, 0.0);
        }
        let (left, top) = (left as usize, top as usize);
        let half = size / 2;
        let dx = self.haar(left, top, &[(0, 0, half, size, -1.0), (half, 0, size, size, 1.0)]);
        let dy = self.haar(left, top, &[(0, 0, size, half, -1.0), (0, half, size, size, 1.0)]);
        (dx, dy)
    }
}

/// Scale a base pattern to a filter of side `size`.
fn resize_pattern(pattern: &[HaarBox], size: usize) -> Vec<HaarBox> {
    let ratio = size as f32 / BASE_FILTER_SIZE as f32;
    pattern
        .iter()
        .map(|&(x0, y0, x1, y1, w)| {
            let scale = |v: usize| (ratio * v as f32).round() as usize;
            (scale(x0), scale(y0), scale(x1), scale(y1), w)
        })
        .collect()
}

/// Hessian determinant responses of one octave.
#[derive(Debug, Clone)]
pub struct SurfOctave {
    pub octave: usize,
    /// Distance between grid samples in pixels.
    pub step: usize,
    /// Filter side of each layer.
    pub sizes: Vec<usize>,
    /// One response grid per layer, indexed by grid coordinates.
    pub layers: Vec<GrayFloatImage>,
}

impl SurfOctave {
    fn new(integral: &IntegralImage, octave: usize, num_layers: usize) -> Self {
        let step = 1 << octave;
        let grid_width = (integral.width() + step - 1) / step;
        let grid_height = (integral.height() + step - 1) / step;
        let sizes: Vec<usize> = (0..num_layers + 2)
            .map(|i| (BASE_FILTER_SIZE + FILTER_SIZE_INCREMENT * i) << octave)
            .collect();
        let layers = sizes
            .iter()
            .map(|&size| {
                let dxx = resize_pattern(&DXX_PATTERN, size);
                let dyy = resize_pattern(&DYY_PATTERN, size);
                let dxy = resize_pattern(&DXY_PATTERN, size);
                let mut layer = GrayFloatImage::new(grid_width, grid_height);
                for gy in 0..grid_height {
                    for gx in 0..grid_width {
                        let (cx, cy) = (gx * step, gy * step);
                        if cx < size / 2 || cy < size / 2 {
                            continue;
                        }
                        let (left, top) = (cx - size / 2, cy - size / 2);
                        if left + size > integral.width() || top + size > integral.height() {
                            continue;
                        }
                        let lxx = integral.haar(left, top, &dxx);
                        let lyy = integral.haar(left, top, &dyy);
                        let lxy = integral.haar(left, top, &dxy);
                        layer.put(gx, gy, lxx * lyy - DXY_WEIGHT * lxy * lxy);
                    }
                }
                layer
            })
            .collect();
        Self {
            octave,
            step,
            sizes,
            layers,
        }
    }

    /// Strict maxima of the middle layers above `threshold`, interpolated in position
    /// and filter size.
    fn find_maxima(&self, threshold: f32) -> Vec<Keypoint> {
        let mut keypoints = vec![];
        for level in 1..self.layers.len() - 1 {
            let layer = &self.layers[level];
            let (width, height) = (layer.width(), layer.height());
            if width < 3 || height < 3 {
                continue;
            }
            for gy in 1..height - 1 {
                for gx in 1..width - 1 {
                    let value = layer.get(gx, gy);
                    if value <= threshold || !self.is_strict_maximum(level, gx, gy, value) {
                        continue;
                    }
                    if let Some(keypoint) = self.interpolate(level, gx, gy) {
                        keypoints.push(keypoint);
                    }
                }
            }
        }
        keypoints
    }

    fn is_strict_maximum(&self, level: usize, x: usize, y: usize, value: f32) -> bool {
        self.layers[level - 1..=level + 1].iter().enumerate().all(|(l, layer)| {
            (y - 1..=y + 1).all(|ny| {
                (x - 1..=x + 1)
                    .all(|nx| (l == 1 && nx == x && ny == y) || value > layer.get(nx, ny))
            })
        })
    }

    /// One quadratic interpolation step around a discrete maximum.
    fn interpolate(&self, level: usize, x: usize, y: usize) -> Option<Keypoint> {
        let (prev, curr, next) =
            (&self.layers[level - 1], &self.layers[level], &self.layers[level + 1]);
        let at = |img: &GrayFloatImage, dx: isize, dy: isize| {
            f64::from(img.get((x as isize + dx) as usize, (y as isize + dy) as usize))
        };
        let center = at(curr, 0, 0);
        let gradient = Vector3::new(
            (at(curr, 1, 0) - at(curr, -1, 0)) * 0.5,
            (at(curr, 0, 1) - at(curr, 0, -1)) * 0.5,
            (at(next, 0, 0) - at(prev, 0, 0)) * 0.5,
        );
        let dxx = at(curr, 1, 0) + at(curr, -1, 0) - 2.0 * center;
        let dyy = at(curr, 0, 1) + at(curr, 0, -1) - 2.0 * center;
        let dss = at(next, 0, 0) + at(prev, 0, 0) - 2.0 * center;
        let dxy = (at(curr, 1, 1) - at(curr, -1, 1) - at(curr, 1, -1) + at(curr, -1, -1)) * 0.25;
        let dxs = (at(next, 1, 0) - at(next, -1, 0) - at(prev, 1, 0) + at(prev, -1, 0)) * 0.25;
        let dys = (at(next, 0, 1) - at(next, 0, -1) - at(prev, 0, 1) + at(prev, 0, -1)) * 0.25;
        let hessian = Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss);
        let offset = -hessian.lu().solve(&gradient)?;
        if !offset.iter().all(|o| o.is_finite() && o.abs() <= 1.0) {
            return None;
        }
        let step = self.step as f64;
        let size_step = (self.sizes[level] - self.sizes[level - 1]) as f64;
        Some(Keypoint {
            x: ((x as f64 + offset[0]) * step) as f32,
            y: ((y as f64 + offset[1]) * step) as f32,
            size: (self.sizes[level] as f64 + offset[2] * size_step).round() as f32,
            angle: 0.0,
            response: center as f32,
        })
    }
}

/// Precomputed SURF responses, searchable at any Hessian threshold.
#[derive(Debug, Clone)]
pub struct SurfScaleSpace {
    pub integral: IntegralImage,
    pub octaves: Vec<SurfOctave>,
}

impl SurfScaleSpace {
    pub fn new(image: &GrayFloatImage, num_octaves: usize, num_layers: usize) -> Self {
        let integral = IntegralImage::new(image);
        let smallest = integral.width().min(integral.height());
        let octaves = (0..num_octaves)
            .map_while(|octave| {
                // The largest filter of the octave must fit in the image.
                let largest =
                    (BASE_FILTER_SIZE + FILTER_SIZE_INCREMENT * (num_layers + 1)) << octave;
                if largest > smallest {
                    return None;
                }
                Some(SurfOctave::new(&integral, octave, num_layers))
            })
            .collect();
        Self { integral, octaves }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Surf {
    pub upright: bool,
}

impl Surf {
    pub fn new(upright: bool) -> Self {
        Self { upright }
    }

    /// Keypoints with a determinant above `threshold`, oriented unless upright.
    pub fn detect(&self, space: &SurfScaleSpace, threshold: f64) -> Vec<Keypoint> {
        let mut keypoints: Vec<Keypoint> = space
            .octaves
            .iter()
            .flat_map(|octave| octave.find_maxima(threshold as f32))
            .collect();
        if !self.upright {
            for keypoint in keypoints.iter_mut() {
                keypoint.angle = orientation(&space.integral, keypoint).to_degrees();
            }
        }
        keypoints
    }

    /// 64-d descriptors of the keypoints, one row each.
    pub fn describe(&self, space: &SurfScaleSpace, keypoints: &[Keypoint]) -> Array2<f32> {
        let mut descriptors = Array2::zeros((keypoints.len(), msurf::DESCRIPTOR_SIZE));
        for (mut row, keypoint) in descriptors.outer_iter_mut().zip(keypoints) {
            let s = sample_scale(keypoint);
            let wavelet = 2 * (s.round() as usize).max(1);
            let descriptor = msurf::surf_descriptor(
                SurfLayout::Surf,
                keypoint.x,
                keypoint.y,
                s,
                keypoint.angle.to_radians(),
                |x, y| space.integral.haar_responses(x, y, wavelet),
            );
            for (out, value) in row.iter_mut().zip(descriptor.iter()) {
                *out = *value;
            }
        }
        descriptors
    }
}

/// Scale of a keypoint, the sigma of the Gaussian its filter size approximates.
fn sample_scale(keypoint: &Keypoint) -> f32 {
    keypoint.size * 1.2 / BASE_FILTER_SIZE as f32
}

/// Orientation in radians from Haar responses on a disc of radius 6s.
fn orientation(integral: &IntegralImage, keypoint: &Keypoint) -> f32 {
    let s = sample_scale(keypoint);
    let wavelet = 2 * ((2.0 * s).round() as usize).max(1);
    msurf::dominant_orientation(keypoint.x, keypoint.y, s, |x, y| {
        integral.haar_responses(x, y, wavelet)
    })
}

/// Run SURF with adaptive Hessian threshold search.
pub fn extract(
    image: &GrayFloatImage,
    config: &FeaturesConfig,
    target_count: usize,
) -> DetectorOutput {
    let surf = Surf::new(config.surf_upright);
    let space = SurfScaleSpace::new(image, config.surf_n_octaves, config.surf_n_octavelayers);
    trace!("SURF responses computed for {} octaves", space.octaves.len());
    let search = AdaptiveThreshold::new(
        config.surf_hessian_threshold,
        config.feature_adaptive_threshold_floor,
    );
    let result = search.search(target_count, |threshold| surf.detect(&space, threshold));
    let keypoints = result.detections;
    let mut descriptors = surf.describe(&space, &keypoints);
    if config.feature_root {
        descriptors = root_feature_surf(&descriptors, false, surf.upright);
    }
    DetectorOutput::new(&keypoints, Descriptors::Float(descriptors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeatureType;
    use approx::assert_relative_eq;

    fn blob_image() -> GrayFloatImage {
        GrayFloatImage(Array2::from_shape_fn((120, 120), |(y, x)| {
            let d2 = (x as f32 - 60.0).powi(2) + (y as f32 - 60.0).powi(2);
            0.1 + 0.8 * (-d2 / (2.0 * 5.0 * 5.0)).exp()
        }))
    }

    #[test]
    fn integral_box_sums() {
        let image = GrayFloatImage(Array2::from_elem((4, 5), 1.0 / 255.0));
        let integral = IntegralImage::new(&image);
        assert_relative_eq!(integral.box_sum(0, 0, 5, 4), 20.0, epsilon = 1e-9);
        assert_relative_eq!(integral.box_sum(1, 1, 3, 4), 6.0, epsilon = 1e-9);
    }

    #[test]
    fn haar_responses_follow_the_gradient() {
        let ramp = GrayFloatImage(Array2::from_shape_fn((20, 20), |(_, x)| x as f32 / 255.0));
        let integral = IntegralImage::new(&ramp);
        let (dx, dy) = integral.haar_responses(10.0, 10.0, 4);
        assert!(dx > 0.0);
        assert_relative_eq!(dy, 0.0, epsilon = 1e-4);
        assert_eq!(integral.haar_responses(0.0, 0.0, 4), (0.0, 0.0));
    }

    #[test]
    fn pattern_resizing_scales_boxes() {
        let resized = resize_pattern(&DXX_PATTERN, 15);
        assert_eq!(resized[0], (0, 3, 5, 12, 1.0));
        assert_eq!(resized[2].2, 15);
    }

    #[test]
    fn detects_a_blob_at_its_center() {
        let space = SurfScaleSpace::new(&blob_image(), 4, 3);
        let keypoints = Surf::new(true).detect(&space, 100.0);
        assert!(!keypoints.is_empty());
        let best = keypoints
            .iter()
            .max_by(|a, b| a.response.total_cmp(&b.response))
            .map(|kp| (kp.x, kp.y));
        let (x, y) = best.unwrap_or_default();
        assert!((x - 60.0).abs() < 2.0 && (y - 60.0).abs() < 2.0);
    }

    #[test]
    fn extract_produces_64_wide_descriptors() {
        let config = FeaturesConfig::new(FeatureType::Surf);
        let output = extract(&blob_image(), &config, 1);
        assert!(!output.is_empty());
        assert_eq!(output.descriptors.width(), 64);
        assert_eq!(output.descriptors.len(), output.len());
    }

    #[test]
    fn tiny_images_have_no_octaves() {
        let tiny = GrayFloatImage::new(10, 10);
        let space = SurfScaleSpace::new(&tiny, 4, 3);
        assert!(space.octaves.is_empty());
        let config = FeaturesConfig::new(FeatureType::Surf);
        let output = extract(&tiny, &config, 10);
        assert_eq!(output.points.dim(), (0, 4));
        assert_eq!(output.descriptors.width(), 64);
    }
}
