//! Gaussian scale space shared by the blob detectors.

use crate::image::{gaussian_blur, GrayFloatImage};
use log::*;
use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;

/// Incremental blur applied to produce each level of an octave from the previous.
///
/// The first entry is the blur of the octave base itself.
pub fn gaussian_kernels(sigma: f64, num_intervals: usize) -> Vec<f64> {
    let levels = num_intervals + 3;
    let k = 2f64.powf(1.0 / num_intervals as f64);
    let mut kernels = vec![sigma; levels];
    for (i, kernel) in kernels.iter_mut().enumerate().skip(1) {
        let previous = k.powi(i as i32 - 1) * sigma;
        let total = k * previous;
        *kernel = (total * total - previous * previous).sqrt();
    }
    kernels
}

/// Number of octaves for an image seeded at twice its resolution.
pub fn number_of_octaves(height: usize, width: usize) -> usize {
    let smallest = height.min(width).max(1) as f64;
    (smallest.log2() - 1.0).round().max(1.0) as usize
}

/// Upsample by two with bilinear interpolation.
pub fn upsample(image: &GrayFloatImage) -> GrayFloatImage {
    GrayFloatImage(Array2::from_shape_fn(
        (image.height() * 2, image.width() * 2),
        |(y, x)| image.sample_bilinear((x as f32 + 0.5) * 0.5 - 0.5, (y as f32 + 0.5) * 0.5 - 0.5),
    ))
}

/// Octaves of progressively blurred images.
///
/// Level `i` of every octave has blur `sigma * 2^(i / scales_per_octave)` measured
/// in that octave's pixels.
#[derive(Debug, Clone)]
pub struct GaussianPyramid {
    pub octaves: Vec<Vec<GrayFloatImage>>,
    pub sigma: f64,
    pub scales_per_octave: usize,
    /// Size of an octave 0 pixel in input pixels.
    pub base_pixel_size: f64,
}

impl GaussianPyramid {
    /// Build a pyramid with `scales_per_octave + 3` levels per octave.
    ///
    /// With `upsample_seed` the first octave works at twice the input resolution.
    /// Octaves stop before either side drops below `min_size`.
    pub fn build(
        image: &GrayFloatImage,
        sigma: f64,
        assumed_blur: f64,
        scales_per_octave: usize,
        upsample_seed: bool,
        min_size: usize,
    ) -> Self {
        let (seed, base_pixel_size, seed_blur) = if upsample_seed {
            (upsample(image), 0.5, 2.0 * assumed_blur)
        } else {
            (image.clone(), 1.0, assumed_blur)
        };
        let sigma_diff = (sigma * sigma - seed_blur * seed_blur).max(0.01).sqrt();
        let kernels = gaussian_kernels(sigma, scales_per_octave);
        let mut num_octaves = number_of_octaves(image.height(), image.width());
        if !upsample_seed {
            num_octaves = num_octaves.saturating_sub(1).max(1);
        }

        let mut octaves: Vec<Vec<GrayFloatImage>> = Vec::with_capacity(num_octaves);
        let mut base = gaussian_blur(&seed, sigma_diff as f32);
        for octave in 0..num_octaves {
            if base.width() < min_size || base.height() < min_size {
                break;
            }
            let mut levels = Vec::with_capacity(kernels.len());
            levels.push(base);
            for &kernel in &kernels[1..] {
                let next = gaussian_blur(&levels[levels.len() - 1], kernel as f32);
                levels.push(next);
            }
            trace!(
                "Octave {} built at {}x{}",
                octave,
                levels[0].width(),
                levels[0].height()
            );
            base = levels[scales_per_octave].decimate();
            octaves.push(levels);
        }
        Self {
            octaves,
            sigma,
            scales_per_octave,
            base_pixel_size,
        }
    }

    /// Size of a pixel of `octave` in input pixels.
    pub fn pixel_size(&self, octave: usize) -> f64 {
        self.base_pixel_size * 2f64.powi(octave as i32)
    }

    /// Blur of a fractional level in octave pixels.
    pub fn level_sigma(&self, level: f64) -> f64 {
        self.sigma * 2f64.powf(level / self.scales_per_octave as f64)
    }
}

/// Difference of consecutive levels of each octave.
pub fn difference_of_gaussians(pyramid: &GaussianPyramid) -> Vec<Vec<GrayFloatImage>> {
    pyramid
        .octaves
        .iter()
        .map(|levels| {
            levels
                .windows(2)
                .map(|pair| GrayFloatImage(&pair[1].0 - &pair[0].0))
                .collect()
        })
        .collect()
}

/// Whether `value` at `(x, y)` of `layers[1]` is an extremum of its 3x3x3 neighborhood.
///
/// Positive values must be at least as large as every neighbor, negative values at
/// most as large.
pub fn is_extremum(layers: [&GrayFloatImage; 3], x: usize, y: usize, value: f32) -> bool {
    let neighborhood = layers.iter().flat_map(|layer| {
        (y - 1..=y + 1).flat_map(move |yy| (x - 1..=x + 1).map(move |xx| layer.get(xx, yy)))
    });
    if value > 0.0 {
        neighborhood.fold(true, |acc, v| acc && value >= v)
    } else if value < 0.0 {
        neighborhood.fold(true, |acc, v| acc && value <= v)
    } else {
        false
    }
}

/// A scale-space extremum after quadratic interpolation.
#[derive(Debug, Clone, Copy)]
pub struct Refined {
    /// Integer location after the last interpolation step.
    pub x: usize,
    pub y: usize,
    pub level: usize,
    /// Sub-pixel offsets from the integer location.
    pub dx: f64,
    pub dy: f64,
    pub dlevel: f64,
    /// Interpolated response.
    pub value: f64,
    /// Spatial Hessian at the integer location.
    pub dxx: f64,
    pub dyy: f64,
    pub dxy: f64,
}

impl Refined {
    /// Whether the principal curvature ratio stays below `edge_threshold`.
    pub fn passes_edge_test(&self, edge_threshold: f64) -> bool {
        let trace = self.dxx + self.dyy;
        let det = self.dxx * self.dyy - self.dxy * self.dxy;
        det > 0.0 && trace * trace * edge_threshold < (edge_threshold + 1.0).powi(2) * det
    }
}

const MAX_INTERPOLATION_STEPS: usize = 5;

/// Fit a quadratic around a discrete extremum of `layers` and move towards its peak.
///
/// Returns `None` when the fit does not converge or leaves the region that is at
/// least `border` pixels from the image sides.
pub fn refine_extremum(
    layers: &[GrayFloatImage],
    mut level: usize,
    mut x: usize,
    mut y: usize,
    border: usize,
) -> Option<Refined> {
    let width = layers[level].width();
    let height = layers[level].height();
    for _ in 0..MAX_INTERPOLATION_STEPS {
        let (prev, curr, next) = (&layers[level - 1], &layers[level], &layers[level + 1]);
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

        if offset.iter().all(|o| o.abs() < 0.5) {
            return Some(Refined {
                x,
                y,
                level,
                dx: offset[0],
                dy: offset[1],
                dlevel: offset[2],
                value: center + 0.5 * gradient.dot(&offset),
                dxx,
                dyy,
                dxy,
            });
        }
        if offset.iter().any(|o| !o.is_finite() || o.abs() > (width + height) as f64) {
            return None;
        }
        let nx = x as isize + offset[0].round() as isize;
        let ny = y as isize + offset[1].round() as isize;
        let nlevel = level as isize + offset[2].round() as isize;
        if nlevel < 1
            || nlevel as usize + 1 >= layers.len()
            || nx < border as isize
            || ny < border as isize
            || nx as usize + border >= width
            || ny as usize + border >= height
        {
            return None;
        }
        x = nx as usize;
        y = ny as usize;
        level = nlevel as usize;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gaussian_kernels_default() {
        let expected = [1.6, 1.2262735, 1.54500779, 1.94658784, 2.452547, 3.09001559];
        for (k, e) in gaussian_kernels(1.6, 3).iter().zip(expected.iter()) {
            assert_relative_eq!(k, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn number_of_octaves_matches_image_size() {
        assert_eq!(number_of_octaves(100, 200), 6);
        assert_eq!(number_of_octaves(223, 324), 7);
        assert_eq!(number_of_octaves(1, 1), 1);
    }

    #[test]
    fn pyramid_levels_halve_per_octave() {
        let image = GrayFloatImage::new(64, 48);
        let pyramid = GaussianPyramid::build(&image, 1.6, 0.5, 3, true, 8);
        assert!(pyramid.octaves.len() >= 3);
        assert_eq!(pyramid.octaves[0][0].dim(), (96, 128));
        assert_eq!(pyramid.octaves[1][0].dim(), (48, 64));
        assert!(pyramid.octaves.iter().all(|o| o.len() == 6));
        assert_relative_eq!(pyramid.pixel_size(2), 2.0);
    }

    #[test]
    fn refines_a_quadratic_peak() {
        // A paraboloid peaking at (10.3, 9.8) on the middle of three layers.
        let layers: Vec<GrayFloatImage> = [0.9f32, 1.0, 0.9]
            .iter()
            .map(|&scale| {
                GrayFloatImage(Array2::from_shape_fn((20, 20), |(y, x)| {
                    let (dx, dy) = (x as f32 - 10.3, y as f32 - 9.8);
                    scale * (1.0 - 0.01 * (dx * dx + dy * dy))
                }))
            })
            .collect();
        let refined = refine_extremum(&layers, 1, 10, 10, 2).unwrap();
        assert_relative_eq!(refined.x as f64 + refined.dx, 10.3, epsilon = 1e-3);
        assert_relative_eq!(refined.y as f64 + refined.dy, 9.8, epsilon = 1e-3);
        assert_relative_eq!(refined.dlevel, 0.0, epsilon = 1e-6);
        assert!(refined.passes_edge_test(10.0));
    }
}
