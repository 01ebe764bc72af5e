use super::derivatives::{simple_scharr_horizontal, simple_scharr_vertical};
use crate::image::{gaussian_blur, GrayFloatImage};
use float_ord::FloatOrd;
use log::*;

/// Contrast factor used when no gradient histogram can be computed.
const FALLBACK_CONTRAST: f64 = 0.03;

/// Empirical contrast factor `k`: the `percentile` of the gradient magnitude
/// histogram of the image smoothed at `gradient_histogram_scale`.
pub fn compute_contrast_factor(
    image: &GrayFloatImage,
    percentile: f64,
    gradient_histogram_scale: f64,
    num_bins: usize,
) -> f64 {
    if image.width() < 3 || image.height() < 3 || num_bins == 0 {
        return FALLBACK_CONTRAST;
    }
    let gaussian = gaussian_blur(image, gradient_histogram_scale as f32);
    let lx = simple_scharr_horizontal(&gaussian);
    let ly = simple_scharr_vertical(&gaussian);
    let magnitudes: Vec<f64> = (1..gaussian.height() - 1)
        .flat_map(|y| (1..gaussian.width() - 1).map(move |x| (x, y)))
        .map(|(x, y)| (f64::from(lx.get(x, y)).powi(2) + f64::from(ly.get(x, y)).powi(2)).sqrt())
        .collect();
    let hmax = magnitudes
        .iter()
        .copied()
        .map(FloatOrd)
        .max()
        .map_or(0.0, |m| m.0);
    if hmax <= 0.0 {
        return FALLBACK_CONTRAST;
    }
    let mut histogram = vec![0usize; num_bins];
    let mut num_points = 0usize;
    for &modg in magnitudes.iter().filter(|&&m| m != 0.0) {
        let bin_number = ((num_bins as f64 * (modg / hmax)).floor() as usize).min(num_bins - 1);
        histogram[bin_number] += 1;
        num_points += 1;
    }
    let threshold = (num_points as f64 * percentile) as usize;
    let mut k = 0;
    let mut num_elements = 0;
    while num_elements < threshold && k < num_bins {
        num_elements += histogram[k];
        k += 1;
    }
    debug!(
        "hmax: {}, threshold: {}, num_elements: {}",
        hmax, threshold, num_elements
    );
    if num_elements >= threshold {
        hmax * (k as f64) / (num_bins as f64)
    } else {
        FALLBACK_CONTRAST
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn flat_image_falls_back() {
        let flat = GrayFloatImage(Array2::from_elem((32, 32), 0.5));
        assert_eq!(compute_contrast_factor(&flat, 0.7, 1.0, 300), FALLBACK_CONTRAST);
    }

    #[test]
    fn contrast_grows_with_gradient_strength() {
        let ramp = |slope: f32| {
            GrayFloatImage(Array2::from_shape_fn((32, 32), |(y, x)| {
                slope * (x as f32 + ((y * 3) % 5) as f32)
            }))
        };
        let weak = compute_contrast_factor(&ramp(0.001), 0.7, 1.0, 300);
        let strong = compute_contrast_factor(&ramp(0.01), 0.7, 1.0, 300);
        assert!(strong > weak);
    }
}
