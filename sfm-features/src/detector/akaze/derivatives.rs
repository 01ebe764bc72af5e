use crate::image::{separable_filter, GrayFloatImage};

/// 3x3 Scharr derivative along x, like `cv::Scharr` with xorder=1, yorder=0.
pub fn simple_scharr_horizontal(image: &GrayFloatImage) -> GrayFloatImage {
    separable_filter(image, &[-1., 0., 1.], &[3., 10., 3.])
}

/// 3x3 Scharr derivative along y, like `cv::Scharr` with xorder=0, yorder=1.
pub fn simple_scharr_vertical(image: &GrayFloatImage) -> GrayFloatImage {
    separable_filter(image, &[3., 10., 3.], &[-1., 0., 1.])
}

/// Scharr derivative along x at scale `sigma_size`, with a separable kernel.
pub fn scharr_horizontal(image: &GrayFloatImage, sigma_size: u32) -> GrayFloatImage {
    if sigma_size <= 1 {
        return simple_scharr_horizontal(image);
    }
    let main_kernel = scharr_kernel(sigma_size, FilterOrder::Main);
    let off_kernel = scharr_kernel(sigma_size, FilterOrder::Off);
    separable_filter(image, &main_kernel, &off_kernel)
}

/// Scharr derivative along y at scale `sigma_size`, with a separable kernel.
pub fn scharr_vertical(image: &GrayFloatImage, sigma_size: u32) -> GrayFloatImage {
    if sigma_size <= 1 {
        return simple_scharr_vertical(image);
    }
    let main_kernel = scharr_kernel(sigma_size, FilterOrder::Main);
    let off_kernel = scharr_kernel(sigma_size, FilterOrder::Off);
    separable_filter(image, &off_kernel, &main_kernel)
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum FilterOrder {
    Main,
    Off,
}

fn scharr_kernel(sigma_size: u32, order: FilterOrder) -> Vec<f32> {
    // Difference between middle and sides of main axis filter.
    let w = 10.0 / 3.0;
    // Side intensity of filter.
    let norm = (1.0 / (2.0 * f64::from(sigma_size) * (w + 2.0))) as f32;
    // Middle intensity of filter.
    let middle = norm * w as f32;
    let ksize = (3 + 2 * (sigma_size - 1)) as usize;
    let mut kernel = vec![0.0; ksize];
    match order {
        FilterOrder::Main => {
            kernel[0] = -1.0;
            kernel[ksize - 1] = 1.0;
        }
        FilterOrder::Off => {
            kernel[0] = norm;
            kernel[ksize / 2] = middle;
            kernel[ksize - 1] = norm;
        }
    };
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn scaled_scharr_of_linear_ramp() {
        // The scaled kernels are normalized to measure the slope itself.
        let ramp = GrayFloatImage(Array2::from_shape_fn((20, 20), |(_, x)| 0.5 * x as f32));
        let dx = scharr_horizontal(&ramp, 3);
        assert_relative_eq!(dx.get(10, 10), 0.5, epsilon = 1e-4);
        let dy = scharr_vertical(&ramp, 3);
        assert_relative_eq!(dy.get(10, 10), 0.0, epsilon = 1e-5);
    }
}
