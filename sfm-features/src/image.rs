use derive_more::{Deref, DerefMut};
use image::{GrayImage, ImageBuffer, Pixel, RgbImage};
use ndarray::{azip, s, Array2};
use std::f32;
use wide::f32x4;

/// Luminance weights used when collapsing RGB to a single channel.
const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// The floating point image every detector operates on.
///
/// Rows are indexed first, so `image[(y, x)]` addresses the pixel at column `x`
/// of row `y`. Values are expected to lie between 0 and 1.
#[derive(Debug, Clone, PartialEq, Deref, DerefMut)]
pub struct GrayFloatImage(pub Array2<f32>);

impl GrayFloatImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self(Array2::zeros((height, width)))
    }

    pub fn from_array2(array: Array2<f32>) -> Self {
        Self(array)
    }

    /// Create a unit float image from an 8-bit grayscale image.
    pub fn from_gray8(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self(Array2::from_shape_fn(
            (height as usize, width as usize),
            |(y, x)| f32::from(image.get_pixel(x as u32, y as u32)[0]) / 255.0,
        ))
    }

    /// Create a unit float luminance image from an 8-bit RGB image.
    pub fn from_rgb8(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let mut array = Array2::zeros((height as usize, width as usize));
        for (out, pixel) in array.iter_mut().zip(image.pixels()) {
            let luma: f32 = pixel
                .channels()
                .iter()
                .zip(LUMA_WEIGHTS.iter())
                .map(|(&c, &w)| f32::from(c) * w)
                .sum();
            *out = luma / 255.0;
        }
        Self(array)
    }

    pub fn zero_array(&self) -> Array2<f32> {
        Array2::zeros(self.dim())
    }

    pub fn width(&self) -> usize {
        self.0.ncols()
    }

    pub fn height(&self) -> usize {
        self.0.nrows()
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.0[(y, x)]
    }

    pub fn put(&mut self, x: usize, y: usize, pixel_value: f32) {
        self.0[(y, x)] = pixel_value;
    }

    /// Read a pixel, clamping the coordinates to the image bounds.
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width() as isize - 1) as usize;
        let y = y.clamp(0, self.height() as isize - 1) as usize;
        self.get(x, y)
    }

    /// Bilinear interpolation at a sub-pixel location.
    ///
    /// Locations outside the image take the value of the nearest border pixel.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        if self.width() == 0 || self.height() == 0 {
            return 0.0;
        }
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as isize, y0 as isize);
        let top = (1.0 - fx) * self.get_clamped(x0, y0) + fx * self.get_clamped(x0 + 1, y0);
        let bottom =
            (1.0 - fx) * self.get_clamped(x0, y0 + 1) + fx * self.get_clamped(x0 + 1, y0 + 1);
        (1.0 - fy) * top + fy * bottom
    }

    /// Downsample by two, averaging 2x2 tiles.
    pub fn half_size(&self) -> Self {
        let width = self.width() / 2;
        let height = self.height() / 2;
        let mut half = Array2::zeros((height, width));

        azip!((
            out in &mut half,
            window in self.slice(s![..height * 2, ..width * 2]).exact_chunks((2, 2)),
        ) {
            *out = window.sum() * 0.25;
        });

        Self(half)
    }

    /// Keep every other pixel in both directions.
    pub fn decimate(&self) -> Self {
        Self(self.slice(s![..;2, ..;2]).to_owned())
    }

    /// Area-averaging resize to an arbitrary size.
    pub fn resize_area(&self, width: usize, height: usize) -> Self {
        let source: Vec<f32> = self.iter().copied().collect();
        let data = resample_area(&source, (self.width(), self.height()), 1, (width, height));
        Self(Array2::from_shape_fn((height, width), |(y, x)| data[y * width + x]))
    }
}

pub fn horizontal_filter(image: &GrayFloatImage, kernel: &[f32]) -> GrayFloatImage {
    debug_assert!(kernel.len() % 2 == 1);
    let half = kernel.len() / 2;
    let width = image.width();
    let mut output = image.zero_array();
    if width == 0 {
        return GrayFloatImage(output);
    }
    // Pad the kernel with zeros up to a multiple of the lane count.
    let kernel_simd = kernel
        .chunks(4)
        .map(|chunk| {
            let mut lanes = [0f32; 4];
            lanes[..chunk.len()].copy_from_slice(chunk);
            f32x4::new(lanes)
        })
        .collect::<Vec<_>>();
    let simd_len = kernel_simd.len() * 4;
    let mut scratch = vec![0f32; width + 2 * half + (simd_len - kernel.len())];
    for (row_in, mut row_out) in image.rows().into_iter().zip(output.rows_mut()) {
        scratch[..half].fill(row_in[0]);
        for (dst, &src) in scratch[half..half + width].iter_mut().zip(row_in.iter()) {
            *dst = src;
        }
        scratch[half + width..2 * half + width].fill(row_in[width - 1]);
        scratch[2 * half + width..].fill(0.);
        for (window, out) in scratch.windows(simd_len).zip(row_out.iter_mut()) {
            *out = window
                .chunks_exact(4)
                .map(|chunk| f32x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .zip(kernel_simd.iter())
                .fold(f32x4::splat(0.), |acc, (a, b)| a.mul_add(*b, acc))
                .reduce_add();
        }
    }
    GrayFloatImage(output)
}

pub fn vertical_filter(image: &GrayFloatImage, kernel: &[f32]) -> GrayFloatImage {
    debug_assert!(kernel.len() % 2 == 1);
    let half = kernel.len() / 2;
    let height = image.height();
    let mut output = image.zero_array();
    if height == 0 {
        return GrayFloatImage(output);
    }
    // Accumulating whole rows keeps memory access sequential.
    for (y, mut row_out) in output.rows_mut().into_iter().enumerate() {
        for (k, &weight) in kernel.iter().enumerate() {
            let source = (y + k).saturating_sub(half).min(height - 1);
            row_out.scaled_add(weight, &image.row(source));
        }
    }
    GrayFloatImage(output)
}

pub fn separable_filter(
    image: &GrayFloatImage,
    h_kernel: &[f32],
    v_kernel: &[f32],
) -> GrayFloatImage {
    let h = horizontal_filter(image, h_kernel);
    vertical_filter(&h, v_kernel)
}

/// The Gaussian function.
fn gaussian(x: f32, r: f32) -> f32 {
    ((2.0 * f32::consts::PI).sqrt() * r).recip() * (-x.powi(2) / (2.0 * r.powi(2))).exp()
}

/// Generate a normalized Gaussian kernel of odd size with standard deviation `r`.
pub fn gaussian_kernel(r: f32, kernel_size: usize) -> Vec<f32> {
    debug_assert!(kernel_size % 2 == 1, "kernel_size must be odd");
    let half_width = (kernel_size / 2) as i32;
    let mut kernel: Vec<f32> = (-half_width..=half_width)
        .map(|i| gaussian(i as f32, r))
        .collect();
    let sum: f32 = kernel.iter().sum();
    for val in kernel.iter_mut() {
        *val /= sum;
    }
    kernel
}

/// Perform Gaussian blur with standard deviation `r`.
///
/// The kernel extends three standard deviations on each side. A non-positive
/// sigma returns the image unchanged.
pub fn gaussian_blur(image: &GrayFloatImage, r: f32) -> GrayFloatImage {
    if r <= 0.0 {
        return image.clone();
    }
    let kernel_radius = (3.0 * r).ceil() as usize;
    let kernel = gaussian_kernel(r, kernel_radius * 2 + 1);
    separable_filter(image, &kernel, &kernel)
}

/// Source taps and weights contributing to each destination sample of an
/// area-averaging resample along one axis.
fn area_taps(src: usize, dst: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = start + scale;
            let mut taps = vec![];
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src {
                let lo = (s as f64).max(start);
                let hi = ((s + 1) as f64).min(end);
                if hi > lo {
                    taps.push((s, ((hi - lo) / scale) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Area-averaging resample of an interleaved buffer with `channels` samples per pixel.
pub fn resample_area(
    data: &[f32],
    (src_w, src_h): (usize, usize),
    channels: usize,
    (dst_w, dst_h): (usize, usize),
) -> Vec<f32> {
    if src_w == 0 || src_h == 0 {
        return vec![0.0; dst_w * dst_h * channels];
    }
    let columns = area_taps(src_w, dst_w);
    let rows = area_taps(src_h, dst_h);
    // Horizontal pass into an intermediate of src_h rows.
    let mut horizontal = vec![0f32; src_h * dst_w * channels];
    for y in 0..src_h {
        let src_row = &data[y * src_w * channels..(y + 1) * src_w * channels];
        let dst_row = &mut horizontal[y * dst_w * channels..(y + 1) * dst_w * channels];
        for (x, taps) in columns.iter().enumerate() {
            for &(s, w) in taps {
                for c in 0..channels {
                    dst_row[x * channels + c] += w * src_row[s * channels + c];
                }
            }
        }
    }
    let stride = dst_w * channels;
    let mut output = vec![0f32; dst_h * stride];
    for (y, taps) in rows.iter().enumerate() {
        let dst_row = &mut output[y * stride..(y + 1) * stride];
        for &(s, w) in taps {
            for (out, &value) in dst_row.iter_mut().zip(&horizontal[s * stride..(s + 1) * stride]) {
                *out += w * value;
            }
        }
    }
    output
}

/// Area-averaging resize of an 8-bit image.
pub fn resize_area<P>(
    image: &ImageBuffer<P, Vec<u8>>,
    width: u32,
    height: u32,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let channels = P::CHANNEL_COUNT as usize;
    let source: Vec<f32> = image.as_raw().iter().map(|&v| f32::from(v)).collect();
    let resized = resample_area(
        &source,
        (image.width() as usize, image.height() as usize),
        channels,
        (width as usize, height as usize),
    );
    let bytes: Vec<u8> = resized
        .iter()
        .map(|&v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    ImageBuffer::from_fn(width, height, |x, y| {
        let start = (y as usize * width as usize + x as usize) * channels;
        *P::from_slice(&bytes[start..start + channels])
    })
}

/// Replicate a single-channel image into three identical RGB channels.
pub fn replicate_channel(image: &GrayImage) -> RgbImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        let value = image.get_pixel(x, y)[0];
        image::Rgb([value, value, value])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;

    fn ramp(width: usize, height: usize) -> GrayFloatImage {
        GrayFloatImage(Array2::from_shape_fn((height, width), |(y, x)| {
            ((x * 7 + y * 13) % 17) as f32 / 17.0
        }))
    }

    /// Direct convolution with replicated borders.
    fn naive_horizontal(image: &GrayFloatImage, kernel: &[f32]) -> GrayFloatImage {
        let half = (kernel.len() / 2) as isize;
        let mut out = image.clone();
        for y in 0..image.height() {
            for x in 0..image.width() {
                let mut acc = 0.0;
                for (k, &w) in kernel.iter().enumerate() {
                    acc += w * image.get_clamped(x as isize + k as isize - half, y as isize);
                }
                out.put(x, y, acc);
            }
        }
        out
    }

    #[test]
    fn gaussian_kernel_correct() {
        let kernel = gaussian_kernel(3.0, 7);
        let known_correct_kernel = [
            0.1062_8852,
            0.1403_2133,
            0.1657_7007,
            0.1752_4014,
            0.1657_7007,
            0.1403_2133,
            0.1062_8852,
        ];
        for (i, j) in kernel.iter().zip(known_correct_kernel.iter()) {
            assert!(f32::abs(*i - *j) < 0.0001);
        }
    }

    #[test]
    fn horizontal_filter_matches_direct_convolution() {
        let image = ramp(23, 9);
        let kernel = gaussian_kernel(1.5, 9);
        let ours = horizontal_filter(&image, &kernel);
        let direct = naive_horizontal(&image, &kernel);
        for (a, b) in ours.iter().zip(direct.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn vertical_filter_is_transposed_horizontal() {
        let image = ramp(11, 19);
        let kernel = gaussian_kernel(2.0, 7);
        let vertical = vertical_filter(&image, &kernel);
        let transposed = GrayFloatImage(image.t().to_owned());
        let horizontal = horizontal_filter(&transposed, &kernel);
        for (a, b) in vertical.iter().zip(horizontal.t().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn blur_preserves_constant_image() {
        let image = GrayFloatImage(Array2::from_elem((12, 15), 0.25));
        let blurred = gaussian_blur(&image, 1.6);
        for &v in blurred.iter() {
            assert_relative_eq!(v, 0.25, epsilon = 1e-5);
        }
    }

    #[test]
    fn half_size_averages_tiles() {
        let image = GrayFloatImage(Array2::from_shape_fn((4, 5), |(y, x)| (y * 5 + x) as f32));
        let half = image.half_size();
        assert_eq!(half.dim(), (2, 2));
        assert_relative_eq!(half.get(0, 0), (0.0 + 1.0 + 5.0 + 6.0) / 4.0);
        assert_relative_eq!(half.get(1, 1), (12.0 + 13.0 + 17.0 + 18.0) / 4.0);
    }

    #[test]
    fn area_resize_averages_blocks() {
        let image = GrayImage::from_fn(4, 4, |x, _| Luma([if x < 2 { 0 } else { 200 }]));
        let resized = resize_area(&image, 2, 2);
        assert_eq!(resized.dimensions(), (2, 2));
        assert_eq!(resized.get_pixel(0, 0)[0], 0);
        assert_eq!(resized.get_pixel(1, 1)[0], 200);

        let odd = resize_area(&image, 3, 3);
        assert_eq!(odd.get_pixel(1, 0)[0], 100);
    }

    #[test]
    fn bilinear_sampling_interpolates() {
        let image = GrayFloatImage(Array2::from_shape_fn((2, 2), |(y, x)| (x + 2 * y) as f32));
        assert_relative_eq!(image.sample_bilinear(0.5, 0.5), 1.5);
        assert_relative_eq!(image.sample_bilinear(-3.0, 0.0), 0.0);
        assert_relative_eq!(image.sample_bilinear(1.0, 5.0), 3.0);
    }

    #[test]
    fn replicated_channels_are_equal() {
        let gray = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 10 + y) as u8]));
        let rgb = replicate_channel(&gray);
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let v = gray.get_pixel(x, y)[0];
            assert_eq!(pixel.0, [v, v, v]);
        }
    }

    #[test]
    fn luminance_of_gray_rgb_matches_gray() {
        let gray = GrayImage::from_fn(5, 4, |x, y| Luma([(x * 40 + y * 3) as u8]));
        let from_rgb = GrayFloatImage::from_rgb8(&replicate_channel(&gray));
        let from_gray = GrayFloatImage::from_gray8(&gray);
        for (a, b) in from_rgb.iter().zip(from_gray.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }
}
