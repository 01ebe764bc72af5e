//! Turning one image into a normalized feature set.

use crate::config::FeaturesConfig;
use crate::detector::run_feature_extractor;
use crate::features_data::FeaturesData;
use crate::image::{replicate_channel, resize_area, GrayFloatImage};
use crate::normalize::normalize_features;
use crate::panorama::{default_subshot_width, extract_cubemap_features};
use crate::Result;
use image::{DynamicImage, GrayImage, RgbImage};
use log::*;
use ndarray::Array2;
use std::time::Instant;

/// Size of an image whose larger side is brought down to `max_size`.
///
/// Returns `None` when no resize is needed, including when `max_size` is zero.
pub fn resized_dimensions(width: u32, height: u32, max_size: u32) -> Option<(u32, u32)> {
    let size = width.max(height);
    if max_size == 0 || max_size >= size {
        return None;
    }
    let scale = |v: u32| (u64::from(v) * u64::from(max_size) / u64::from(size)) as u32;
    Some((scale(width), scale(height)))
}

/// Convert to the pixel layout used for detection and colors.
///
/// Images without color channels stay single channel.
fn prepare_pixels(image: &DynamicImage, max_size: u32) -> (GrayFloatImage, RgbImage) {
    let is_gray = image.color().channel_count() <= 2;
    let (width, height) = (image.width(), image.height());
    let dims = resized_dimensions(width, height, max_size);
    if is_gray {
        let mut gray: GrayImage = image.to_luma8();
        if let Some((w, h)) = dims {
            gray = resize_area(&gray, w, h);
        }
        (GrayFloatImage::from_gray8(&gray), replicate_channel(&gray))
    } else {
        let mut rgb = image.to_rgb8();
        if let Some((w, h)) = dims {
            rgb = resize_area(&rgb, w, h);
        }
        (GrayFloatImage::from_rgb8(&rgb), rgb)
    }
}

/// Colors of the pixels nearest to each `(x, y, ..)` row.
pub fn sample_colors(image: &RgbImage, points: &Array2<f64>) -> Array2<u8> {
    let (width, height) = image.dimensions();
    let mut colors = Array2::zeros((points.nrows(), 3));
    if width == 0 || height == 0 {
        return colors;
    }
    for (point, mut color) in points.rows().into_iter().zip(colors.rows_mut()) {
        let x = point[0].round().clamp(0.0, f64::from(width - 1)) as u32;
        let y = point[1].round().clamp(0.0, f64::from(height - 1)) as u32;
        let pixel = image.get_pixel(x, y);
        for c in 0..3 {
            color[c] = pixel[c];
        }
    }
    colors
}

/// Detect features in a color or grayscale image.
///
/// The image is shrunk to the configured process size, detected on with the
/// configured backend (through a cubemap for panoramas when enabled), and the
/// keypoints are returned in normalized image coordinates of the shrunk image.
pub fn extract_features(
    image: &DynamicImage,
    config: &FeaturesConfig,
    is_panorama: bool,
) -> Result<FeaturesData> {
    config.validate()?;
    let start = Instant::now();
    let (process_size, target_count) = if is_panorama {
        (config.feature_process_size_panorama, config.feature_min_frames_panorama)
    } else {
        (config.feature_process_size, config.feature_min_frames)
    };

    let (gray, colors_image) = prepare_pixels(image, process_size);
    let (width, height) = colors_image.dimensions();
    info!(
        "Extracting {} features from a {}x{} image (processed at {}x{})",
        config.feature_type,
        image.width(),
        image.height(),
        width,
        height
    );

    let output = if is_panorama && config.feature_extract_from_cubemap_panorama {
        let subshot_width = if process_size > 0 {
            process_size
        } else {
            default_subshot_width(width)
        };
        debug!("Cubemap extraction with {}x{} faces", subshot_width, subshot_width);
        extract_cubemap_features(&gray, config, target_count, subshot_width)
    } else {
        run_feature_extractor(&gray, config, target_count)
    };

    let colors = sample_colors(&colors_image, &output.points);
    let points = normalize_features(&output.points, width, height).mapv(|v| v as f32);
    info!(
        "Found {} features in {:.3}s",
        points.nrows(),
        start.elapsed().as_secs_f64()
    );
    Ok(FeaturesData::new(points, output.descriptors, colors, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeatureType;
    use image::{Luma, Rgb};

    fn squares<P>(background: P, square: P) -> image::ImageBuffer<P, Vec<u8>>
    where
        P: image::Pixel<Subpixel = u8> + 'static,
    {
        image::ImageBuffer::from_fn(240, 240, |x, y| {
            let inside =
                |x0: u32, y0: u32, side: u32| x >= x0 && x < x0 + side && y >= y0 && y < y0 + side;
            if inside(50, 50, 40) || inside(130, 60, 50) || inside(70, 140, 60) {
                square
            } else {
                background
            }
        })
    }

    #[test]
    fn resize_keeps_aspect_and_skips_small_images() {
        assert_eq!(resized_dimensions(4000, 3000, 2048), Some((2048, 1536)));
        assert_eq!(resized_dimensions(3000, 4000, 2048), Some((1536, 2048)));
        assert_eq!(resized_dimensions(640, 480, 2048), None);
        assert_eq!(resized_dimensions(640, 480, 640), None);
        assert_eq!(resized_dimensions(4000, 3000, 0), None);
        assert_eq!(resized_dimensions(101, 7, 50), Some((50, 3)));
    }

    #[test]
    fn colors_are_sampled_at_rounded_clamped_pixels() {
        let image = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8, y as u8, 7]));
        let points = ndarray::array![
            [1.4, 1.6, 1.0, 0.0],
            [-3.0, 10.0, 1.0, 0.0],
            [2.5, 0.2, 1.0, 0.0]
        ];
        let colors = sample_colors(&image, &points);
        assert_eq!(colors, ndarray::array![[1, 2, 7], [0, 2, 7], [3, 0, 7]]);
    }

    #[test]
    fn gray_images_get_replicated_colors() {
        let mut config = FeaturesConfig::new(FeatureType::Orb);
        config.feature_min_frames = 30;
        let image = DynamicImage::ImageLuma8(squares(Luma([25u8]), Luma([230u8])));
        let features = extract_features(&image, &config, false).unwrap();
        assert!(!features.is_empty());
        assert_eq!(features.colors.nrows(), features.len());
        assert_eq!(features.descriptors.len(), features.len());
        for color in features.colors.rows() {
            assert_eq!(color[0], color[1]);
            assert_eq!(color[1], color[2]);
        }
    }

    #[test]
    fn color_points_are_normalized() {
        let mut config = FeaturesConfig::new(FeatureType::Orb);
        config.feature_min_frames = 30;
        let image = DynamicImage::ImageRgb8(squares(Rgb([20u8, 20, 20]), Rgb([240u8, 30, 30])));
        let features = extract_features(&image, &config, false).unwrap();
        assert!(!features.is_empty());
        for (point, color) in features.points.rows().into_iter().zip(features.colors.rows()) {
            assert!(point[0].abs() <= 0.5 && point[1].abs() <= 0.5);
            assert!(point[2] > 0.0 && point[2] < 1.0);
            assert!(color.to_vec() == vec![20, 20, 20] || color.to_vec() == vec![240, 30, 30]);
        }
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = FeaturesConfig::new(FeatureType::Sift);
        config.sift_peak_threshold = -1.0;
        let image = DynamicImage::ImageLuma8(GrayImage::new(16, 16));
        assert!(extract_features(&image, &config, false).is_err());
    }
}
