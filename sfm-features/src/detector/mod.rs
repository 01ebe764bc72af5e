//! Keypoint detectors and the dispatch between them.

pub mod adaptive;
pub mod akaze;
pub mod hahog;
pub mod msurf;
pub mod orb;
pub mod scale_space;
pub mod sift;
pub mod surf;

use crate::config::{FeatureType, FeaturesConfig};
use crate::features_data::Descriptors;
use crate::image::GrayFloatImage;
use log::*;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use std::time::Instant;

/// A point of interest in pixel coordinates.
///
/// +x faces right and +y faces down, with the origin at the top-left pixel center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the meaningful neighborhood in pixels.
    pub size: f32,
    /// Orientation in the detector's native units.
    pub angle: f32,
    /// The magnitude of response from the detector.
    pub response: f32,
}

/// Keypoints and descriptors of one detector run.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorOutput {
    /// One `(x, y, size, angle)` row per keypoint, in pixels.
    pub points: Array2<f64>,
    pub descriptors: Descriptors,
}

impl DetectorOutput {
    pub fn new(keypoints: &[Keypoint], descriptors: Descriptors) -> Self {
        let points = Array2::from_shape_fn((keypoints.len(), 4), |(i, j)| {
            let kp = &keypoints[i];
            f64::from([kp.x, kp.y, kp.size, kp.angle][j])
        });
        Self { points, descriptors }
    }

    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack the rows of several runs of one detector, keeping points and descriptors
    /// aligned.
    ///
    /// Returns `None` for no parts or when the descriptors disagree in kind or width.
    pub fn concatenate(parts: &[DetectorOutput]) -> Option<Self> {
        let descriptors: Vec<&Descriptors> = parts.iter().map(|p| &p.descriptors).collect();
        let descriptors = Descriptors::concatenate(&descriptors)?;
        let points: Vec<ArrayView2<f64>> = parts.iter().map(|p| p.points.view()).collect();
        let points = concatenate(Axis(0), &points).ok()?;
        Some(Self { points, descriptors })
    }
}

/// Detect keypoints with the configured backend.
///
/// `target_count` is the number of keypoints the backend aims for: adaptive backends
/// lower their threshold until they reach it, the others use it as their budget.
pub fn run_feature_extractor(
    image: &GrayFloatImage,
    config: &FeaturesConfig,
    target_count: usize,
) -> DetectorOutput {
    let start = Instant::now();
    let output = match config.feature_type {
        FeatureType::Sift => sift::extract(image, config, target_count),
        FeatureType::Surf => surf::extract(image, config, target_count),
        FeatureType::Akaze => akaze::extract(image, config, target_count),
        FeatureType::Hahog => hahog::extract(image, config, target_count),
        FeatureType::Orb => orb::extract(image, config, target_count),
    };
    debug!(
        "{} found {} points in {:.3}s on a {}x{} image",
        config.feature_type,
        output.len(),
        start.elapsed().as_secs_f64(),
        image.width(),
        image.height()
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypoint(x: f32) -> Keypoint {
        Keypoint {
            x,
            y: 2.0 * x,
            size: 3.0,
            angle: 0.0,
            response: 1.0,
        }
    }

    #[test]
    fn concatenation_keeps_rows_aligned() {
        let a = DetectorOutput::new(
            &[keypoint(1.0), keypoint(2.0)],
            Descriptors::Byte(Array2::ones((2, 4))),
        );
        let b = DetectorOutput::new(&[], Descriptors::empty_byte(4));
        let c = DetectorOutput::new(&[keypoint(5.0)], Descriptors::Byte(Array2::zeros((1, 4))));
        let merged = DetectorOutput::concatenate(&[a, b, c]).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.descriptors.len(), 3);
        assert_eq!(merged.points.column(0).to_vec(), vec![1.0, 2.0, 5.0]);
        assert_eq!(merged.descriptors.to_byte().column(0).to_vec(), vec![1, 1, 0]);
    }

    #[test]
    fn disagreeing_descriptors_are_not_merged() {
        let float = DetectorOutput::new(&[keypoint(1.0)], Descriptors::Float(Array2::ones((1, 4))));
        let byte = DetectorOutput::new(&[keypoint(2.0)], Descriptors::Byte(Array2::ones((1, 4))));
        assert!(DetectorOutput::concatenate(&[float.clone(), byte]).is_none());
        let wider = DetectorOutput::new(&[keypoint(3.0)], Descriptors::Float(Array2::ones((1, 8))));
        assert!(DetectorOutput::concatenate(&[float, wider]).is_none());
        assert!(DetectorOutput::concatenate(&[]).is_none());
    }
}
