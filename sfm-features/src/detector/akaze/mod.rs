//! Accelerated KAZE features.
//!
//! The scale space is built by nonlinear diffusion (or plain Gaussian smoothing when
//! isotropic diffusion is requested), keypoints are extrema of the scale normalized
//! Hessian determinant, and descriptors are either binary M-LDB strings or 64-d
//! SURF-like vectors computed on the diffusion derivatives.

mod contrast_factor;
mod derivatives;
mod descriptors;
mod detector_response;
mod evolution;
mod fed_tau;
mod nonlinear_diffusion;
mod scale_space_extrema;

pub use evolution::EvolutionStep;

use crate::config::AkazeDescriptor;
use crate::detector::{DetectorOutput, Keypoint};
use crate::features_data::Descriptors;
use crate::image::{gaussian_blur, GrayFloatImage};
use crate::root::root_feature_surf;
use crate::FeaturesConfig;
use float_ord::FloatOrd;
use log::*;
use nonlinear_diffusion::pm_g2;
use std::cmp::Reverse;

/// Response ratio under which a stronger neighbour suppresses a keypoint in ANMS.
const ANMS_ROBUSTNESS: f32 = 0.9;

/// A point of interest in an image, with the scale space bookkeeping AKAZE needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    /// The horizontal and vertical position in input pixels.
    pub point: (f32, f32),
    /// The magnitude of response from the detector.
    pub response: f32,
    /// The radius defining the extent of the keypoint, in pixel units
    pub size: f32,
    /// The level of scale space in which the keypoint was detected.
    pub octave: usize,
    /// Index of the evolution the keypoint was detected in.
    pub class_id: usize,
    /// The orientation angle in radians.
    pub angle: f32,
}

impl From<&KeyPoint> for Keypoint {
    fn from(kp: &KeyPoint) -> Self {
        Keypoint {
            x: kp.point.0,
            y: kp.point.1,
            size: kp.size,
            angle: kp.angle,
            response: kp.response,
        }
    }
}

/// Contains the configuration parameters of AKAZE.
///
/// The most important parameter to pay attention to is `detector_threshold`.
/// [`Akaze::new`] can be used to set this threshold and let all other parameters
/// remain default.
#[derive(Debug, Copy, Clone)]
pub struct Akaze {
    /// Default number of sublevels per scale level
    pub num_sublevels: u32,
    /// Maximum octave evolution of the image 2^sigma (coarsest scale sigma units)
    pub max_octave_evolution: u32,
    /// Base scale offset (sigma units)
    pub base_scale_offset: f64,
    /// Percentile level for the contrast factor
    pub contrast_percentile: f64,
    /// Number of bins for the contrast factor histogram
    pub contrast_factor_num_bins: usize,
    /// Factor for the multiscale derivatives
    pub derivative_factor: f64,
    /// Detector response threshold to accept point
    pub detector_threshold: f64,
    /// Replace nonlinear diffusion with Gaussian smoothing.
    pub isotropic_diffusion: bool,
    pub descriptor: AkazeDescriptor,
    /// Number of M-LDB bits kept, or 0 for all of them
    pub descriptor_size: usize,
    /// Number of channels in the descriptor (1, 2, 3)
    pub descriptor_channels: usize,
    /// Actual patch size is 2*pattern_size*point.scale
    pub descriptor_pattern_size: usize,
}

impl Akaze {
    /// This convenience constructor is provided for the very common case
    /// that the detector threshold needs to be modified.
    pub fn new(threshold: f64) -> Self {
        Self {
            detector_threshold: threshold,
            ..Default::default()
        }
    }

    pub fn from_config(config: &FeaturesConfig) -> Self {
        Self {
            max_octave_evolution: config.akaze_omax as u32,
            detector_threshold: config.akaze_dthreshold,
            contrast_percentile: config.akaze_kcontrast_percentile,
            isotropic_diffusion: config.akaze_use_isotropic_diffusion,
            descriptor: config.akaze_descriptor,
            descriptor_size: config.akaze_descriptor_size,
            descriptor_channels: config.akaze_descriptor_channels,
            ..Default::default()
        }
    }
}

impl Default for Akaze {
    fn default() -> Akaze {
        Akaze {
            num_sublevels: 4,
            max_octave_evolution: 4,
            base_scale_offset: 1.6f64,
            contrast_percentile: 0.7f64,
            contrast_factor_num_bins: 300,
            derivative_factor: 1.5f64,
            detector_threshold: 0.001f64,
            isotropic_diffusion: false,
            descriptor: AkazeDescriptor::Msurf,
            descriptor_size: 0,
            descriptor_channels: 3usize,
            descriptor_pattern_size: 10usize,
        }
    }
}

impl Akaze {
    /// Fill the evolutions with the diffused images.
    fn create_nonlinear_scale_space(
        &self,
        evolutions: &mut [EvolutionStep],
        image: &GrayFloatImage,
    ) {
        if evolutions.is_empty() {
            return;
        }
        trace!("Creating first evolution.");
        evolutions[0].Lt = gaussian_blur(image, self.base_scale_offset as f32);
        evolutions[0].Lsmooth = evolutions[0].Lt.clone();
        let mut contrast_factor = contrast_factor::compute_contrast_factor(
            &evolutions[0].Lsmooth,
            self.contrast_percentile,
            1.0f64,
            self.contrast_factor_num_bins,
        );
        debug!(
            "Contrast percentile={}, Num bins={}, Initial contrast factor={}",
            self.contrast_percentile, self.contrast_factor_num_bins, contrast_factor
        );
        for i in 1..evolutions.len() {
            let (done, rest) = evolutions.split_at_mut(i);
            let previous = &done[i - 1];
            let current = &mut rest[0];
            current.Lt = if current.octave > previous.octave {
                contrast_factor *= 0.75;
                let half = previous.Lt.half_size();
                debug!(
                    "New image size: {}x{}, new contrast factor: {}",
                    half.width(),
                    half.height(),
                    contrast_factor
                );
                half
            } else {
                previous.Lt.clone()
            };
            if self.isotropic_diffusion {
                let sigma = (2.0 * (current.etime - previous.etime)).sqrt();
                current.Lt = gaussian_blur(&current.Lt, sigma as f32);
                current.Lsmooth = gaussian_blur(&current.Lt, 1.0f32);
                continue;
            }
            current.Lsmooth = gaussian_blur(&current.Lt, 1.0f32);
            current.Lx = derivatives::scharr_horizontal(&current.Lsmooth, 1);
            current.Ly = derivatives::scharr_vertical(&current.Lsmooth, 1);
            current.Lflow = pm_g2(&current.Lx, &current.Ly, contrast_factor);
            for j in 0..current.fed_tau_steps.len() {
                let step_size = current.fed_tau_steps[j];
                nonlinear_diffusion::calculate_step(current, step_size as f32);
            }
            trace!("Evolution {} diffused in {} steps.", i, current.fed_tau_steps.len());
        }
    }

    /// Build the scale space of an image.
    ///
    /// The result is empty when the image is too small for a single octave.
    pub fn scale_space(&self, image: &GrayFloatImage) -> Vec<EvolutionStep> {
        let mut evolutions = self.allocate_evolutions(image.width(), image.height());
        self.create_nonlinear_scale_space(&mut evolutions, image);
        evolutions
    }

    /// Find keypoints of a built scale space.
    pub fn find_image_keypoints(&self, evolutions: &mut [EvolutionStep]) -> Vec<KeyPoint> {
        if evolutions.is_empty() {
            return vec![];
        }
        self.detector_response(evolutions);
        trace!("Computing detector response finished.");
        self.detect_keypoints(evolutions)
    }

    /// Detect keypoints and compute their descriptors.
    ///
    /// Keypoints whose descriptor cannot be computed are dropped, so the returned
    /// keypoints correspond row by row to the descriptors.
    pub fn extract(&self, image: &GrayFloatImage) -> (Vec<KeyPoint>, Descriptors) {
        let mut evolutions = self.scale_space(image);
        let keypoints = self.find_image_keypoints(&mut evolutions);
        let (keypoints, descriptors) = self.extract_descriptors(&evolutions, &keypoints);
        info!("Extracted {} features", keypoints.len());
        (keypoints, descriptors)
    }
}

/// Keep the `target` keypoints with the largest suppression radius.
///
/// The radius of a keypoint is its distance to the nearest keypoint that is
/// sufficiently stronger. The strongest keypoint has an infinite radius.
pub fn adaptive_non_maximal_suppression(keypoints: &[KeyPoint], target: usize) -> Vec<KeyPoint> {
    if keypoints.len() <= target {
        return keypoints.to_vec();
    }
    let mut sorted = keypoints.to_vec();
    sorted.sort_by_key(|kp| Reverse(FloatOrd(kp.response)));
    let mut radii: Vec<(f32, usize)> = sorted
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            let radius = sorted[..i]
                .iter()
                .filter(|stronger| kp.response < ANMS_ROBUSTNESS * stronger.response)
                .map(|stronger| {
                    let dx = kp.point.0 - stronger.point.0;
                    let dy = kp.point.1 - stronger.point.1;
                    dx * dx + dy * dy
                })
                .map(FloatOrd)
                .min()
                .map_or(f32::INFINITY, |d| d.0);
            (radius, i)
        })
        .collect();
    radii.sort_by_key(|&(radius, i)| (Reverse(FloatOrd(radius)), i));
    radii.truncate(target);
    radii.into_iter().map(|(_, i)| sorted[i]).collect()
}

/// Run AKAZE aiming for `target_count` keypoints.
///
/// Candidates are searched down to the adaptive threshold floor. All candidates
/// above the configured threshold are kept; when there are fewer than the target,
/// the strongest remaining ones fill the gap.
pub fn extract(
    image: &GrayFloatImage,
    config: &FeaturesConfig,
    target_count: usize,
) -> DetectorOutput {
    let mut akaze = Akaze::from_config(config);
    let dthreshold = akaze.detector_threshold;
    akaze.detector_threshold = dthreshold.min(config.feature_adaptive_threshold_floor);

    let mut evolutions = akaze.scale_space(image);
    let mut keypoints = akaze.find_image_keypoints(&mut evolutions);
    keypoints.sort_by_key(|kp| Reverse(FloatOrd(kp.response)));
    let passing = keypoints
        .iter()
        .take_while(|kp| f64::from(kp.response) > dthreshold)
        .count();
    let keep = if passing < target_count {
        target_count.min(keypoints.len())
    } else {
        passing
    };
    keypoints.truncate(keep);
    debug!(
        "{} candidates pass threshold {}, keeping {}",
        passing, dthreshold, keep
    );
    if config.feature_use_adaptive_suppression && keypoints.len() > target_count {
        keypoints = adaptive_non_maximal_suppression(&keypoints, target_count);
        debug!("{} keypoints remain after ANMS", keypoints.len());
    }

    let (keypoints, descriptors) = akaze.extract_descriptors(&evolutions, &keypoints);
    let descriptors = match descriptors {
        Descriptors::Float(values) if config.feature_root => Descriptors::Float(root_feature_surf(
            &values,
            false,
            akaze.descriptor.is_upright(),
        )),
        other => other,
    };
    let points: Vec<Keypoint> = keypoints.iter().map(Keypoint::from).collect();
    DetectorOutput::new(&points, descriptors)
}
