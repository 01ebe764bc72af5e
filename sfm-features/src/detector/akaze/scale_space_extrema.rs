use super::evolution::EvolutionStep;
use super::{Akaze, KeyPoint};
use crate::detector::msurf;
use crate::image::GrayFloatImage;
use log::*;

/// Half width of the descriptor support, in units of the keypoint scale.
const SMAX: f32 = 10.0 * std::f32::consts::SQRT_2;

/// Is `value` strictly greater than its 8 neighbours?
fn is_local_maximum(image: &GrayFloatImage, x: usize, y: usize, value: f32) -> bool {
    (y - 1..=y + 1).all(|ny| {
        (x - 1..=x + 1).all(|nx| (nx == x && ny == y) || value > image.get(nx, ny))
    })
}

fn squared_distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    (a.0 - b.0) * (a.0 - b.0) + (a.1 - b.1) * (a.1 - b.1)
}

/// Map a pixel of an octave with the given ratio to input image coordinates.
fn to_input(point: (f32, f32), ratio: f32) -> (f32, f32) {
    (
        point.0 * ratio + 0.5 * (ratio - 1.0),
        point.1 * ratio + 0.5 * (ratio - 1.0),
    )
}

impl Akaze {
    /// Compute scale space extrema of the detector response.
    fn find_scale_space_extrema(&self, evolutions: &[EvolutionStep]) -> Vec<KeyPoint> {
        let mut keypoint_cache: Vec<KeyPoint> = vec![];
        let threshold = self.detector_threshold as f32;
        for (e_id, evolution) in evolutions.iter().enumerate() {
            let ldet = &evolution.Ldet;
            let (w, h) = (ldet.width(), ldet.height());
            if w < 3 || h < 3 {
                continue;
            }
            let ratio = evolution.ratio();
            let size = (evolution.esigma * self.derivative_factor) as f32;
            let sigma_size = f32::round(size / ratio);
            let border = SMAX * sigma_size + 1.0;
            for y in 1..h - 1 {
                for x in 1..w - 1 {
                    let value = ldet.get(x, y);
                    if value <= threshold || !is_local_maximum(ldet, x, y, value) {
                        continue;
                    }
                    // Check that the descriptor support stays inside the image.
                    let (xf, yf) = (x as f32, y as f32);
                    if f32::round(xf - border) < 0.0
                        || f32::round(xf + border) >= w as f32
                        || f32::round(yf - border) < 0.0
                        || f32::round(yf + border) >= h as f32
                    {
                        continue;
                    }
                    let keypoint = KeyPoint {
                        response: f32::abs(value),
                        size,
                        octave: evolution.octave as usize,
                        class_id: e_id,
                        point: to_input((xf, yf), ratio),
                        angle: 0f32,
                    };
                    // Compare response with same and lower scale
                    let neighbour = keypoint_cache.iter().position(|previous| {
                        (previous.class_id == e_id || previous.class_id + 1 == e_id)
                            && squared_distance(keypoint.point, previous.point) <= size * size
                    });
                    match neighbour {
                        None => keypoint_cache.push(keypoint),
                        Some(k) if keypoint.response > keypoint_cache[k].response => {
                            keypoint_cache[k] = keypoint;
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        // Now filter points with the upper scale level
        let output_keypoints: Vec<KeyPoint> = keypoint_cache
            .iter()
            .filter(|kp_i| {
                !keypoint_cache.iter().any(|kp_j| {
                    kp_j.class_id == kp_i.class_id + 1
                        && squared_distance(kp_i.point, kp_j.point) <= kp_i.size * kp_i.size
                        && kp_j.response > kp_i.response
                })
            })
            .copied()
            .collect();
        debug!("Extracted {} scale space extrema.", output_keypoints.len());
        output_keypoints
    }

    /// Detect keypoints in a scale space whose detector response is computed.
    ///
    /// Extrema are refined to sub-pixel accuracy and oriented, unless the
    /// descriptor is upright.
    pub fn detect_keypoints(&self, evolutions: &[EvolutionStep]) -> Vec<KeyPoint> {
        let keypoints = self.find_scale_space_extrema(evolutions);
        let mut keypoints = do_subpixel_refinement(&keypoints, evolutions);
        if !self.descriptor.is_upright() {
            for keypoint in keypoints.iter_mut() {
                compute_main_orientation(keypoint, evolutions);
            }
        }
        keypoints
    }
}

/// Compute the main orientation of the keypoint from the first derivatives.
fn compute_main_orientation(keypoint: &mut KeyPoint, evolutions: &[EvolutionStep]) {
    let evolution = &evolutions[keypoint.class_id];
    let ratio = evolution.ratio();
    let s = f32::round(0.5f32 * keypoint.size / ratio);
    let xf = keypoint.point.0 / ratio;
    let yf = keypoint.point.1 / ratio;
    keypoint.angle = msurf::dominant_orientation(xf, yf, s, |sx, sy| {
        (
            evolution.Lx.get_clamped(sx as isize, sy as isize),
            evolution.Ly.get_clamped(sx as isize, sy as isize),
        )
    });
}

/// Fit a 2D quadratic to the response around each keypoint.
///
/// Keypoints whose offset leaves the pixel are dropped.
fn do_subpixel_refinement(
    in_keypoints: &[KeyPoint],
    evolutions: &[EvolutionStep],
) -> Vec<KeyPoint> {
    let result: Vec<KeyPoint> = in_keypoints
        .iter()
        .filter_map(|keypoint| {
            let ldet = &evolutions[keypoint.class_id].Ldet;
            let ratio = evolutions[keypoint.class_id].ratio();
            let x = f32::round(keypoint.point.0 / ratio) as usize;
            let y = f32::round(keypoint.point.1 / ratio) as usize;
            if x < 1 || y < 1 || x + 1 >= ldet.width() || y + 1 >= ldet.height() {
                return None;
            }
            let x_i = ldet.get(x, y);
            let x_p = ldet.get(x + 1, y);
            let x_m = ldet.get(x - 1, y);
            let y_p = ldet.get(x, y + 1);
            let y_m = ldet.get(x, y - 1);
            // Derivative
            let d_x = 0.5f32 * (x_p - x_m);
            let d_y = 0.5f32 * (y_p - y_m);
            // Hessian
            let d_xx = x_p + x_m - 2f32 * x_i;
            let d_yy = y_p + y_m - 2f32 * x_i;
            let d_xy = 0.25f32 * (ldet.get(x + 1, y + 1) + ldet.get(x - 1, y - 1))
                - 0.25f32 * (ldet.get(x + 1, y - 1) + ldet.get(x - 1, y + 1));
            #[allow(clippy::suspicious_operation_groupings)]
            let inv_det_a = (d_xx * d_yy - d_xy * d_xy).recip();
            let dst = [
                -d_x * inv_det_a * d_yy + d_y * inv_det_a * d_xy,
                d_x * inv_det_a * d_xy - d_y * inv_det_a * d_xx,
            ];
            if f32::abs(dst[0]) <= 1.0 && f32::abs(dst[1]) <= 1.0 {
                let mut refined = *keypoint;
                refined.point = to_input((x as f32 + dst[0], y as f32 + dst[1]), ratio);
                Some(refined)
            } else {
                None
            }
        })
        .collect();
    debug!(
        "{}/{} remain after subpixel refinement.",
        result.len(),
        in_keypoints.len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn local_maximum_needs_all_eight_neighbours() {
        let mut image = GrayFloatImage::new(3, 3);
        image.put(1, 1, 1.0);
        assert!(is_local_maximum(&image, 1, 1, 1.0));
        image.put(2, 2, 1.0);
        assert!(!is_local_maximum(&image, 1, 1, 1.0));
    }

    #[test]
    fn refinement_finds_quadratic_peak() {
        let akaze = Akaze::default();
        let mut evolutions = akaze.allocate_evolutions(100, 100);
        evolutions[0].Ldet = GrayFloatImage(Array2::from_shape_fn((100, 100), |(y, x)| {
            1.0 - 0.01 * ((x as f32 - 50.3).powi(2) + (y as f32 - 49.8).powi(2))
        }));
        let candidate = KeyPoint {
            point: (50.0, 50.0),
            response: 1.0,
            size: 2.4,
            octave: 0,
            class_id: 0,
            angle: 0.0,
        };
        let refined = do_subpixel_refinement(&[candidate], &evolutions);
        assert_eq!(refined.len(), 1);
        assert_relative_eq!(refined[0].point.0, 50.3, epsilon = 1e-3);
        assert_relative_eq!(refined[0].point.1, 49.8, epsilon = 1e-3);
    }

    #[test]
    fn upper_scale_filter_keeps_the_stronger_response() {
        let akaze = Akaze::new(0.5);
        let mut evolutions = akaze.allocate_evolutions(100, 100);
        let peak = |amplitude: f32| {
            GrayFloatImage(Array2::from_shape_fn((100, 100), |(y, x)| {
                amplitude * (-((x as f32 - 50.0).powi(2) + (y as f32 - 50.0).powi(2)) / 8.0).exp()
            }))
        };
        for (i, evolution) in evolutions.iter_mut().enumerate() {
            evolution.Ldet = if i == 1 { peak(2.0) } else { GrayFloatImage::new(100, 100) };
        }
        evolutions.truncate(3);
        let extrema = akaze.find_scale_space_extrema(&evolutions);
        assert_eq!(extrema.len(), 1);
        assert_eq!(extrema[0].class_id, 1);
        assert_eq!(extrema[0].point, (50.0, 50.0));
    }
}
