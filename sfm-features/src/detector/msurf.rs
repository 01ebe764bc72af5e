//! 64-dimensional SURF descriptors and the sliding-window orientation they use.
//!
//! Both are written against a derivative sampler so that the SURF backend can feed
//! Haar wavelet responses and AKAZE can feed its Scharr derivative images.

use std::f32::consts::PI;

pub const DESCRIPTOR_SIZE: usize = 64;

/// Sampling layout of the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfLayout {
    /// 4x4 disjoint subregions of 5x5 samples.
    Surf,
    /// 4x4 overlapping subregions of 9x9 Gaussian weighted samples.
    Msurf,
}

fn gaussian(x: f32, y: f32, sigma: f32) -> f32 {
    (-(x * x + y * y) / (2.0 * sigma * sigma)).exp()
}

/// Compute a unit-length 64-d descriptor around `(x, y)`.
///
/// `scale` is the sample spacing, `angle` the orientation in radians and `sample`
/// returns the horizontal and vertical derivatives at a sub-pixel location. Each
/// subregion contributes `(sum dx, sum dy, sum |dx|, sum |dy|)`.
pub fn surf_descriptor(
    layout: SurfLayout,
    x: f32,
    y: f32,
    scale: f32,
    angle: f32,
    sample: impl Fn(f32, f32) -> (f32, f32),
) -> [f32; DESCRIPTOR_SIZE] {
    let (si, co) = angle.sin_cos();
    let mut desc = [0f32; DESCRIPTOR_SIZE];
    let rotated = |k: f32, l: f32| {
        (
            x + (-l * scale * si + k * scale * co),
            y + (l * scale * co + k * scale * si),
        )
    };
    let mut dcount = 0;
    match layout {
        SurfLayout::Surf => {
            for i in (-10..10).step_by(5) {
                for j in (-10..10).step_by(5) {
                    let mut sums = [0f32; 4];
                    for k in i..i + 5 {
                        for l in j..j + 5 {
                            let (sx, sy) = rotated(k as f32, l as f32);
                            let (rx, ry) = sample(sx, sy);
                            let rry = rx * co + ry * si;
                            let rrx = -rx * si + ry * co;
                            sums[0] += rrx;
                            sums[1] += rry;
                            sums[2] += rrx.abs();
                            sums[3] += rry.abs();
                        }
                    }
                    desc[dcount..dcount + 4].copy_from_slice(&sums);
                    dcount += 4;
                }
            }
        }
        SurfLayout::Msurf => {
            let mut cx = -0.5f32;
            for i in [-12, -7, -2, 3] {
                cx += 1.0;
                let mut cy = -0.5f32;
                for j in [-12, -7, -2, 3] {
                    cy += 1.0;
                    // Subregion center on the rotated axis.
                    let (xs, ys) = rotated((i + 5) as f32, (j + 5) as f32);
                    let mut sums = [0f32; 4];
                    for k in i..i + 9 {
                        for l in j..j + 9 {
                            let (sx, sy) = rotated(k as f32, l as f32);
                            let weight = gaussian(xs - sx, ys - sy, 2.5 * scale);
                            let (rx, ry) = sample(sx, sy);
                            let rry = weight * (rx * co + ry * si);
                            let rrx = weight * (-rx * si + ry * co);
                            sums[0] += rrx;
                            sums[1] += rry;
                            sums[2] += rrx.abs();
                            sums[3] += rry.abs();
                        }
                    }
                    let weight = gaussian(cx - 2.0, cy - 2.0, 1.5);
                    for (out, sum) in desc[dcount..dcount + 4].iter_mut().zip(sums) {
                        *out = sum * weight;
                    }
                    dcount += 4;
                }
            }
        }
    }
    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in desc.iter_mut() {
            *v /= norm;
        }
    }
    desc
}

/// Dominant direction of derivative responses sampled on a disc of radius `6 * scale`.
///
/// A pi/3 window slides around the circle in steps of 0.15 rad; the window whose
/// summed response is longest gives the orientation in radians, in `[0, 2pi)`.
pub fn dominant_orientation(
    x: f32,
    y: f32,
    scale: f32,
    sample: impl Fn(f32, f32) -> (f32, f32),
) -> f32 {
    let mut responses = Vec::with_capacity(109);
    for i in -6i32..=6 {
        for j in -6i32..=6 {
            if i * i + j * j >= 36 {
                continue;
            }
            let sx = (x + i as f32 * scale).round();
            let sy = (y + j as f32 * scale).round();
            let weight = gaussian(i as f32, j as f32, 2.5);
            let (rx, ry) = sample(sx, sy);
            let (rx, ry) = (weight * rx, weight * ry);
            responses.push((rx, ry, positive_angle(rx, ry)));
        }
    }
    let mut best = 0f32;
    let mut orientation = 0f32;
    let mut ang1 = 0f32;
    while ang1 < 2.0 * PI {
        let ang2 = if ang1 + PI / 3.0 > 2.0 * PI {
            ang1 - 5.0 * PI / 3.0
        } else {
            ang1 + PI / 3.0
        };
        let (mut sum_x, mut sum_y) = (0f32, 0f32);
        for &(rx, ry, ang) in &responses {
            let inside = if ang1 < ang2 {
                ang1 < ang && ang < ang2
            } else {
                (ang > 0.0 && ang < ang2) || (ang > ang1 && ang < 2.0 * PI)
            };
            if inside {
                sum_x += rx;
                sum_y += ry;
            }
        }
        let length = sum_x * sum_x + sum_y * sum_y;
        if length > best {
            best = length;
            orientation = positive_angle(sum_x, sum_y);
        }
        ang1 += 0.15;
    }
    orientation
}

/// Angle of a vector in `[0, 2pi)`.
fn positive_angle(x: f32, y: f32) -> f32 {
    let angle = y.atan2(x);
    if angle < 0.0 {
        angle + 2.0 * PI
    } else {
        angle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn constant_gradient_orientation() {
        let angle = dominant_orientation(50.0, 50.0, 2.0, |_, _| (0.0, 1.0));
        assert_relative_eq!(angle, PI / 2.0, epsilon = 0.1);
        let angle = dominant_orientation(50.0, 50.0, 2.0, |_, _| (1.0, 0.0));
        assert!(angle < 0.1 || angle > 2.0 * PI - 0.1);
    }

    #[test]
    fn descriptors_are_unit_length() {
        for layout in [SurfLayout::Surf, SurfLayout::Msurf] {
            let desc = surf_descriptor(layout, 40.0, 40.0, 1.5, 0.3, |x, y| {
                ((x * 0.1).sin(), (y * 0.07).cos())
            });
            let norm: f32 = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert_relative_eq!(norm, 1.0, epsilon = 1e-4);
            for (i, v) in desc.iter().enumerate() {
                if i % 4 >= 2 {
                    assert!(*v >= 0.0);
                }
            }
        }
    }

    #[test]
    fn flat_region_gives_zero_descriptor() {
        let desc = surf_descriptor(SurfLayout::Msurf, 10.0, 10.0, 1.0, 0.0, |_, _| (0.0, 0.0));
        assert!(desc.iter().all(|&v| v == 0.0));
    }
}
