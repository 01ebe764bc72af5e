//! Root (Hellinger) descriptor transforms.
//!
//! Euclidean distances between transformed descriptors approximate the Hellinger
//! distance between the original histograms.

use ndarray::{Array2, Axis};

/// Square root of each row divided by its L1 sum.
///
/// Descriptors are treated as non-negative histograms. With `l2_normalization`
/// each row is first scaled to unit L2 norm. Rows summing to zero stay zero.
pub fn root_feature(descriptors: &Array2<f32>, l2_normalization: bool) -> Array2<f32> {
    let mut out = descriptors.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        if l2_normalization {
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row.mapv_inplace(|v| v / norm);
            }
        }
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| (v / sum).max(0.0).sqrt());
        } else {
            row.fill(0.0);
        }
    }
    out
}

/// Signed root transform for 64-dimensional SURF descriptors.
///
/// Each selected dimension becomes `sign(d) * sqrt(|d| / L1(row))` where the L1 sum
/// covers the full row. With `partial` only dimensions `i % 4 in {2, 3}` are
/// transformed. Descriptors of any other width are returned unchanged.
pub fn root_feature_surf(
    descriptors: &Array2<f32>,
    l2_normalization: bool,
    partial: bool,
) -> Array2<f32> {
    let mut out = descriptors.clone();
    if descriptors.ncols() != 64 {
        return out;
    }
    for mut row in out.axis_iter_mut(Axis(0)) {
        if l2_normalization {
            let norm = row.dot(&row).sqrt();
            if norm > 0.0 {
                row.mapv_inplace(|v| v / norm);
            }
        }
        let l1: f32 = row.iter().map(|v| v.abs()).sum();
        if l1 <= 0.0 {
            continue;
        }
        for (i, v) in row.iter_mut().enumerate() {
            if !partial || i % 4 >= 2 {
                *v = v.signum() * (v.abs() / l1).sqrt();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn hellinger_rows_have_unit_norm() {
        let histograms = array![
            [0.1f32, 0.2, 0.3, 0.4],
            [0.25, 0.25, 0.25, 0.25],
            [1.0, 0.0, 0.0, 0.0]
        ];
        let rooted = root_feature(&histograms, false);
        for row in rooted.rows() {
            assert_relative_eq!(row.dot(&row).sqrt(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_rows_stay_zero() {
        let rooted = root_feature(&Array2::zeros((2, 8)), true);
        assert!(rooted.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn l2_normalization_does_not_change_direction() {
        let d = array![[3.0f32, 4.0, 0.0, 5.0]];
        for (a, b) in root_feature(&d, true).iter().zip(root_feature(&d, false).iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn surf_root_keeps_signs() {
        let row: Vec<f32> = (0..64).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let d = Array2::from_shape_vec((1, 64), row).unwrap();
        let rooted = root_feature_surf(&d, false, false);
        let expected = (1.0f32 / 64.0).sqrt();
        for (i, &v) in rooted.iter().enumerate() {
            assert_relative_eq!(v, if i % 2 == 0 { expected } else { -expected }, epsilon = 1e-6);
        }
        assert_relative_eq!(rooted.row(0).dot(&rooted.row(0)), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn partial_surf_root_touches_absolute_dimensions_only() {
        let d = Array2::from_elem((1, 64), 0.5f32);
        let rooted = root_feature_surf(&d, false, true);
        let expected = (0.5f32 / 32.0).sqrt();
        for (i, &v) in rooted.iter().enumerate() {
            if i % 4 >= 2 {
                assert_relative_eq!(v, expected, epsilon = 1e-6);
            } else {
                assert_eq!(v, 0.5);
            }
        }
    }

    #[test]
    fn surf_root_ignores_other_widths() {
        let d = Array2::from_elem((2, 128), 0.5f32);
        assert_eq!(root_feature_surf(&d, true, false), d);
    }
}
