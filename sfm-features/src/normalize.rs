//! Conversion between pixel and normalized image coordinates.
//!
//! Normalized coordinates put the image center at the origin and divide by the
//! larger image side, so the longer axis spans `[-0.5, 0.5]`.

use ndarray::{Array2, Axis};

/// Normalize a single pixel coordinate.
pub fn normalized_image_coordinate(x: f64, y: f64, width: u32, height: u32) -> (f64, f64) {
    let (w, h) = (f64::from(width), f64::from(height));
    let size = w.max(h);
    ((x + 0.5 - w / 2.0) / size, (y + 0.5 - h / 2.0) / size)
}

/// Inverse of [`normalized_image_coordinate`].
pub fn denormalized_image_coordinate(x: f64, y: f64, width: u32, height: u32) -> (f64, f64) {
    let (w, h) = (f64::from(width), f64::from(height));
    let size = w.max(h);
    (x * size - 0.5 + w / 2.0, y * size - 0.5 + h / 2.0)
}

/// Normalize the first two columns of every row.
pub fn normalized_image_coordinates(
    pixel_coords: &Array2<f64>,
    width: u32,
    height: u32,
) -> Array2<f64> {
    map_xy(pixel_coords, |x, y| normalized_image_coordinate(x, y, width, height))
}

/// Denormalize the first two columns of every row.
pub fn denormalized_image_coordinates(
    norm_coords: &Array2<f64>,
    width: u32,
    height: u32,
) -> Array2<f64> {
    map_xy(norm_coords, |x, y| denormalized_image_coordinate(x, y, width, height))
}

/// Normalize keypoint rows `(x, y, size, angle)`.
///
/// Sizes are divided by the larger image side. There is no matching inverse for
/// the size column.
pub fn normalize_features(points: &Array2<f64>, width: u32, height: u32) -> Array2<f64> {
    let mut out = normalized_image_coordinates(points, width, height);
    if out.ncols() > 2 {
        let size = f64::from(width.max(height));
        out.column_mut(2).mapv_inplace(|s| s / size);
    }
    out
}

fn map_xy(points: &Array2<f64>, f: impl Fn(f64, f64) -> (f64, f64)) -> Array2<f64> {
    let mut out = points.clone();
    if out.ncols() < 2 {
        return out;
    }
    for mut row in out.axis_iter_mut(Axis(0)) {
        let (x, y) = f(row[0], row[1]);
        row[0] = x;
        row[1] = y;
    }
    out
}
