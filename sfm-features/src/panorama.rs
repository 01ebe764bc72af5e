//! Detection on equirectangular panoramas through a cubemap.
//!
//! The panorama is cut into six 90° perspective faces, each face is run through the
//! configured detector, and the detections are mapped back into panorama pixels.

use crate::camera::{rotation_from_ptr, CameraModel, PerspectiveCamera, Shot, SphericalCamera};
use crate::config::FeaturesConfig;
use crate::detector::{run_feature_extractor, DetectorOutput};
use crate::features_data::Descriptors;
use crate::image::GrayFloatImage;
use crate::normalize::{denormalized_image_coordinate, normalized_image_coordinate};
use log::*;
use nalgebra::{Point2, Rotation3, Vector3};
use ndarray::{Array2, Axis};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

/// Face names in rendering order.
pub const FACE_NAMES: [&str; 6] = ["front", "left", "back", "right", "top", "bottom"];

/// A focal length of half the side gives a 90° field of view.
const FACE_FOCAL: f64 = 0.5;

/// World to face rotation of each cubemap face.
fn face_rotation(face: usize) -> Rotation3<f64> {
    match face {
        0..=3 => Rotation3::from_axis_angle(&Vector3::y_axis(), face as f64 * FRAC_PI_2),
        4 => Rotation3::from_axis_angle(&Vector3::x_axis(), -FRAC_PI_2),
        _ => Rotation3::from_axis_angle(&Vector3::x_axis(), FRAC_PI_2),
    }
}

/// Map a pixel of a perspective sub-image to a pixel of the panorama.
fn perspective_to_panorama(
    sub_shot: &Shot<PerspectiveCamera>,
    pano_shot: &Shot<SphericalCamera>,
    rotation: &Rotation3<f64>,
    x: f64,
    y: f64,
) -> (f64, f64) {
    let sub = &sub_shot.camera;
    let pano = &pano_shot.camera;
    let (nx, ny) = normalized_image_coordinate(x, y, sub.width(), sub.height());
    let bearing = rotation * sub.pixel_bearing(Point2::new(nx, ny));
    // Spherical projection covers every bearing.
    pano.project(&bearing)
        .map_or((f64::NAN, f64::NAN), |p| {
            denormalized_image_coordinate(p.x, p.y, pano.width(), pano.height())
        })
}

/// Bilinear sample that wraps around horizontally and clamps vertically.
fn sample_wrapped(image: &GrayFloatImage, x: f64, y: f64) -> f32 {
    let width = image.width() as isize;
    if width == 0 || image.height() == 0 {
        return 0.0;
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = (x - x0) as f32;
    let fy = (y - y0) as f32;
    let (x0, y0) = (x0 as isize, y0 as isize);
    let xa = x0.rem_euclid(width);
    let xb = (x0 + 1).rem_euclid(width);
    let top = (1.0 - fx) * image.get_clamped(xa, y0) + fx * image.get_clamped(xb, y0);
    let bottom = (1.0 - fx) * image.get_clamped(xa, y0 + 1) + fx * image.get_clamped(xb, y0 + 1);
    (1.0 - fy) * top + fy * bottom
}

/// Render the six cubemap faces of a panorama.
///
/// Faces are `subshot_width` pixels square. The returned panorama shot carries
/// `rotation`, so faces of a rotated cubemap look along rotated directions of the
/// panorama.
pub fn generate_perspective_images_of_a_panorama(
    image: &GrayFloatImage,
    subshot_width: u32,
    rotation: Rotation3<f64>,
) -> (Vec<(Shot<PerspectiveCamera>, GrayFloatImage)>, Shot<SphericalCamera>) {
    let pano_shot = Shot::new(
        "panorama",
        SphericalCamera {
            width: image.width() as u32,
            height: image.height() as u32,
        },
        rotation,
    );
    let side = subshot_width as usize;
    let faces = FACE_NAMES
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let shot = Shot::new(
                *name,
                PerspectiveCamera {
                    width: subshot_width,
                    height: subshot_width,
                    focal: FACE_FOCAL,
                },
                face_rotation(index),
            );
            let mapping = pano_shot.rotation * shot.rotation.inverse();
            let face = GrayFloatImage(Array2::from_shape_fn((side, side), |(y, x)| {
                let (px, py) =
                    perspective_to_panorama(&shot, &pano_shot, &mapping, x as f64, y as f64);
                sample_wrapped(image, px, py)
            }));
            (shot, face)
        })
        .collect();
    (faces, pano_shot)
}

/// Map `(x, y, ..)` rows in sub-image pixels to panorama pixels.
///
/// Only the first two columns change.
pub fn transform_from_perspective_to_panorama(
    sub_shot: &Shot<PerspectiveCamera>,
    pano_shot: &Shot<SphericalCamera>,
    points: &Array2<f64>,
) -> Array2<f64> {
    let mapping = pano_shot.rotation * sub_shot.rotation.inverse();
    let mut out = points.clone();
    if out.ncols() < 2 {
        return out;
    }
    for mut row in out.axis_iter_mut(Axis(0)) {
        let (x, y) = perspective_to_panorama(sub_shot, pano_shot, &mapping, row[0], row[1]);
        row[0] = x;
        row[1] = y;
    }
    out
}

/// Detect on every cubemap face and gather the detections in panorama pixels.
///
/// Each face gets the full `target_count`. With `feature_extract_from_cubemap_augmented`
/// a second cubemap, rotated by 45° in pan and tilt, is appended. Overlapping
/// detections are kept.
pub fn extract_cubemap_features(
    image: &GrayFloatImage,
    config: &FeaturesConfig,
    target_count: usize,
    subshot_width: u32,
) -> DetectorOutput {
    let mut passes = vec![Rotation3::identity()];
    if config.feature_extract_from_cubemap_augmented {
        passes.push(rotation_from_ptr(FRAC_PI_4, FRAC_PI_4, 0.0));
    }

    let mut outputs = vec![];
    for (pass, rotation) in passes.into_iter().enumerate() {
        let (faces, pano_shot) =
            generate_perspective_images_of_a_panorama(image, subshot_width, rotation);
        for (shot, face) in faces {
            let output = run_feature_extractor(&face, config, target_count);
            debug!("cubemap pass {} face {}: {} points", pass, shot.name, output.len());
            outputs.push(DetectorOutput {
                points: transform_from_perspective_to_panorama(&shot, &pano_shot, &output.points),
                descriptors: output.descriptors,
            });
        }
    }

    // Every face runs the same detector, so the parts always agree.
    let merged = DetectorOutput::concatenate(&outputs);
    debug_assert!(merged.is_some(), "cubemap faces disagree on descriptors");
    merged.unwrap_or_else(|| {
        warn!("cubemap faces disagree on descriptors, dropping all detections");
        DetectorOutput::new(&[], Descriptors::empty_float(0))
    })
}

/// Side of a cubemap face for a panorama when no process size is configured.
///
/// A 90° face spans a quarter of the panorama width.
pub fn default_subshot_width(panorama_width: u32) -> u32 {
    (panorama_width / 4).max(1)
}
