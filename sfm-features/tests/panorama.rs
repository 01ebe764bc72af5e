use image::{DynamicImage, GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use nalgebra::Rotation3;
use ndarray::{array, Array2};
use sfm_features::camera::rotation_from_ptr;
use sfm_features::normalize::{denormalized_image_coordinate, normalized_image_coordinate};
use sfm_features::panorama::{
    generate_perspective_images_of_a_panorama, transform_from_perspective_to_panorama,
};
use sfm_features::{extract_features, FeatureType, FeaturesConfig, GrayFloatImage};

fn bump(width: usize, height: usize, cx: f32, cy: f32, sigma: f32) -> GrayFloatImage {
    GrayFloatImage(Array2::from_shape_fn((height, width), |(y, x)| {
        let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
        (-d2 / (2.0 * sigma * sigma)).exp()
    }))
}

fn argmax(image: &GrayFloatImage) -> (usize, usize, f32) {
    let mut best = (0, 0, f32::NEG_INFINITY);
    for ((y, x), &v) in image.indexed_iter() {
        if v > best.2 {
            best = (x, y, v);
        }
    }
    best
}

/// The brightest pixel of a face maps back onto the bump it was rendered from.
fn check_rendering_matches_reprojection(rotation: Rotation3<f64>) {
    let (cx, cy) = (250.0, 170.0);
    let pano = bump(800, 400, cx, cy, 3.0);
    let (faces, pano_shot) = generate_perspective_images_of_a_panorama(&pano, 200, rotation);
    let mut seen = 0;
    for (shot, face) in &faces {
        let (x, y, value) = argmax(face);
        if value < 0.5 || x == 0 || y == 0 || x == 199 || y == 199 {
            continue;
        }
        seen += 1;
        let points = array![[x as f64, y as f64]];
        let mapped = transform_from_perspective_to_panorama(shot, &pano_shot, &points);
        let dx = mapped[(0, 0)] - f64::from(cx);
        let dy = mapped[(0, 1)] - f64::from(cy);
        let error = (dx * dx + dy * dy).sqrt();
        assert!(error < 2.0, "face {} maps to {:?}", shot.name, mapped.row(0));
    }
    assert!(seen >= 1);
}

#[test]
fn rendering_and_reprojection_agree() {
    check_rendering_matches_reprojection(Rotation3::identity());
}

#[test]
fn rotated_rendering_and_reprojection_agree() {
    check_rendering_matches_reprojection(rotation_from_ptr(0.7, 0.3, 0.1));
}

#[test]
fn rotated_front_face_looks_along_the_rotation() {
    let pano = GrayFloatImage::new(800, 400);
    let rotation = rotation_from_ptr(0.5, 0.2, 0.0);
    let (faces, pano_shot) = generate_perspective_images_of_a_panorama(&pano, 101, rotation);
    let mapped =
        transform_from_perspective_to_panorama(&faces[0].0, &pano_shot, &array![[50.0, 50.0]]);
    // The front face looks along the world z axis, seen from the panorama.
    let forward = rotation * nalgebra::Vector3::z();
    let lon = forward.x.atan2(forward.z) / (2.0 * std::f64::consts::PI);
    let lat = (-forward.y).atan2(forward.x.hypot(forward.z)) / (2.0 * std::f64::consts::PI);
    let (x, y) = denormalized_image_coordinate(lon, -lat, 800, 400);
    assert!((mapped[(0, 0)] - x).abs() < 1e-6 && (mapped[(0, 1)] - y).abs() < 1e-6);
}

/// Keypoints of a bright square on a 4000x2000 panorama, normalized.
///
/// The square is drawn at every horizontal wrap of its center so it can straddle the seam.
fn square_cluster(cx: i32, cy: i32) -> Vec<(f64, f64)> {
    let mut image = GrayImage::from_pixel(4000, 2000, Luma([25]));
    for shift in [-4000, 0, 4000] {
        let rect = Rect::at(cx - 80 + shift, cy - 80).of_size(160, 160);
        draw_filled_rect_mut(&mut image, rect, Luma([230]));
    }
    let image = DynamicImage::ImageLuma8(image);

    let config = FeaturesConfig {
        feature_process_size_panorama: 512,
        feature_min_frames_panorama: 50,
        feature_extract_from_cubemap_panorama: true,
        ..FeaturesConfig::new(FeatureType::Orb)
    };
    let features = extract_features(&image, &config, true).unwrap();
    assert!(!features.is_empty());
    assert_eq!(features.colors.nrows(), features.len());
    features
        .points
        .rows()
        .into_iter()
        .map(|p| (f64::from(p[0]), f64::from(p[1])))
        .collect()
}

fn check_single_cluster(cx: i32, cy: i32) {
    let _ = pretty_env_logger::try_init();
    let (x, y) = normalized_image_coordinate(f64::from(cx) - 0.5, f64::from(cy) - 0.5, 4000, 2000);
    for (px, py) in square_cluster(cx, cy) {
        // Longitude wraps, so compare x modulo the panorama width.
        let dx = (px - x + 0.5).rem_euclid(1.0) - 0.5;
        let distance = (dx * dx + (py - y).powi(2)).sqrt();
        assert!(distance < 0.05, "keypoint at ({}, {}) for square at ({}, {})", px, py, cx, cy);
    }
}

#[test]
fn bright_square_gives_one_cluster() {
    // The panorama center, which is the origin once normalized.
    check_single_cluster(2000, 1000);
}

#[test]
fn bright_square_on_a_side_face_gives_one_cluster() {
    check_single_cluster(3000, 1000);
}

#[test]
fn bright_square_across_the_seam_gives_one_cluster() {
    check_single_cluster(10, 1000);
}
