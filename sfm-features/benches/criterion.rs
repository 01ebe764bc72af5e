use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use sfm_features::{run_feature_extractor, FeatureType, FeaturesConfig, GrayFloatImage};

/// A deterministic pattern of blobs and edges.
fn load_image() -> GrayFloatImage {
    GrayFloatImage(Array2::from_shape_fn((480, 640), |(y, x)| {
        let (fx, fy) = (x as f32 / 23.0, y as f32 / 17.0);
        0.5 + 0.25 * fx.sin() * fy.cos() + 0.2 * ((x / 40 + y / 40) % 2) as f32
    }))
}

fn extract(c: &mut Criterion) {
    let image = load_image();
    for feature_type in [
        FeatureType::Sift,
        FeatureType::Surf,
        FeatureType::Akaze,
        FeatureType::Hahog,
        FeatureType::Orb,
    ] {
        let config = FeaturesConfig::new(feature_type);
        c.bench_function(&format!("extract_{}", feature_type), |b| {
            b.iter(|| run_feature_extractor(&image, &config, 2000))
        });
    }
}

criterion_group!(
    name = detectors;
    config = Criterion::default().sample_size(10);
    targets = extract
);

fn bench_horizontal_filter(c: &mut Criterion) {
    let image = load_image();
    let small_kernel = sfm_features::image::gaussian_kernel(1.0, 7);
    c.bench_function("horizontal_filter_small_kernel", |b| {
        b.iter(|| sfm_features::image::horizontal_filter(&image, &small_kernel))
    });
    let large_kernel = sfm_features::image::gaussian_kernel(10.0, 71);
    c.bench_function("horizontal_filter_large_kernel", |b| {
        b.iter(|| sfm_features::image::horizontal_filter(&image, &large_kernel))
    });
}

fn bench_panorama(c: &mut Criterion) {
    let image = load_image();
    c.bench_function("cubemap_faces", |b| {
        b.iter(|| {
            sfm_features::panorama::generate_perspective_images_of_a_panorama(
                &image,
                256,
                nalgebra::Rotation3::identity(),
            )
        })
    });
}

criterion_group!(
    name = filters;
    config = Criterion::default().sample_size(10);
    targets = bench_horizontal_filter, bench_panorama
);

criterion_main!(detectors, filters);
