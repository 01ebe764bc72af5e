use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing;
use log::*;
use sfm_features::normalize::denormalized_image_coordinate;
use sfm_features::{extract_features, FeatureType, FeaturesConfig, FeaturesData, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

/// A directory with an `images/` folder and an optional `config.yaml`.
///
/// Features are written to `features/` and keypoint overlays to `rendered/`.
#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
}

impl Dataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File names of every image, sorted.
    pub fn images(&self) -> Result<Vec<String>> {
        let mut names = vec![];
        for entry in std::fs::read_dir(self.root.join("images"))? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if !is_image || !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn image_path(&self, image: &str) -> PathBuf {
        self.root.join("images").join(image)
    }

    pub fn features_path(&self, image: &str) -> PathBuf {
        self.root.join("features").join(format!("{}.features.npz", image))
    }

    pub fn rendered_path(&self, image: &str) -> PathBuf {
        self.root.join("rendered").join(format!("{}_features.png", image))
    }

    /// Read `override_path` if given, else the dataset `config.yaml`.
    ///
    /// Without either, HAHOG defaults are used.
    pub fn load_config(&self, override_path: Option<&Path>) -> Result<FeaturesConfig> {
        let path = match override_path {
            Some(path) => path.to_owned(),
            None => self.root.join("config.yaml"),
        };
        if override_path.is_none() && !path.exists() {
            warn!("no config.yaml in {}, using defaults", self.root.display());
            return Ok(FeaturesConfig::new(FeatureType::Hahog));
        }
        info!("loading configuration from {}", path.display());
        FeaturesConfig::from_file(path)
    }
}

/// How a batch treats each image.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Image names to treat as panoramas.
    pub panoramas: HashSet<String>,
    /// Treat every image with a 2:1 aspect ratio as a panorama.
    pub detect_panoramas: bool,
    pub render: bool,
    pub overwrite: bool,
}

impl ExtractOptions {
    pub fn is_panorama(&self, name: &str, image: &DynamicImage) -> bool {
        self.panoramas.contains(name)
            || (self.detect_panoramas && has_panorama_shape(image.width(), image.height()))
    }
}

/// Equirectangular panoramas are twice as wide as they are tall.
pub fn has_panorama_shape(width: u32, height: u32) -> bool {
    height > 0 && width == 2 * height
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Extracted { features: usize, panorama: bool },
    /// The features file already existed.
    Skipped,
}

/// Extract, save and optionally render the features of one image.
pub fn process_image(
    dataset: &Dataset,
    name: &str,
    config: &FeaturesConfig,
    options: &ExtractOptions,
) -> Result<Outcome> {
    let output = dataset.features_path(name);
    if output.exists() && !options.overwrite {
        debug!("{} already has features, skipping", name);
        return Ok(Outcome::Skipped);
    }
    let image = image::open(dataset.image_path(name))?;
    let panorama = options.is_panorama(name, &image);
    let features = extract_features(&image, config, panorama)?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    features.save(&output, config)?;

    if options.render {
        let rendered = dataset.rendered_path(name);
        if let Some(parent) = rendered.parent() {
            std::fs::create_dir_all(parent)?;
        }
        render_keypoints(&image, &features).save(&rendered)?;
    }
    Ok(Outcome::Extracted {
        features: features.len(),
        panorama,
    })
}

/// Draw every keypoint as a cross with a circle of its size.
pub fn render_keypoints(image: &DynamicImage, features: &FeaturesData) -> RgbaImage {
    let (width, height) = (image.width(), image.height());
    let scale = f64::from(width.max(height));
    let mut canvas = drawing::Blend(image.to_rgba8());
    for point in features.points.rows() {
        let (x, y) =
            denormalized_image_coordinate(f64::from(point[0]), f64::from(point[1]), width, height);
        let radius = (f64::from(point[2]) * scale / 2.0).round().max(1.0) as i32;
        let center = (x.round() as i32, y.round() as i32);
        drawing::draw_hollow_circle_mut(&mut canvas, center, radius, Rgba([255, 64, 0, 160]));
        drawing::draw_cross_mut(&mut canvas, Rgba([0, 255, 255, 200]), center.0, center.1);
    }
    canvas.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn squares() -> GrayImage {
        GrayImage::from_fn(240, 240, |x, y| {
            let inside =
                |x0: u32, y0: u32, side: u32| x >= x0 && x < x0 + side && y >= y0 && y < y0 + side;
            if inside(50, 50, 40) || inside(130, 60, 50) || inside(70, 140, 60) {
                Luma([230])
            } else {
                Luma([25])
            }
        })
    }

    fn dataset_with_images(names: &[&str]) -> (tempfile::TempDir, Dataset) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        for name in names {
            squares().save(dir.path().join("images").join(name)).unwrap();
        }
        let dataset = Dataset::new(dir.path());
        (dir, dataset)
    }

    #[test]
    fn lists_only_images() {
        let (dir, dataset) = dataset_with_images(&["b.png", "a.png"]);
        std::fs::write(dir.path().join("images").join("notes.txt"), "x").unwrap();
        assert_eq!(dataset.images().unwrap(), vec!["a.png", "b.png"]);
        assert!(dataset.features_path("a.png").ends_with("features/a.png.features.npz"));
        assert!(dataset.rendered_path("a.png").ends_with("rendered/a.png_features.png"));
    }

    #[test]
    fn config_falls_back_to_defaults() {
        let (dir, dataset) = dataset_with_images(&[]);
        assert_eq!(dataset.load_config(None).unwrap().feature_type, FeatureType::Hahog);
        std::fs::write(dir.path().join("config.yaml"), "feature_type: ORB\n").unwrap();
        assert_eq!(dataset.load_config(None).unwrap().feature_type, FeatureType::Orb);
        assert!(dataset.load_config(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn panorama_detection() {
        assert!(has_panorama_shape(4000, 2000));
        assert!(!has_panorama_shape(4000, 3000));
        assert!(!has_panorama_shape(0, 0));
        let image = DynamicImage::ImageLuma8(GrayImage::new(20, 10));
        let mut options = ExtractOptions::default();
        assert!(!options.is_panorama("a.png", &image));
        options.detect_panoramas = true;
        assert!(options.is_panorama("a.png", &image));
        let square = DynamicImage::ImageLuma8(GrayImage::new(10, 10));
        options.panoramas.insert("b.png".to_owned());
        assert!(options.is_panorama("b.png", &square));
    }

    #[test]
    fn extracts_saves_and_renders() {
        let (_dir, dataset) = dataset_with_images(&["squares.png"]);
        let mut config = FeaturesConfig::new(FeatureType::Orb);
        config.feature_min_frames = 20;
        let options = ExtractOptions {
            render: true,
            ..Default::default()
        };
        let outcome = process_image(&dataset, "squares.png", &config, &options).unwrap();
        let count = match outcome {
            Outcome::Extracted { features, panorama } => {
                assert!(!panorama);
                features
            }
            Outcome::Skipped => panic!("nothing was extracted"),
        };
        assert!(count > 0);
        let loaded =
            FeaturesData::from_file(dataset.features_path("squares.png"), &config).unwrap();
        assert_eq!(loaded.len(), count);
        assert!(dataset.rendered_path("squares.png").exists());

        let again = process_image(&dataset, "squares.png", &config, &options).unwrap();
        assert_eq!(again, Outcome::Skipped);
    }

    #[test]
    fn broken_images_fail_alone() {
        let (dir, dataset) = dataset_with_images(&["good.png"]);
        std::fs::write(dir.path().join("images").join("bad.png"), b"not a png").unwrap();
        let config = FeaturesConfig::new(FeatureType::Orb);
        let options = ExtractOptions::default();
        assert!(process_image(&dataset, "bad.png", &config, &options).is_err());
        assert!(process_image(&dataset, "good.png", &config, &options).is_ok());
    }
}
