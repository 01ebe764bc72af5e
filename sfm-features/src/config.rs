use crate::{Error, Result};
use serde::Deserialize;
use std::{fmt, path::Path, str::FromStr};

/// The detector backends that can be selected with `feature_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureType {
    Sift,
    Surf,
    Akaze,
    Hahog,
    Orb,
}

impl FromStr for FeatureType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SIFT" => Ok(Self::Sift),
            "SURF" => Ok(Self::Surf),
            "AKAZE" => Ok(Self::Akaze),
            "HAHOG" => Ok(Self::Hahog),
            "ORB" => Ok(Self::Orb),
            _ => Err(Error::UnsupportedFeatureType(s.to_owned())),
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sift => "SIFT",
            Self::Surf => "SURF",
            Self::Akaze => "AKAZE",
            Self::Hahog => "HAHOG",
            Self::Orb => "ORB",
        };
        f.write_str(name)
    }
}

/// Descriptor computed by the AKAZE backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AkazeDescriptor {
    SurfUpright,
    Surf,
    MsurfUpright,
    Msurf,
    MldbUpright,
    Mldb,
}

impl AkazeDescriptor {
    /// Binary descriptors are stored as bytes.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Mldb | Self::MldbUpright)
    }

    /// Upright descriptors skip orientation estimation.
    pub fn is_upright(self) -> bool {
        matches!(self, Self::SurfUpright | Self::MsurfUpright | Self::MldbUpright)
    }
}

impl FromStr for AkazeDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SURF_UPRIGHT" => Ok(Self::SurfUpright),
            "SURF" => Ok(Self::Surf),
            "MSURF_UPRIGHT" => Ok(Self::MsurfUpright),
            "MSURF" => Ok(Self::Msurf),
            "MLDB_UPRIGHT" => Ok(Self::MldbUpright),
            "MLDB" => Ok(Self::Mldb),
            _ => Err(Error::UnsupportedAkazeDescriptor(s.to_owned())),
        }
    }
}

/// Validated options of the feature extraction stage.
///
/// Built either from [`FeaturesConfig::new`] followed by field updates, or parsed
/// from YAML with [`FeaturesConfig::from_yaml_str`], which rejects unknown keys and
/// requires `feature_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturesConfig {
    pub feature_type: FeatureType,
    /// Apply the root (Hellinger) transform to descriptors.
    pub feature_root: bool,
    /// Target keypoint count for perspective images.
    pub feature_min_frames: usize,
    /// Target keypoint count for panoramas.
    pub feature_min_frames_panorama: usize,
    /// Maximum size of the larger image side, 0 to keep the original size.
    pub feature_process_size: u32,
    pub feature_process_size_panorama: u32,
    pub feature_use_adaptive_suppression: bool,
    pub feature_extract_from_cubemap_panorama: bool,
    pub feature_extract_from_cubemap_augmented: bool,
    /// Lowest threshold the adaptive search may reach.
    pub feature_adaptive_threshold_floor: f64,
    pub sift_peak_threshold: f64,
    pub sift_edge_threshold: f64,
    pub surf_hessian_threshold: f64,
    pub surf_n_octaves: usize,
    pub surf_n_octavelayers: usize,
    pub surf_upright: bool,
    pub akaze_omax: usize,
    pub akaze_dthreshold: f64,
    pub akaze_descriptor: AkazeDescriptor,
    /// Descriptor length in bits for MLDB, 0 for the full length.
    pub akaze_descriptor_size: usize,
    pub akaze_descriptor_channels: usize,
    pub akaze_kcontrast_percentile: f64,
    pub akaze_use_isotropic_diffusion: bool,
    pub hahog_peak_threshold: f64,
    pub hahog_edge_threshold: f64,
    pub hahog_normalize_to_uchar: bool,
    /// Keypoint scale assigned when loading version 0 feature files.
    pub reprojection_error_sd: f64,
}

impl FeaturesConfig {
    /// Default options for the given detector.
    pub fn new(feature_type: FeatureType) -> Self {
        Self {
            feature_type,
            feature_root: true,
            feature_min_frames: 4000,
            feature_min_frames_panorama: 16000,
            feature_process_size: 2048,
            feature_process_size_panorama: 4096,
            feature_use_adaptive_suppression: false,
            feature_extract_from_cubemap_panorama: false,
            feature_extract_from_cubemap_augmented: false,
            feature_adaptive_threshold_floor: 1e-4,
            sift_peak_threshold: 0.1,
            sift_edge_threshold: 10.0,
            surf_hessian_threshold: 3000.0,
            surf_n_octaves: 4,
            surf_n_octavelayers: 2,
            surf_upright: false,
            akaze_omax: 4,
            akaze_dthreshold: 0.001,
            akaze_descriptor: AkazeDescriptor::Msurf,
            akaze_descriptor_size: 0,
            akaze_descriptor_channels: 3,
            akaze_kcontrast_percentile: 0.7,
            akaze_use_isotropic_diffusion: false,
            hahog_peak_threshold: 1e-5,
            hahog_edge_threshold: 10.0,
            hahog_normalize_to_uchar: true,
            reprojection_error_sd: 0.004,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;
        raw.validate()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// Check value ranges that the detectors rely on.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("feature_adaptive_threshold_floor", self.feature_adaptive_threshold_floor),
            ("sift_peak_threshold", self.sift_peak_threshold),
            ("sift_edge_threshold", self.sift_edge_threshold),
            ("surf_hessian_threshold", self.surf_hessian_threshold),
            ("akaze_dthreshold", self.akaze_dthreshold),
            ("hahog_peak_threshold", self.hahog_peak_threshold),
            ("hahog_edge_threshold", self.hahog_edge_threshold),
        ];
        for (key, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    key, value
                )));
            }
        }
        if !(1..=3).contains(&self.akaze_descriptor_channels) {
            return Err(Error::InvalidConfig(format!(
                "akaze_descriptor_channels must be 1, 2 or 3, got {}",
                self.akaze_descriptor_channels
            )));
        }
        if !(self.akaze_kcontrast_percentile > 0.0 && self.akaze_kcontrast_percentile <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "akaze_kcontrast_percentile must be in (0, 1], got {}",
                self.akaze_kcontrast_percentile
            )));
        }
        if self.akaze_omax == 0 || self.surf_n_octaves == 0 || self.surf_n_octavelayers == 0 {
            return Err(Error::InvalidConfig(
                "akaze_omax, surf_n_octaves and surf_n_octavelayers must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Whether the descriptors of this configuration are persisted as bytes.
    pub fn stores_byte_descriptors(&self) -> bool {
        match self.feature_type {
            FeatureType::Akaze => self.akaze_descriptor.is_binary(),
            FeatureType::Hahog => self.hahog_normalize_to_uchar,
            FeatureType::Orb => true,
            FeatureType::Sift | FeatureType::Surf => false,
        }
    }
}

/// Configuration as written in YAML, before validation.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    feature_type: Option<String>,
    feature_root: bool,
    feature_min_frames: usize,
    feature_min_frames_panorama: usize,
    feature_process_size: u32,
    feature_process_size_panorama: u32,
    feature_use_adaptive_suppression: bool,
    feature_extract_from_cubemap_panorama: bool,
    feature_extract_from_cubemap_augmented: bool,
    feature_adaptive_threshold_floor: f64,
    sift_peak_threshold: f64,
    sift_edge_threshold: f64,
    surf_hessian_threshold: f64,
    surf_n_octaves: usize,
    surf_n_octavelayers: usize,
    surf_upright: bool,
    akaze_omax: usize,
    akaze_dthreshold: f64,
    akaze_descriptor: String,
    akaze_descriptor_size: usize,
    akaze_descriptor_channels: usize,
    akaze_kcontrast_percentile: f64,
    akaze_use_isotropic_diffusion: bool,
    hahog_peak_threshold: f64,
    hahog_edge_threshold: f64,
    hahog_normalize_to_uchar: bool,
    reprojection_error_sd: f64,
}

impl Default for RawConfig {
    fn default() -> Self {
        let d = FeaturesConfig::new(FeatureType::Hahog);
        Self {
            feature_type: None,
            feature_root: d.feature_root,
            feature_min_frames: d.feature_min_frames,
            feature_min_frames_panorama: d.feature_min_frames_panorama,
            feature_process_size: d.feature_process_size,
            feature_process_size_panorama: d.feature_process_size_panorama,
            feature_use_adaptive_suppression: d.feature_use_adaptive_suppression,
            feature_extract_from_cubemap_panorama: d.feature_extract_from_cubemap_panorama,
            feature_extract_from_cubemap_augmented: d.feature_extract_from_cubemap_augmented,
            feature_adaptive_threshold_floor: d.feature_adaptive_threshold_floor,
            sift_peak_threshold: d.sift_peak_threshold,
            sift_edge_threshold: d.sift_edge_threshold,
            surf_hessian_threshold: d.surf_hessian_threshold,
            surf_n_octaves: d.surf_n_octaves,
            surf_n_octavelayers: d.surf_n_octavelayers,
            surf_upright: d.surf_upright,
            akaze_omax: d.akaze_omax,
            akaze_dthreshold: d.akaze_dthreshold,
            akaze_descriptor: "MSURF".to_owned(),
            akaze_descriptor_size: d.akaze_descriptor_size,
            akaze_descriptor_channels: d.akaze_descriptor_channels,
            akaze_kcontrast_percentile: d.akaze_kcontrast_percentile,
            akaze_use_isotropic_diffusion: d.akaze_use_isotropic_diffusion,
            hahog_peak_threshold: d.hahog_peak_threshold,
            hahog_edge_threshold: d.hahog_edge_threshold,
            hahog_normalize_to_uchar: d.hahog_normalize_to_uchar,
            reprojection_error_sd: d.reprojection_error_sd,
        }
    }
}

impl RawConfig {
    fn validate(self) -> Result<FeaturesConfig> {
        let feature_type = self
            .feature_type
            .as_deref()
            .ok_or(Error::MissingConfigKey("feature_type"))?
            .parse()?;
        let config = FeaturesConfig {
            feature_type,
            feature_root: self.feature_root,
            feature_min_frames: self.feature_min_frames,
            feature_min_frames_panorama: self.feature_min_frames_panorama,
            feature_process_size: self.feature_process_size,
            feature_process_size_panorama: self.feature_process_size_panorama,
            feature_use_adaptive_suppression: self.feature_use_adaptive_suppression,
            feature_extract_from_cubemap_panorama: self.feature_extract_from_cubemap_panorama,
            feature_extract_from_cubemap_augmented: self.feature_extract_from_cubemap_augmented,
            feature_adaptive_threshold_floor: self.feature_adaptive_threshold_floor,
            sift_peak_threshold: self.sift_peak_threshold,
            sift_edge_threshold: self.sift_edge_threshold,
            surf_hessian_threshold: self.surf_hessian_threshold,
            surf_n_octaves: self.surf_n_octaves,
            surf_n_octavelayers: self.surf_n_octavelayers,
            surf_upright: self.surf_upright,
            akaze_omax: self.akaze_omax,
            akaze_dthreshold: self.akaze_dthreshold,
            akaze_descriptor: self.akaze_descriptor.parse()?,
            akaze_descriptor_size: self.akaze_descriptor_size,
            akaze_descriptor_channels: self.akaze_descriptor_channels,
            akaze_kcontrast_percentile: self.akaze_kcontrast_percentile,
            akaze_use_isotropic_diffusion: self.akaze_use_isotropic_diffusion,
            hahog_peak_threshold: self.hahog_peak_threshold,
            hahog_edge_threshold: self.hahog_edge_threshold,
            hahog_normalize_to_uchar: self.hahog_normalize_to_uchar,
            reprojection_error_sd: self.reprojection_error_sd,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = FeaturesConfig::from_yaml_str("feature_type: akaze\n").unwrap();
        assert_eq!(config, FeaturesConfig::new(FeatureType::Akaze));
    }

    #[test]
    fn parses_overrides() {
        let yaml = "feature_type: SIFT\nsift_peak_threshold: 0.05\nfeature_root: false\n\
                    akaze_descriptor: MLDB_UPRIGHT\n";
        let config = FeaturesConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.feature_type, FeatureType::Sift);
        assert_eq!(config.sift_peak_threshold, 0.05);
        assert!(!config.feature_root);
        assert_eq!(config.akaze_descriptor, AkazeDescriptor::MldbUpright);
    }

    #[test]
    fn rejects_unknown_feature_type() {
        let err = FeaturesConfig::from_yaml_str("feature_type: BRISK\n").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeatureType(name) if name == "BRISK"));
    }

    #[test]
    fn rejects_missing_feature_type() {
        let err = FeaturesConfig::from_yaml_str("feature_root: true\n").unwrap_err();
        assert!(matches!(err, Error::MissingConfigKey("feature_type")));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err =
            FeaturesConfig::from_yaml_str("feature_type: orb\nfeature_bogus: 3\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_akaze_descriptor() {
        let err = FeaturesConfig::from_yaml_str("feature_type: akaze\nakaze_descriptor: KAZE\n")
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAkazeDescriptor(_)));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let yaml = "feature_type: akaze\nakaze_descriptor_channels: 4\n";
        let err = FeaturesConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn byte_storage_follows_descriptor_family() {
        let mut config = FeaturesConfig::new(FeatureType::Akaze);
        assert!(!config.stores_byte_descriptors());
        config.akaze_descriptor = AkazeDescriptor::Mldb;
        assert!(config.stores_byte_descriptors());
        assert!(FeaturesConfig::new(FeatureType::Orb).stores_byte_descriptors());
        assert!(FeaturesConfig::new(FeatureType::Hahog).stores_byte_descriptors());
        assert!(!FeaturesConfig::new(FeatureType::Sift).stores_byte_descriptors());
    }
}
