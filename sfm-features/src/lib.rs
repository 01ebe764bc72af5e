//! Feature extraction for structure from motion.
//!
//! An image goes in, a [`FeaturesData`] comes out: keypoints in normalized image
//! coordinates, one descriptor per keypoint and the color under each keypoint.
//! Five detectors are available through [`FeatureType`], panoramas can be
//! processed through a cubemap, and feature sets can be written to and read back
//! from a versioned file format.
//!
//! ```no_run
//! use sfm_features::{extract_features, FeatureType, FeaturesConfig};
//!
//! let image = image::open("photo.jpg").unwrap();
//! let config = FeaturesConfig::new(FeatureType::Hahog);
//! let features = extract_features(&image, &config, false).unwrap();
//! features.save("photo.features.npz", &config).unwrap();
//! ```

pub mod camera;
pub mod config;
pub mod detector;
mod error;
pub mod extract;
pub mod features_data;
pub mod image;
pub mod io;
pub mod normalize;
pub mod panorama;
pub mod root;

pub use crate::config::{AkazeDescriptor, FeatureType, FeaturesConfig};
pub use crate::detector::{run_feature_extractor, DetectorOutput, Keypoint};
pub use crate::error::{Error, Result};
pub use crate::extract::extract_features;
pub use crate::features_data::{Descriptors, FeaturesData, SemanticData};
pub use crate::image::GrayFloatImage;
pub use crate::io::FormatVersion;
