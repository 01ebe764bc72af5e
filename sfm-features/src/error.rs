use thiserror::Error;

/// Everything that can abort the extraction or serialization of one image.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported feature type: {0}")]
    UnsupportedFeatureType(String),
    #[error("unsupported AKAZE descriptor: {0}")]
    UnsupportedAkazeDescriptor(String),
    #[error("missing required configuration key: {0}")]
    MissingConfigKey(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to parse configuration: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error(
        "cannot save a feature set without descriptors ({points} points, {descriptors} descriptors)"
    )]
    MissingDescriptors { points: usize, descriptors: usize },
    #[error(
        "features file version {0} is not supported: its semantic arrays require unsafe \
         object deserialization, which can execute arbitrary code (remote code execution) \
         on load; re-extract the features to produce a current file"
    )]
    UnsupportedLegacyFormat(i64),
    #[error("unknown features file version {0}")]
    UnknownFormatVersion(i64),
    #[error("mask of length {mask} does not match array with shape {shape:?}")]
    MaskShapeMismatch { mask: usize, shape: Vec<usize> },
    #[error("not a features file")]
    NotAFeaturesFile,
    #[error("features file is missing array `{0}`")]
    MissingArray(&'static str),
    #[error("features file array `{name}` is malformed: {reason}")]
    MalformedArray { name: String, reason: String },
    #[error("features file array `{0}` holds pickled objects, which are never loaded")]
    ObjectArray(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("features archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("failed to read array: {0}")]
    ReadArray(#[from] ndarray_npy::ReadNpyError),
    #[error("failed to write array: {0}")]
    WriteArray(#[from] ndarray_npy::WriteNpyError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
