use crate::{Error, Result};
use ndarray::{concatenate, Array2, ArrayView2, Axis};

/// Per-keypoint descriptor rows, either floating point or bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    Float(Array2<f32>),
    Byte(Array2<u8>),
}

impl Descriptors {
    /// Zero rows of the given width.
    pub fn empty_float(width: usize) -> Self {
        Self::Float(Array2::zeros((0, width)))
    }

    pub fn empty_byte(width: usize) -> Self {
        Self::Byte(Array2::zeros((0, width)))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float(d) => d.nrows(),
            Self::Byte(d) => d.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements per descriptor.
    pub fn width(&self) -> usize {
        match self {
            Self::Float(d) => d.ncols(),
            Self::Byte(d) => d.ncols(),
        }
    }

    pub fn is_byte(&self) -> bool {
        matches!(self, Self::Byte(_))
    }

    /// Keep the rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        match self {
            Self::Float(d) => Self::Float(d.select(Axis(0), indices)),
            Self::Byte(d) => Self::Byte(d.select(Axis(0), indices)),
        }
    }

    /// Widen to floating point.
    pub fn to_float(&self) -> Array2<f32> {
        match self {
            Self::Float(d) => d.clone(),
            Self::Byte(d) => d.mapv(f32::from),
        }
    }

    /// Narrow to bytes, saturating values outside 0..=255.
    pub fn to_byte(&self) -> Array2<u8> {
        match self {
            Self::Float(d) => d.mapv(|v| v as u8),
            Self::Byte(d) => d.clone(),
        }
    }

    /// Stack descriptor sets of the same kind and width.
    ///
    /// Returns `None` for an empty slice or when the parts disagree.
    pub fn concatenate(parts: &[&Descriptors]) -> Option<Self> {
        match parts.first()? {
            Self::Float(_) => {
                let views = parts
                    .iter()
                    .map(|p| match p {
                        Self::Float(d) => Some(d.view()),
                        Self::Byte(_) => None,
                    })
                    .collect::<Option<Vec<ArrayView2<f32>>>>()?;
                concatenate(Axis(0), &views).ok().map(Self::Float)
            }
            Self::Byte(_) => {
                let views = parts
                    .iter()
                    .map(|p| match p {
                        Self::Byte(d) => Some(d.view()),
                        Self::Float(_) => None,
                    })
                    .collect::<Option<Vec<ArrayView2<u8>>>>()?;
                concatenate(Axis(0), &views).ok().map(Self::Byte)
            }
        }
    }
}

/// Segmentation output attached to a feature set.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticData {
    pub segmentation: Array2<u8>,
    pub instances: Option<Array2<i16>>,
    /// Segment class descriptions, indexed by segmentation label.
    pub labels: Vec<String>,
}

impl SemanticData {
    pub fn new(
        segmentation: Array2<u8>,
        instances: Option<Array2<i16>>,
        labels: Vec<String>,
    ) -> Self {
        Self {
            segmentation,
            instances,
            labels,
        }
    }

    pub fn has_instances(&self) -> bool {
        self.instances.is_some()
    }

    /// Filter the rows of segmentation and instances with the same mask.
    pub fn mask(&self, mask: &[bool]) -> Result<Self> {
        check_mask(mask, self.segmentation.shape())?;
        if let Some(instances) = &self.instances {
            check_mask(mask, instances.shape())?;
        }
        let indices = selected(mask);
        Ok(Self {
            segmentation: self.segmentation.select(Axis(0), &indices),
            instances: self.instances.as_ref().map(|i| i.select(Axis(0), &indices)),
            labels: self.labels.clone(),
        })
    }

    /// Whether a mask of length `len` applies to these arrays.
    fn accepts_mask_len(&self, len: usize) -> bool {
        self.segmentation.nrows() == len
            && self.instances.as_ref().map_or(true, |i| i.nrows() == len)
    }
}

/// Keypoints, descriptors, colors and optional semantic data of one image.
///
/// `points` holds one `(x, y, size, angle)` row per keypoint in normalized image
/// coordinates. Row `i` of every per-keypoint array describes keypoint `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturesData {
    pub points: Array2<f32>,
    pub descriptors: Descriptors,
    pub colors: Array2<u8>,
    pub semantic: Option<SemanticData>,
}

impl FeaturesData {
    pub fn new(
        points: Array2<f32>,
        descriptors: Descriptors,
        colors: Array2<u8>,
        semantic: Option<SemanticData>,
    ) -> Self {
        Self {
            points,
            descriptors,
            colors,
            semantic,
        }
    }

    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_segmentation(&self) -> Option<&Array2<u8>> {
        self.semantic.as_ref().map(|s| &s.segmentation)
    }

    pub fn has_instances(&self) -> bool {
        self.semantic.as_ref().map_or(false, SemanticData::has_instances)
    }

    /// Keep the keypoints selected by `mask`, returning a new feature set.
    ///
    /// Semantic arrays with one row per keypoint are filtered with the same mask;
    /// arrays laid out on the pixel grid are carried over unchanged.
    pub fn mask(&self, mask: &[bool]) -> Result<Self> {
        check_mask(mask, self.points.shape())?;
        let indices = selected(mask);
        let semantic = match &self.semantic {
            Some(semantic) if semantic.accepts_mask_len(mask.len()) => Some(semantic.mask(mask)?),
            other => other.clone(),
        };
        Ok(Self {
            points: self.points.select(Axis(0), &indices),
            descriptors: self.descriptors.select(&indices),
            colors: self.colors.select(Axis(0), &indices),
            semantic,
        })
    }
}

fn check_mask(mask: &[bool], shape: &[usize]) -> Result<()> {
    if shape.first() == Some(&mask.len()) {
        Ok(())
    } else {
        Err(Error::MaskShapeMismatch {
            mask: mask.len(),
            shape: shape.to_vec(),
        })
    }
}

fn selected(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &keep)| keep.then(|| i))
        .collect()
}
