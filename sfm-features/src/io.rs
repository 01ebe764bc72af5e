//! Versioned on-disk feature sets.
//!
//! A features file is a compressed npz archive: a zip holding one `.npy` entry per named
//! array (`points`, `descriptors`, `colors`, `segmentations`, `instances` and
//! `segmentation_labels`). The scalar `OPENSFM_FEATURES_VERSION` entry tags the layout;
//! files without it are version 0.

use crate::config::{FeatureType, FeaturesConfig};
use crate::features_data::{Descriptors, FeaturesData, SemanticData};
use crate::{Error, Result};
use log::*;
use ndarray::{Array, Array2, ArrayD, Dimension, IxDyn};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const VERSION_KEY: &str = "OPENSFM_FEATURES_VERSION";

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// One array of the archive.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredArray {
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Uint8(ArrayD<u8>),
    Int16(ArrayD<i16>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    /// Fixed width unicode strings (`<U` dtype).
    Strings(Vec<String>),
}

impl StoredArray {
    fn kind(&self) -> &'static str {
        match self {
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Uint8(_) => "uint8",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Strings(_) => "unicode",
        }
    }

    fn shape(&self) -> Vec<usize> {
        match self {
            Self::Float32(a) => a.shape().to_vec(),
            Self::Float64(a) => a.shape().to_vec(),
            Self::Uint8(a) => a.shape().to_vec(),
            Self::Int16(a) => a.shape().to_vec(),
            Self::Int32(a) => a.shape().to_vec(),
            Self::Int64(a) => a.shape().to_vec(),
            Self::Strings(s) => vec![s.len()],
        }
    }

    /// Whether the array has no entries along its first axis.
    ///
    /// Scalars are never empty.
    pub fn is_empty(&self) -> bool {
        self.shape().first() == Some(&0)
    }

    /// The single value of a scalar or one-element integer array.
    fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Int64(a) if a.len() == 1 => a.iter().next().copied(),
            Self::Int32(a) if a.len() == 1 => a.iter().next().map(|&v| i64::from(v)),
            _ => None,
        }
    }

    fn write_npy(&self, writer: impl Write) -> Result<()> {
        match self {
            Self::Float32(a) => a.write_npy(writer)?,
            Self::Float64(a) => a.write_npy(writer)?,
            Self::Uint8(a) => a.write_npy(writer)?,
            Self::Int16(a) => a.write_npy(writer)?,
            Self::Int32(a) => a.write_npy(writer)?,
            Self::Int64(a) => a.write_npy(writer)?,
            Self::Strings(s) => write_unicode(s, writer)?,
        }
        Ok(())
    }
}

macro_rules! stored_array_conversions {
    ($variant:ident, $t:ty) => {
        impl<D: Dimension> From<&Array<$t, D>> for StoredArray {
            fn from(array: &Array<$t, D>) -> Self {
                Self::$variant(array.to_owned().into_dyn())
            }
        }
    };
}

stored_array_conversions!(Float32, f32);
stored_array_conversions!(Float64, f64);
stored_array_conversions!(Uint8, u8);
stored_array_conversions!(Int16, i16);
stored_array_conversions!(Int32, i32);
stored_array_conversions!(Int64, i64);

/// An empty float64 vector, which is how absent optional arrays are stored.
fn absent() -> StoredArray {
    StoredArray::Float64(ArrayD::zeros(IxDyn(&[0])))
}

fn malformed(name: &str, reason: impl Into<String>) -> Error {
    Error::MalformedArray {
        name: name.to_owned(),
        reason: reason.into(),
    }
}

/// Element type named by the `descr` field of an npy header.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Dtype {
    Float32,
    Float64,
    Uint8,
    Int16,
    Int32,
    Int64,
    /// Little endian UTF-32 strings of a fixed number of code points.
    Unicode(usize),
    /// Pickled objects.
    Object,
    Other(String),
}

impl Dtype {
    fn from_descr(descr: &str) -> Self {
        let little = !descr.starts_with('>');
        let code = descr.trim_start_matches(|c| matches!(c, '<' | '>' | '|' | '='));
        match code {
            "f4" => Self::Float32,
            "f8" => Self::Float64,
            "u1" => Self::Uint8,
            "i2" => Self::Int16,
            "i4" => Self::Int32,
            "i8" => Self::Int64,
            "O" => Self::Object,
            _ => match code.strip_prefix('U').map(str::parse) {
                Some(Ok(width)) if little => Self::Unicode(width),
                _ => Self::Other(descr.to_owned()),
            },
        }
    }
}

/// The quoted value of `'descr'` in an npy header dictionary.
///
/// Structured dtypes are written as a list and yield `None`.
fn header_descr(header: &str) -> Option<&str> {
    let key = "'descr'";
    let rest = &header[header.find(key)? + key.len()..];
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    let quote = rest.chars().next().filter(|&c| c == '\'' || c == '"')?;
    let rest = &rest[1..];
    Some(&rest[..rest.find(quote)?])
}

/// Parse the header of one npy entry without touching its data.
///
/// Returns the element type and the offset of the data.
fn npy_header(name: &str, bytes: &[u8]) -> Result<(Dtype, usize)> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(malformed(name, "not an npy array"));
    }
    let (length, start) = match bytes[6] {
        1 => (usize::from(u16::from_le_bytes([bytes[8], bytes[9]])), 10),
        2 | 3 if bytes.len() >= 12 => {
            let length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (length as usize, 12)
        }
        major => return Err(malformed(name, format!("unsupported npy version {}", major))),
    };
    let header = bytes
        .get(start..start + length)
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| malformed(name, "truncated npy header"))?;
    let dtype = match header_descr(header) {
        Some(descr) => Dtype::from_descr(descr),
        None => Dtype::Other(header.trim().to_owned()),
    };
    Ok((dtype, start + length))
}

fn read_unicode(name: &str, width: usize, data: &[u8]) -> Result<Vec<String>> {
    if width == 0 {
        return Ok(vec![]);
    }
    let item = 4 * width;
    if data.len() % item != 0 {
        return Err(malformed(name, "unicode data is not a whole number of items"));
    }
    data.chunks_exact(item)
        .map(|chunk| {
            chunk
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .take_while(|&c| c != 0)
                .map(|c| char::from_u32(c).ok_or_else(|| malformed(name, "invalid code point")))
                .collect::<Result<String>>()
        })
        .collect()
}

/// Write a one dimensional `<U` array the way numpy does.
fn write_unicode(strings: &[String], mut writer: impl Write) -> Result<()> {
    let width = strings
        .iter()
        .map(|s| s.chars().count())
        .max()
        .unwrap_or(0)
        .max(1);
    let mut header = format!(
        "{{'descr': '<U{}', 'fortran_order': False, 'shape': ({},), }}",
        width,
        strings.len()
    );
    // Magic, version and length take ten bytes and the data starts 64-byte aligned.
    let used = 10 + header.len() + 1;
    header.extend(std::iter::repeat(' ').take((64 - used % 64) % 64));
    header.push('\n');
    let length = u16::try_from(header.len()).map_err(|_| malformed("unicode", "header too long"))?;

    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    for s in strings {
        let padded = s.chars().map(u32::from).chain(std::iter::repeat(0)).take(width);
        for c in padded {
            writer.write_all(&c.to_le_bytes())?;
        }
    }
    Ok(())
}

fn decode(name: &str, dtype: Dtype, bytes: &[u8], data_start: usize) -> Result<StoredArray> {
    Ok(match dtype {
        Dtype::Float32 => StoredArray::Float32(ArrayD::read_npy(bytes)?),
        Dtype::Float64 => StoredArray::Float64(ArrayD::read_npy(bytes)?),
        Dtype::Uint8 => StoredArray::Uint8(ArrayD::read_npy(bytes)?),
        Dtype::Int16 => StoredArray::Int16(ArrayD::read_npy(bytes)?),
        Dtype::Int32 => StoredArray::Int32(ArrayD::read_npy(bytes)?),
        Dtype::Int64 => StoredArray::Int64(ArrayD::read_npy(bytes)?),
        Dtype::Unicode(width) => {
            StoredArray::Strings(read_unicode(name, width, &bytes[data_start..])?)
        }
        Dtype::Object => return Err(Error::ObjectArray(name.to_owned())),
        Dtype::Other(descr) => return Err(malformed(name, format!("unsupported dtype {}", descr))),
    })
}

/// Layout of a features file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Points, descriptors and colors; the scale column was not meaningful.
    V0,
    /// Points, descriptors and colors.
    V1,
    /// Semantic arrays stored as pickled objects.
    V2,
    /// Semantic arrays stored as plain arrays, empty when absent.
    V3,
}

impl FormatVersion {
    pub const CURRENT: Self = Self::V3;

    pub fn from_number(version: i64) -> Result<Self> {
        match version {
            0 => Ok(Self::V0),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(Error::UnknownFormatVersion(other)),
        }
    }

    pub fn number(self) -> i64 {
        match self {
            Self::V0 => 0,
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }
}

/// The named arrays of a decoded archive, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayArchive {
    pub arrays: Vec<(String, StoredArray)>,
}

impl ArrayArchive {
    pub fn push(&mut self, name: &str, array: StoredArray) {
        self.arrays.push((name.to_owned(), array));
    }

    pub fn get(&self, name: &str) -> Option<&StoredArray> {
        self.arrays.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    fn take(&mut self, name: &'static str) -> Result<StoredArray> {
        self.take_optional(name).ok_or(Error::MissingArray(name))
    }

    fn take_optional(&mut self, name: &str) -> Option<StoredArray> {
        let index = self.arrays.iter().position(|(n, _)| n == name)?;
        Some(self.arrays.remove(index).1)
    }

    pub fn version(&self) -> Result<FormatVersion> {
        match self.get(VERSION_KEY) {
            None => Ok(FormatVersion::V0),
            Some(array) => match array.as_integer() {
                Some(version) => FormatVersion::from_number(version),
                None => Err(malformed(
                    VERSION_KEY,
                    format!(
                        "expected one integer, got {} with shape {:?}",
                        array.kind(),
                        array.shape()
                    ),
                )),
            },
        }
    }

    /// Write a compressed npz archive.
    pub fn write_to<W: Write + Seek>(&self, writer: W) -> Result<()> {
        let mut zip = ZipWriter::new(writer);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, array) in &self.arrays {
            zip.start_file(format!("{}.npy", name), options)?;
            array.write_npy(&mut zip)?;
        }
        zip.finish()?.flush()?;
        Ok(())
    }

    /// Read an npz archive.
    ///
    /// Version 2 archives and object arrays are refused from their headers alone, so
    /// pickled data is never decoded.
    pub fn read_from<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut zip = ZipArchive::new(reader).map_err(|e| match e {
            ZipError::Io(e) if e.kind() != std::io::ErrorKind::UnexpectedEof => Error::Io(e),
            _ => Error::NotAFeaturesFile,
        })?;

        let mut entries = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut file = zip.by_index(index)?;
            let name = file.name();
            let name = name.strip_suffix(".npy").unwrap_or(name).to_owned();
            let mut bytes = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut bytes)?;
            let (dtype, data_start) = npy_header(&name, &bytes)?;
            entries.push((name, dtype, bytes, data_start));
        }

        if let Some((name, dtype, bytes, start)) = entries.iter().find(|(n, ..)| n == VERSION_KEY) {
            let tag = decode(name, dtype.clone(), bytes, *start)?;
            let version = tag.as_integer().map(FormatVersion::from_number).transpose()?;
            if version == Some(FormatVersion::V2) {
                return Err(Error::UnsupportedLegacyFormat(2));
            }
        }
        if let Some((name, ..)) = entries.iter().find(|(_, dtype, ..)| *dtype == Dtype::Object) {
            return Err(Error::ObjectArray(name.clone()));
        }

        let arrays = entries
            .into_iter()
            .map(|(name, dtype, bytes, start)| {
                let array = decode(&name, dtype, &bytes, start)?;
                Ok((name, array))
            })
            .collect::<Result<_>>()?;
        Ok(Self { arrays })
    }
}

/// Reshape to two dimensions. A vector of `n` values becomes `n` rows of one column.
fn into_array2<T>(name: &str, array: ArrayD<T>) -> Result<Array2<T>> {
    let shape = array.shape().to_vec();
    let array = match shape.as_slice() {
        [0] => array.into_shape(IxDyn(&[0, 0])),
        &[n] => array.into_shape(IxDyn(&[n, 1])),
        _ => Ok(array),
    }
    .map_err(|e| malformed(name, e.to_string()))?;
    array
        .into_dimensionality()
        .map_err(|_| malformed(name, format!("expected 2 dimensions, got shape {:?}", shape)))
}

/// Two dimensional array with `columns` columns, or zero rows.
fn with_columns<T>(name: &str, array: Array2<T>, columns: usize) -> Result<Array2<T>> {
    if array.nrows() > 0 && array.ncols() != columns {
        return Err(malformed(
            name,
            format!("expected {} columns, got {}", columns, array.ncols()),
        ));
    }
    let rows = array.nrows();
    array
        .into_shape((rows, columns))
        .map_err(|e| malformed(name, e.to_string()))
}

fn unexpected(name: &str, array: &StoredArray) -> Error {
    malformed(name, format!("unexpected {} array", array.kind()))
}

fn points_array(array: StoredArray) -> Result<Array2<f32>> {
    let points = match array {
        StoredArray::Float32(a) => into_array2("points", a)?,
        StoredArray::Float64(a) => into_array2("points", a)?.mapv(|v| v as f32),
        other => return Err(unexpected("points", &other)),
    };
    with_columns("points", points, 4)
}

fn descriptors_array(array: StoredArray) -> Result<Descriptors> {
    match array {
        StoredArray::Float32(a) => Ok(Descriptors::Float(into_array2("descriptors", a)?)),
        StoredArray::Float64(a) => Ok(Descriptors::Float(
            into_array2("descriptors", a)?.mapv(|v| v as f32),
        )),
        StoredArray::Uint8(a) => Ok(Descriptors::Byte(into_array2("descriptors", a)?)),
        other => Err(unexpected("descriptors", &other)),
    }
}

fn colors_array(array: StoredArray) -> Result<Array2<u8>> {
    let to_byte = |v: f64| v.round().clamp(0.0, 255.0) as u8;
    let colors = match array {
        StoredArray::Uint8(a) => into_array2("colors", a)?,
        StoredArray::Float32(a) => into_array2("colors", a)?.mapv(|v| to_byte(f64::from(v))),
        StoredArray::Float64(a) => into_array2("colors", a)?.mapv(to_byte),
        StoredArray::Int64(a) => into_array2("colors", a)?.mapv(|v| v.clamp(0, 255) as u8),
        other => return Err(unexpected("colors", &other)),
    };
    with_columns("colors", colors, 3)
}

fn semantic_arrays(archive: &mut ArrayArchive) -> Result<Option<SemanticData>> {
    let segmentation = match archive.take("segmentations")? {
        StoredArray::Uint8(a) => into_array2("segmentations", a)?,
        empty if empty.is_empty() => Array2::zeros((0, 0)),
        other => return Err(unexpected("segmentations", &other)),
    };
    let instances = match archive.take("instances")? {
        StoredArray::Int16(a) => Some(into_array2("instances", a)?),
        empty if empty.is_empty() => None,
        other => return Err(unexpected("instances", &other)),
    };
    let labels = match archive.take_optional("segmentation_labels") {
        Some(StoredArray::Strings(labels)) => labels,
        Some(empty) if empty.is_empty() => vec![],
        None => vec![],
        Some(other) => return Err(unexpected("segmentation_labels", &other)),
    };
    let instances = instances.filter(|i| !i.is_empty());
    if segmentation.is_empty() && instances.is_none() {
        return Ok(None);
    }
    Ok(Some(SemanticData::new(segmentation, instances, labels)))
}

impl FeaturesData {
    /// Encode in the current layout.
    ///
    /// Descriptors are narrowed to bytes for the configurations that store them that
    /// way.
    pub fn to_archive(&self, config: &FeaturesConfig) -> Result<ArrayArchive> {
        if self.descriptors.len() != self.points.nrows() {
            return Err(Error::MissingDescriptors {
                points: self.points.nrows(),
                descriptors: self.descriptors.len(),
            });
        }
        let descriptors = if config.stores_byte_descriptors() {
            StoredArray::from(&self.descriptors.to_byte())
        } else {
            StoredArray::from(&self.descriptors.to_float())
        };
        let (segmentations, instances, labels) = match &self.semantic {
            Some(semantic) => (
                StoredArray::from(&semantic.segmentation),
                semantic.instances.as_ref().map_or_else(absent, StoredArray::from),
                StoredArray::Strings(semantic.labels.clone()),
            ),
            None => (absent(), absent(), absent()),
        };

        let mut archive = ArrayArchive::default();
        archive.push("points", StoredArray::from(&self.points));
        archive.push("descriptors", descriptors);
        archive.push("colors", StoredArray::from(&self.colors));
        archive.push("segmentations", segmentations);
        archive.push("instances", instances);
        archive.push("segmentation_labels", labels);
        archive.push(
            VERSION_KEY,
            StoredArray::from(&ndarray::arr0(FormatVersion::CURRENT.number())),
        );
        Ok(archive)
    }

    /// Decode any supported layout.
    pub fn from_archive(mut archive: ArrayArchive, config: &FeaturesConfig) -> Result<Self> {
        let version = archive.version()?;
        debug!("Reading features file version {}", version.number());
        if version == FormatVersion::V2 {
            return Err(Error::UnsupportedLegacyFormat(version.number()));
        }

        let mut points = points_array(archive.take("points")?)?;
        let mut descriptors = descriptors_array(archive.take("descriptors")?)?;
        let colors = colors_array(archive.take("colors")?)?;
        if config.feature_type == FeatureType::Hahog && config.hahog_normalize_to_uchar {
            descriptors = Descriptors::Float(descriptors.to_float());
        }
        let semantic = match version {
            FormatVersion::V0 => {
                // Old files stored a meaningless scale.
                points.column_mut(2).fill(config.reprojection_error_sd as f32);
                None
            }
            FormatVersion::V1 | FormatVersion::V2 => None,
            FormatVersion::V3 => semantic_arrays(&mut archive)?,
        };

        if descriptors.len() != points.nrows() || colors.nrows() != points.nrows() {
            return Err(malformed(
                "points",
                format!(
                    "{} points, {} descriptors and {} colors",
                    points.nrows(),
                    descriptors.len(),
                    colors.nrows()
                ),
            ));
        }
        Ok(Self::new(points, descriptors, colors, semantic))
    }

    pub fn to_writer<W: Write + Seek>(&self, writer: W, config: &FeaturesConfig) -> Result<()> {
        self.to_archive(config)?.write_to(writer)
    }

    /// Write to a file, replacing it if it exists.
    pub fn save(&self, path: impl AsRef<Path>, config: &FeaturesConfig) -> Result<()> {
        let file = File::create(path)?;
        self.to_writer(BufWriter::new(file), config)
    }

    pub fn from_reader<R: Read + Seek>(reader: R, config: &FeaturesConfig) -> Result<Self> {
        Self::from_archive(ArrayArchive::read_from(reader)?, config)
    }

    pub fn from_file(path: impl AsRef<Path>, config: &FeaturesConfig) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), config)
    }
}
