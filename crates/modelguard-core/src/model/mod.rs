use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scanner::{ScanError, ScanProgress};

pub mod hdf5;
pub mod proto;
pub mod saved_model;

pub use hdf5::Hdf5Extractor;
pub use saved_model::SavedModelExtractor;

/// First eight bytes of every HDF5 file.
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];
/// Protobuf descriptor that marks a SavedModel directory.
pub const SAVED_MODEL_DESCRIPTOR: &str = "saved_model.pb";

const HDF5_EXTENSIONS: &[&str] = &["h5", "hdf5", "keras"];

/// On-disk model serialization formats the engine knows how to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Hdf5,
    SavedModel,
    Unrecognized,
}

impl ModelFormat {
    /// Human label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            Self::Hdf5 => "TensorFlow (H5)",
            Self::SavedModel => "TensorFlow (SavedModel)",
            Self::Unrecognized => "Non-TensorFlow",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hdf5 => "hdf5",
            Self::SavedModel => "saved_model",
            Self::Unrecognized => "unrecognized",
        })
    }
}

/// Parsed structural metadata, loaded once per handle on first use.
#[derive(Debug)]
pub(crate) enum Structure {
    /// Keras `model_config` tree; `None` for weights-only HDF5 files.
    Layers(Option<serde_json::Value>),
    Graph(proto::SavedModel),
}

/// One on-disk artifact plus its sniffed format. Structure is read lazily
/// and dropped with the handle.
#[derive(Debug)]
pub struct ModelHandle {
    path: PathBuf,
    format: ModelFormat,
    structure: OnceCell<Structure>,
}

impl ModelHandle {
    /// Sniff the format of `path`. Only the first bytes of a file are read.
    pub fn detect(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let metadata =
            std::fs::metadata(path).map_err(|err| ScanError::invalid_path(path, err))?;

        let format = if metadata.is_dir() {
            if path.join(SAVED_MODEL_DESCRIPTOR).is_file() {
                ModelFormat::SavedModel
            } else {
                ModelFormat::Unrecognized
            }
        } else if has_hdf5_signature(path)? {
            ModelFormat::Hdf5
        } else {
            if has_hdf5_extension(path) {
                debug!(path = %path.display(), "HDF5 extension without HDF5 signature");
            }
            ModelFormat::Unrecognized
        };

        debug!(path = %path.display(), %format, "detected model format");
        Ok(Self {
            path: path.to_path_buf(),
            format,
            structure: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ModelFormat {
        self.format
    }

    /// Parse the structure on first use. Reads stop early once `progress`
    /// is cancelled.
    pub(crate) fn structure(&self, progress: &ScanProgress) -> Result<&Structure, ScanError> {
        self.structure.get_or_try_init(|| match self.format {
            ModelFormat::Hdf5 => {
                hdf5::load_model_config(&self.path, progress).map(Structure::Layers)
            }
            ModelFormat::SavedModel => {
                saved_model::load_saved_model(&self.path, progress).map(Structure::Graph)
            }
            ModelFormat::Unrecognized => Err(ScanError::structural(
                self.format,
                "no structural reader for this format",
            )),
        })
    }
}

/// Largest chunk handed to the inner reader per call, so a cancel request is
/// seen at least once per chunk.
const READ_CHUNK: usize = 64 * 1024;

/// Reader that starts failing once the scan is cancelled.
pub(crate) struct CancellableRead<'p, R> {
    inner: R,
    progress: &'p ScanProgress,
}

impl<'p, R> CancellableRead<'p, R> {
    pub(crate) fn new(inner: R, progress: &'p ScanProgress) -> Self {
        Self { inner, progress }
    }
}

impl<R: Read> Read for CancellableRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.progress.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "scan cancelled"));
        }
        let len = buf.len().min(READ_CHUNK);
        self.inner.read(&mut buf[..len])
    }
}

/// Map a read failure, reporting cancellation rather than the I/O error it
/// surfaced as.
pub(crate) fn read_error(path: &Path, progress: &ScanProgress, err: io::Error) -> ScanError {
    if progress.is_cancelled() {
        ScanError::Cancelled
    } else {
        ScanError::invalid_path(path, err)
    }
}

fn has_hdf5_signature(path: &Path) -> Result<bool, ScanError> {
    let mut file = File::open(path).map_err(|err| ScanError::invalid_path(path, err))?;
    let mut header = [0u8; HDF5_SIGNATURE.len()];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ScanError::invalid_path(path, err)),
        }
    }
    Ok(header == HDF5_SIGNATURE)
}

fn has_hdf5_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| HDF5_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// One unit discovered in a model's layer list or computation graph.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    /// Declared name; not guaranteed unique.
    pub name: String,
    /// Layer class name or graph op type.
    pub op_type: String,
    pub payload: Payload,
}

/// Typed decode of a record's native attribute data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Layer(LayerPayload),
    Node(NodePayload),
    /// Structural entry that could not be decoded; kept so the rest of the
    /// model is still scanned.
    Unparsable(Unparsable),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerPayload {
    /// Full layer `config` object as stored.
    pub config: serde_json::Value,
    pub callable: Option<Callable>,
}

/// Executable payload embedded in a layer config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callable {
    /// Marshalled, base64-encoded function body.
    Bytecode(String),
    /// Serialized lambda source or code object wrapper.
    LambdaSource(String),
    /// Importable function referenced by name.
    Reference(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodePayload {
    /// Enclosing library function, `None` for top-level graph nodes.
    pub function: Option<String>,
    pub inputs: Vec<Operand>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl NodePayload {
    /// String constants fed into this node, in input order.
    pub fn constant_operands(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|input| input.constant.as_deref())
    }
}

/// A node input, with the value of the producing `Const` node when it is a
/// string constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub name: String,
    pub constant: Option<String>,
}

/// Decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f32),
    Bool(bool),
    Type(&'static str),
    Shape(Vec<i64>),
    Tensor(TensorValue),
    List(Vec<AttrValue>),
    Func {
        name: String,
        attrs: BTreeMap<String, AttrValue>,
    },
    Placeholder(String),
    Unset,
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// String members of a list attribute (or the value itself when scalar).
    pub fn strings(&self) -> Vec<&str> {
        match self {
            Self::Str(value) => vec![value.as_str()],
            Self::List(items) => items.iter().filter_map(AttrValue::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Type(name) => f.write_str(name),
            Self::Shape(dims) => write!(f, "shape{dims:?}"),
            Self::Tensor(tensor) => write!(f, "{tensor}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Func { name, attrs } => {
                write!(f, "func {name}")?;
                if !attrs.is_empty() {
                    f.write_str(" ")?;
                    write_attr_map(f, attrs)?;
                }
                Ok(())
            }
            Self::Placeholder(name) => write!(f, "${name}"),
            Self::Unset => f.write_str("unset"),
        }
    }
}

pub(crate) fn write_attr_map(
    f: &mut impl fmt::Write,
    attrs: &BTreeMap<String, AttrValue>,
) -> fmt::Result {
    f.write_str("{")?;
    for (idx, (key, value)) in attrs.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{key}: {value}")?;
    }
    f.write_str("}")
}

/// `Display` for an attribute map, rendered as `{key: value, ...}`.
pub(crate) struct AttrMap<'a>(pub(crate) &'a BTreeMap<String, AttrValue>);

impl fmt::Display for AttrMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_attr_map(f, self.0)
    }
}

/// Summary of a tensor attribute. String tensors keep their values since
/// they are where paths and addresses live.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    pub dtype: &'static str,
    pub shape: Vec<i64>,
    pub strings: Vec<String>,
}

impl fmt::Display for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{}>{:?}", self.dtype, self.shape)?;
        if !self.strings.is_empty() {
            write!(f, "{:?}", self.strings)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unparsable {
    pub origin: ModelFormat,
    pub reason: String,
    /// Lossy rendering of whatever was there.
    pub raw: String,
}

/// Records yielded lazily from a handle's cached structure.
pub type OperationStream<'h> = Box<dyn ExactSizeIterator<Item = OperationRecord> + 'h>;

/// Format-specific walk over a model's layers or graph nodes. Extracting
/// twice from the same handle yields the same sequence.
pub trait GraphExtractor: Send + Sync {
    fn format(&self) -> ModelFormat;

    fn extract<'h>(
        &self,
        handle: &'h ModelHandle,
        progress: &ScanProgress,
    ) -> Result<OperationStream<'h>, ScanError>;
}

static HDF5_EXTRACTOR: Hdf5Extractor = Hdf5Extractor;
static SAVED_MODEL_EXTRACTOR: SavedModelExtractor = SavedModelExtractor;

/// Pick the extractor for a sniffed format; `None` means delegate elsewhere.
pub fn extractor_for(format: ModelFormat) -> Option<&'static dyn GraphExtractor> {
    match format {
        ModelFormat::Hdf5 => Some(&HDF5_EXTRACTOR),
        ModelFormat::SavedModel => Some(&SAVED_MODEL_EXTRACTOR),
        ModelFormat::Unrecognized => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::FailureKind;
    use std::fs;

    #[test]
    fn detects_hdf5_by_signature() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("weights.bin");
        let mut bytes = HDF5_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        fs::write(&path, bytes).unwrap();

        let handle = ModelHandle::detect(&path).unwrap();
        assert_eq!(handle.format(), ModelFormat::Hdf5);
    }

    #[test]
    fn extension_alone_is_not_authoritative() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("model.h5");
        fs::write(&path, b"definitely not hdf5").unwrap();

        let handle = ModelHandle::detect(&path).unwrap();
        assert_eq!(handle.format(), ModelFormat::Unrecognized);
    }

    #[test]
    fn detects_saved_model_directory() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join(SAVED_MODEL_DESCRIPTOR), b"").unwrap();

        let handle = ModelHandle::detect(temp.path()).unwrap();
        assert_eq!(handle.format(), ModelFormat::SavedModel);
    }

    #[test]
    fn plain_directory_and_pickle_are_unrecognized() {
        let temp = tempfile::tempdir().unwrap();
        let pickle = temp.path().join("model.pkl");
        fs::write(&pickle, [0x80, 0x04, 0x95, 0x00]).unwrap();

        assert_eq!(
            ModelHandle::detect(temp.path()).unwrap().format(),
            ModelFormat::Unrecognized
        );
        assert_eq!(
            ModelHandle::detect(&pickle).unwrap().format(),
            ModelFormat::Unrecognized
        );
    }

    #[test]
    fn missing_path_is_invalid() {
        let temp = tempfile::tempdir().unwrap();
        let err = ModelHandle::detect(temp.path().join("missing.h5")).unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidPath);
    }

    #[test]
    fn cancelled_reader_stops_and_maps_to_cancelled() {
        let progress = ScanProgress::new();
        let data = vec![7u8; READ_CHUNK * 3];
        let mut reader = CancellableRead::new(&data[..], &progress);

        let mut buf = vec![0u8; READ_CHUNK * 2];
        assert_eq!(reader.read(&mut buf).unwrap(), READ_CHUNK);

        progress.cancel();
        let err = reader.read(&mut buf).unwrap_err();
        let mapped = read_error(Path::new("model.h5"), &progress, err);
        assert_eq!(mapped.kind(), FailureKind::Cancelled);
    }

    #[test]
    fn unrecognized_handle_has_no_structure() {
        let temp = tempfile::tempdir().unwrap();
        let handle = ModelHandle::detect(temp.path()).unwrap();
        assert!(extractor_for(handle.format()).is_none());
        assert!(handle.structure(&ScanProgress::new()).is_err());
    }

    #[test]
    fn attr_values_render_compactly() {
        let mut attrs = BTreeMap::new();
        attrs.insert("T".to_string(), AttrValue::Type("string"));
        attrs.insert(
            "urls".to_string(),
            AttrValue::List(vec![AttrValue::Str("file:///tmp/x".into())]),
        );
        let mut out = String::new();
        write_attr_map(&mut out, &attrs).unwrap();
        assert_eq!(out, r#"{T: string, urls: ["file:///tmp/x"]}"#);
        assert_eq!(AttrMap(&attrs).to_string(), out);
    }
}
