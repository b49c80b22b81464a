//! Keras HDF5 models keep their architecture as a JSON document in the
//! root group's `model_config` attribute. Attribute strings are stored
//! contiguously (inline or in a global heap collection), so the document can
//! be located by scanning the file for JSON object starts without decoding
//! the HDF5 object model, and without holding the weights in memory.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::Path,
};

use aho_corasick::AhoCorasick;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{
    read_error, Callable, CancellableRead, GraphExtractor, LayerPayload, ModelFormat, ModelHandle,
    OperationRecord, OperationStream, Payload, Structure, Unparsable,
};
use crate::scanner::{ScanError, ScanProgress};

/// Upper bound on a single config document.
const MAX_CONFIG_BYTES: usize = 64 * 1024 * 1024;
/// Upper bound on bytes read across all candidate documents of one file.
const MAX_SEARCH_BYTES: usize = 4 * MAX_CONFIG_BYTES;
/// Nesting depth beyond which layer walking stops.
const MAX_LAYER_DEPTH: usize = 32;
const MODEL_CLASSES: &[&str] = &["Sequential", "Functional", "Model"];
/// Config keys holding layers that are walked as records of their own.
const NESTED_LAYER_KEYS: &[&str] = &["layers", "layer", "backward_layer"];

const CONFIG_MARKER: usize = 2;
static MARKERS: Lazy<Option<AhoCorasick>> = Lazy::new(|| {
    AhoCorasick::new([r#"{"class_name":"#, r#"{"module":"#, "model_config"]).ok()
});

/// Walks the layer list of a Keras `model_config`, descending into nested
/// models and wrapper layers depth-first.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdf5Extractor;

impl GraphExtractor for Hdf5Extractor {
    fn format(&self) -> ModelFormat {
        ModelFormat::Hdf5
    }

    fn extract<'h>(
        &self,
        handle: &'h ModelHandle,
        progress: &ScanProgress,
    ) -> Result<OperationStream<'h>, ScanError> {
        let config = match handle.structure(progress)? {
            Structure::Layers(config) => config,
            Structure::Graph(_) => {
                return Err(ScanError::structural(
                    handle.format(),
                    "handle does not hold a Keras layer config",
                ))
            }
        };
        let Some(root) = config else {
            debug!("HDF5 file carries no model_config; nothing to walk");
            return Ok(Box::new(std::iter::empty::<OperationRecord>()));
        };

        let mut entries = Vec::new();
        for layer in child_layers(root) {
            collect_layer(layer, 0, &mut entries);
        }
        debug!(layers = entries.len(), "walking Keras layer config");
        Ok(Box::new(
            entries
                .into_iter()
                .enumerate()
                .map(|(index, entry)| entry_record(index, entry)),
        ))
    }
}

/// Locate and parse the model config document. `Ok(None)` means the file
/// has no architecture at all (weights-only).
///
/// Every top-level JSON object that starts with a Keras marker is read once;
/// objects nested inside one already read are skipped. Exactly one distinct
/// model-shaped document is accepted. A damaged candidate, or a second model
/// that differs from the first, fails the scan.
pub(crate) fn load_model_config(
    path: &Path,
    progress: &ScanProgress,
) -> Result<Option<Value>, ScanError> {
    let markers = MARKERS
        .as_ref()
        .ok_or_else(|| ScanError::structural(ModelFormat::Hdf5, "marker automaton unavailable"))?;
    let file = File::open(path).map_err(|err| ScanError::invalid_path(path, err))?;

    let mut candidates = Vec::new();
    let mut saw_config_attr = false;
    let reader = BufReader::new(CancellableRead::new(file, progress));
    for found in markers.stream_find_iter(reader) {
        let found = found.map_err(|err| read_error(path, progress, err))?;
        if found.pattern().as_usize() == CONFIG_MARKER {
            saw_config_attr = true;
        } else {
            candidates.push(found.start() as u64);
        }
    }
    trace!(candidates = candidates.len(), saw_config_attr, "config candidates");

    let mut file = File::open(path).map_err(|err| ScanError::invalid_path(path, err))?;
    let mut budget = MAX_SEARCH_BYTES;
    let mut searched_until = 0u64;
    let mut located: Option<(u64, Value)> = None;
    for offset in candidates {
        if offset < searched_until {
            continue;
        }
        if budget == 0 {
            return Err(ScanError::structural(
                ModelFormat::Hdf5,
                format!("config search exceeded {MAX_SEARCH_BYTES} bytes"),
            ));
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| ScanError::invalid_path(path, err))?;
        let reader = BufReader::new(CancellableRead::new(&mut file, progress));
        let object = read_json_object(reader, budget.min(MAX_CONFIG_BYTES))
            .map_err(|err| read_error(path, progress, err))?;
        budget = budget.saturating_sub(object.consumed());
        searched_until = offset + object.consumed() as u64;

        let value = match &object {
            JsonObject::Closed(raw) => parse_config(raw),
            JsonObject::Open(_) => None,
        };
        let Some(value) = value else {
            return Err(ScanError::structural(
                ModelFormat::Hdf5,
                format!("config document at offset {offset} is truncated or malformed"),
            ));
        };
        if !is_model_config(&value) {
            continue;
        }
        match &located {
            None => {
                debug!(offset, bytes = object.consumed(), "located model config");
                located = Some((offset, value));
            }
            Some((_, first)) if *first == value => {}
            Some((first, _)) => {
                return Err(ScanError::structural(
                    ModelFormat::Hdf5,
                    format!("competing model configs at offsets {first} and {offset}"),
                ))
            }
        }
    }

    match located {
        Some((_, value)) => Ok(Some(value)),
        None if saw_config_attr => Err(ScanError::structural(
            ModelFormat::Hdf5,
            "model_config present but no model architecture found",
        )),
        None => Ok(None),
    }
}

/// Result of reading one `{...}` object from a candidate offset.
#[derive(Debug, PartialEq, Eq)]
enum JsonObject {
    Closed(Vec<u8>),
    /// Hit a NUL, end of file or the byte limit first; holds the bytes consumed.
    Open(usize),
}

impl JsonObject {
    fn consumed(&self) -> usize {
        match self {
            JsonObject::Closed(raw) => raw.len(),
            JsonObject::Open(consumed) => *consumed,
        }
    }
}

/// Read one balanced `{...}` object, honouring JSON string escapes.
fn read_json_object<R: Read>(reader: R, limit: usize) -> std::io::Result<JsonObject> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for byte in reader.bytes() {
        let byte = byte?;
        out.push(byte);
        if out.len() > limit {
            return Ok(JsonObject::Open(out.len()));
        }
        if in_string {
            match byte {
                0 => return Ok(JsonObject::Open(out.len())),
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(JsonObject::Closed(out));
                }
            }
            0 => return Ok(JsonObject::Open(out.len())),
            _ => {}
        }
    }
    Ok(JsonObject::Open(out.len()))
}

/// Strict JSON first; Keras writes bare `NaN`/`Infinity`, which only the
/// JSON5 grammar accepts.
fn parse_config(raw: &[u8]) -> Option<Value> {
    serde_json::from_slice(raw).ok().or_else(|| {
        let text = std::str::from_utf8(raw).ok()?;
        json5::from_str(text).ok()
    })
}

fn is_model_config(value: &Value) -> bool {
    let Some(class_name) = value.get("class_name").and_then(Value::as_str) else {
        return false;
    };
    let Some(config) = value.get("config") else {
        return false;
    };
    MODEL_CLASSES.contains(&class_name)
        || config.is_array()
        || config.get("layers").map(Value::is_array).unwrap_or(false)
}

/// Layer entries of a model: `config.layers`, or the bare list older
/// Sequential configs store directly under `config`.
fn child_layers(model: &Value) -> &[Value] {
    let config = model.get("config");
    config
        .and_then(|config| config.get("layers"))
        .or(config)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// A layer to emit, or a layer whose subtree lies past the depth limit.
enum LayerEntry<'v> {
    Layer(&'v Value),
    TooDeep(&'v Value),
}

fn collect_layer<'v>(layer: &'v Value, depth: usize, out: &mut Vec<LayerEntry<'v>>) {
    out.push(LayerEntry::Layer(layer));
    let nested = child_layers(layer);
    let wrapped: Vec<&'v Value> = layer
        .get("config")
        .into_iter()
        .flat_map(|config| ["layer", "backward_layer"].map(move |key| config.get(key)))
        .flatten()
        .filter(|value| value.is_object())
        .collect();
    if nested.is_empty() && wrapped.is_empty() {
        return;
    }
    if depth >= MAX_LAYER_DEPTH {
        warn!(depth, "layer nesting exceeds depth limit");
        out.push(LayerEntry::TooDeep(layer));
        return;
    }
    for child in nested.iter().chain(wrapped) {
        collect_layer(child, depth + 1, out);
    }
}

fn entry_record(index: usize, entry: LayerEntry<'_>) -> OperationRecord {
    match entry {
        LayerEntry::Layer(layer) => layer_record(index, layer),
        LayerEntry::TooDeep(layer) => unparsable_layer(
            index,
            layer,
            "nested layers exceed the depth limit and were not inspected",
        ),
    }
}

fn layer_record(index: usize, layer: &Value) -> OperationRecord {
    let class_name = layer.get("class_name").and_then(Value::as_str);
    let config = layer.get("config").filter(|config| config.is_object());
    let (Some(class_name), Some(config)) = (class_name, config) else {
        warn!(index, "layer entry without class_name/config");
        return unparsable_layer(index, layer, "layer entry lacks class_name or config object");
    };

    let name = config
        .get("name")
        .or_else(|| layer.get("name"))
        .and_then(Value::as_str)
        .unwrap_or(class_name);

    let Ok(callable) = embedded_callable(config) else {
        warn!(index, layer = name, "layer config nests past the depth limit");
        return unparsable_layer(index, layer, "layer config exceeds the depth limit");
    };

    OperationRecord {
        name: name.to_string(),
        op_type: class_name.to_string(),
        payload: Payload::Layer(LayerPayload {
            config: config.clone(),
            callable,
        }),
    }
}

fn unparsable_layer(index: usize, layer: &Value, reason: &str) -> OperationRecord {
    OperationRecord {
        name: format!("layer#{index}"),
        op_type: layer
            .get("class_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        payload: Payload::Unparsable(Unparsable {
            origin: ModelFormat::Hdf5,
            reason: reason.into(),
            raw: layer.to_string(),
        }),
    }
}

/// A config nested deeper than [`MAX_LAYER_DEPTH`].
#[derive(Debug, PartialEq, Eq)]
struct TooDeep;

/// Executable payload carried by a layer config, if any. Nested layer
/// entries are left to their own records.
fn embedded_callable(config: &Value) -> Result<Option<Callable>, TooDeep> {
    if let Some(function) = config.get("function") {
        let function_type = config.get("function_type").and_then(Value::as_str);
        match function {
            Value::Array(parts) => {
                if let Some(code) = parts.first().and_then(Value::as_str) {
                    return Ok(Some(Callable::Bytecode(code.to_string())));
                }
            }
            Value::String(code) if function_type == Some("lambda") => {
                return Ok(Some(Callable::Bytecode(code.clone())));
            }
            Value::String(name) => return Ok(Some(Callable::Reference(name.clone()))),
            _ => {}
        }
    }
    let Some(map) = config.as_object() else {
        return Ok(None);
    };
    for (key, value) in map {
        if NESTED_LAYER_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(callable) = find_lambda_object(value, 1)? {
            return Ok(Some(callable));
        }
    }
    Ok(None)
}

/// Keras 3 serializes lambdas as `{"class_name": "__lambda__", "config": {"code": ...}}`
/// wherever a callable is accepted.
fn find_lambda_object(value: &Value, depth: usize) -> Result<Option<Callable>, TooDeep> {
    match value {
        Value::Object(_) | Value::Array(_) if depth > MAX_LAYER_DEPTH => Err(TooDeep),
        Value::Object(map) => {
            if map.get("class_name").and_then(Value::as_str) == Some("__lambda__") {
                let code = map
                    .get("config")
                    .and_then(|config| config.get("code"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                return Ok(Some(Callable::LambdaSource(code.to_string())));
            }
            for nested in map.values() {
                if let Some(callable) = find_lambda_object(nested, depth + 1)? {
                    return Ok(Some(callable));
                }
            }
            Ok(None)
        }
        Value::Array(items) => {
            for nested in items {
                if let Some(callable) = find_lambda_object(nested, depth + 1)? {
                    return Ok(Some(callable));
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}
