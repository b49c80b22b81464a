#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use modelguard_core::model::{
    proto::{self, attr_value, GraphDef, MetaGraphDef, NodeDef, TensorProto},
    HDF5_SIGNATURE, SAVED_MODEL_DESCRIPTOR,
};
use prost::Message;
use serde_json::{json, Value};

/// HDF5 signature, padding, the `model_config` attribute name and the JSON
/// text laid out contiguously, the way h5py stores small string attributes.
pub fn write_keras_h5(dir: &Path, file_name: &str, model_config: &Value) -> PathBuf {
    let mut bytes = HDF5_SIGNATURE.to_vec();
    bytes.extend_from_slice(&[0u8; 48]);
    bytes.extend_from_slice(b"model_config\0\0\0\0GCOL\x01\0\0\0");
    bytes.extend_from_slice(model_config.to_string().as_bytes());
    bytes.extend_from_slice(&[0u8; 32]);
    let path = dir.join(file_name);
    fs::write(&path, bytes).unwrap();
    path
}

/// An HDF5 file whose only config candidate is an object with a string that
/// never terminates, so the locator has to read `text_len` bytes before
/// giving up.
pub fn write_unterminated_h5(dir: &Path, file_name: &str, text_len: usize) -> PathBuf {
    let mut bytes = HDF5_SIGNATURE.to_vec();
    bytes.extend_from_slice(br#"{"class_name": ""#);
    bytes.resize(bytes.len() + text_len, b'a');
    let path = dir.join(file_name);
    fs::write(&path, bytes).unwrap();
    path
}

pub fn sequential(layers: Vec<Value>) -> Value {
    json!({
        "class_name": "Sequential",
        "config": {"name": "sequential", "layers": layers}
    })
}

pub fn dense(name: &str) -> Value {
    json!({
        "class_name": "Dense",
        "config": {"name": name, "units": 4, "activation": "relu"}
    })
}

/// Custom layer class carrying marshalled function bytecode.
pub fn custom_with_bytecode(name: &str) -> Value {
    json!({
        "class_name": "ExfilLayer",
        "config": {
            "name": name,
            "function": ["4wEAAAAAAAAAAAAAAAEAAAACAAAAQwAAAHMEAAAAfABTAKkBTqkA", null, null],
            "function_type": "lambda"
        }
    })
}

pub fn string_const(name: &str, value: &str) -> NodeDef {
    let mut attr = BTreeMap::new();
    attr.insert(
        "value".to_string(),
        proto::AttrValue {
            value: Some(attr_value::Value::Tensor(TensorProto {
                dtype: proto::DT_STRING,
                string_val: vec![value.as_bytes().to_vec()],
                ..Default::default()
            })),
        },
    );
    NodeDef {
        name: name.into(),
        op: "Const".into(),
        attr,
        ..Default::default()
    }
}

pub fn op(name: &str, op: &str, inputs: &[&str]) -> NodeDef {
    NodeDef {
        name: name.into(),
        op: op.into(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn saved_model_bytes(nodes: Vec<NodeDef>) -> Vec<u8> {
    proto::SavedModel {
        saved_model_schema_version: 1,
        meta_graphs: vec![MetaGraphDef {
            graph_def: Some(GraphDef {
                node: nodes,
                library: None,
            }),
        }],
    }
    .encode_to_vec()
}

pub fn write_saved_model(dir: &Path, nodes: Vec<NodeDef>) -> PathBuf {
    let model_dir = dir.join("saved_model");
    fs::create_dir_all(model_dir.join("variables")).unwrap();
    fs::write(
        model_dir.join(SAVED_MODEL_DESCRIPTOR),
        saved_model_bytes(nodes),
    )
    .unwrap();
    model_dir
}
