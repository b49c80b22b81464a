use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::Read,
    path::Path,
};

use prost::Message;
use tracing::{debug, warn};

use super::{
    proto::{self, attr_value, NodeDef},
    read_error, AttrValue, CancellableRead, GraphExtractor, ModelFormat, ModelHandle, NodePayload, Operand, OperationRecord,
    OperationStream, Payload, Structure, TensorValue, Unparsable, SAVED_MODEL_DESCRIPTOR,
};
use crate::scanner::{ScanError, ScanProgress};

const CONST_OP: &str = "Const";

/// Walks `graph_def.node` and every `library.function[*].node_def`, across
/// all meta graphs, in declaration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedModelExtractor;

pub(crate) fn load_saved_model(
    dir: &Path,
    progress: &ScanProgress,
) -> Result<proto::SavedModel, ScanError> {
    let descriptor = dir.join(SAVED_MODEL_DESCRIPTOR);
    let file = File::open(&descriptor).map_err(|err| ScanError::invalid_path(&descriptor, err))?;
    let mut bytes = Vec::new();
    CancellableRead::new(file, progress)
        .read_to_end(&mut bytes)
        .map_err(|err| read_error(&descriptor, progress, err))?;
    let model = proto::SavedModel::decode(bytes.as_slice()).map_err(|err| {
        ScanError::structural(
            ModelFormat::SavedModel,
            format!("{}: {err}", descriptor.display()),
        )
    })?;
    debug!(
        meta_graphs = model.meta_graphs.len(),
        bytes = bytes.len(),
        "decoded SavedModel descriptor"
    );
    Ok(model)
}

/// A node plus the index of the scope it was declared in.
struct ScopedNode<'h> {
    node: &'h NodeDef,
    scope: usize,
}

/// Graph body or library function: constants are resolved per scope.
struct Scope {
    function: Option<String>,
    constants: HashMap<String, String>,
}

impl GraphExtractor for SavedModelExtractor {
    fn format(&self) -> ModelFormat {
        ModelFormat::SavedModel
    }

    fn extract<'h>(
        &self,
        handle: &'h ModelHandle,
        progress: &ScanProgress,
    ) -> Result<OperationStream<'h>, ScanError> {
        let model = match handle.structure(progress)? {
            Structure::Graph(model) => model,
            Structure::Layers(_) => {
                return Err(ScanError::structural(
                    handle.format(),
                    "handle does not hold a SavedModel graph",
                ))
            }
        };

        let mut scopes = Vec::new();
        let mut nodes = Vec::new();
        for graph in model.meta_graphs.iter().filter_map(|meta| meta.graph_def.as_ref()) {
            push_scope(&mut scopes, &mut nodes, None, &graph.node);
            for function in graph.library.iter().flat_map(|lib| lib.function.iter()) {
                let name = function
                    .signature
                    .as_ref()
                    .map(|sig| sig.name.clone())
                    .unwrap_or_default();
                push_scope(&mut scopes, &mut nodes, Some(name), &function.node_def);
            }
        }

        debug!(nodes = nodes.len(), scopes = scopes.len(), "walking SavedModel graph");
        Ok(Box::new(
            nodes
                .into_iter()
                .map(move |scoped| node_record(scoped.node, &scopes[scoped.scope])),
        ))
    }
}

fn push_scope<'h>(
    scopes: &mut Vec<Scope>,
    nodes: &mut Vec<ScopedNode<'h>>,
    function: Option<String>,
    body: &'h [NodeDef],
) {
    let scope = scopes.len();
    scopes.push(Scope {
        function,
        constants: string_constants(body),
    });
    nodes.extend(body.iter().map(|node| ScopedNode { node, scope }));
}

/// Map `Const` node names to the string they hold.
fn string_constants(body: &[NodeDef]) -> HashMap<String, String> {
    body.iter()
        .filter(|node| node.op == CONST_OP)
        .filter_map(|node| {
            let tensor = match node.attr.get("value")?.value.as_ref()? {
                attr_value::Value::Tensor(tensor) => tensor,
                _ => return None,
            };
            if tensor.dtype != proto::DT_STRING || tensor.string_val.is_empty() {
                return None;
            }
            let joined = tensor
                .string_val
                .iter()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            Some((node.name.clone(), joined))
        })
        .collect()
}

fn node_record(node: &NodeDef, scope: &Scope) -> OperationRecord {
    if node.op.trim().is_empty() {
        warn!(node = %node.name, "graph node without op type");
        return OperationRecord {
            name: node.name.clone(),
            op_type: String::new(),
            payload: Payload::Unparsable(Unparsable {
                origin: ModelFormat::SavedModel,
                reason: "node declares no op type".into(),
                raw: format!("{node:?}"),
            }),
        };
    }

    let inputs = node
        .input
        .iter()
        .map(|input| Operand {
            name: input.clone(),
            constant: producer_name(input).and_then(|name| scope.constants.get(name).cloned()),
        })
        .collect();

    OperationRecord {
        name: node.name.clone(),
        op_type: node.op.clone(),
        payload: Payload::Node(NodePayload {
            function: scope.function.clone(),
            inputs,
            attrs: decode_attrs(&node.attr),
        }),
    }
}

/// Producing node of a data input: `name`, `name:0` or `name:out:0`.
/// Control inputs (`^name`) carry no value.
fn producer_name(input: &str) -> Option<&str> {
    if input.starts_with('^') {
        return None;
    }
    input.split(':').next().filter(|name| !name.is_empty())
}

fn decode_attrs(attrs: &BTreeMap<String, proto::AttrValue>) -> BTreeMap<String, AttrValue> {
    attrs
        .iter()
        .map(|(key, value)| (key.clone(), decode_attr(value)))
        .collect()
}

fn decode_attr(value: &proto::AttrValue) -> AttrValue {
    match value.value.as_ref() {
        None => AttrValue::Unset,
        Some(attr_value::Value::S(raw)) => AttrValue::Str(String::from_utf8_lossy(raw).into_owned()),
        Some(attr_value::Value::I(int)) => AttrValue::Int(*int),
        Some(attr_value::Value::F(float)) => AttrValue::Float(*float),
        Some(attr_value::Value::B(flag)) => AttrValue::Bool(*flag),
        Some(attr_value::Value::Type(dtype)) => AttrValue::Type(proto::dtype_name(*dtype)),
        Some(attr_value::Value::Shape(shape)) => AttrValue::Shape(dims(shape)),
        Some(attr_value::Value::Tensor(tensor)) => AttrValue::Tensor(decode_tensor(tensor)),
        Some(attr_value::Value::Placeholder(name)) => AttrValue::Placeholder(name.clone()),
        Some(attr_value::Value::Func(func)) => AttrValue::Func {
            name: func.name.clone(),
            attrs: decode_attrs(&func.attr),
        },
        Some(attr_value::Value::List(list)) => AttrValue::List(decode_list(list)),
    }
}

fn decode_list(list: &proto::ListValue) -> Vec<AttrValue> {
    let mut items = Vec::new();
    items.extend(
        list.s
            .iter()
            .map(|raw| AttrValue::Str(String::from_utf8_lossy(raw).into_owned())),
    );
    items.extend(list.i.iter().copied().map(AttrValue::Int));
    items.extend(list.f.iter().copied().map(AttrValue::Float));
    items.extend(list.b.iter().copied().map(AttrValue::Bool));
    items.extend(
        list.r#type
            .iter()
            .map(|dtype| AttrValue::Type(proto::dtype_name(*dtype))),
    );
    items.extend(list.shape.iter().map(|shape| AttrValue::Shape(dims(shape))));
    items.extend(
        list.tensor
            .iter()
            .map(|tensor| AttrValue::Tensor(decode_tensor(tensor))),
    );
    items.extend(list.func.iter().map(|func| AttrValue::Func {
        name: func.name.clone(),
        attrs: decode_attrs(&func.attr),
    }));
    items
}

fn dims(shape: &proto::TensorShapeProto) -> Vec<i64> {
    shape.dim.iter().map(|dim| dim.size).collect()
}

fn decode_tensor(tensor: &proto::TensorProto) -> TensorValue {
    TensorValue {
        dtype: proto::dtype_name(tensor.dtype),
        shape: tensor.tensor_shape.as_ref().map(dims).unwrap_or_default(),
        strings: tensor
            .string_val
            .iter()
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .collect(),
    }
}
