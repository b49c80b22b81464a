use tracing::trace;

use crate::model::{
    AttrMap, Callable, LayerPayload, ModelFormat, NodePayload, OperationRecord, Payload,
    Unparsable,
};
use crate::scanner::{Ability, Category, Issue, Severity};

pub mod rules;

use rules::{rules_for, severity_for, Check, OpRule, LAMBDA_LAYER_CLASS};

pub const DEFAULT_MAX_DETAILS_CHARS: usize = 4096;
const DETAILS_SEPARATOR: &str = " | ";

/// Matches extracted records against the static rule table. Holds no
/// per-scan state, so one instance can be shared across threads.
#[derive(Debug, Clone)]
pub struct Classifier {
    max_details_chars: usize,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DETAILS_CHARS)
    }
}

impl Classifier {
    /// `max_details_chars` caps the payload rendering in `Issue::details`;
    /// the record's name and type are always kept in full.
    pub fn new(max_details_chars: usize) -> Self {
        Self { max_details_chars }
    }

    /// Zero or more issues for one record, one per matching rule.
    pub fn classify(&self, record: &OperationRecord) -> Vec<Issue> {
        let issues = match &record.payload {
            Payload::Layer(layer) => self.classify_layer(record, layer),
            Payload::Node(node) => self.classify_node(record, node),
            Payload::Unparsable(unparsable) => vec![self.unparsable(record, unparsable)],
        };
        trace!(
            name = %record.name,
            op_type = %record.op_type,
            issues = issues.len(),
            "classified record"
        );
        issues
    }

    fn classify_layer(&self, record: &OperationRecord, layer: &LayerPayload) -> Vec<Issue> {
        let note = match (&layer.callable, record.op_type == LAMBDA_LAYER_CLASS) {
            (Some(Callable::Bytecode(_)), _) => "embeds serialized function bytecode",
            (Some(Callable::LambdaSource(_)), _) => "embeds a serialized lambda",
            (Some(Callable::Reference(_)), true) => "Lambda layer referencing an importable function",
            (None, true) => "Lambda layer",
            (Some(Callable::Reference(_)), false) | (None, false) => return Vec::new(),
        };
        let mut parts = vec![subject("layer", record, None), note.to_string()];
        if let Some(Callable::Reference(target)) = &layer.callable {
            parts.push(format!("function: {target}"));
        }
        parts.push(format!(
            "config: {}",
            truncate_chars(&layer.config.to_string(), self.max_details_chars)
        ));
        vec![Issue::new(
            Severity::High,
            Category::LambdaLayer,
            Ability::CodeExecution,
            parts.join(DETAILS_SEPARATOR),
        )]
    }

    fn classify_node(&self, record: &OperationRecord, node: &NodePayload) -> Vec<Issue> {
        let mut issues = Vec::new();
        for rule in rules_for(&record.op_type) {
            for (ability, severity, target) in judge(rule, node) {
                let mut parts = vec![
                    subject("node", record, node.function.as_deref()),
                    rule.description.to_string(),
                ];
                if let Some(target) = target {
                    parts.push(format!("target: {target}"));
                }
                parts.extend(self.node_payload(node));
                issues.push(Issue::new(
                    severity,
                    Category::TensorOpAbuse,
                    ability,
                    parts.join(DETAILS_SEPARATOR),
                ));
            }
        }
        issues
    }

    fn node_payload(&self, node: &NodePayload) -> Vec<String> {
        let mut parts = Vec::new();
        let operands: Vec<_> = node.constant_operands().collect();
        if !operands.is_empty() {
            parts.push(format!("operands: {operands:?}"));
        }
        let inputs: Vec<_> = node.inputs.iter().map(|input| input.name.as_str()).collect();
        parts.push(format!("inputs: {inputs:?}"));
        parts.push(format!(
            "attrs: {}",
            truncate_chars(&AttrMap(&node.attrs).to_string(), self.max_details_chars)
        ));
        parts
    }

    /// Damaged entries surface as low-severity issues so they are not
    /// mistaken for a clean record.
    fn unparsable(&self, record: &OperationRecord, unparsable: &Unparsable) -> Issue {
        let (kind, category) = match unparsable.origin {
            ModelFormat::Hdf5 => ("layer", Category::LambdaLayer),
            _ => ("node", Category::TensorOpAbuse),
        };
        let details = [
            subject(kind, record, None),
            format!("unparsable: {}", unparsable.reason),
            format!(
                "raw: {}",
                truncate_chars(&unparsable.raw, self.max_details_chars)
            ),
        ]
        .join(DETAILS_SEPARATOR);
        Issue::new(Severity::Low, category, Ability::None, details)
    }
}

/// Judgments for one rule row: `(ability, severity, target)` per firing.
fn judge(rule: &OpRule, node: &NodePayload) -> Vec<(Ability, Severity, Option<String>)> {
    match rule.check {
        Check::Always { ability, severity } => {
            let target = node.constant_operands().next().map(str::to_string);
            vec![(ability, severity, target)]
        }
        Check::DebugUrls => {
            let urls = node
                .attrs
                .get("debug_urls")
                .map(|value| value.strings())
                .unwrap_or_default();
            if urls.is_empty() {
                return vec![(Ability::None, Severity::Low, None)];
            }
            urls.into_iter()
                .map(|url| {
                    let ability = match url.split_once("://").map(|(scheme, _)| scheme) {
                        Some(scheme) if scheme.eq_ignore_ascii_case("file") => Ability::FileWrite,
                        Some(_) => Ability::Network,
                        None => Ability::None,
                    };
                    (ability, severity_for(ability), Some(url.to_string()))
                })
                .collect()
        }
        Check::OutputStream => node
            .attrs
            .get("output_stream")
            .and_then(|value| value.as_str())
            .filter(|stream| stream.starts_with("file://"))
            .map(|stream| {
                vec![(
                    Ability::FileWrite,
                    severity_for(Ability::FileWrite),
                    Some(stream.to_string()),
                )]
            })
            .unwrap_or_default(),
    }
}

/// `layer 'name' (Type)` / `node 'name' (Type) in function 'f'`. Always the
/// first thing in `details`.
fn subject(kind: &str, record: &OperationRecord, function: Option<&str>) -> String {
    let op_type = if record.op_type.is_empty() {
        "unknown"
    } else {
        record.op_type.as_str()
    };
    let mut out = format!("{kind} {} ({op_type})", quote_name(&record.name));
    if let Some(function) = function {
        out.push_str(" in function ");
        out.push_str(&quote_name(function));
    }
    out
}

/// Single-quote `name`, backslash-escaping `\` and `'` so the report can
/// read it back verbatim.
fn quote_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('\'');
    for c in name.chars() {
        if matches!(c, '\\' | '\'') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrValue, Operand};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn layer(name: &str, class_name: &str, callable: Option<Callable>) -> OperationRecord {
        OperationRecord {
            name: name.into(),
            op_type: class_name.into(),
            payload: Payload::Layer(LayerPayload {
                config: json!({"name": name}),
                callable,
            }),
        }
    }

    fn node(name: &str, op: &str, attrs: Vec<(&str, AttrValue)>) -> OperationRecord {
        OperationRecord {
            name: name.into(),
            op_type: op.into(),
            payload: Payload::Node(NodePayload {
                function: None,
                inputs: vec![Operand {
                    name: "path:0".into(),
                    constant: Some("/tmp/x".into()),
                }],
                attrs: attrs
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value))
                    .collect::<BTreeMap<_, _>>(),
            }),
        }
    }

    #[test]
    fn standard_layers_are_clean() {
        let issues = Classifier::default().classify(&layer("dense", "Dense", None));
        assert!(issues.is_empty());
    }

    #[test]
    fn lambda_layers_are_code_execution() {
        let issues = Classifier::default().classify(&layer("lambda_1", "Lambda", None));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::High);
        assert_eq!(issues[0].category, Category::LambdaLayer);
        assert_eq!(issues[0].ability, Ability::CodeExecution);
        assert!(issues[0].details.starts_with("layer 'lambda_1' (Lambda)"));
    }

    #[test]
    fn custom_layer_with_bytecode_is_flagged() {
        let record = layer("custom", "MyLayer", Some(Callable::Bytecode("4wEA".into())));
        let issues = Classifier::default().classify(&record);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].category, Category::LambdaLayer);
    }

    #[test]
    fn custom_layer_with_function_reference_is_not_flagged() {
        let record = layer("custom", "MyLayer", Some(Callable::Reference("mod.fn".into())));
        assert!(Classifier::default().classify(&record).is_empty());
    }

    #[test]
    fn save_ops_are_file_writes_with_target() {
        let issues = Classifier::default().classify(&node("save", "SaveV2", vec![]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].category, Category::TensorOpAbuse);
        assert_eq!(issues[0].ability, Ability::FileWrite);
        assert!(issues[0].details.contains("target: /tmp/x"));
    }

    #[test]
    fn multi_rule_ops_emit_one_issue_per_rule() {
        let issues = Classifier::default().classify(&node("merge", "MergeV2Checkpoints", vec![]));
        let abilities: Vec<_> = issues.iter().map(|issue| issue.ability).collect();
        assert_eq!(abilities, vec![Ability::FileWrite, Ability::FileRead]);
    }

    #[test]
    fn debug_urls_split_by_scheme() {
        let urls = AttrValue::List(vec![
            AttrValue::Str("file:///tmp/dump".into()),
            AttrValue::Str("grpc://203.0.113.7:6064".into()),
        ]);
        let issues = Classifier::default()
            .classify(&node("dbg", "DebugIdentityV3", vec![("debug_urls", urls)]));
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].ability, Ability::FileWrite);
        assert_eq!(issues[1].ability, Ability::Network);
        assert!(issues[1].details.contains("grpc://203.0.113.7:6064"));
    }

    #[test]
    fn debug_op_without_urls_is_low_and_unattributed() {
        let issues = Classifier::default().classify(&node("dbg", "DebugIdentity", vec![]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Low);
        assert_eq!(issues[0].ability, Ability::None);
    }

    #[test]
    fn print_only_flagged_for_file_streams() {
        let classifier = Classifier::default();
        let stderr = node(
            "print",
            "PrintV2",
            vec![("output_stream", AttrValue::Str("stderr".into()))],
        );
        assert!(classifier.classify(&stderr).is_empty());

        let file = node(
            "print",
            "PrintV2",
            vec![("output_stream", AttrValue::Str("file:///tmp/leak".into()))],
        );
        let issues = classifier.classify(&file);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].ability, Ability::FileWrite);
    }

    #[test]
    fn unmatched_ops_are_silent() {
        assert!(Classifier::default()
            .classify(&node("mm", "MatMul", vec![]))
            .is_empty());
    }

    #[test]
    fn unparsable_records_become_low_issues() {
        let record = OperationRecord {
            name: "layer#0".into(),
            op_type: String::new(),
            payload: Payload::Unparsable(Unparsable {
                origin: ModelFormat::Hdf5,
                reason: "missing class_name".into(),
                raw: "{}".into(),
            }),
        };
        let issues = Classifier::default().classify(&record);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Low);
        assert_eq!(issues[0].ability, Ability::None);
        assert!(issues[0].details.starts_with("layer 'layer#0' (unknown)"));
    }

    #[test]
    fn truncation_keeps_subject() {
        let long = AttrValue::Str("x".repeat(10_000));
        let issues =
            Classifier::new(16).classify(&node("w", "WriteFile", vec![("blob", long)]));
        assert!(issues[0].details.starts_with("node 'w' (WriteFile)"));
        assert!(issues[0].details.len() < 400);
        assert!(issues[0].details.ends_with('…'));
    }

    #[test]
    fn names_with_quotes_are_escaped() {
        let issues = Classifier::default().classify(&layer(r"o'brien\x", "Lambda", None));
        assert!(issues[0]
            .details
            .starts_with(r"layer 'o\'brien\\x' (Lambda)"));

        let issues = Classifier::default().classify(&layer("", "Lambda", None));
        assert!(issues[0].details.starts_with("layer '' (Lambda)"));
    }

    proptest! {
        #[test]
        fn details_always_lead_with_name_and_type(
            name in "[A-Za-z0-9.][A-Za-z0-9_./-]{0,40}",
            max in 0usize..64,
        ) {
            let issues = Classifier::new(max).classify(&node(&name, "ReadFile", vec![]));
            prop_assert_eq!(issues.len(), 1);
            let expected = format!("node '{}' (ReadFile)", name);
            prop_assert!(issues[0].details.starts_with(&expected));
        }
    }
}
