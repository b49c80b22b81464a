use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::scanner::{Ability, Severity};

/// Layer class that always carries an arbitrary callable.
pub const LAMBDA_LAYER_CLASS: &str = "Lambda";

/// How a matched op is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Fixed judgment whenever the op is present.
    Always { ability: Ability, severity: Severity },
    /// One judgment per `debug_urls` entry, by URL scheme.
    DebugUrls,
    /// File write when `output_stream` names a `file://` target.
    OutputStream,
}

/// One row of the graph-op rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpRule {
    pub op: &'static str,
    pub check: Check,
    pub description: &'static str,
}

/// Severity attached to each capability when a rule fires unconditionally.
pub const fn severity_for(ability: Ability) -> Severity {
    match ability {
        Ability::FileWrite | Ability::Network | Ability::CodeExecution => Severity::High,
        Ability::FileRead => Severity::Mid,
        Ability::DirectoryRead | Ability::None => Severity::Low,
    }
}

const fn always(ability: Ability) -> Check {
    Check::Always {
        ability,
        severity: severity_for(ability),
    }
}

const fn rule(op: &'static str, check: Check, description: &'static str) -> OpRule {
    OpRule {
        op,
        check,
        description,
    }
}

/// Graph ops known to accept filesystem paths, directory patterns, network
/// endpoints or host callables as operands. An op may appear more than once;
/// every matching row yields its own issue.
pub const OP_RULES: &[OpRule] = &[
    rule("WriteFile", always(Ability::FileWrite), "writes tensor contents to a path operand"),
    rule("Save", always(Ability::FileWrite), "writes a checkpoint to a path operand"),
    rule("SaveV2", always(Ability::FileWrite), "writes a checkpoint to a prefix operand"),
    rule("SaveSlices", always(Ability::FileWrite), "writes checkpoint slices to a path operand"),
    rule("MergeV2Checkpoints", always(Ability::FileWrite), "moves checkpoint files to a destination prefix"),
    rule("MergeV2Checkpoints", always(Ability::FileRead), "reads checkpoint files from source prefixes"),
    rule("CreateSummaryFileWriter", always(Ability::FileWrite), "opens an event file under a log directory operand"),
    rule("PrintV2", Check::OutputStream, "prints tensors to a configurable output stream"),
    rule("DebugIdentity", Check::DebugUrls, "dumps tensors to debug URLs"),
    rule("DebugIdentityV2", Check::DebugUrls, "dumps tensors to debug URLs"),
    rule("DebugIdentityV3", Check::DebugUrls, "dumps tensors to debug URLs"),
    rule("DebugNanCount", Check::DebugUrls, "reports tensor statistics to debug URLs"),
    rule("DebugNumericSummary", Check::DebugUrls, "reports tensor statistics to debug URLs"),
    rule("ReadFile", always(Ability::FileRead), "reads an arbitrary file named by an operand"),
    rule("Restore", always(Ability::FileRead), "reads a checkpoint from a path operand"),
    rule("RestoreV2", always(Ability::FileRead), "reads a checkpoint from a prefix operand"),
    rule("RestoreSlice", always(Ability::FileRead), "reads a checkpoint slice from a path operand"),
    rule("ImmutableConst", always(Ability::FileRead), "memory-maps a file region named by an attribute"),
    rule("InitializeTableFromTextFile", always(Ability::FileRead), "loads a lookup table from a text file"),
    rule("InitializeTableFromTextFileV2", always(Ability::FileRead), "loads a lookup table from a text file"),
    rule("TextLineDataset", always(Ability::FileRead), "streams lines from file operands"),
    rule("TFRecordDataset", always(Ability::FileRead), "streams records from file operands"),
    rule("FixedLengthRecordDataset", always(Ability::FileRead), "streams records from file operands"),
    rule("FixedLengthRecordDatasetV2", always(Ability::FileRead), "streams records from file operands"),
    rule("MatchingFiles", always(Ability::DirectoryRead), "lists files matching a glob operand"),
    rule("MatchingFilesDataset", always(Ability::DirectoryRead), "lists files matching glob operands"),
    rule("DataServiceDataset", always(Ability::Network), "connects to a tf.data service address"),
    rule("DataServiceDatasetV2", always(Ability::Network), "connects to a tf.data service address"),
    rule("DataServiceDatasetV3", always(Ability::Network), "connects to a tf.data service address"),
    rule("DataServiceDatasetV4", always(Ability::Network), "connects to a tf.data service address"),
    rule("RegisterDataset", always(Ability::Network), "registers a dataset with a remote dispatcher"),
    rule("RpcCall", always(Ability::Network), "issues an RPC to an address operand"),
    rule("RpcClient", always(Ability::Network), "opens an RPC channel to an address operand"),
    rule("Rpc", always(Ability::Network), "issues an RPC to an address operand"),
    rule("TryRpc", always(Ability::Network), "issues an RPC to an address operand"),
    rule("PyFunc", always(Ability::CodeExecution), "invokes a host callable"),
    rule("PyFuncStateless", always(Ability::CodeExecution), "invokes a host callable"),
    rule("EagerPyFunc", always(Ability::CodeExecution), "invokes a host callable"),
];

static RULES_BY_OP: Lazy<HashMap<&'static str, Vec<&'static OpRule>>> = Lazy::new(|| {
    let mut index: HashMap<&'static str, Vec<&'static OpRule>> = HashMap::new();
    for rule in OP_RULES {
        index.entry(rule.op).or_default().push(rule);
    }
    index
});

/// Every rule row matching `op`, in table order.
pub fn rules_for(op: &str) -> &'static [&'static OpRule] {
    RULES_BY_OP.get(op).map(Vec::as_slice).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_exact_and_case_sensitive() {
        assert_eq!(rules_for("SaveV2").len(), 1);
        assert!(rules_for("savev2").is_empty());
        assert!(rules_for("MatMul").is_empty());
    }

    #[test]
    fn duplicate_rows_are_kept_in_order() {
        let rows = rules_for("MergeV2Checkpoints");
        assert_eq!(rows.len(), 2);
        assert!(matches!(
            rows[0].check,
            Check::Always {
                ability: Ability::FileWrite,
                ..
            }
        ));
        assert!(matches!(
            rows[1].check,
            Check::Always {
                ability: Ability::FileRead,
                ..
            }
        ));
    }

    #[test]
    fn save_restore_ops_grant_file_access() {
        for op in ["Save", "SaveV2", "SaveSlices", "Restore", "RestoreV2", "RestoreSlice"] {
            let grants_file_access = rules_for(op).iter().any(|rule| {
                matches!(
                    rule.check,
                    Check::Always {
                        ability: Ability::FileWrite | Ability::FileRead,
                        ..
                    }
                )
            });
            assert!(grants_file_access, "{op} should be a file access rule");
        }
    }

    #[test]
    fn unconditional_rules_never_use_none_ability() {
        for rule in OP_RULES {
            if let Check::Always { ability, severity } = rule.check {
                assert_ne!(ability, Ability::None, "{}", rule.op);
                assert_eq!(severity, severity_for(ability), "{}", rule.op);
            }
        }
    }
}
