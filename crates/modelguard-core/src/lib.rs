pub mod classify;
pub mod model;
pub mod report;
pub mod scanner;
pub mod settings;

pub use classify::Classifier;
pub use model::{GraphExtractor, ModelFormat, ModelHandle, OperationRecord};
pub use report::{op_name_from_details, render_report, OutputFormat};
pub use scanner::{
    fallback::{CommandFallbackScanner, NoFallbackScanner},
    model_scanner::ModelScanner,
    Ability, Category, FailureKind, FallbackFinding, FallbackScanner, Issue, ScanError,
    ScanProgress, ScanReport, Scanner, ScannerKind, Severity,
};
pub use settings::{FallbackSettings, ScanSettings};
