pub mod error_classifier;
pub mod error_recovery;
pub mod retry_loop;
pub mod schema_fixer;

pub use error_classifier::{classify, extract_context, ErrorClassifier, ErrorContext, ErrorKind};
pub use error_recovery::{generate_hints, ErrorRecovery};
pub use retry_loop::{CorrectionAttempt, RunOutcome, SelfCorrectingLoop, SqlSource};
pub use schema_fixer::{CorrectionKind, FixerStats, QuickFix, SchemaAwareFixer};
