//! Learning from past self-corrections

pub mod correction_learner;

pub use correction_learner::{normalize_error, CorrectionLearner, CorrectionSummary, LearningStats};
