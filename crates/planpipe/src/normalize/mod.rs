//! Entity normalization: reconciles heterogeneous extractor output into one
//! canonical record using declarative rules.

pub mod engine;
pub mod measure;
pub mod rules;
pub mod transform;
pub mod validation;

pub use engine::{NormalizationEngine, Rejection, RejectionReason};
pub use measure::{parse_measurements, Measurement};
pub use rules::{Check, NormalizationRule, RuleSet, SourceMatcher, Transform, ValidationRule};
pub use validation::CompiledValidation;
