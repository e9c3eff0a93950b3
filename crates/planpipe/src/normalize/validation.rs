use regex::Regex;

use crate::document::{CanonicalField, CanonicalRecord, Dimension, ValidationError};
use crate::error::ConfigError;

use super::rules::{compile, Check, ValidationRule};

/// A validation rule with its pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledValidation {
    pub rule: ValidationRule,
    pattern: Option<Regex>,
}

impl CompiledValidation {
    pub fn new(rule: ValidationRule) -> Result<Self, ConfigError> {
        let pattern = match &rule.check {
            Check::Pattern(pattern) => Some(compile(&rule.id, pattern)?),
            _ => None,
        };
        Ok(Self { rule, pattern })
    }

    /// Runs the check. Returns the error to append, if any.
    pub fn check(&self, record: &CanonicalRecord) -> Option<ValidationError> {
        let field = self.rule.field;
        let failure = match &self.rule.check {
            Check::Required => {
                if record.is_field_empty(field) {
                    Some(format!("{} is required", field))
                } else {
                    None
                }
            }
            Check::Pattern(pattern) => {
                let regex = self.pattern.as_ref()?;
                let offending: Vec<&str> = text_values(record, field)
                    .into_iter()
                    .filter(|value| !regex.is_match(value))
                    .collect();
                if offending.is_empty() {
                    None
                } else {
                    Some(format!(
                        "{} value(s) {:?} do not match /{}/",
                        field, offending, pattern
                    ))
                }
            }
            Check::Positive => {
                let offending: Vec<String> = record
                    .dimensions
                    .iter()
                    .filter(|d| d.value <= 0.0)
                    .map(display_dimension)
                    .collect();
                if offending.is_empty() {
                    None
                } else {
                    Some(format!(
                        "{} must be positive, got {}",
                        field,
                        offending.join(", ")
                    ))
                }
            }
            Check::Range { min, max, unit } => {
                let offending: Vec<String> = record
                    .dimensions
                    .iter()
                    .filter(|d| {
                        let value = unit.map(|u| d.in_unit(u)).unwrap_or(d.value);
                        min.map(|m| value < m).unwrap_or(false)
                            || max.map(|m| value > m).unwrap_or(false)
                    })
                    .map(display_dimension)
                    .collect();
                if offending.is_empty() {
                    None
                } else {
                    Some(format!(
                        "{} out of range [{}, {}]{}: {}",
                        field,
                        min.map(|m| m.to_string()).unwrap_or_else(|| "-inf".into()),
                        max.map(|m| m.to_string()).unwrap_or_else(|| "inf".into()),
                        unit.map(|u| format!(" {}", u)).unwrap_or_default(),
                        offending.join(", ")
                    ))
                }
            }
        }?;

        Some(ValidationError {
            rule_id: self.rule.id.clone(),
            field,
            message: self.rule.message.clone().unwrap_or(failure),
            fatal: self.rule.fatal,
        })
    }
}

fn text_values(record: &CanonicalRecord, field: CanonicalField) -> Vec<&str> {
    match field {
        CanonicalField::Address => record.address.as_deref().into_iter().collect(),
        CanonicalField::DocumentType => record.document_type.as_deref().into_iter().collect(),
        CanonicalField::RoomNames => record.room_names.iter().map(String::as_str).collect(),
        CanonicalField::Materials => record.materials.iter().map(String::as_str).collect(),
        CanonicalField::Dimensions => Vec::new(),
    }
}

fn display_dimension(dimension: &Dimension) -> String {
    format!("{} {}", dimension.value, dimension.unit)
}

/// Runs every rule in order, one error per failed rule.
pub fn run_validations(
    validations: &[CompiledValidation],
    record: &CanonicalRecord,
) -> Vec<ValidationError> {
    validations.iter().filter_map(|v| v.check(record)).collect()
}
