//! Declarative normalization and validation rules.
//!
//! Rules are plain data, loaded once at startup from YAML or JSON and shared
//! read-only between workers. Regexes are compiled up front so a bad pattern
//! is a configuration error, never a per-document failure.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::document::{CanonicalField, ExtractorKind, LengthUnit};
use crate::error::ConfigError;

/// Maps extractor output onto one canonical field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRule {
    pub id: String,
    pub field: CanonicalField,
    /// Higher priority wins conflicts.
    #[serde(default)]
    pub priority: i32,
    pub source: SourceMatcher,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// Which raw items a rule applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMatcher {
    pub extractor: ExtractorKind,
    /// Regex over the item label (NER label, layout label or table header).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Regex over the item text. A named group `value` narrows the capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Value transform applied to a candidate before conflict resolution.
///
/// Written as a bare name (`lowercase`) or, for unit conversion, as
/// `{ convert_unit: ft }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Trim,
    CollapseWhitespace,
    Lowercase,
    Uppercase,
    TitleCase,
    ConvertUnit(LengthUnit),
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Trim => "trim",
            Transform::CollapseWhitespace => "collapse_whitespace",
            Transform::Lowercase => "lowercase",
            Transform::Uppercase => "uppercase",
            Transform::TitleCase => "title_case",
            Transform::ConvertUnit(_) => "convert_unit",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "trim" => Some(Transform::Trim),
            "collapse_whitespace" => Some(Transform::CollapseWhitespace),
            "lowercase" => Some(Transform::Lowercase),
            "uppercase" => Some(Transform::Uppercase),
            "title_case" => Some(Transform::TitleCase),
            _ => None,
        }
    }
}

impl Serialize for Transform {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        match self {
            Transform::ConvertUnit(unit) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("convert_unit", unit)?;
                map.end()
            }
            other => serializer.serialize_str(other.name()),
        }
    }
}

impl<'de> Deserialize<'de> for Transform {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        use serde_json::Value;

        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::String(name) => Transform::from_name(name)
                .ok_or_else(|| D::Error::custom(format!("unknown transform '{}'", name))),
            Value::Object(map) => {
                let unit = map
                    .get("convert_unit")
                    .ok_or_else(|| D::Error::custom("transform object must be { convert_unit: <unit> }"))?;
                let unit: LengthUnit = serde_json::from_value(unit.clone())
                    .map_err(|e| D::Error::custom(format!("Invalid target unit: {}", e)))?;
                Ok(Transform::ConvertUnit(unit))
            }
            _ => Err(D::Error::custom("transform must be a name or an object")),
        }
    }
}

/// A check run against the assembled canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub field: CanonicalField,
    pub check: Check,
    /// A failed fatal rule rejects the document.
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Written as a bare name (`required`, `positive`) or as a single-key object
/// (`{ pattern: "^\\d+" }`, `{ range: { min: 1, max: 500, unit: ft } }`).
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Required,
    Positive,
    Pattern(String),
    Range {
        min: Option<f64>,
        max: Option<f64>,
        unit: Option<LengthUnit>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RangeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<LengthUnit>,
}

impl Check {
    pub fn name(&self) -> &'static str {
        match self {
            Check::Required => "required",
            Check::Positive => "positive",
            Check::Pattern(_) => "pattern",
            Check::Range { .. } => "range",
        }
    }
}

impl Serialize for Check {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        match self {
            Check::Required | Check::Positive => serializer.serialize_str(self.name()),
            Check::Pattern(regex) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("pattern", regex)?;
                map.end()
            }
            Check::Range { min, max, unit } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(
                    "range",
                    &RangeSpec {
                        min: *min,
                        max: *max,
                        unit: *unit,
                    },
                )?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Check {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        use serde_json::Value;

        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::String(name) => match name.as_str() {
                "required" => Ok(Check::Required),
                "positive" => Ok(Check::Positive),
                other => Err(D::Error::custom(format!("unknown check '{}'", other))),
            },
            Value::Object(map) => {
                if let Some(pattern) = map.get("pattern") {
                    let pattern = pattern
                        .as_str()
                        .ok_or_else(|| D::Error::custom("pattern check must be a string"))?;
                    return Ok(Check::Pattern(pattern.to_string()));
                }
                if let Some(range) = map.get("range") {
                    let spec: RangeSpec = serde_json::from_value(range.clone())
                        .map_err(|e| D::Error::custom(format!("Invalid range check: {}", e)))?;
                    return Ok(Check::Range {
                        min: spec.min,
                        max: spec.max,
                        unit: spec.unit,
                    });
                }
                Err(D::Error::custom("check object must contain 'pattern' or 'range'"))
            }
            _ => Err(D::Error::custom("check must be a name or an object")),
        }
    }
}

/// Normalization and validation rules as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<NormalizationRule>,
    #[serde(default)]
    pub validations: Vec<ValidationRule>,
}

impl RuleSet {
    /// Loads a rule file; `.yaml`/`.yml` is read as YAML, anything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let rule_set: RuleSet = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source: e,
            })?
        } else {
            serde_json::from_str(&content)?
        };

        rule_set.validate()?;
        Ok(rule_set)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let ids = self
            .rules
            .iter()
            .map(|r| r.id.as_str())
            .chain(self.validations.iter().map(|v| v.id.as_str()));
        for id in ids {
            if id.trim().is_empty() {
                return Err(ConfigError::Validation {
                    message: "Rule id must not be empty".to_string(),
                });
            }
            if !seen.insert(id) {
                return Err(ConfigError::Validation {
                    message: format!("Duplicate rule ID: {}", id),
                });
            }
        }

        for rule in &self.rules {
            validate_normalization_rule(rule)?;
        }
        for validation in &self.validations {
            validate_validation_rule(validation)?;
        }
        Ok(())
    }
}

fn validate_normalization_rule(rule: &NormalizationRule) -> Result<(), ConfigError> {
    if rule.source.extractor == ExtractorKind::Text && rule.source.label.is_some() {
        return Err(ConfigError::InvalidRule {
            id: rule.id.clone(),
            reason: "text spans carry no label".to_string(),
        });
    }

    if let Some(label) = &rule.source.label {
        compile(&rule.id, label)?;
    }
    if let Some(pattern) = &rule.source.pattern {
        compile(&rule.id, pattern)?;
    }

    if let Some(Transform::ConvertUnit(_)) = rule.transform {
        if !rule.field.is_measurement() {
            return Err(ConfigError::InvalidRule {
                id: rule.id.clone(),
                reason: format!("convert_unit cannot apply to field '{}'", rule.field),
            });
        }
    }
    Ok(())
}

fn validate_validation_rule(rule: &ValidationRule) -> Result<(), ConfigError> {
    match &rule.check {
        Check::Required => Ok(()),
        Check::Pattern(pattern) => {
            if rule.field.is_measurement() {
                return Err(ConfigError::InvalidRule {
                    id: rule.id.clone(),
                    reason: "pattern checks apply to text fields".to_string(),
                });
            }
            compile(&rule.id, pattern).map(|_| ())
        }
        Check::Positive | Check::Range { .. } if !rule.field.is_measurement() => {
            Err(ConfigError::InvalidRule {
                id: rule.id.clone(),
                reason: format!(
                    "{} check needs a measurement field, got '{}'",
                    rule.check.name(),
                    rule.field
                ),
            })
        }
        Check::Range {
            min: Some(min),
            max: Some(max),
            ..
        } if min > max => Err(ConfigError::InvalidRule {
            id: rule.id.clone(),
            reason: format!("range min {} exceeds max {}", min, max),
        }),
        _ => Ok(()),
    }
}

pub(crate) fn compile(id: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        id: id.to_string(),
        reason: e.to_string(),
    })
}
