use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::Regex;

use crate::document::{
    CanonicalField, CanonicalRecord, Dimension, ExtractedItem, ExtractionArtifact, FieldSource,
    NormalizedDocument, Provenance,
};
use crate::error::ConfigError;
use crate::sanitize;

use super::measure::{parse_measurements, Measurement};
use super::rules::{compile, NormalizationRule, RuleSet, Transform};
use super::transform::apply_text_transform;
use super::validation::{run_validations, CompiledValidation};

struct CompiledRule {
    rule: NormalizationRule,
    label: Option<Regex>,
    pattern: Option<Regex>,
}

impl CompiledRule {
    fn new(rule: NormalizationRule) -> Result<Self, ConfigError> {
        let label = rule
            .source
            .label
            .as_deref()
            .map(|l| compile(&rule.id, l))
            .transpose()?;
        let pattern = rule
            .source
            .pattern
            .as_deref()
            .map(|p| compile(&rule.id, p))
            .transpose()?;
        Ok(Self {
            rule,
            label,
            pattern,
        })
    }

    /// Text this rule captures from `item`, if the item matches.
    fn capture<'a>(&self, item: &'a ExtractedItem) -> Option<&'a str> {
        if item.value.extractor() != self.rule.source.extractor {
            return None;
        }

        if let Some(label_regex) = &self.label {
            let label = item.value.label()?;
            if !label_regex.is_match(label) {
                return None;
            }
        }

        let text = item.value.text();
        let captured = match &self.pattern {
            Some(pattern) => {
                let caps = pattern.captures(text)?;
                caps.name("value").or_else(|| caps.get(0))?.as_str()
            }
            None => text,
        };

        let captured = captured.trim();
        if captured.is_empty() {
            None
        } else {
            Some(captured)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CandidateValue {
    Text(String),
    Measure(Measurement),
}

impl CandidateValue {
    fn key(&self) -> String {
        match self {
            CandidateValue::Text(text) => text.clone(),
            CandidateValue::Measure(m) => m.key(),
        }
    }
}

struct Candidate<'a> {
    value: CandidateValue,
    rule: &'a NormalizationRule,
    raw_text: &'a str,
    provenance: Provenance,
    /// Position of the value within its item, for items yielding several.
    position: usize,
    /// Equal measurements this rule produced before this one. Candidates
    /// from different rules with the same value and occurrence describe one
    /// entity; repeats from the same rule are separate entities.
    occurrence: usize,
}

impl Candidate<'_> {
    fn order(&self) -> (u64, usize) {
        (self.provenance.sequence, self.position)
    }

    fn source(&self) -> FieldSource {
        FieldSource {
            rule_id: self.rule.id.clone(),
            raw_text: self.raw_text.to_string(),
            provenance: self.provenance,
        }
    }
}

/// Conflict order: rule priority, then extractor confidence, then the most
/// recently extracted item.
fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.rule
        .priority
        .cmp(&b.rule.priority)
        .then_with(|| a.provenance.confidence.total_cmp(&b.provenance.confidence))
        .then_with(|| a.order().cmp(&b.order()))
}

/// Candidates sharing one transformed value, best first.
struct ValueGroup<'a> {
    candidates: Vec<Candidate<'a>>,
}

impl<'a> ValueGroup<'a> {
    fn best(&self) -> &Candidate<'a> {
        &self.candidates[0]
    }

    fn first_seen(&self) -> (u64, usize) {
        self.candidates
            .iter()
            .map(Candidate::order)
            .min()
            .unwrap_or((u64::MAX, usize::MAX))
    }

    fn sources(&self) -> Vec<FieldSource> {
        self.candidates.iter().map(Candidate::source).collect()
    }
}

fn group_by_value(candidates: Vec<Candidate<'_>>) -> Vec<ValueGroup<'_>> {
    let mut groups: BTreeMap<(String, usize), Vec<Candidate<'_>>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry((candidate.value.key(), candidate.occurrence))
            .or_default()
            .push(candidate);
    }

    groups
        .into_values()
        .map(|mut candidates| {
            candidates.sort_by(|a, b| rank(b, a));
            ValueGroup { candidates }
        })
        .collect()
}

/// Why normalization refused to produce a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    /// At least one fatal validation rule failed.
    FatalRules(Vec<String>),
    /// Non-fatal rules failed and warnings are not allowed.
    WarningsNotAllowed(Vec<String>),
}

/// A canonical record that failed validation, kept for diagnosis.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub document: NormalizedDocument,
    pub reason: RejectionReason,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            RejectionReason::FatalRules(ids) => {
                write!(f, "fatal validation rule(s) failed: {}", ids.join(", "))
            }
            RejectionReason::WarningsNotAllowed(ids) => {
                write!(f, "validation rule(s) failed: {}", ids.join(", "))
            }
        }
    }
}

/// Reconciles extractor output into one canonical record.
///
/// Pure: the same extraction artifact and rule set always give the same
/// record, field sources and validation errors, in the same order.
pub struct NormalizationEngine {
    rules: Vec<CompiledRule>,
    validations: Vec<CompiledValidation>,
    allow_warnings: bool,
}

impl NormalizationEngine {
    pub fn new(rule_set: &RuleSet, allow_warnings: bool) -> Result<Self, ConfigError> {
        rule_set.validate()?;

        let rules = rule_set
            .rules
            .iter()
            .cloned()
            .map(CompiledRule::new)
            .collect::<Result<Vec<_>, _>>()?;
        let validations = rule_set
            .validations
            .iter()
            .cloned()
            .map(CompiledValidation::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            validations,
            allow_warnings,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn validation_count(&self) -> usize {
        self.validations.len()
    }

    pub fn normalize(&self, extraction: &ExtractionArtifact) -> Result<NormalizedDocument, Rejection> {
        let mut per_field: BTreeMap<CanonicalField, Vec<Candidate<'_>>> = BTreeMap::new();
        let mut measured: HashMap<(usize, String), usize> = HashMap::new();

        for item in &extraction.items {
            for (rule_index, compiled) in self.rules.iter().enumerate() {
                let Some(captured) = compiled.capture(item) else {
                    continue;
                };
                let rule = &compiled.rule;
                for (position, value) in candidate_values(rule, captured).into_iter().enumerate() {
                    let occurrence = match &value {
                        CandidateValue::Measure(m) => {
                            let count = measured.entry((rule_index, m.key())).or_insert(0);
                            *count += 1;
                            *count - 1
                        }
                        CandidateValue::Text(_) => 0,
                    };
                    per_field.entry(rule.field).or_default().push(Candidate {
                        value,
                        rule,
                        raw_text: captured,
                        provenance: item.provenance,
                        position,
                        occurrence,
                    });
                }
            }
        }

        let mut document = NormalizedDocument::default();
        for (field, candidates) in per_field {
            let mut groups = group_by_value(candidates);

            if field.is_list() {
                groups.sort_by_key(|g| g.first_seen());
                let mut sources = Vec::new();
                for group in &groups {
                    assign(&mut document.record, field, group.best());
                    sources.extend(group.sources());
                }
                document.sources.insert(field, sources);
            } else if let Some(winner) = groups
                .iter()
                .max_by(|a, b| rank(a.best(), b.best()))
            {
                tracing::debug!(
                    field = %field,
                    rule = %winner.best().rule.id,
                    value = %sanitize::preview_text(&winner.best().value.key()),
                    contenders = groups.len(),
                    "Resolved field"
                );
                assign(&mut document.record, field, winner.best());
                document.sources.insert(field, winner.sources());
            }
        }

        let errors = run_validations(&self.validations, &document.record);
        let fatal: Vec<String> = errors
            .iter()
            .filter(|e| e.fatal)
            .map(|e| e.rule_id.clone())
            .collect();
        let all: Vec<String> = errors.iter().map(|e| e.rule_id.clone()).collect();
        document.record.validation_errors = errors;

        if !fatal.is_empty() {
            return Err(Rejection {
                document,
                reason: RejectionReason::FatalRules(fatal),
            });
        }
        if !self.allow_warnings && !all.is_empty() {
            return Err(Rejection {
                document,
                reason: RejectionReason::WarningsNotAllowed(all),
            });
        }
        Ok(document)
    }
}

fn candidate_values(rule: &NormalizationRule, captured: &str) -> Vec<CandidateValue> {
    if rule.field.is_measurement() {
        return parse_measurements(captured)
            .into_iter()
            .map(|m| match rule.transform {
                Some(Transform::ConvertUnit(target)) => m.convert(target),
                _ => m,
            })
            .map(CandidateValue::Measure)
            .collect();
    }

    let value = match rule.transform {
        Some(transform) => apply_text_transform(captured, transform),
        None => captured.to_string(),
    };
    let value = value.trim();
    if value.is_empty() {
        Vec::new()
    } else {
        vec![CandidateValue::Text(value.to_string())]
    }
}

fn assign(record: &mut CanonicalRecord, field: CanonicalField, candidate: &Candidate<'_>) {
    match (&candidate.value, field) {
        (CandidateValue::Text(text), CanonicalField::Address) => {
            record.address = Some(text.clone())
        }
        (CandidateValue::Text(text), CanonicalField::DocumentType) => {
            record.document_type = Some(text.clone())
        }
        (CandidateValue::Text(text), CanonicalField::RoomNames) => {
            record.room_names.push(text.clone())
        }
        (CandidateValue::Text(text), CanonicalField::Materials) => {
            record.materials.push(text.clone())
        }
        (CandidateValue::Measure(m), CanonicalField::Dimensions) => {
            record.dimensions.push(Dimension {
                value: m.value,
                unit: m.unit,
                confidence: candidate.provenance.confidence,
            })
        }
        _ => {}
    }
}
