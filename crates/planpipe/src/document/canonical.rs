//! The canonical, schema-conformant record produced by normalization.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::artifact::Provenance;

/// Length units recognised in building plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LengthUnit {
    #[serde(rename = "ft")]
    Feet,
    #[serde(rename = "in")]
    Inches,
    #[serde(rename = "m")]
    Meters,
    #[serde(rename = "cm")]
    Centimeters,
    #[serde(rename = "mm")]
    Millimeters,
}

impl LengthUnit {
    /// Parses a unit token as written on a plan (`ft`, `feet`, `'`, `m`, ...).
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "ft" | "feet" | "foot" | "'" => Some(LengthUnit::Feet),
            "in" | "inch" | "inches" | "\"" => Some(LengthUnit::Inches),
            "m" | "meter" | "meters" | "metre" | "metres" => Some(LengthUnit::Meters),
            "cm" | "centimeter" | "centimeters" | "centimetre" | "centimetres" => {
                Some(LengthUnit::Centimeters)
            }
            "mm" | "millimeter" | "millimeters" | "millimetre" | "millimetres" => {
                Some(LengthUnit::Millimeters)
            }
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            LengthUnit::Feet => "ft",
            LengthUnit::Inches => "in",
            LengthUnit::Meters => "m",
            LengthUnit::Centimeters => "cm",
            LengthUnit::Millimeters => "mm",
        }
    }

    fn meters_per_unit(self) -> f64 {
        match self {
            LengthUnit::Feet => 0.3048,
            LengthUnit::Inches => 0.0254,
            LengthUnit::Meters => 1.0,
            LengthUnit::Centimeters => 0.01,
            LengthUnit::Millimeters => 0.001,
        }
    }

    /// Converts `value` from `self` into `target`, rounded to 4 decimals so
    /// repeated runs serialize identically.
    pub fn convert(self, value: f64, target: LengthUnit) -> f64 {
        if self == target {
            return value;
        }
        let converted = value * self.meters_per_unit() / target.meters_per_unit();
        (converted * 10_000.0).round() / 10_000.0
    }
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A single measurement taken from the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub value: f64,
    pub unit: LengthUnit,
    pub confidence: f32,
}

impl Dimension {
    pub fn in_unit(&self, target: LengthUnit) -> f64 {
        self.unit.convert(self.value, target)
    }
}

/// Fields of the canonical schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Address,
    Dimensions,
    RoomNames,
    Materials,
    DocumentType,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 5] = [
        CanonicalField::Address,
        CanonicalField::Dimensions,
        CanonicalField::RoomNames,
        CanonicalField::Materials,
        CanonicalField::DocumentType,
    ];

    /// Scalar fields keep one winning value; list fields keep every distinct value.
    pub fn is_list(self) -> bool {
        matches!(
            self,
            CanonicalField::Dimensions | CanonicalField::RoomNames | CanonicalField::Materials
        )
    }

    pub fn is_measurement(self) -> bool {
        matches!(self, CanonicalField::Dimensions)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::Address => "address",
            CanonicalField::Dimensions => "dimensions",
            CanonicalField::RoomNames => "room_names",
            CanonicalField::Materials => "materials",
            CanonicalField::DocumentType => "document_type",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub rule_id: String,
    pub field: CanonicalField,
    pub message: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub address: Option<String>,
    pub dimensions: Vec<Dimension>,
    pub room_names: Vec<String>,
    pub materials: Vec<String>,
    pub document_type: Option<String>,
    pub validation_errors: Vec<ValidationError>,
}

impl CanonicalRecord {
    pub fn has_fatal_errors(&self) -> bool {
        self.validation_errors.iter().any(|e| e.fatal)
    }

    pub fn is_field_empty(&self, field: CanonicalField) -> bool {
        match field {
            CanonicalField::Address => self.address.is_none(),
            CanonicalField::Dimensions => self.dimensions.is_empty(),
            CanonicalField::RoomNames => self.room_names.is_empty(),
            CanonicalField::Materials => self.materials.is_empty(),
            CanonicalField::DocumentType => self.document_type.is_none(),
        }
    }
}

/// Where a canonical value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSource {
    pub rule_id: String,
    pub raw_text: String,
    pub provenance: Provenance,
}

/// Normalization output: the canonical record and the sources of its values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedDocument {
    pub record: CanonicalRecord,
    pub sources: BTreeMap<CanonicalField, Vec<FieldSource>>,
}

/// Identifier returned by a record sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
