//! Measurement parsing for plan dimensions such as `12 ft × 20 ft`,
//! `12' x 20'` or `3.5 m`.

use std::sync::OnceLock;

use regex::Regex;

use crate::document::LengthUnit;

/// Longer unit spellings come first so the alternation never stops at a prefix.
/// `upto` is the second number of a range such as `10-12 ft`.
const MEASUREMENT_PATTERN: &str = r#"(?i)(?P<sign>-)?(?P<num>\d+(?:\.\d+)?)(?:\s*[-–]\s*(?P<upto>\d+(?:\.\d+)?))?\s*(?P<unit>feet|foot|ft|inches|inch|in|millimeters|millimetres|mm|centimeters|centimetres|cm|meters|metres|meter|metre|m|'|")"#;

fn measurement_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(MEASUREMENT_PATTERN).ok())
        .as_ref()
}

/// A number with its unit, as written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub unit: LengthUnit,
}

impl Measurement {
    pub fn convert(self, target: LengthUnit) -> Self {
        Self {
            value: self.unit.convert(self.value, target),
            unit: target,
        }
    }

    /// Grouping key used to detect duplicate values across extractors.
    pub fn key(&self) -> String {
        format!("{} {}", self.value, self.unit)
    }
}

/// A measurement located in the source text.
struct Found {
    start: usize,
    end: usize,
    measurement: Measurement,
    ranged: bool,
}

/// Every measurement in `text`, in order of appearance.
///
/// A unit directly followed by a letter (`12 main`, `5 minutes`) is not a
/// unit, and neither is a spaced `in` that reads as a word (`2 in east
/// wing`). A `-` after a number or a foot/inch mark is a separator:
/// `12'-6"` is one measurement of 12.5 ft and `10-12 ft` is two.
pub fn parse_measurements(text: &str) -> Vec<Measurement> {
    let Some(regex) = measurement_regex() else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for caps in regex.captures_iter(text) {
        let (Some(whole), Some(num), Some(unit)) = (caps.get(0), caps.name("num"), caps.name("unit"))
        else {
            continue;
        };
        let upto = caps.name("upto");

        let unit_token = unit.as_str();
        let alphabetic_unit = unit_token.chars().all(|c| c.is_ascii_alphabetic());
        if alphabetic_unit && starts_with_letter(&text[whole.end()..]) {
            continue;
        }
        let number_end = upto.unwrap_or(num).end();
        if unit_token.eq_ignore_ascii_case("in")
            && unit.start() > number_end
            && reads_as_word(&text[unit.end()..])
        {
            continue;
        }

        let negative = caps
            .name("sign")
            .filter(|sign| !follows_measurement(&text[..sign.start()]));
        let start = negative.map_or(num.start(), |sign| sign.start());
        if ends_with_letter(&text[..start]) {
            continue;
        }

        let (Ok(value), Some(unit)) = (num.as_str().parse::<f64>(), LengthUnit::parse(unit_token))
        else {
            continue;
        };
        let value = if negative.is_some() { -value } else { value };

        let mut push = |value: f64, ranged: bool| {
            found.push(Found {
                start,
                end: whole.end(),
                measurement: Measurement { value, unit },
                ranged,
            })
        };
        match upto.and_then(|u| u.as_str().parse::<f64>().ok()) {
            Some(upper) => {
                push(value, true);
                push(upper, true);
            }
            None => push(value, false),
        }
    }
    join_feet_and_inches(text, &found)
}

fn starts_with_letter(text: &str) -> bool {
    text.chars().next().is_some_and(char::is_alphabetic)
}

fn ends_with_letter(text: &str) -> bool {
    text.chars().next_back().is_some_and(char::is_alphabetic)
}

/// Whether the text before a `-` ends in a number or a foot/inch mark.
fn follows_measurement(before: &str) -> bool {
    before
        .trim_end()
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_digit() || c == '\'' || c == '"')
}

fn reads_as_word(after: &str) -> bool {
    let word: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect();
    !word.is_empty() && !word.eq_ignore_ascii_case("x") && !word.eq_ignore_ascii_case("by")
}

/// Joins `12'-6"`, `12' 6"` and `12 ft 6 in` into a single value in feet.
fn join_feet_and_inches(text: &str, found: &[Found]) -> Vec<Measurement> {
    let mut joined: Vec<Measurement> = Vec::with_capacity(found.len());
    let mut previous: Option<&Found> = None;

    for current in found {
        if let Some(feet) = previous.filter(|feet| is_feet_inch_pair(text, feet, current)) {
            if let Some(last) = joined.last_mut() {
                let inches = current.measurement.value / 12.0;
                let total = if feet.measurement.value < 0.0 {
                    feet.measurement.value - inches
                } else {
                    feet.measurement.value + inches
                };
                last.value = (total * 10_000.0).round() / 10_000.0;
            }
            previous = None;
            continue;
        }
        joined.push(current.measurement);
        previous = Some(current);
    }
    joined
}

fn is_feet_inch_pair(text: &str, feet: &Found, inches: &Found) -> bool {
    feet.measurement.unit == LengthUnit::Feet
        && inches.measurement.unit == LengthUnit::Inches
        && !feet.ranged
        && !inches.ranged
        && (0.0..12.0).contains(&inches.measurement.value)
        && matches!(text.get(feet.end..inches.start).map(str::trim), Some("" | "-"))
}
