use super::rules::Transform;

/// Applies a text transform. Unit conversion is handled on parsed
/// measurements, so it leaves text untouched here.
pub fn apply_text_transform(value: &str, transform: Transform) -> String {
    match transform {
        Transform::Trim => value.trim().to_string(),
        Transform::CollapseWhitespace => collapse_whitespace(value),
        Transform::Lowercase => value.to_lowercase(),
        Transform::Uppercase => value.to_uppercase(),
        Transform::TitleCase => title_case(value),
        Transform::ConvertUnit(_) => value.to_string(),
    }
}

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
