//! Helpers for sanitizing data before it enters tracing span attributes and
//! log lines.
//!
//! Plans carry street addresses and client names. Logs may be shared for
//! debugging, so spans only ever see file names, hashes and short previews.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

const PREVIEW_CHARS: usize = 24;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Short deterministic hash of a path for correlating log lines without
/// exposing the path.
pub fn hash_path(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// First few characters of extracted text, with the total length appended
/// when truncated.
pub fn preview_text(text: &str) -> String {
    let count = text.chars().count();
    if count <= PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}… ({} chars)", head, count)
}
