// src/core/key.rs

use crate::constants::{PRIVATE_KEY_PREFIX, TEMPLATE_CLOSE, TEMPLATE_OPEN};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    // One dotted segment, optionally followed by bracketed indices: `name`, `name[3]`.
    static ref SEGMENT_RE: Regex = Regex::new(r"^([^.\[\]]+)((?:\[\d+\])*)$").unwrap();
    static ref INDEX_RE: Regex = Regex::new(r"\[(\d+)\]").unwrap();
}

/// One step of a key path: a named field or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySegment {
    Name(String),
    Index(usize),
}

impl KeySegment {
    /// Returns the field name for named segments, `None` for indices.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name.as_str()),
            Self::Index(_) => None,
        }
    }

    /// Whether this segment refers to a private (underscore-prefixed) field.
    pub fn is_private(&self) -> bool {
        match self {
            Self::Name(name) => name.starts_with(PRIVATE_KEY_PREFIX),
            Self::Index(_) => false,
        }
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Index(index) => write!(f, "[{index}]"),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<usize> for KeySegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// The parsed form of one `${a.b[2].c}` reference, excluding the leading
/// scope-root token.
pub type ContextKey = Vec<KeySegment>;

/// Renders a key path as a stable, human-readable string: `a.b[2].c`.
///
/// The rendered form is the canonical identity used for cycle detection,
/// cache keys, and diagnostics. It is never used for data lookup.
pub fn render_key_path(segments: &[KeySegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            KeySegment::Name(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            KeySegment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// Renders a key path back into literal template text: `${a.b[2].c}`.
/// This is the re-renderable form emitted by partial and passthrough
/// deferrals, ready for a later resolution pass.
pub fn template_for_path(segments: &[KeySegment]) -> String {
    format!("{TEMPLATE_OPEN}{}{TEMPLATE_CLOSE}", render_key_path(segments))
}

/// Errors produced while parsing a dotted/bracketed key path string.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("Empty key path.")]
    Empty,
    #[error("Invalid key path segment: '{segment}'.")]
    InvalidSegment { segment: String },
}

/// Parses a dotted/bracketed path string (`a.b[2].c`) into a [`ContextKey`].
///
/// This is a convenience for callers holding already-extracted lookup text;
/// the full `${...}` expression grammar lives in the template parser, not
/// here.
pub fn parse_key_path(path: &str) -> Result<ContextKey, KeyParseError> {
    if path.trim().is_empty() {
        return Err(KeyParseError::Empty);
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        let captures = SEGMENT_RE
            .captures(part)
            .ok_or_else(|| KeyParseError::InvalidSegment {
                segment: part.to_string(),
            })?;

        if let Some(name) = captures.get(1) {
            segments.push(KeySegment::Name(name.as_str().to_string()));
        }
        if let Some(indices) = captures.get(2) {
            for index in INDEX_RE.captures_iter(indices.as_str()) {
                let parsed = index
                    .get(1)
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .ok_or_else(|| KeyParseError::InvalidSegment {
                        segment: part.to_string(),
                    })?;
                segments.push(KeySegment::Index(parsed));
            }
        }
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(parts: &[&str]) -> ContextKey {
        parts.iter().map(|p| KeySegment::from(*p)).collect()
    }

    #[test]
    fn test_render_simple_path() {
        assert_eq!(render_key_path(&key(&["project", "name"])), "project.name");
    }

    #[test]
    fn test_render_path_with_indices() {
        let segments = vec![
            KeySegment::from("a"),
            KeySegment::from("b"),
            KeySegment::from(2usize),
            KeySegment::from("c"),
        ];
        assert_eq!(render_key_path(&segments), "a.b[2].c");
    }

    #[test]
    fn test_template_for_path() {
        let segments = key(&["runtime", "services", "web"]);
        assert_eq!(template_for_path(&segments), "${runtime.services.web}");
    }

    #[test]
    fn test_parse_round_trips_render() {
        let parsed = parse_key_path("a.b[2].c").unwrap();
        assert_eq!(
            parsed,
            vec![
                KeySegment::from("a"),
                KeySegment::from("b"),
                KeySegment::from(2usize),
                KeySegment::from("c"),
            ]
        );
        assert_eq!(render_key_path(&parsed), "a.b[2].c");
    }

    #[test]
    fn test_parse_rejects_empty_and_malformed() {
        assert_eq!(parse_key_path("   "), Err(KeyParseError::Empty));
        assert!(matches!(
            parse_key_path("a..b"),
            Err(KeyParseError::InvalidSegment { .. })
        ));
        assert!(matches!(
            parse_key_path("a.b[x]"),
            Err(KeyParseError::InvalidSegment { .. })
        ));
    }

    #[test]
    fn test_private_segment_detection() {
        assert!(KeySegment::from("_internal").is_private());
        assert!(!KeySegment::from("internal").is_private());
        assert!(!KeySegment::from(0usize).is_private());
    }
}
