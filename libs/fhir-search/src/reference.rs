//! Reference string interpretation shared by query parsing and indexing.

use crate::types::{is_valid_logical_id, is_valid_resource_type};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedReference {
    /// `Type/id` or `Type/id/_history/vid`.
    Local {
        resource_type: String,
        id: String,
        version: Option<String>,
    },
    /// A bare logical id (query values only).
    IdOnly(String),
    /// Absolute url. `resource_type`/`id` are set when the url ends in a
    /// RESTful `Type/id` path.
    Absolute {
        url: String,
        resource_type: Option<String>,
        id: Option<String>,
        version: Option<String>,
    },
    /// `url|version`.
    Canonical { url: String, version: Option<String> },
    /// `#id` pointing into `contained`.
    Contained(String),
}

fn is_absolute(value: &str) -> bool {
    value.contains("://") || value.starts_with("urn:")
}

/// Split a path into `(type, id, version)` when its tail is `Type/id` or
/// `Type/id/_history/vid`.
fn restful_tail(path: &str) -> Option<(String, String, Option<String>)> {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    let n = segments.len();
    if n >= 4 && segments[n - 2] == "_history" {
        let (t, id, v) = (segments[n - 4], segments[n - 3], segments[n - 1]);
        if is_valid_resource_type(t) && is_valid_logical_id(id) {
            return Some((t.to_string(), id.to_string(), Some(v.to_string())));
        }
    }
    if n >= 2 {
        let (t, id) = (segments[n - 2], segments[n - 1]);
        if is_valid_resource_type(t) && is_valid_logical_id(id) {
            return Some((t.to_string(), id.to_string(), None));
        }
    }
    None
}

pub fn parse_reference(raw: &str) -> ParsedReference {
    let raw = raw.trim();
    if let Some(id) = raw.strip_prefix('#') {
        return ParsedReference::Contained(id.to_string());
    }

    if let Some((url, version)) = raw.split_once('|') {
        return ParsedReference::Canonical {
            url: url.to_string(),
            version: Some(version.to_string()).filter(|v| !v.is_empty()),
        };
    }

    if is_absolute(raw) {
        let tail = if raw.starts_with("urn:") {
            None
        } else {
            restful_tail(raw)
        };
        return match tail {
            Some((t, id, version)) => ParsedReference::Absolute {
                url: raw.to_string(),
                resource_type: Some(t),
                id: Some(id),
                version,
            },
            None => ParsedReference::Absolute {
                url: raw.to_string(),
                resource_type: None,
                id: None,
                version: None,
            },
        };
    }

    if !raw.contains('/') {
        return ParsedReference::IdOnly(raw.to_string());
    }

    match restful_tail(raw) {
        Some((resource_type, id, version)) => ParsedReference::Local {
            resource_type,
            id,
            version,
        },
        None => ParsedReference::Absolute {
            url: raw.to_string(),
            resource_type: None,
            id: None,
            version: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_references() {
        assert_eq!(
            parse_reference("Patient/123"),
            ParsedReference::Local {
                resource_type: "Patient".into(),
                id: "123".into(),
                version: None
            }
        );
        assert_eq!(
            parse_reference("Patient/123/_history/2"),
            ParsedReference::Local {
                resource_type: "Patient".into(),
                id: "123".into(),
                version: Some("2".into())
            }
        );
        assert_eq!(parse_reference("123"), ParsedReference::IdOnly("123".into()));
        assert_eq!(parse_reference("#c1"), ParsedReference::Contained("c1".into()));
    }

    #[test]
    fn absolute_and_canonical_references() {
        match parse_reference("http://example.org/fhir/Patient/9") {
            ParsedReference::Absolute {
                resource_type, id, ..
            } => {
                assert_eq!(resource_type.as_deref(), Some("Patient"));
                assert_eq!(id.as_deref(), Some("9"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parse_reference("http://example.org/Questionnaire/q|1.0"),
            ParsedReference::Canonical {
                url: "http://example.org/Questionnaire/q".into(),
                version: Some("1.0".into())
            }
        );
        assert!(matches!(
            parse_reference("urn:uuid:1234"),
            ParsedReference::Absolute { id: None, .. }
        ));
    }
}
