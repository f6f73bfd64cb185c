//! Search value escaping (FHIR "Encoding Note").
//!
//! Values may escape separator characters with `\`:
//! - `\,` comma inside a value (OR separator otherwise)
//! - `\|` token system/code separator
//! - `\$` composite component separator
//! - `\\` literal backslash

use crate::error::{Result, SearchError};

/// Split `input` on `sep`, skipping separators escaped with a backslash.
///
/// Escape sequences are kept verbatim in the returned slices.
pub fn split_unescaped(input: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            out.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    out.push(&input[start..]);
    out
}

/// Split on the first unescaped `sep`.
pub fn split_once_unescaped(input: &str, sep: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some((&input[..i], &input[i + c.len_utf8()..]));
        }
    }
    None
}

/// Resolve escape sequences. An unpaired backslash, or one escaping a
/// character other than `\ , $ |`, is rejected.
pub fn unescape_search_value(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(next @ ('\\' | ',' | '$' | '|')) => out.push(next),
            _ => return Err(SearchError::InvalidEscape(input.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_skips_escaped_separators() {
        assert_eq!(split_unescaped("a,b\\,c,d", ','), vec!["a", "b\\,c", "d"]);
        assert_eq!(split_unescaped("", ','), vec![""]);
        assert_eq!(split_unescaped("a$b", '$'), vec!["a", "b"]);
    }

    #[test]
    fn split_handles_escaped_backslash_before_separator() {
        // `\\` is a literal backslash, so the following comma separates.
        assert_eq!(split_unescaped("a\\\\,b", ','), vec!["a\\\\", "b"]);
    }

    #[test]
    fn split_once_finds_first_unescaped() {
        assert_eq!(
            split_once_unescaped("sys\\|tem|code", '|'),
            Some(("sys\\|tem", "code"))
        );
        assert_eq!(split_once_unescaped("code", '|'), None);
    }

    #[test]
    fn unescape_resolves_known_sequences() {
        assert_eq!(unescape_search_value("a\\,b\\|c\\$d\\\\").unwrap(), "a,b|c$d\\");
    }

    #[test]
    fn unescape_rejects_unpaired_backslash() {
        assert!(unescape_search_value("abc\\").is_err());
        assert!(unescape_search_value("a\\bc").is_err());
    }
}
