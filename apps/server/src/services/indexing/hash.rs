//! Parameter hash over a resource's extracted search values.

use crate::models::ExtractedParameterValue;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// SHA-256 of the sorted, deduplicated canonical texts, base64 encoded.
///
/// Two resources with the same search values hash identically regardless of
/// element order, so an unchanged hash means the value tables can be left
/// alone.
pub fn parameter_hash(values: &[ExtractedParameterValue]) -> String {
    let mut texts: Vec<String> = values.iter().map(ExtractedParameterValue::canonical_text).collect();
    texts.sort_unstable();
    texts.dedup();

    let mut hasher = Sha256::new();
    for text in &texts {
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
    }
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedValue;
    use meridian_search::SearchParamType;

    fn token(code: &str, value: &str) -> ExtractedParameterValue {
        ExtractedParameterValue::new(
            code,
            SearchParamType::Token,
            ExtractedValue::Token {
                system: None,
                code: value.to_string(),
            },
        )
    }

    #[test]
    fn hash_ignores_order_and_duplicates() {
        let a = vec![token("gender", "female"), token("active", "true")];
        let b = vec![token("active", "true"), token("gender", "female"), token("active", "true")];
        assert_eq!(parameter_hash(&a), parameter_hash(&b));
    }

    #[test]
    fn hash_changes_with_values() {
        let a = vec![token("gender", "female")];
        let b = vec![token("gender", "male")];
        assert_ne!(parameter_hash(&a), parameter_hash(&b));
        // Separator keeps concatenations apart.
        assert_ne!(
            parameter_hash(&[token("a", "bc")]),
            parameter_hash(&[token("a", "b"), token("c", "")])
        );
    }

    #[test]
    fn empty_hash_is_stable() {
        assert_eq!(parameter_hash(&[]), parameter_hash(&[]));
        assert_eq!(parameter_hash(&[]).len(), 44);
    }
}
