use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Normalize a string for FHIR string search: case-insensitive,
/// accent-insensitive, ignoring punctuation and whitespace.
pub fn normalize_string(input: &str) -> String {
    input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(|c| c.to_lowercase())
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Case-fold and strip combining marks but keep punctuation (uri matching).
pub fn normalize_casefold(input: &str) -> String {
    input
        .trim()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_case_diacritics_and_punctuation() {
        assert_eq!(normalize_string("Évê"), "eve");
        assert_eq!(normalize_string("  E\tv e  "), "eve");
        assert_eq!(normalize_string("Carreño-Quiñones"), "carrenoquinones");
    }

    #[test]
    fn casefold_keeps_punctuation() {
        assert_eq!(normalize_casefold("Éxample.Org/FHÍR"), "example.org/fhir");
    }
}
