/// Bind values for `sqlx` queries. Typed values are bound as text and cast
/// in the SQL (`$3::numeric`, `$4::timestamptz`).
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    TextArray(Vec<String>),
}

pub(super) fn push_text(bind_params: &mut Vec<BindValue>, value: impl Into<String>) -> usize {
    bind_params.push(BindValue::Text(value.into()));
    bind_params.len()
}

pub(super) fn push_text_array(bind_params: &mut Vec<BindValue>, value: Vec<String>) -> usize {
    bind_params.push(BindValue::TextArray(value));
    bind_params.len()
}

/// Escape `LIKE` wildcards (the default escape character is `\`).
pub(super) fn escape_like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_one_based() {
        let mut binds = Vec::new();
        assert_eq!(push_text(&mut binds, "a"), 1);
        assert_eq!(push_text_array(&mut binds, vec!["b".into()]), 2);
        assert_eq!(binds[0], BindValue::Text("a".into()));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like_pattern("50%_a\\b"), "50\\%\\_a\\\\b");
    }
}
