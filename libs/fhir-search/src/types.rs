//! Search parameter types, modifiers and prefixes.

use crate::error::{Result, SearchError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    Number,
    Date,
    String,
    Token,
    Reference,
    Composite,
    Quantity,
    Uri,
    Special,
}

impl SearchParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Date => "date",
            Self::String => "string",
            Self::Token => "token",
            Self::Reference => "reference",
            Self::Composite => "composite",
            Self::Quantity => "quantity",
            Self::Uri => "uri",
            Self::Special => "special",
        }
    }

    /// Whether values of this type may carry a comparison prefix.
    pub fn supports_prefix(self) -> bool {
        matches!(
            self,
            Self::Number | Self::Date | Self::Quantity | Self::Special
        )
    }

    /// Modifiers accepted for this parameter type (the `type` modifier for
    /// references is checked separately since it is open ended).
    pub fn allowed_modifiers(self) -> &'static [Modifier] {
        use Modifier::*;
        match self {
            Self::String => &[Exact, Contains, Missing],
            Self::Token => &[Missing, Not, Text, OfType, In, NotIn, Above, Below],
            Self::Reference => &[Missing, Identifier, Type],
            Self::Uri => &[Below, Above, Missing],
            Self::Number | Self::Date | Self::Quantity | Self::Composite | Self::Special => {
                &[Missing]
            }
        }
    }
}

impl fmt::Display for SearchParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchParamType {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "number" => Ok(Self::Number),
            "date" => Ok(Self::Date),
            "string" => Ok(Self::String),
            "token" => Ok(Self::Token),
            "reference" => Ok(Self::Reference),
            "composite" => Ok(Self::Composite),
            "quantity" => Ok(Self::Quantity),
            "uri" => Ok(Self::Uri),
            "special" => Ok(Self::Special),
            other => Err(SearchError::InvalidDefinition(format!(
                "unknown search parameter type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modifier {
    Missing,
    Exact,
    Contains,
    Not,
    Text,
    In,
    NotIn,
    Below,
    Above,
    /// Reference type restriction (`subject:Patient`).
    Type,
    Identifier,
    OfType,
    Iterate,
}

impl Modifier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::Not => "not",
            Self::Text => "text",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::Below => "below",
            Self::Above => "above",
            Self::Type => "type",
            Self::Identifier => "identifier",
            Self::OfType => "of-type",
            Self::Iterate => "iterate",
        }
    }

    /// Parse a modifier token. Resource type modifiers are handled by the
    /// caller before reaching here.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "missing" => Ok(Self::Missing),
            "exact" => Ok(Self::Exact),
            "contains" => Ok(Self::Contains),
            "not" => Ok(Self::Not),
            "text" => Ok(Self::Text),
            "in" => Ok(Self::In),
            "not-in" => Ok(Self::NotIn),
            "below" => Ok(Self::Below),
            "above" => Ok(Self::Above),
            "type" => Ok(Self::Type),
            "identifier" => Ok(Self::Identifier),
            "of-type" => Ok(Self::OfType),
            "iterate" => Ok(Self::Iterate),
            other => Err(SearchError::UnknownModifier(other.to_string())),
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison prefix for ordered values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Prefix {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Sa,
    Eb,
    Ap,
}

impl Prefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::Sa => "sa",
            Self::Eb => "eb",
            Self::Ap => "ap",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "gt" => Self::Gt,
            "lt" => Self::Lt,
            "ge" => Self::Ge,
            "le" => Self::Le,
            "sa" => Self::Sa,
            "eb" => Self::Eb,
            "ap" => Self::Ap,
            _ => return None,
        })
    }

    /// Strip a leading two-letter prefix from `value`. Values without a
    /// recognized prefix are returned unchanged with `Eq`.
    pub fn split(value: &str) -> (Self, &str) {
        if value.len() >= 2 && value.is_char_boundary(2) {
            if let Some(prefix) = Self::from_code(&value[..2]) {
                return (prefix, &value[2..]);
            }
        }
        (Self::Eq, value)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FHIR resource type names are PascalCase ASCII identifiers.
pub fn is_valid_resource_type(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

/// FHIR logical ids: 1-64 characters of `[A-Za-z0-9\-\.]`.
pub fn is_valid_logical_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_split_recognizes_known_prefixes_only() {
        assert_eq!(Prefix::split("ge2020"), (Prefix::Ge, "2020"));
        assert_eq!(Prefix::split("2020"), (Prefix::Eq, "2020"));
        assert_eq!(Prefix::split("ap5.4"), (Prefix::Ap, "5.4"));
        assert_eq!(Prefix::split("x"), (Prefix::Eq, "x"));
    }

    #[test]
    fn allowed_modifiers_follow_type() {
        assert!(SearchParamType::String
            .allowed_modifiers()
            .contains(&Modifier::Exact));
        assert!(!SearchParamType::Date
            .allowed_modifiers()
            .contains(&Modifier::Exact));
        assert!(SearchParamType::Reference
            .allowed_modifiers()
            .contains(&Modifier::Type));
    }

    #[test]
    fn resource_type_and_id_validation() {
        assert!(is_valid_resource_type("Patient"));
        assert!(!is_valid_resource_type("patient"));
        assert!(!is_valid_resource_type("Pat-ient"));
        assert!(is_valid_logical_id("abc-123.x"));
        assert!(!is_valid_logical_id("abc/123"));
        assert!(!is_valid_logical_id(&"a".repeat(65)));
    }
}
