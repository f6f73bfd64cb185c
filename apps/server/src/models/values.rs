//! Search values extracted from a resource.
//!
//! These are the unit of indexing: the persistence service extracts them,
//! hashes them, and either writes them to the value tables or ships them to
//! the remote index consumer.

use chrono::{DateTime, SecondsFormat, Utc};
use meridian_search::SearchParamType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedParameterValue {
    /// Search parameter code. Identifier derived tokens use the synthetic
    /// codes `{code}:of-type` and `{code}:identifier`.
    pub code: String,
    pub param_type: SearchParamType,
    pub value: ExtractedValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractedValue {
    String {
        value: String,
    },
    Number {
        value: Decimal,
        low: Decimal,
        high: Decimal,
    },
    Date {
        start: DateTime<Utc>,
        /// Exclusive.
        end: DateTime<Utc>,
    },
    Token {
        system: Option<String>,
        code: String,
    },
    Quantity {
        value: Decimal,
        low: Decimal,
        high: Decimal,
        system: Option<String>,
        code: Option<String>,
        unit: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    /// Local references carry type and id; absolute and canonical
    /// references carry the url.
    Reference {
        resource_type: Option<String>,
        id: Option<String>,
        version: Option<String>,
        url: Option<String>,
    },
    Uri {
        value: String,
    },
    Composite {
        components: Vec<ExtractedParameterValue>,
    },
}

impl ExtractedParameterValue {
    pub fn new(code: impl Into<String>, param_type: SearchParamType, value: ExtractedValue) -> Self {
        Self {
            code: code.into(),
            param_type,
            value,
        }
    }

    /// Stable text form used for the parameter hash. Two values with the same
    /// canonical text index identically.
    pub fn canonical_text(&self) -> String {
        format!("{}|{}|{}", self.code, self.param_type.as_str(), self.value.canonical_text())
    }
}

fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn instant(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl ExtractedValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractedValue::String { .. } => "string",
            ExtractedValue::Number { .. } => "number",
            ExtractedValue::Date { .. } => "date",
            ExtractedValue::Token { .. } => "token",
            ExtractedValue::Quantity { .. } => "quantity",
            ExtractedValue::Location { .. } => "location",
            ExtractedValue::Reference { .. } => "reference",
            ExtractedValue::Uri { .. } => "uri",
            ExtractedValue::Composite { .. } => "composite",
        }
    }

    fn canonical_text(&self) -> String {
        match self {
            ExtractedValue::String { value } => format!("s:{value}"),
            ExtractedValue::Number { value, low, high } => {
                format!("n:{}:{}:{}", value.normalize(), low.normalize(), high.normalize())
            }
            ExtractedValue::Date { start, end } => format!("d:{}:{}", instant(start), instant(end)),
            ExtractedValue::Token { system, code } => format!("t:{}|{}", opt(system), code),
            ExtractedValue::Quantity {
                value,
                low,
                high,
                system,
                code,
                unit,
            } => format!(
                "q:{}:{}:{}:{}|{}|{}",
                value.normalize(),
                low.normalize(),
                high.normalize(),
                opt(system),
                opt(code),
                opt(unit)
            ),
            ExtractedValue::Location {
                latitude,
                longitude,
            } => format!("l:{latitude}:{longitude}"),
            ExtractedValue::Reference {
                resource_type,
                id,
                version,
                url,
            } => format!(
                "r:{}/{}/{}|{}",
                opt(resource_type),
                opt(id),
                opt(version),
                opt(url)
            ),
            ExtractedValue::Uri { value } => format!("u:{value}"),
            ExtractedValue::Composite { components } => {
                let parts: Vec<String> = components.iter().map(|c| c.canonical_text()).collect();
                format!("c:[{}]", parts.join(";"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_text_ignores_decimal_trailing_zeros() {
        let a = ExtractedParameterValue::new(
            "probability",
            SearchParamType::Number,
            ExtractedValue::Number {
                value: Decimal::new(50, 2),
                low: Decimal::new(495, 3),
                high: Decimal::new(505, 3),
            },
        );
        let b = ExtractedParameterValue::new(
            "probability",
            SearchParamType::Number,
            ExtractedValue::Number {
                value: Decimal::new(5, 1),
                low: Decimal::new(4950, 4),
                high: Decimal::new(5050, 4),
            },
        );
        assert_eq!(a.canonical_text(), b.canonical_text());
    }

    #[test]
    fn values_serialize_with_kind_tag() {
        let v = ExtractedValue::Token {
            system: Some("http://loinc.org".into()),
            code: "1234-5".into(),
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "token");
        let back: ExtractedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
