//! Search value extraction from resource JSON

use super::path::{Node, PathExpression};
use crate::models::{ExtractedParameterValue, ExtractedValue};
use chrono::{DateTime, Duration, TimeZone, Utc};
use meridian_search::{
    parse_number, parse_reference, DateRange, ParsedReference, SearchParamType, SearchParameterDef,
    SearchParameterRegistry,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Stored on the logical resource row, not in the value tables.
const ROW_PARAMETERS: &[&str] = &["_id", "_lastUpdated"];

const MAX_COMPOSITE_COMBINATIONS: usize = 64;

fn component_key(url: &str, idx: usize) -> String {
    format!("{url}#{idx}")
}

/// Compiled search parameter expressions for every registered definition.
pub struct ParameterExtractor {
    registry: Arc<SearchParameterRegistry>,
    expressions: HashMap<String, PathExpression>,
}

impl ParameterExtractor {
    pub fn new(registry: Arc<SearchParameterRegistry>) -> Self {
        let mut expressions = HashMap::new();
        let mut compile = |key: String, code: &str, expression: &str| match PathExpression::parse(expression) {
            Ok(expr) => {
                expressions.insert(key, expr);
            }
            Err(e) => tracing::warn!(
                code = %code,
                expression = %expression,
                error = %e,
                "Search parameter expression is not supported; parameter will not be indexed"
            ),
        };
        for def in registry.definitions() {
            if let Some(expression) = &def.expression {
                compile(def.url.clone(), &def.code, expression);
            }
            for (idx, component) in def.components.iter().enumerate() {
                compile(component_key(&def.url, idx), &def.code, &component.expression);
            }
        }
        Self {
            registry,
            expressions,
        }
    }

    pub fn registry(&self) -> &Arc<SearchParameterRegistry> {
        &self.registry
    }

    /// Every search value of `resource`, deduplicated and in canonical order.
    pub fn extract(&self, resource_type: &str, resource: &Value) -> Vec<ExtractedParameterValue> {
        let mut values = Vec::new();
        for def in self.registry.params_for(resource_type) {
            if ROW_PARAMETERS.contains(&def.code.as_str()) {
                continue;
            }
            let Some(expr) = self.expressions.get(&def.url) else {
                continue;
            };
            let nodes = expr.evaluate(resource_type, resource);
            if def.param_type == SearchParamType::Composite {
                for node in &nodes {
                    self.composites(&def, node, &mut values);
                }
            } else {
                for node in &nodes {
                    node_values(&def, node, &mut values);
                }
            }
        }

        let mut keyed: Vec<(String, ExtractedParameterValue)> =
            values.into_iter().map(|v| (v.canonical_text(), v)).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        keyed.into_iter().map(|(_, v)| v).collect()
    }

    /// One composite value per combination of component values found under
    /// the same base element.
    fn composites(&self, def: &SearchParameterDef, base: &Node<'_>, out: &mut Vec<ExtractedParameterValue>) {
        let mut per_component: Vec<Vec<ExtractedParameterValue>> = Vec::with_capacity(def.components.len());
        for (idx, component) in def.components.iter().enumerate() {
            let (Some(component_def), Some(expr)) = (
                self.registry.get_by_url(&component.definition),
                self.expressions.get(&component_key(&def.url, idx)),
            ) else {
                return;
            };
            let mut values = Vec::new();
            for node in expr.evaluate_relative(base) {
                node_values(component_def, &node, &mut values);
            }
            values.retain(|v| v.code == component_def.code);
            if values.is_empty() {
                return;
            }
            per_component.push(values);
        }

        let mut combinations: Vec<Vec<ExtractedParameterValue>> = vec![Vec::new()];
        for values in per_component {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combination in &combinations {
                for value in &values {
                    let mut extended = combination.clone();
                    extended.push(value.clone());
                    next.push(extended);
                }
            }
            if next.len() > MAX_COMPOSITE_COMBINATIONS {
                tracing::warn!(
                    code = %def.code,
                    combinations = next.len(),
                    "Too many composite combinations; truncating"
                );
                next.truncate(MAX_COMPOSITE_COMBINATIONS);
            }
            combinations = next;
        }

        for components in combinations {
            out.push(ExtractedParameterValue::new(
                def.code.clone(),
                SearchParamType::Composite,
                ExtractedValue::Composite { components },
            ));
        }
    }
}

/// Values of a non-composite parameter found at `node`.
fn node_values(def: &SearchParameterDef, node: &Node<'_>, out: &mut Vec<ExtractedParameterValue>) {
    let code = def.code.as_str();
    let push = |out: &mut Vec<ExtractedParameterValue>, value: ExtractedValue| {
        out.push(ExtractedParameterValue::new(code, def.param_type, value));
    };
    match def.param_type {
        SearchParamType::String => {
            for value in extract_strings(node.value) {
                push(out, ExtractedValue::String { value });
            }
        }
        SearchParamType::Token => {
            for (system, token) in extract_tokens(node.value) {
                push(out, ExtractedValue::Token { system, code: token });
            }
            for (type_system, type_code, value) in extract_identifier_types(node.value) {
                out.push(ExtractedParameterValue::new(
                    format!("{code}:of-type"),
                    SearchParamType::Token,
                    ExtractedValue::Token {
                        system: Some(format!("{type_system}|{type_code}")),
                        code: value,
                    },
                ));
            }
        }
        SearchParamType::Reference => {
            for value in extract_references(node.value, &def.targets) {
                push(out, value);
            }
            if let Some(identifier) = node.value.get("identifier") {
                for (system, token) in extract_tokens(identifier) {
                    out.push(ExtractedParameterValue::new(
                        format!("{code}:identifier"),
                        SearchParamType::Token,
                        ExtractedValue::Token { system, code: token },
                    ));
                }
            }
        }
        SearchParamType::Date => {
            for (start, end) in extract_date_ranges(node.value) {
                push(out, ExtractedValue::Date { start, end });
            }
        }
        SearchParamType::Number => {
            for text in number_texts(node.value) {
                if let Ok((value, low, high)) = parse_number(code, &text) {
                    push(out, ExtractedValue::Number { value, low, high });
                }
            }
        }
        SearchParamType::Quantity => {
            for value in extract_quantities(code, node.value) {
                push(out, value);
            }
        }
        SearchParamType::Uri => {
            if let Some(value) = node.value.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                push(out, ExtractedValue::Uri { value: value.to_string() });
            }
        }
        SearchParamType::Special => {
            let lat = node.value.get("latitude").and_then(Value::as_f64);
            let lng = node.value.get("longitude").and_then(Value::as_f64);
            if let (Some(latitude), Some(longitude)) = (lat, lng) {
                push(out, ExtractedValue::Location { latitude, longitude });
            }
        }
        SearchParamType::Composite => {}
    }
}

// ============================================================================
// Strings (HumanName, Address and plain strings)
// ============================================================================

const STRING_PARTS: &[&str] = &[
    "text",
    "family",
    "given",
    "prefix",
    "suffix",
    "line",
    "city",
    "district",
    "state",
    "postalCode",
    "country",
];

fn extract_strings(value: &Value) -> Vec<String> {
    let mut values = Vec::new();
    extract_strings_into(value, &mut values);
    values
}

fn extract_strings_into(value: &Value, values: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                values.push(trimmed.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                extract_strings_into(item, values);
            }
        }
        Value::Object(obj) => {
            for field in STRING_PARTS {
                if let Some(part) = obj.get(*field) {
                    extract_strings_into(part, values);
                }
            }
        }
        _ => {}
    }
}

// ============================================================================
// Tokens (code, boolean, Coding, CodeableConcept, Identifier, ContactPoint)
// ============================================================================

fn extract_tokens(value: &Value) -> Vec<(Option<String>, String)> {
    let mut tokens = Vec::new();
    extract_tokens_into(value, &mut tokens);
    tokens
}

fn extract_tokens_into(value: &Value, tokens: &mut Vec<(Option<String>, String)>) {
    match value {
        Value::Object(obj) => {
            if let Some(codings) = obj.get("coding") {
                extract_tokens_into(codings, tokens);
                return;
            }
            let system = string_field(obj, "system");
            if let Some(code) = string_field(obj, "code") {
                tokens.push((system, code));
                return;
            }
            if let Some(value) = string_field(obj, "value") {
                // ContactPoint.system is an enum, not a code system.
                let system = system.filter(|s| !is_contact_point_system(s));
                tokens.push((system, value));
            }
        }
        Value::Array(items) => {
            for item in items {
                extract_tokens_into(item, tokens);
            }
        }
        Value::String(s) if !s.trim().is_empty() => tokens.push((None, s.trim().to_string())),
        Value::Bool(b) => tokens.push((None, b.to_string())),
        Value::Number(n) => tokens.push((None, n.to_string())),
        _ => {}
    }
}

/// `(type system, type code, identifier value)` for each Identifier.type coding.
fn extract_identifier_types(value: &Value) -> Vec<(String, String, String)> {
    let mut rows = Vec::new();
    let Some(obj) = value.as_object() else {
        return rows;
    };
    let (Some(identifier_value), Some(codings)) = (
        string_field(obj, "value"),
        obj.get("type").and_then(|t| t.get("coding")),
    ) else {
        return rows;
    };
    let codings: Vec<&Value> = match codings {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for coding in codings.into_iter().filter_map(Value::as_object) {
        if let (Some(system), Some(code)) = (string_field(coding, "system"), string_field(coding, "code")) {
            rows.push((system, code, identifier_value.clone()));
        }
    }
    rows
}

fn is_contact_point_system(system: &str) -> bool {
    matches!(system, "phone" | "fax" | "email" | "pager" | "url" | "sms" | "other")
}

// ============================================================================
// References
// ============================================================================

fn extract_references(value: &Value, targets: &[String]) -> Vec<ExtractedValue> {
    let raw = match value {
        Value::Object(obj) => string_field(obj, "reference"),
        // canonical elements (QuestionnaireResponse.questionnaire)
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        _ => None,
    };
    let Some(raw) = raw else {
        return Vec::new();
    };
    let value = match parse_reference(&raw) {
        ParsedReference::Local {
            resource_type,
            id,
            version,
        } => ExtractedValue::Reference {
            resource_type: Some(resource_type),
            id: Some(id),
            version,
            url: None,
        },
        ParsedReference::IdOnly(id) => ExtractedValue::Reference {
            resource_type: (targets.len() == 1).then(|| targets[0].clone()),
            id: Some(id),
            version: None,
            url: None,
        },
        ParsedReference::Absolute {
            url,
            resource_type,
            id,
            version,
        } => ExtractedValue::Reference {
            resource_type,
            id,
            version,
            url: Some(url),
        },
        ParsedReference::Canonical { url, version } => ExtractedValue::Reference {
            resource_type: None,
            id: None,
            version,
            url: Some(url),
        },
        // Contained resources are not indexed separately.
        ParsedReference::Contained(_) => return Vec::new(),
    };
    vec![value]
}

// ============================================================================
// Dates (date, dateTime, instant, Period, Timing)
// ============================================================================

/// Lower bound for periods without a start.
fn min_datetime() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Upper bound for periods without an end.
fn max_datetime() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .map(|dt| dt + Duration::seconds(1))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn extract_date_ranges(value: &Value) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut values = Vec::new();
    extract_date_ranges_into(value, &mut values);
    values
}

fn extract_date_ranges_into(value: &Value, values: &mut Vec<(DateTime<Utc>, DateTime<Utc>)>) {
    match value {
        Value::Array(items) => {
            for item in items {
                extract_date_ranges_into(item, values);
            }
        }
        Value::String(s) => {
            if let Ok(range) = DateRange::parse(s) {
                values.push((range.lower, range.upper));
            }
        }
        Value::Object(obj) => {
            // Period: a missing boundary is open-ended.
            if obj.contains_key("start") || obj.contains_key("end") {
                let start = obj
                    .get("start")
                    .and_then(|v| extract_date_ranges(v).into_iter().next())
                    .map(|(start, _)| start)
                    .unwrap_or_else(min_datetime);
                let end = obj
                    .get("end")
                    .and_then(|v| extract_date_ranges(v).into_iter().next())
                    .map(|(_, end)| end)
                    .unwrap_or_else(max_datetime);
                values.push((start, end));
                return;
            }
            // Timing: from the earliest to the latest event.
            if let Some(event) = obj.get("event") {
                let events = extract_date_ranges(event);
                let start = events.iter().map(|(s, _)| *s).min();
                let end = events.iter().map(|(_, e)| *e).max();
                if let (Some(start), Some(end)) = (start, end) {
                    values.push((start, end));
                }
                return;
            }
            if let Some(bounds) = obj.get("repeat").and_then(|r| r.get("boundsPeriod")) {
                extract_date_ranges_into(bounds, values);
            }
        }
        _ => {}
    }
}

// ============================================================================
// Numbers and quantities
// ============================================================================

fn number_texts(value: &Value) -> Vec<String> {
    match value {
        Value::Number(n) => vec![n.to_string()],
        Value::String(s) => vec![s.trim().to_string()],
        Value::Array(items) => items.iter().flat_map(number_texts).collect(),
        _ => Vec::new(),
    }
}

fn extract_quantities(code: &str, value: &Value) -> Vec<ExtractedValue> {
    match value {
        Value::Array(items) => items.iter().flat_map(|v| extract_quantities(code, v)).collect(),
        Value::Object(obj) => {
            let Some(text) = obj.get("value").and_then(|v| number_texts(v).into_iter().next()) else {
                return Vec::new();
            };
            let Ok((value, low, high)) = parse_number(code, &text) else {
                return Vec::new();
            };
            vec![ExtractedValue::Quantity {
                value,
                low,
                high,
                system: string_field(obj, "system"),
                code: string_field(obj, "code"),
                unit: string_field(obj, "unit"),
            }]
        }
        Value::Number(_) | Value::String(_) => number_texts(value)
            .into_iter()
            .filter_map(|text| parse_number(code, &text).ok())
            .map(|(value, low, high)| ExtractedValue::Quantity {
                value,
                low,
                high,
                system: None,
                code: None,
                unit: None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn string_field(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn extractor() -> ParameterExtractor {
        ParameterExtractor::new(Arc::new(SearchParameterRegistry::with_builtin().unwrap()))
    }

    fn values_for<'a>(values: &'a [ExtractedParameterValue], code: &str) -> Vec<&'a ExtractedValue> {
        values.iter().filter(|v| v.code == code).map(|v| &v.value).collect()
    }

    #[test]
    fn patient_strings_tokens_and_identifiers() {
        let patient = json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"tag": [{"system": "http://example.org/tags", "code": "vip"}]},
            "name": [{"family": "Smith", "given": ["Ann", "Marie"]}],
            "gender": "female",
            "active": true,
            "telecom": [{"system": "phone", "value": "555-1234"}],
            "identifier": [{
                "system": "http://hospital.org/mrn",
                "value": "12345",
                "type": {"coding": [{"system": "http://terminology.hl7.org/CodeSystem/v2-0203", "code": "MR"}]}
            }]
        });
        let values = extractor().extract("Patient", &patient);

        assert_eq!(values_for(&values, "family"), vec![&ExtractedValue::String { value: "Smith".into() }]);
        assert_eq!(values_for(&values, "name").len(), 3);
        assert_eq!(values_for(&values, "given").len(), 2);
        assert_eq!(
            values_for(&values, "active"),
            vec![&ExtractedValue::Token { system: None, code: "true".into() }]
        );
        assert_eq!(
            values_for(&values, "telecom"),
            vec![&ExtractedValue::Token { system: None, code: "555-1234".into() }]
        );
        assert_eq!(
            values_for(&values, "identifier:of-type"),
            vec![&ExtractedValue::Token {
                system: Some("http://terminology.hl7.org/CodeSystem/v2-0203|MR".into()),
                code: "12345".into()
            }]
        );
        assert_eq!(values_for(&values, "_tag").len(), 1);
        assert!(values_for(&values, "_id").is_empty());
        assert!(values_for(&values, "_lastUpdated").is_empty());
    }

    #[test]
    fn observation_references_dates_and_quantities() {
        let obs = json!({
            "resourceType": "Observation",
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": "29463-7"}]},
            "subject": {"reference": "Patient/p1"},
            "performer": [{"reference": "#contained"}, {"identifier": {"system": "urn:npi", "value": "99"}}],
            "effectivePeriod": {"start": "2020-01-01"},
            "valueQuantity": {"value": 72.5, "unit": "kg", "system": "http://unitsofmeasure.org", "code": "kg"}
        });
        let values = extractor().extract("Observation", &obs);

        let patient_ref = ExtractedValue::Reference {
            resource_type: Some("Patient".into()),
            id: Some("p1".into()),
            version: None,
            url: None,
        };
        assert_eq!(values_for(&values, "subject"), vec![&patient_ref]);
        assert_eq!(values_for(&values, "patient"), vec![&patient_ref]);
        assert!(values_for(&values, "performer").is_empty());
        assert_eq!(values_for(&values, "performer:identifier").len(), 1);

        match values_for(&values, "date").as_slice() {
            [ExtractedValue::Date { start, end }] => {
                assert_eq!(start.to_rfc3339(), "2020-01-01T00:00:00+00:00");
                assert_eq!(*end, max_datetime());
            }
            other => panic!("unexpected {other:?}"),
        }

        match values_for(&values, "value-quantity").as_slice() {
            [ExtractedValue::Quantity { value, code, .. }] => {
                assert_eq!(*value, Decimal::new(725, 1));
                assert_eq!(code.as_deref(), Some("kg"));
            }
            other => panic!("unexpected {other:?}"),
        }

        match values_for(&values, "code-value-quantity").as_slice() {
            [ExtractedValue::Composite { components }] => {
                assert_eq!(components.len(), 2);
                assert_eq!(components[0].code, "code");
                assert_eq!(components[1].code, "value-quantity");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn extraction_is_order_independent() {
        let a = json!({
            "resourceType": "Patient",
            "name": [{"given": ["Ann"]}, {"given": ["Bo"]}]
        });
        let b = json!({
            "resourceType": "Patient",
            "name": [{"given": ["Bo"]}, {"given": ["Ann"]}, {"given": ["Ann"]}]
        });
        let ex = extractor();
        assert_eq!(ex.extract("Patient", &a), ex.extract("Patient", &b));
    }

    #[test]
    fn location_position_and_number() {
        let ex = extractor();
        let location = json!({"resourceType": "Location", "position": {"latitude": 52.1, "longitude": 4.3}});
        let values = ex.extract("Location", &location);
        assert_eq!(
            values_for(&values, "near"),
            vec![&ExtractedValue::Location { latitude: 52.1, longitude: 4.3 }]
        );

        let risk = json!({"resourceType": "RiskAssessment", "prediction": [{"probabilityDecimal": 0.25}]});
        let values = ex.extract("RiskAssessment", &risk);
        assert!(matches!(
            values_for(&values, "probability").as_slice(),
            [ExtractedValue::Number { .. }]
        ));
    }
}
