//! Search result parameter filtering (`_summary`, `_elements`).
//!
//! Resources are plain JSON and no StructureDefinitions are loaded, so the
//! summary levels are approximated on top-level elements:
//! - `data` drops `text`
//! - `text` keeps `id`, `meta`, `text`
//! - `true` drops `text`, `contained` and `extension`
//!
//! Filtered resources are tagged SUBSETTED.

use meridian_search::SummaryMode;
use serde_json::{Map, Value as JsonValue};

const SUBSETTED_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ObservationValue";

/// Apply `_summary`. `false` and `count` leave the resource untouched.
pub fn apply_summary(mut resource: JsonValue, mode: SummaryMode) -> JsonValue {
    let Some(obj) = resource.as_object_mut() else {
        return resource;
    };
    match mode {
        SummaryMode::False | SummaryMode::Count => return resource,
        SummaryMode::Data => {
            obj.remove("text");
        }
        SummaryMode::True => {
            for key in ["text", "contained", "extension"] {
                obj.remove(key);
            }
        }
        SummaryMode::Text => {
            obj.retain(|key, _| matches!(key.as_str(), "resourceType" | "id" | "meta" | "text"));
        }
    }
    add_subsetted_tag(&mut resource);
    resource
}

/// Apply `_elements`: keep the listed top-level elements plus
/// `resourceType`, `id` and `meta`. `Type.element` entries only apply to
/// resources of that type.
///
/// # Errors
/// Element names with choice or index notation.
pub fn filter_elements(resource: JsonValue, elements: &[String]) -> crate::Result<JsonValue> {
    let Some(obj) = resource.as_object() else {
        return Ok(resource);
    };

    for element in elements {
        if element.contains('[') {
            return Err(crate::Error::Validation(format!(
                "Invalid _elements value '{}': use the base element name",
                element
            )));
        }
    }

    let resource_type = obj.get("resourceType").and_then(|v| v.as_str());
    let mut filtered = Map::new();
    for field in ["resourceType", "id", "meta"] {
        if let Some(value) = obj.get(field) {
            filtered.insert(field.to_string(), value.clone());
        }
    }
    for element in elements {
        let key = match element.split_once('.') {
            Some((rt, name)) if resource_type == Some(rt) => name,
            Some(_) => continue,
            None => element.as_str(),
        };
        if let Some(value) = obj.get(key) {
            filtered.insert(key.to_string(), value.clone());
        }
    }

    let mut result = JsonValue::Object(filtered);
    add_subsetted_tag(&mut result);
    Ok(result)
}

fn add_subsetted_tag(resource: &mut JsonValue) {
    let Some(obj) = resource.as_object_mut() else {
        return;
    };
    let Some(meta) = obj
        .entry("meta")
        .or_insert_with(|| JsonValue::Object(Map::new()))
        .as_object_mut()
    else {
        return;
    };
    let Some(tags) = meta
        .entry("tag")
        .or_insert_with(|| JsonValue::Array(Vec::new()))
        .as_array_mut()
    else {
        return;
    };

    let tagged = tags.iter().any(|tag| {
        tag.get("system").and_then(|v| v.as_str()) == Some(SUBSETTED_SYSTEM)
            && tag.get("code").and_then(|v| v.as_str()) == Some("SUBSETTED")
    });
    if !tagged {
        tags.push(serde_json::json!({"system": SUBSETTED_SYSTEM, "code": "SUBSETTED"}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient() -> JsonValue {
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"versionId": "1"},
            "text": {"status": "generated"},
            "name": [{"family": "Chalmers"}],
            "birthDate": "1974-12-25"
        })
    }

    #[test]
    fn summary_text_keeps_narrative_only() {
        let filtered = apply_summary(patient(), SummaryMode::Text);
        assert!(filtered.get("text").is_some());
        assert!(filtered.get("name").is_none());
        assert_eq!(filtered["meta"]["tag"][0]["code"], "SUBSETTED");
    }

    #[test]
    fn summary_false_is_untouched() {
        assert_eq!(apply_summary(patient(), SummaryMode::False), patient());
    }

    #[test]
    fn elements_keep_requested_fields() {
        let filtered =
            filter_elements(patient(), &["birthDate".to_string(), "Observation.code".to_string()]).unwrap();
        assert_eq!(filtered["birthDate"], "1974-12-25");
        assert!(filtered.get("name").is_none());
        assert_eq!(filtered["id"], "p1");
        assert!(filter_elements(patient(), &["value[x]".to_string()]).is_err());
    }
}
