//! Search parameter definitions and compartment membership.
//!
//! The registry is populated from FHIR `SearchParameter` resources (a Bundle,
//! a JSON array or single resources). A built-in bundle provides the common
//! `Resource` parameters plus a small clinical set.

use crate::error::{Result, SearchError};
use crate::types::SearchParamType;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

const BUILTIN_SEARCH_PARAMETERS: &str = include_str!("../resources/search-parameters.json");
const BUILTIN_COMPARTMENTS: &str = include_str!("../resources/compartments.json");

/// Base types whose parameters apply to every resource type.
const COMMON_BASES: &[&str] = &["Resource", "DomainResource"];

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDef {
    /// Canonical url of the component's own SearchParameter.
    pub definition: String,
    /// Expression relative to the composite's base element.
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParameterDef {
    pub code: String,
    pub url: String,
    pub param_type: SearchParamType,
    pub base: Vec<String>,
    pub expression: Option<String>,
    /// Allowed reference targets (reference parameters only).
    pub targets: Vec<String>,
    pub components: Vec<ComponentDef>,
}

impl SearchParameterDef {
    /// Build a definition from a `SearchParameter` resource.
    pub fn from_resource(resource: &JsonValue) -> Result<Self> {
        let str_field = |name: &str| {
            resource
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| SearchError::InvalidDefinition(format!("missing '{name}'")))
        };
        let str_list = |name: &str| -> Vec<String> {
            resource
                .get(name)
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        let code = str_field("code")?;
        let url = str_field("url")?;
        let param_type: SearchParamType = str_field("type")?.parse()?;
        let base = str_list("base");
        if base.is_empty() {
            return Err(SearchError::InvalidDefinition(format!(
                "search parameter '{url}' has no base"
            )));
        }

        let components = resource
            .get("component")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(|c| {
                        let definition = c.get("definition").and_then(|v| v.as_str());
                        let expression = c.get("expression").and_then(|v| v.as_str());
                        match (definition, expression) {
                            (Some(d), Some(e)) => Ok(ComponentDef {
                                definition: d.to_string(),
                                expression: e.to_string(),
                            }),
                            _ => Err(SearchError::InvalidDefinition(format!(
                                "composite '{url}' has an incomplete component"
                            ))),
                        }
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        if param_type == SearchParamType::Composite && components.is_empty() {
            return Err(SearchError::InvalidDefinition(format!(
                "composite '{url}' has no components"
            )));
        }

        Ok(Self {
            code,
            url,
            param_type,
            base,
            expression: resource
                .get("expression")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            targets: str_list("target"),
            components,
        })
    }

    pub fn is_common(&self) -> bool {
        self.base.iter().any(|b| COMMON_BASES.contains(&b.as_str()))
    }
}

#[derive(Debug, Default, Clone)]
pub struct SearchParameterRegistry {
    by_type: HashMap<String, HashMap<String, Arc<SearchParameterDef>>>,
    by_url: HashMap<String, Arc<SearchParameterDef>>,
    /// compartment type -> member resource type -> inclusion parameter codes
    compartments: HashMap<String, HashMap<String, Vec<String>>>,
}

impl SearchParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in parameters and compartments.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        let bundle: JsonValue = serde_json::from_str(BUILTIN_SEARCH_PARAMETERS)
            .map_err(|e| SearchError::InvalidDefinition(e.to_string()))?;
        registry.load(&bundle)?;
        let compartments: JsonValue = serde_json::from_str(BUILTIN_COMPARTMENTS)
            .map_err(|e| SearchError::InvalidDefinition(e.to_string()))?;
        registry.load_compartments(&compartments)?;
        Ok(registry)
    }

    pub fn register(&mut self, def: SearchParameterDef) {
        let def = Arc::new(def);
        for base in &def.base {
            self.by_type
                .entry(base.clone())
                .or_default()
                .insert(def.code.clone(), def.clone());
        }
        self.by_url.insert(def.url.clone(), def);
    }

    /// Load SearchParameter resources from a Bundle, an array or a single
    /// resource. Retired parameters and other resource types are skipped.
    /// Returns the number of registered definitions.
    pub fn load(&mut self, value: &JsonValue) -> Result<usize> {
        let resources: Vec<&JsonValue> = match value {
            JsonValue::Array(items) => items.iter().collect(),
            JsonValue::Object(_) if value.get("resourceType").and_then(|v| v.as_str()) == Some("Bundle") => value
                .get("entry")
                .and_then(|v| v.as_array())
                .map(|entries| entries.iter().filter_map(|e| e.get("resource")).collect())
                .unwrap_or_default(),
            JsonValue::Object(_) => vec![value],
            _ => {
                return Err(SearchError::InvalidDefinition(
                    "expected a Bundle, an array or a SearchParameter".to_string(),
                ))
            }
        };

        let mut loaded = 0;
        for resource in resources {
            if resource.get("resourceType").and_then(|v| v.as_str()) != Some("SearchParameter") {
                continue;
            }
            if resource.get("status").and_then(|v| v.as_str()) == Some("retired") {
                continue;
            }
            self.register(SearchParameterDef::from_resource(resource)?);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Load compartment membership: `{ "Patient": { "Observation": ["subject"] } }`.
    pub fn load_compartments(&mut self, value: &JsonValue) -> Result<()> {
        let compartments = value.as_object().ok_or_else(|| {
            SearchError::InvalidDefinition("compartment definitions must be an object".to_string())
        })?;
        for (compartment, members) in compartments {
            let members = members.as_object().ok_or_else(|| {
                SearchError::InvalidDefinition(format!(
                    "compartment '{compartment}' must map resource types to parameter lists"
                ))
            })?;
            let entry = self.compartments.entry(compartment.clone()).or_default();
            for (resource_type, params) in members {
                let params = params
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                entry.insert(resource_type.clone(), params);
            }
        }
        Ok(())
    }

    /// Look up a parameter for a resource type, falling back to the
    /// parameters common to all resources.
    pub fn get(&self, resource_type: &str, code: &str) -> Option<&Arc<SearchParameterDef>> {
        self.by_type
            .get(resource_type)
            .and_then(|params| params.get(code))
            .or_else(|| {
                COMMON_BASES
                    .iter()
                    .find_map(|base| self.by_type.get(*base).and_then(|p| p.get(code)))
            })
    }

    pub fn get_by_url(&self, url: &str) -> Option<&Arc<SearchParameterDef>> {
        self.by_url.get(url)
    }

    /// Every registered definition.
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<SearchParameterDef>> {
        self.by_url.values()
    }

    /// Every parameter that applies to `resource_type`, common ones included.
    pub fn params_for(&self, resource_type: &str) -> Vec<Arc<SearchParameterDef>> {
        let mut out: HashMap<&str, Arc<SearchParameterDef>> = HashMap::new();
        for base in COMMON_BASES.iter().copied().chain(std::iter::once(resource_type)) {
            if let Some(params) = self.by_type.get(base) {
                for (code, def) in params {
                    out.insert(code.as_str(), def.clone());
                }
            }
        }
        let mut defs: Vec<_> = out.into_values().collect();
        defs.sort_by(|a, b| a.code.cmp(&b.code));
        defs
    }

    /// Resource types with at least one type-specific parameter.
    pub fn resource_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .by_type
            .keys()
            .map(String::as_str)
            .filter(|t| !COMMON_BASES.contains(t))
            .collect();
        types.sort_unstable();
        types
    }

    pub fn is_compartment(&self, name: &str) -> bool {
        self.compartments.contains_key(name)
    }

    /// Inclusion parameters linking `resource_type` to `compartment`.
    pub fn compartment_params(&self, compartment: &str, resource_type: &str) -> Option<&[String]> {
        self.compartments
            .get(compartment)?
            .get(resource_type)
            .map(Vec::as_slice)
    }

    pub fn compartment_members(&self, compartment: &str) -> Vec<&str> {
        let mut members: Vec<&str> = self
            .compartments
            .get(compartment)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_resolves_type_and_common_params() {
        let registry = SearchParameterRegistry::with_builtin().unwrap();
        let name = registry.get("Patient", "name").unwrap();
        assert_eq!(name.param_type, SearchParamType::String);

        let id = registry.get("Observation", "_id").unwrap();
        assert!(id.is_common());
        assert!(registry.get("Patient", "no-such-param").is_none());
    }

    #[test]
    fn composite_components_resolve_by_url() {
        let registry = SearchParameterRegistry::with_builtin().unwrap();
        let composite = registry.get("Observation", "code-value-quantity").unwrap();
        assert_eq!(composite.components.len(), 2);
        let second = registry
            .get_by_url(&composite.components[1].definition)
            .unwrap();
        assert_eq!(second.param_type, SearchParamType::Quantity);
    }

    #[test]
    fn load_skips_retired_and_foreign_resources() {
        let mut registry = SearchParameterRegistry::new();
        let loaded = registry
            .load(&json!([
                {"resourceType": "SearchParameter", "url": "http://x/a", "code": "a",
                 "base": ["Patient"], "type": "string", "expression": "Patient.a"},
                {"resourceType": "SearchParameter", "url": "http://x/b", "code": "b",
                 "base": ["Patient"], "type": "string", "status": "retired"},
                {"resourceType": "Patient", "id": "p"}
            ]))
            .unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.get("Patient", "a").is_some());
        assert!(registry.get("Patient", "b").is_none());
    }

    #[test]
    fn composite_without_components_is_rejected() {
        let err = SearchParameterDef::from_resource(&json!({
            "resourceType": "SearchParameter", "url": "http://x/c", "code": "c",
            "base": ["Observation"], "type": "composite"
        }))
        .unwrap_err();
        assert!(matches!(err, SearchError::InvalidDefinition(_)));
    }

    #[test]
    fn compartment_membership() {
        let registry = SearchParameterRegistry::with_builtin().unwrap();
        assert!(registry.is_compartment("Patient"));
        assert_eq!(
            registry.compartment_params("Patient", "Observation").unwrap(),
            &["subject".to_string(), "performer".to_string()]
        );
        assert!(registry.compartment_params("Patient", "Organization").is_none());
    }
}
