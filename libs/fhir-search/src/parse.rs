//! Search request parsing.
//!
//! Turns ordered `(name, value)` query items into a [`SearchContext`]:
//! - repeated parameters are AND, comma separated values are OR
//! - `code[:modifier]` names, where a resource type modifier restricts
//!   reference targets
//! - chains (`subject:Patient.name`), reverse chains (`_has:...`)
//! - result parameters (`_count`, `_page`, `_sort`, `_include`, ...)

use crate::date::DateRange;
use crate::error::{Result, SearchError};
use crate::escape::{split_once_unescaped, split_unescaped, unescape_search_value};
use crate::query::*;
use crate::reference::{parse_reference, ParsedReference};
use crate::registry::{SearchParameterDef, SearchParameterRegistry};
use crate::types::{is_valid_resource_type, Modifier, Prefix, SearchParamType};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_NEAR_DISTANCE_KM: f64 = 1.0;

struct Parser<'a> {
    registry: &'a SearchParameterRegistry,
    options: &'a ParseOptions,
    /// `_type` restriction used to resolve parameters of a system search.
    system_types: Vec<String>,
}

/// Parse a type-level (`Some(type)`) or system-level (`None`) search.
pub fn parse_query(
    resource_type: Option<&str>,
    items: &[(String, String)],
    registry: &SearchParameterRegistry,
    options: &ParseOptions,
) -> Result<SearchContext> {
    if let Some(rt) = resource_type {
        if !is_valid_resource_type(rt) {
            return Err(SearchError::InvalidResourceType(rt.to_string()));
        }
    }

    let mut context = SearchContext::new(resource_type.map(str::to_string), options.default_page_size);

    // `_type` must be known before any other parameter of a system search.
    for (name, value) in items.iter().filter(|(n, _)| n == "_type") {
        if resource_type.is_some() {
            lenient(
                options,
                &mut context,
                SearchError::Invalid(format!("_type is only valid for system search: {name}={value}")),
            )?;
            continue;
        }
        for t in split_unescaped(value, ',') {
            let t = t.trim();
            if t.is_empty() {
                continue;
            }
            if !is_valid_resource_type(t) {
                return Err(SearchError::InvalidResourceType(t.to_string()));
            }
            if !context.resource_types.iter().any(|x| x == t) {
                context.resource_types.push(t.to_string());
            }
        }
    }

    let parser = Parser {
        registry,
        options,
        system_types: context.resource_types.clone(),
    };

    let mut sort_seen = false;
    for (name, value) in items {
        match name.as_str() {
            "_type" | "_format" | "_pretty" => {}
            "_count" => {
                let count: i64 = value.trim().parse().map_err(|_| {
                    SearchError::invalid_value("_count", value, "expected an integer")
                })?;
                if count < 0 {
                    return Err(SearchError::invalid_value("_count", value, "must not be negative"));
                }
                let count = count as usize;
                if count == 0 {
                    context.summary = Some(SummaryMode::Count);
                }
                if count > options.max_page_size {
                    tracing::info!(
                        requested = count,
                        max = options.max_page_size,
                        "Capping _count to the maximum page size"
                    );
                }
                context.page_size = count.min(options.max_page_size);
            }
            "_page" => {
                let page: usize = value
                    .trim()
                    .parse()
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| {
                        SearchError::invalid_value("_page", value, "expected a positive integer")
                    })?;
                context.page_number = page;
            }
            "_sort" => {
                if sort_seen {
                    return Err(SearchError::Invalid(
                        "_sort must not appear more than once".to_string(),
                    ));
                }
                sort_seen = true;
                for raw in split_unescaped(value, ',') {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        continue;
                    }
                    match parser.parse_sort(resource_type, raw) {
                        Ok(sort) => context.sort.push(sort),
                        Err(e) => lenient(options, &mut context, e)?,
                    }
                }
            }
            "_include" | "_include:iterate" | "_revinclude" | "_revinclude:iterate" => {
                let reverse = name.starts_with("_revinclude");
                let iterate = name.ends_with(":iterate");
                let Some(rt) = resource_type else {
                    lenient(
                        options,
                        &mut context,
                        SearchError::Invalid(format!("{name} is not supported for system search")),
                    )?;
                    continue;
                };
                for raw in split_unescaped(value, ',') {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        continue;
                    }
                    match parser.parse_inclusion(rt, raw, reverse, iterate) {
                        Ok(inc) if reverse => context.revincludes.push(inc),
                        Ok(inc) => context.includes.push(inc),
                        Err(e) => lenient(options, &mut context, e)?,
                    }
                }
            }
            "_elements" => {
                for element in split_unescaped(value, ',') {
                    let element = element.trim();
                    if element.is_empty() {
                        continue;
                    }
                    if !element.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        lenient(
                            options,
                            &mut context,
                            SearchError::invalid_value("_elements", element, "not an element name"),
                        )?;
                        continue;
                    }
                    context.elements.push(element.to_string());
                }
            }
            "_summary" => {
                context.summary = Some(match value.trim() {
                    "true" => SummaryMode::True,
                    "text" => SummaryMode::Text,
                    "data" => SummaryMode::Data,
                    "count" => SummaryMode::Count,
                    "false" => SummaryMode::False,
                    _ => return Err(SearchError::invalid_value("_summary", value, "unknown mode")),
                });
            }
            "_total" => {
                context.total = match value.trim() {
                    "none" => TotalMode::None,
                    "estimate" => TotalMode::Estimate,
                    "accurate" => TotalMode::Accurate,
                    _ => return Err(SearchError::invalid_value("_total", value, "unknown mode")),
                };
            }
            _ => {
                let parsed = if let Some(rest) = name.strip_prefix("_has:") {
                    match resource_type {
                        Some(rt) => parser.parse_reverse_chain(rt, rest, value),
                        None => Err(SearchError::Invalid(
                            "_has is not supported for system search".to_string(),
                        )),
                    }
                } else {
                    parser.parse_parameter(resource_type, name, value)
                };
                match parsed {
                    Ok(param) => context.parameters.push(param),
                    Err(e) => lenient(options, &mut context, e)?,
                }
            }
        }
    }

    if !context.sort.is_empty() && (!context.includes.is_empty() || !context.revincludes.is_empty()) {
        return Err(SearchError::Invalid(
            "_sort cannot be combined with _include or _revinclude".to_string(),
        ));
    }

    if context.checked_offset().is_none() {
        return Err(SearchError::invalid_value(
            "_page",
            &context.page_number.to_string(),
            "page lies beyond the last addressable result",
        ));
    }

    Ok(context)
}

/// Compartment search (`/Patient/123/Observation`): a regular search of
/// `resource_type` plus one inclusion criteria parameter that OR-s every
/// reference parameter linking the resource type to the compartment.
pub fn parse_compartment_query(
    compartment: &str,
    compartment_id: &str,
    resource_type: &str,
    items: &[(String, String)],
    registry: &SearchParameterRegistry,
    options: &ParseOptions,
) -> Result<SearchContext> {
    if !registry.is_compartment(compartment) {
        return Err(SearchError::Invalid(format!(
            "'{compartment}' is not a supported compartment"
        )));
    }
    let codes = registry
        .compartment_params(compartment, resource_type)
        .filter(|codes| !codes.is_empty())
        .ok_or_else(|| {
            SearchError::Invalid(format!(
                "'{resource_type}' is not a member of the {compartment} compartment"
            ))
        })?;

    let mut context = parse_query(Some(resource_type), items, registry, options)?;

    let raw = format!("{compartment}/{compartment_id}");
    let mut inclusion = QueryParameter::new(codes[0].clone(), SearchParamType::Reference);
    inclusion.inclusion_codes = codes.to_vec();
    inclusion.values.push(QueryParameterValue {
        prefix: Prefix::Eq,
        value: QueryValue::Reference {
            resource_type: Some(compartment.to_string()),
            id: Some(compartment_id.to_string()),
            url: None,
            version: None,
        },
        raw,
    });
    context.parameters.insert(0, inclusion);
    Ok(context)
}

fn lenient(options: &ParseOptions, context: &mut SearchContext, error: SearchError) -> Result<()> {
    if options.lenient {
        tracing::warn!(error = %error, "Ignoring invalid search parameter (lenient)");
        context.warnings.push(error.to_string());
        Ok(())
    } else {
        Err(error)
    }
}

impl<'a> Parser<'a> {
    /// Resolve a parameter definition. System searches use the `_type`
    /// restriction: the parameter must exist, with the same type, on every
    /// listed resource type.
    fn lookup(&self, resource_type: Option<&str>, code: &str) -> Result<Arc<SearchParameterDef>> {
        let unknown = |rt: &str| SearchError::UnknownParameter {
            resource_type: rt.to_string(),
            code: code.to_string(),
        };
        match resource_type {
            Some(rt) => self.registry.get(rt, code).cloned().ok_or_else(|| unknown(rt)),
            None if self.system_types.is_empty() => self
                .registry
                .get("Resource", code)
                .cloned()
                .ok_or_else(|| unknown("Resource")),
            None => {
                let mut found: Option<Arc<SearchParameterDef>> = None;
                for t in &self.system_types {
                    let def = self.registry.get(t, code).ok_or_else(|| unknown(t))?;
                    match found.as_ref().map(|prev| prev.param_type) {
                        Some(prev) if prev != def.param_type => {
                            return Err(SearchError::Invalid(format!(
                                "search parameter '{code}' has different types across _type"
                            )))
                        }
                        Some(_) => {}
                        None => found = Some(def.clone()),
                    }
                }
                found.ok_or_else(|| unknown("Resource"))
            }
        }
    }

    fn parse_parameter(&self, resource_type: Option<&str>, name: &str, value: &str) -> Result<QueryParameter> {
        if let Some((head, rest)) = name.split_once('.') {
            return self.parse_chain(resource_type, head, rest, value);
        }

        let (code, modifier_str) = match name.split_once(':') {
            Some((c, m)) => (c, Some(m)),
            None => (name, None),
        };
        let def = self.lookup(resource_type, code)?;
        let mut param = QueryParameter::new(code, def.param_type);

        if let Some(m) = modifier_str {
            self.apply_modifier(&def, &mut param, m)?;
        }

        if param.modifier == Some(Modifier::Missing) {
            let missing = match value.trim() {
                "true" => true,
                "false" => false,
                _ => return Err(SearchError::invalid_value(code, value, ":missing expects true or false")),
            };
            param.values.push(QueryParameterValue {
                prefix: Prefix::Eq,
                value: QueryValue::Missing(missing),
                raw: value.to_string(),
            });
            return Ok(param);
        }

        for raw in split_unescaped(value, ',') {
            if raw.trim().is_empty() {
                continue;
            }
            param.values.push(self.parse_value(
                &def,
                param.modifier,
                param.modifier_resource_type.as_deref(),
                raw.trim(),
            )?);
        }
        if param.values.is_empty() {
            return Err(SearchError::invalid_value(code, value, "no value"));
        }
        Ok(param)
    }

    fn apply_modifier(&self, def: &SearchParameterDef, param: &mut QueryParameter, raw: &str) -> Result<()> {
        if is_valid_resource_type(raw) {
            if def.param_type != SearchParamType::Reference {
                return Err(SearchError::ModifierNotAllowed {
                    code: def.code.clone(),
                    modifier: raw.to_string(),
                    param_type: def.param_type.to_string(),
                });
            }
            if !def.targets.is_empty() && !def.targets.iter().any(|t| t == raw) {
                return Err(SearchError::invalid_value(
                    &def.code,
                    raw,
                    "resource type is not a target of this parameter",
                ));
            }
            param.modifier = Some(Modifier::Type);
            param.modifier_resource_type = Some(raw.to_string());
            return Ok(());
        }

        let modifier = Modifier::parse(raw)?;
        if modifier == Modifier::Type || !def.param_type.allowed_modifiers().contains(&modifier) {
            return Err(SearchError::ModifierNotAllowed {
                code: def.code.clone(),
                modifier: raw.to_string(),
                param_type: def.param_type.to_string(),
            });
        }
        param.modifier = Some(modifier);
        Ok(())
    }

    fn parse_value(
        &self,
        def: &SearchParameterDef,
        modifier: Option<Modifier>,
        modifier_type: Option<&str>,
        raw: &str,
    ) -> Result<QueryParameterValue> {
        let code = def.code.as_str();
        let (prefix, rest) = if def.param_type.supports_prefix() {
            Prefix::split(raw)
        } else {
            (Prefix::Eq, raw)
        };

        let value = match def.param_type {
            SearchParamType::String => QueryValue::String(unescape_search_value(rest)?),
            SearchParamType::Uri => QueryValue::Uri(unescape_search_value(rest)?),
            SearchParamType::Date => QueryValue::Date(DateRange::parse(&unescape_search_value(rest)?)?),
            SearchParamType::Number => {
                let (value, low, high) = parse_number(code, &unescape_search_value(rest)?)?;
                QueryValue::Number { value, low, high }
            }
            SearchParamType::Token => parse_token(code, rest, modifier == Some(Modifier::OfType))?,
            SearchParamType::Quantity => parse_quantity(code, rest)?,
            SearchParamType::Reference if modifier == Some(Modifier::Identifier) => parse_token(code, rest, false)?,
            SearchParamType::Reference => parse_reference_value(def, modifier_type, &unescape_search_value(rest)?)?,
            SearchParamType::Composite => self.parse_composite(def, rest)?,
            SearchParamType::Special => parse_near(def, rest)?,
        };

        Ok(QueryParameterValue {
            prefix,
            value,
            raw: raw.to_string(),
        })
    }

    fn parse_composite(&self, def: &SearchParameterDef, raw: &str) -> Result<QueryValue> {
        let parts = split_unescaped(raw, '$');
        if parts.len() != def.components.len() {
            return Err(SearchError::invalid_value(
                &def.code,
                raw,
                format!("expected {} components, found {}", def.components.len(), parts.len()),
            ));
        }
        let mut components = Vec::with_capacity(parts.len());
        for (component, part) in def.components.iter().zip(parts) {
            let component_def = self.registry.get_by_url(&component.definition).ok_or_else(|| {
                SearchError::InvalidDefinition(format!(
                    "component '{}' of '{}' is not registered",
                    component.definition, def.code
                ))
            })?;
            if component_def.param_type == SearchParamType::Composite {
                return Err(SearchError::InvalidDefinition(format!(
                    "composite '{}' nests another composite",
                    def.code
                )));
            }
            components.push(self.parse_value(component_def, None, None, part)?);
        }
        Ok(QueryValue::Composite(components))
    }

    /// `head` is `code` or `code:Type`; `rest` the remainder of the chain.
    fn parse_chain(&self, resource_type: Option<&str>, head: &str, rest: &str, value: &str) -> Result<QueryParameter> {
        let (code, type_modifier) = match head.split_once(':') {
            Some((c, t)) => (c, Some(t)),
            None => (head, None),
        };
        let def = self.lookup(resource_type, code)?;
        if def.param_type != SearchParamType::Reference {
            return Err(SearchError::Invalid(format!(
                "chained parameter '{code}' must be a reference parameter"
            )));
        }

        let next_code = rest
            .split(['.', ':'])
            .next()
            .unwrap_or(rest);

        let target_type = match type_modifier {
            Some(t) => {
                if !is_valid_resource_type(t) || (!def.targets.is_empty() && !def.targets.iter().any(|x| x == t)) {
                    return Err(SearchError::invalid_value(code, t, "invalid chain target type"));
                }
                t.to_string()
            }
            None => {
                let candidates: Vec<&String> = def
                    .targets
                    .iter()
                    .filter(|t| self.registry.get(t, next_code).is_some())
                    .collect();
                match candidates.as_slice() {
                    [only] => (*only).clone(),
                    [] => {
                        return Err(SearchError::UnknownParameter {
                            resource_type: def.targets.join("|"),
                            code: next_code.to_string(),
                        })
                    }
                    _ => {
                        return Err(SearchError::Invalid(format!(
                            "chained parameter '{code}' has several target types; specify one with '{code}:Type.{rest}'"
                        )))
                    }
                }
            }
        };

        let next = self.parse_parameter(Some(&target_type), rest, value)?;
        let mut param = QueryParameter::new(code, SearchParamType::Reference);
        param.modifier = Some(Modifier::Type);
        param.modifier_resource_type = Some(target_type.clone());
        param.chain = Some(Chain::Forward {
            target_type,
            next: Box::new(next),
        });
        Ok(param)
    }

    /// `rest` is `Source:reference:param` or `Source:reference:_has:...`.
    fn parse_reverse_chain(&self, resource_type: &str, rest: &str, value: &str) -> Result<QueryParameter> {
        let mut parts = rest.splitn(3, ':');
        let (Some(source_type), Some(reference_code), Some(tail)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(SearchError::Invalid(format!("malformed _has parameter '_has:{rest}'")));
        };
        if !is_valid_resource_type(source_type) {
            return Err(SearchError::InvalidResourceType(source_type.to_string()));
        }
        let reference_def = self.lookup(Some(source_type), reference_code)?;
        if reference_def.param_type != SearchParamType::Reference {
            return Err(SearchError::Invalid(format!(
                "_has parameter '{reference_code}' must be a reference parameter"
            )));
        }
        if !reference_def.targets.is_empty() && !reference_def.targets.iter().any(|t| t == resource_type) {
            return Err(SearchError::Invalid(format!(
                "'{source_type}.{reference_code}' cannot refer to {resource_type}"
            )));
        }

        let next = match tail.strip_prefix("_has:") {
            Some(inner) => self.parse_reverse_chain(source_type, inner, value)?,
            None => self.parse_parameter(Some(source_type), tail, value)?,
        };

        let mut param = QueryParameter::new("_has", SearchParamType::Reference);
        param.chain = Some(Chain::Reverse {
            source_type: source_type.to_string(),
            reference_code: reference_code.to_string(),
            next: Box::new(next),
        });
        Ok(param)
    }

    fn parse_sort(&self, resource_type: Option<&str>, raw: &str) -> Result<SortParameter> {
        let (direction, code) = match raw.strip_prefix('-') {
            Some(code) => (SortDirection::Descending, code),
            None => (SortDirection::Ascending, raw),
        };
        let param_type = match code {
            "_id" => SearchParamType::Token,
            "_lastUpdated" => SearchParamType::Date,
            _ => {
                let def = self.lookup(resource_type, code)?;
                match def.param_type {
                    SearchParamType::Composite | SearchParamType::Special | SearchParamType::Reference => {
                        return Err(SearchError::Invalid(format!(
                            "sorting by {} parameter '{code}' is not supported",
                            def.param_type
                        )))
                    }
                    t => t,
                }
            }
        };
        Ok(SortParameter {
            code: code.to_string(),
            param_type,
            direction,
        })
    }

    fn parse_inclusion(&self, resource_type: &str, raw: &str, reverse: bool, iterate: bool) -> Result<InclusionParameter> {
        if raw == "*" {
            return Err(SearchError::Invalid("wildcard _include is not supported".to_string()));
        }
        let parts: Vec<&str> = raw.split(':').collect();
        let (source_type, code, target_type) = match parts.as_slice() {
            [s, c] => (*s, *c, None),
            [s, c, t] => (*s, *c, Some(*t)),
            _ => return Err(SearchError::Invalid(format!("malformed inclusion '{raw}'"))),
        };
        if !is_valid_resource_type(source_type) {
            return Err(SearchError::InvalidResourceType(source_type.to_string()));
        }
        if !reverse && !iterate && source_type != resource_type {
            return Err(SearchError::Invalid(format!(
                "_include source type '{source_type}' must match the searched type '{resource_type}'"
            )));
        }
        let def = self.lookup(Some(source_type), code)?;
        if def.param_type != SearchParamType::Reference {
            return Err(SearchError::Invalid(format!(
                "inclusion parameter '{code}' must be a reference parameter"
            )));
        }
        if let Some(t) = target_type {
            if !def.targets.is_empty() && !def.targets.iter().any(|x| x == t) {
                return Err(SearchError::invalid_value(code, t, "not a target of this parameter"));
            }
            if reverse && !iterate && t != resource_type {
                return Err(SearchError::Invalid(format!(
                    "_revinclude target '{t}' must match the searched type '{resource_type}'"
                )));
            }
        } else if reverse && !def.targets.is_empty() && !def.targets.iter().any(|x| x == resource_type) {
            return Err(SearchError::Invalid(format!(
                "'{source_type}.{code}' cannot refer to {resource_type}"
            )));
        }
        Ok(InclusionParameter {
            source_type: source_type.to_string(),
            code: code.to_string(),
            target_type: target_type.map(str::to_string),
            iterate,
        })
    }
}

/// Parse a decimal together with its implicit precision range
/// (`100` → `[99.5, 100.5)`, `1.50` → `[1.495, 1.505)`).
pub fn parse_number(code: &str, raw: &str) -> Result<(Decimal, Decimal, Decimal)> {
    let trimmed = raw.trim();
    let value = if trimmed.contains(['e', 'E']) {
        Decimal::from_scientific(trimmed)
    } else {
        Decimal::from_str(trimmed)
    }
    .map_err(|_| SearchError::invalid_value(code, raw, "not a decimal number"))?;
    let half = Decimal::new(5, value.scale() + 1);
    Ok((value, value - half, value + half))
}

fn parse_token(code: &str, raw: &str, of_type: bool) -> Result<QueryValue> {
    if of_type {
        let parts = split_unescaped(raw, '|');
        let [type_system, type_code, value] = parts.as_slice() else {
            return Err(SearchError::invalid_value(code, raw, ":of-type expects system|code|value"));
        };
        if type_system.is_empty() || type_code.is_empty() || value.is_empty() {
            return Err(SearchError::invalid_value(code, raw, ":of-type parts must not be empty"));
        }
        return Ok(QueryValue::Token {
            system: TokenSystem::Any,
            code: Some(unescape_search_value(value)?),
            of_type: Some((unescape_search_value(type_system)?, unescape_search_value(type_code)?)),
        });
    }

    let (system, value) = match split_once_unescaped(raw, '|') {
        None => (TokenSystem::Any, Some(unescape_search_value(raw)?)),
        Some(("", "")) => return Err(SearchError::invalid_value(code, raw, "empty token")),
        Some(("", c)) => (TokenSystem::NoSystem, Some(unescape_search_value(c)?)),
        Some((s, "")) => (TokenSystem::Is(unescape_search_value(s)?), None),
        Some((s, c)) => (TokenSystem::Is(unescape_search_value(s)?), Some(unescape_search_value(c)?)),
    };
    Ok(QueryValue::Token {
        system,
        code: value,
        of_type: None,
    })
}

fn parse_quantity(code: &str, raw: &str) -> Result<QueryValue> {
    let parts = split_unescaped(raw, '|');
    let (number, system, unit) = match parts.as_slice() {
        [n] => (*n, None, None),
        [n, s, c] => (
            *n,
            Some(unescape_search_value(s)?).filter(|s| !s.is_empty()),
            Some(unescape_search_value(c)?).filter(|c| !c.is_empty()),
        ),
        _ => return Err(SearchError::invalid_value(code, raw, "expected number|system|code")),
    };
    let (value, low, high) = parse_number(code, number)?;
    Ok(QueryValue::Quantity {
        value,
        low,
        high,
        system,
        code: unit,
    })
}

fn parse_reference_value(def: &SearchParameterDef, modifier_type: Option<&str>, raw: &str) -> Result<QueryValue> {
    let code = def.code.as_str();
    let value = match parse_reference(raw) {
        ParsedReference::Local {
            resource_type,
            id,
            version,
        } => {
            if modifier_type.is_some_and(|t| t != resource_type) {
                return Err(SearchError::invalid_value(code, raw, "reference type conflicts with the type modifier"));
            }
            if !def.targets.is_empty() && !def.targets.iter().any(|t| *t == resource_type) {
                return Err(SearchError::invalid_value(code, raw, "resource type is not a target of this parameter"));
            }
            QueryValue::Reference {
                resource_type: Some(resource_type),
                id: Some(id),
                url: None,
                version,
            }
        }
        ParsedReference::IdOnly(id) => {
            // A single possible target makes an id-only value unambiguous.
            let resource_type = modifier_type
                .map(str::to_string)
                .or_else(|| (def.targets.len() == 1).then(|| def.targets[0].clone()));
            QueryValue::Reference {
                resource_type,
                id: Some(id),
                url: None,
                version: None,
            }
        }
        ParsedReference::Absolute {
            url,
            resource_type,
            id,
            version,
        } => QueryValue::Reference {
            resource_type,
            id,
            url: Some(url),
            version,
        },
        ParsedReference::Canonical { url, version } => QueryValue::Reference {
            resource_type: None,
            id: None,
            url: Some(url),
            version,
        },
        ParsedReference::Contained(_) => {
            return Err(SearchError::invalid_value(code, raw, "contained references cannot be searched"))
        }
    };
    Ok(value)
}

/// `near=lat|lng[|distance[|units]]`; units default to kilometers.
fn parse_near(def: &SearchParameterDef, raw: &str) -> Result<QueryValue> {
    let code = def.code.as_str();
    if code != "near" {
        return Err(SearchError::Invalid(format!("special parameter '{code}' is not supported")));
    }
    let parts: Vec<&str> = raw.split('|').collect();
    let float = |s: &str| -> Result<f64> {
        s.trim()
            .parse::<f64>()
            .map_err(|_| SearchError::invalid_value(code, raw, "expected a number"))
    };
    let (latitude, longitude) = match parts.as_slice() {
        [lat, lng, ..] => (float(lat)?, float(lng)?),
        _ => return Err(SearchError::invalid_value(code, raw, "expected latitude|longitude")),
    };
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(SearchError::invalid_value(code, raw, "coordinates out of range"));
    }
    let distance = match parts.get(2) {
        Some(d) if !d.trim().is_empty() => float(d)?,
        _ => DEFAULT_NEAR_DISTANCE_KM,
    };
    let distance_km = match parts.get(3).map(|u| u.trim()) {
        None | Some("") | Some("km") => distance,
        Some("m") => distance / 1000.0,
        Some("mi") | Some("[mi_i]") => distance * 1.609_344,
        Some(other) => {
            return Err(SearchError::invalid_value(code, raw, format!("unsupported distance unit '{other}'")))
        }
    };
    Ok(QueryValue::Near {
        latitude,
        longitude,
        distance_km,
    })
}
