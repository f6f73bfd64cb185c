//! WHERE clauses over the value tables.
//!
//! Every clause is an `EXISTS` subquery correlated with an outer
//! `logical_resources` alias. Aliases are numbered so chains and
//! composites can nest without shadowing.

use super::bind::{escape_like_pattern, push_text, push_text_array, BindValue};
use crate::db::compare::{approximate_date_range, approximate_delta};
use crate::db::postgres::values::DEFAULT_TOKEN_SYSTEM;
use crate::db::stored_code;
use chrono::{DateTime, SecondsFormat, Utc};
use meridian_search::normalize::normalize_string;
use meridian_search::{
    Chain, DateRange, Modifier, Prefix, QueryParameter, QueryParameterValue, QueryValue,
    SearchParamType, SortDirection, SortParameter, TokenSystem,
};
use rust_decimal::Decimal;

const EARTH_RADIUS_KM: f64 = 6371.0088;

fn table_for(value: &QueryValue) -> Option<&'static str> {
    Some(match value {
        QueryValue::String(_) => "str_values",
        QueryValue::Uri(_) => "uri_values",
        QueryValue::Number { .. } => "number_values",
        QueryValue::Date(_) => "date_values",
        QueryValue::Token { .. } => "resource_token_refs",
        QueryValue::Quantity { .. } => "quantity_values",
        QueryValue::Reference { .. } => "ref_values",
        QueryValue::Near { .. } => "latlng_values",
        QueryValue::Missing(_) | QueryValue::Composite(_) => return None,
    })
}

fn table_for_type(param_type: SearchParamType) -> Option<&'static str> {
    Some(match param_type {
        SearchParamType::String => "str_values",
        SearchParamType::Uri => "uri_values",
        SearchParamType::Number => "number_values",
        SearchParamType::Date => "date_values",
        SearchParamType::Token => "resource_token_refs",
        SearchParamType::Quantity => "quantity_values",
        SearchParamType::Reference => "ref_values",
        SearchParamType::Special => "latlng_values",
        SearchParamType::Composite => return None,
    })
}

/// Lookup joins a predicate on `table` needs, aliased after `sp`.
fn joins(table: &str, sp: &str) -> String {
    match table {
        "resource_token_refs" => format!(
            " JOIN common_token_values {sp}_tv ON {sp}_tv.common_token_value_id = {sp}.common_token_value_id \
             JOIN code_systems {sp}_cs ON {sp}_cs.code_system_id = {sp}_tv.code_system_id"
        ),
        "ref_values" => format!(
            " LEFT JOIN logical_resource_ident {sp}_li ON {sp}_li.logical_resource_id = {sp}.ref_logical_resource_id \
             LEFT JOIN resource_types {sp}_rt ON {sp}_rt.resource_type_id = {sp}_li.resource_type_id \
             LEFT JOIN common_canonical_values {sp}_cv ON {sp}_cv.canonical_id = {sp}.ref_canonical_id"
        ),
        _ => String::new(),
    }
}

fn instant(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn or_join(mut parts: Vec<String>) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => Some(parts.remove(0)),
        _ => Some(format!("({})", parts.join(" OR "))),
    }
}

fn and_join(parts: Vec<String>) -> String {
    if parts.is_empty() {
        "TRUE".to_string()
    } else {
        parts.join(" AND ")
    }
}

/// Accumulates bind values and alias numbers while clauses are built.
#[derive(Debug, Default)]
pub(super) struct ClauseBuilder {
    pub bind_params: Vec<BindValue>,
    next_alias: usize,
}

impl ClauseBuilder {
    fn alias(&mut self, prefix: &str) -> String {
        self.next_alias += 1;
        format!("{prefix}{}", self.next_alias)
    }

    fn text(&mut self, value: impl Into<String>) -> String {
        format!("${}", push_text(&mut self.bind_params, value))
    }

    fn text_array(&mut self, values: Vec<String>) -> String {
        format!("${}::text[]", push_text_array(&mut self.bind_params, values))
    }

    fn param_id(&mut self, code: &str) -> String {
        let idx = self.text(code);
        format!("(SELECT parameter_name_id FROM parameter_names WHERE parameter_name = {idx})")
    }

    pub(super) fn type_ids(&mut self, types: Vec<String>) -> String {
        let arr = self.text_array(types);
        format!("(SELECT resource_type_id FROM resource_types WHERE resource_type = ANY({arr}))")
    }

    fn type_id(&mut self, resource_type: &str) -> String {
        let idx = self.text(resource_type);
        format!("(SELECT resource_type_id FROM resource_types WHERE resource_type = {idx})")
    }

    /// Clause for one AND-ed parameter, correlated with `lr`.
    pub(super) fn parameter(&mut self, lr: &str, param: &QueryParameter) -> String {
        if param.is_inclusion_criteria() {
            return self.inclusion_criteria(lr, param);
        }
        match &param.chain {
            Some(Chain::Forward { target_type, next }) => return self.forward_chain(lr, param, target_type, next),
            Some(Chain::Reverse {
                source_type,
                reference_code,
                next,
            }) => return self.reverse_chain(lr, source_type, reference_code, next),
            None => {}
        }

        if let Some(QueryValue::Missing(missing)) = param.values.first().map(|v| &v.value) {
            return self.missing(lr, param, *missing);
        }

        let any_value = match param.code.as_str() {
            "_id" => {
                let ids: Vec<String> = param
                    .values
                    .iter()
                    .filter_map(|q| match &q.value {
                        QueryValue::Token { code: Some(code), .. } => Some(code.clone()),
                        _ => None,
                    })
                    .collect();
                if ids.is_empty() {
                    None
                } else {
                    let arr = self.text_array(ids);
                    Some(format!("{lr}.logical_id = ANY({arr})"))
                }
            }
            "_lastUpdated" => {
                let parts = param
                    .values
                    .iter()
                    .filter_map(|q| match &q.value {
                        QueryValue::Date(range) => Some(self.instant_predicate(&format!("{lr}.last_updated"), q.prefix, range)),
                        _ => None,
                    })
                    .collect();
                or_join(parts)
            }
            _ => {
                let parts = param
                    .values
                    .iter()
                    .filter_map(|q| {
                        let code = stored_code(param, q);
                        self.value_exists(lr, &code, param.modifier, q)
                    })
                    .collect();
                or_join(parts)
            }
        };

        let any_value = any_value.unwrap_or_else(|| "FALSE".to_string());
        if param.modifier == Some(Modifier::Not) {
            format!("NOT {any_value}")
        } else {
            any_value
        }
    }

    fn inclusion_criteria(&mut self, lr: &str, param: &QueryParameter) -> String {
        let sp = self.alias("sp");
        let codes = self.text_array(param.inclusion_codes.clone());
        let preds: Vec<String> = param
            .values
            .iter()
            .filter_map(|q| self.predicate(&sp, None, q))
            .collect();
        let Some(pred) = or_join(preds) else {
            return "FALSE".to_string();
        };
        format!(
            "EXISTS (SELECT 1 FROM ref_values {sp}{joins} WHERE {sp}.logical_resource_id = {lr}.logical_resource_id \
             AND {sp}.parameter_name_id IN (SELECT parameter_name_id FROM parameter_names WHERE parameter_name = ANY({codes})) \
             AND {sp}.composite_id IS NULL AND {pred})",
            joins = joins("ref_values", &sp)
        )
    }

    fn forward_chain(&mut self, lr: &str, param: &QueryParameter, target_type: &str, next: &QueryParameter) -> String {
        let sp = self.alias("sp");
        let target = self.alias("lr");
        let pid = self.param_id(&param.code);
        let tid = self.type_id(target_type);
        let next = self.parameter(&target, next);
        format!(
            "EXISTS (SELECT 1 FROM ref_values {sp} \
             JOIN logical_resources {target} ON {target}.logical_resource_id = {sp}.ref_logical_resource_id \
             WHERE {sp}.logical_resource_id = {lr}.logical_resource_id AND {sp}.parameter_name_id = {pid} \
             AND {sp}.composite_id IS NULL AND {target}.resource_type_id = {tid} AND NOT {target}.is_deleted \
             AND {next})"
        )
    }

    fn reverse_chain(&mut self, lr: &str, source_type: &str, reference_code: &str, next: &QueryParameter) -> String {
        let sp = self.alias("sp");
        let source = self.alias("lr");
        let pid = self.param_id(reference_code);
        let tid = self.type_id(source_type);
        let next = self.parameter(&source, next);
        format!(
            "EXISTS (SELECT 1 FROM ref_values {sp} \
             JOIN logical_resources {source} ON {source}.logical_resource_id = {sp}.logical_resource_id \
             WHERE {sp}.ref_logical_resource_id = {lr}.logical_resource_id AND {sp}.parameter_name_id = {pid} \
             AND {sp}.composite_id IS NULL AND {source}.resource_type_id = {tid} AND NOT {source}.is_deleted \
             AND {next})"
        )
    }

    fn missing(&mut self, lr: &str, param: &QueryParameter, missing: bool) -> String {
        let has_value = match param.code.as_str() {
            "_id" | "_lastUpdated" => "TRUE".to_string(),
            code => match table_for_type(param.param_type) {
                Some(table) => {
                    let sp = self.alias("sp");
                    let pid = self.param_id(code);
                    format!(
                        "EXISTS (SELECT 1 FROM {table} {sp} WHERE {sp}.logical_resource_id = {lr}.logical_resource_id \
                         AND {sp}.parameter_name_id = {pid} AND {sp}.composite_id IS NULL)"
                    )
                }
                // Composite components may live in any value table.
                None => {
                    let pid = self.param_id(code);
                    let parts: Vec<String> = crate::db::postgres::values::VALUE_TABLES
                        .iter()
                        .map(|table| {
                            let sp = self.alias("sp");
                            format!(
                                "EXISTS (SELECT 1 FROM {table} {sp} WHERE {sp}.logical_resource_id = {lr}.logical_resource_id \
                                 AND {sp}.composite_parameter_name_id = {pid})"
                            )
                        })
                        .collect();
                    format!("({})", parts.join(" OR "))
                }
            },
        };
        if missing {
            format!("NOT {has_value}")
        } else {
            has_value
        }
    }

    /// `EXISTS` over the values stored under `code` for one query value.
    fn value_exists(
        &mut self,
        lr: &str,
        code: &str,
        modifier: Option<Modifier>,
        q: &QueryParameterValue,
    ) -> Option<String> {
        if let QueryValue::Composite(components) = &q.value {
            return self.composite_exists(lr, code, components);
        }
        let table = table_for(&q.value)?;
        let sp = self.alias("sp");
        let pred = self.predicate(&sp, modifier, q)?;
        let pid = self.param_id(code);
        Some(format!(
            "EXISTS (SELECT 1 FROM {table} {sp}{joins} WHERE {sp}.logical_resource_id = {lr}.logical_resource_id \
             AND {sp}.parameter_name_id = {pid} AND {sp}.composite_id IS NULL AND {pred})",
            joins = joins(table, &sp)
        ))
    }

    /// All components must match rows of the same composite instance.
    fn composite_exists(&mut self, lr: &str, code: &str, components: &[QueryParameterValue]) -> Option<String> {
        let pid = self.param_id(code);
        let mut first: Option<String> = None;
        let mut conditions = Vec::new();
        let mut head = String::new();
        for (idx, component) in components.iter().enumerate() {
            let table = table_for(&component.value)?;
            let sp = self.alias("cp");
            let pred = self.predicate(&sp, None, component)?;
            let joins = joins(table, &sp);
            match &first {
                None => {
                    head = format!(
                        "EXISTS (SELECT 1 FROM {table} {sp}{joins} WHERE {sp}.logical_resource_id = {lr}.logical_resource_id \
                         AND {sp}.composite_parameter_name_id = {pid} AND {sp}.component_idx = {idx} AND {pred}"
                    );
                    first = Some(sp);
                }
                Some(c0) => conditions.push(format!(
                    "EXISTS (SELECT 1 FROM {table} {sp}{joins} WHERE {sp}.logical_resource_id = {c0}.logical_resource_id \
                     AND {sp}.composite_id = {c0}.composite_id AND {sp}.component_idx = {idx} AND {pred})"
                )),
            }
        }
        first?;
        let mut clause = head;
        for condition in conditions {
            clause.push_str(" AND ");
            clause.push_str(&condition);
        }
        clause.push(')');
        Some(clause)
    }

    /// Predicate over one value row aliased `sp`.
    fn predicate(&mut self, sp: &str, modifier: Option<Modifier>, q: &QueryParameterValue) -> Option<String> {
        match &q.value {
            QueryValue::String(value) => Some(match modifier {
                Some(Modifier::Exact) => format!("{sp}.str_value = {}", self.text(value.clone())),
                Some(Modifier::Contains) => {
                    let pattern = format!("%{}%", escape_like_pattern(&normalize_string(value)));
                    format!("{sp}.str_value_norm LIKE {}", self.text(pattern))
                }
                _ => {
                    let pattern = format!("{}%", escape_like_pattern(&normalize_string(value)));
                    format!("{sp}.str_value_norm LIKE {}", self.text(pattern))
                }
            }),
            QueryValue::Uri(value) => {
                let idx = self.text(value.clone());
                Some(match modifier {
                    Some(Modifier::Below) => format!("left({sp}.uri_value, length({idx})) = {idx}"),
                    Some(Modifier::Above) => format!("left({idx}, length({sp}.uri_value)) = {sp}.uri_value"),
                    _ => format!("{sp}.uri_value = {idx}"),
                })
            }
            QueryValue::Token { system, code, of_type } => {
                let mut parts = Vec::new();
                match of_type {
                    Some((type_system, type_code)) => {
                        let idx = self.text(format!("{type_system}|{type_code}"));
                        parts.push(format!("{sp}_cs.code_system = {idx}"));
                    }
                    None => match system {
                        TokenSystem::Any => {}
                        TokenSystem::NoSystem => {
                            let idx = self.text(DEFAULT_TOKEN_SYSTEM);
                            parts.push(format!("{sp}_cs.code_system = {idx}"));
                        }
                        TokenSystem::Is(system) => {
                            let idx = self.text(system.clone());
                            parts.push(format!("{sp}_cs.code_system = {idx}"));
                        }
                    },
                }
                if let Some(code) = code {
                    let idx = self.text(code.clone());
                    parts.push(format!("{sp}_tv.token_value = {idx}"));
                }
                Some(and_join(parts))
            }
            QueryValue::Number { value, low, high } => {
                Some(self.number_predicate(&format!("{sp}.number_value"), q.prefix, *value, *low, *high))
            }
            QueryValue::Quantity {
                value,
                low,
                high,
                system,
                code,
            } => {
                let mut parts = vec![self.number_predicate(&format!("{sp}.quantity_value"), q.prefix, *value, *low, *high)];
                match (system, code) {
                    (Some(s), Some(c)) => {
                        let s = self.text(s.clone());
                        let c = self.text(c.clone());
                        parts.push(format!("{sp}.code_system = {s} AND {sp}.code = {c}"));
                    }
                    (None, Some(c)) => {
                        let c = self.text(c.clone());
                        parts.push(format!("({sp}.code = {c} OR {sp}.unit = {c})"));
                    }
                    (Some(s), None) => {
                        let s = self.text(s.clone());
                        parts.push(format!("{sp}.code_system = {s}"));
                    }
                    (None, None) => {}
                }
                Some(and_join(parts))
            }
            QueryValue::Date(range) => Some(self.date_predicate(sp, q.prefix, range)),
            QueryValue::Reference {
                resource_type,
                id,
                url,
                version,
            } => {
                let mut parts = Vec::new();
                match (id, url) {
                    (Some(id), _) => {
                        let idx = self.text(id.clone());
                        parts.push(format!("{sp}_li.logical_id = {idx}"));
                        if let Some(t) = resource_type {
                            let idx = self.text(t.clone());
                            parts.push(format!("{sp}_rt.resource_type = {idx}"));
                        }
                    }
                    (None, Some(url)) => {
                        let idx = self.text(url.clone());
                        parts.push(format!("{sp}_cv.url = {idx}"));
                    }
                    (None, None) => return None,
                }
                if let Some(v) = version {
                    let idx = self.text(v.clone());
                    parts.push(format!("{sp}.ref_version = {idx}"));
                }
                Some(and_join(parts))
            }
            QueryValue::Near {
                latitude,
                longitude,
                distance_km,
            } => {
                let lat = self.text(latitude.to_string());
                let lng = self.text(longitude.to_string());
                let dist = self.text(distance_km.to_string());
                Some(format!(
                    "(2 * {EARTH_RADIUS_KM} * asin(sqrt(\
                     power(sin(radians({sp}.latitude - {lat}::double precision) / 2), 2) + \
                     cos(radians({lat}::double precision)) * cos(radians({sp}.latitude)) * \
                     power(sin(radians({sp}.longitude - {lng}::double precision) / 2), 2)))) <= {dist}::double precision"
                ))
            }
            QueryValue::Missing(_) | QueryValue::Composite(_) => None,
        }
    }

    fn number_predicate(&mut self, column: &str, prefix: Prefix, value: Decimal, low: Decimal, high: Decimal) -> String {
        let mut num = |this: &mut Self, d: Decimal| format!("{}::numeric", this.text(d.to_string()));
        match prefix {
            Prefix::Eq => {
                let (l, h) = (num(self, low), num(self, high));
                format!("({column} >= {l} AND {column} < {h})")
            }
            Prefix::Ne => {
                let (l, h) = (num(self, low), num(self, high));
                format!("({column} < {l} OR {column} >= {h})")
            }
            Prefix::Gt | Prefix::Sa => format!("{column} >= {}", num(self, high)),
            Prefix::Ge => format!("{column} >= {}", num(self, low)),
            Prefix::Lt | Prefix::Eb => format!("{column} < {}", num(self, low)),
            Prefix::Le => format!("{column} < {}", num(self, high)),
            Prefix::Ap => {
                let delta = approximate_delta(value, low, high);
                let (l, h) = (num(self, value - delta), num(self, value + delta));
                format!("({column} >= {l} AND {column} <= {h})")
            }
        }
    }

    fn date_predicate(&mut self, sp: &str, prefix: Prefix, range: &DateRange) -> String {
        let ts = |this: &mut Self, at: DateTime<Utc>| format!("{}::timestamptz", this.text(instant(&at)));
        let (start, end) = (format!("{sp}.date_start"), format!("{sp}.date_end"));
        match prefix {
            Prefix::Eq => {
                let (s, e) = (ts(self, range.lower), ts(self, range.upper));
                format!("({start} >= {s} AND {end} <= {e})")
            }
            Prefix::Ne => {
                let (s, e) = (ts(self, range.lower), ts(self, range.upper));
                format!("({end} <= {s} OR {start} >= {e})")
            }
            Prefix::Gt => format!("{end} > {}", ts(self, range.upper)),
            Prefix::Ge => format!("{end} > {}", ts(self, range.lower)),
            Prefix::Lt => format!("{start} < {}", ts(self, range.lower)),
            Prefix::Le => format!("{start} < {}", ts(self, range.upper)),
            Prefix::Sa => format!("{start} >= {}", ts(self, range.upper)),
            Prefix::Eb => format!("{end} <= {}", ts(self, range.lower)),
            Prefix::Ap => {
                let (a_start, a_end) = approximate_date_range(range.lower, range.upper);
                let (s, e) = (ts(self, a_start), ts(self, a_end));
                format!("({start} < {e} AND {end} > {s})")
            }
        }
    }

    fn instant_predicate(&mut self, column: &str, prefix: Prefix, range: &DateRange) -> String {
        let ts = |this: &mut Self, at: DateTime<Utc>| format!("{}::timestamptz", this.text(instant(&at)));
        match prefix {
            Prefix::Eq | Prefix::Ne => {
                let (s, e) = (ts(self, range.lower), ts(self, range.upper));
                let eq = format!("({column} >= {s} AND {column} < {e})");
                if prefix == Prefix::Ne {
                    format!("NOT {eq}")
                } else {
                    eq
                }
            }
            Prefix::Gt | Prefix::Sa => format!("{column} >= {}", ts(self, range.upper)),
            Prefix::Ge => format!("{column} >= {}", ts(self, range.lower)),
            Prefix::Lt | Prefix::Eb => format!("{column} < {}", ts(self, range.lower)),
            Prefix::Le => format!("{column} < {}", ts(self, range.upper)),
            Prefix::Ap => {
                let (a_start, a_end) = approximate_date_range(range.lower, range.upper);
                let (s, e) = (ts(self, a_start), ts(self, a_end));
                format!("({column} >= {s} AND {column} < {e})")
            }
        }
    }

    /// `ORDER BY` term for one sort parameter. Resources without a value
    /// sort last in both directions.
    pub(super) fn sort_expression(&mut self, lr: &str, sort: &SortParameter) -> Option<String> {
        let (agg, direction) = match sort.direction {
            SortDirection::Ascending => ("MIN", "ASC"),
            SortDirection::Descending => ("MAX", "DESC"),
        };
        let expr = match sort.code.as_str() {
            "_id" => format!("{lr}.logical_id"),
            "_lastUpdated" => format!("{lr}.last_updated"),
            code => {
                let table = table_for_type(sort.param_type)?;
                let sp = self.alias("sp");
                let column = match (sort.param_type, sort.direction) {
                    (SearchParamType::String, _) => format!("{sp}.str_value_norm"),
                    (SearchParamType::Token, _) => format!("{sp}_tv.token_value"),
                    (SearchParamType::Uri, _) => format!("{sp}.uri_value"),
                    (SearchParamType::Number, _) => format!("{sp}.number_value"),
                    (SearchParamType::Quantity, _) => format!("{sp}.quantity_value"),
                    (SearchParamType::Date, SortDirection::Ascending) => format!("{sp}.date_start"),
                    (SearchParamType::Date, SortDirection::Descending) => format!("{sp}.date_end"),
                    _ => return None,
                };
                let pid = self.param_id(code);
                format!(
                    "(SELECT {agg}({column}) FROM {table} {sp}{joins} WHERE {sp}.logical_resource_id = {lr}.logical_resource_id \
                     AND {sp}.parameter_name_id = {pid} AND {sp}.composite_id IS NULL)",
                    joins = joins(table, &sp)
                )
            }
        };
        Some(format!("{expr} {direction} NULLS LAST"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_search::parse_number;

    fn value(prefix: Prefix, value: QueryValue) -> QueryParameterValue {
        QueryParameterValue {
            prefix,
            value,
            raw: String::new(),
        }
    }

    fn token_param(code: &str, system: TokenSystem, token: &str) -> QueryParameter {
        let mut param = QueryParameter::new(code, SearchParamType::Token);
        param.values.push(value(
            Prefix::Eq,
            QueryValue::Token {
                system,
                code: Some(token.into()),
                of_type: None,
            },
        ));
        param
    }

    #[test]
    fn token_clause_joins_code_system() {
        let mut builder = ClauseBuilder::default();
        let sql = builder.parameter("lr", &token_param("code", TokenSystem::Is("http://loinc.org".into()), "1234-5"));
        assert!(sql.starts_with("EXISTS (SELECT 1 FROM resource_token_refs sp1"));
        assert!(sql.contains("sp1_cs.code_system = $1"));
        assert!(sql.contains("sp1_tv.token_value = $2"));
        assert!(sql.contains("parameter_name = $3"));
        assert_eq!(
            builder.bind_params,
            vec![
                BindValue::Text("http://loinc.org".into()),
                BindValue::Text("1234-5".into()),
                BindValue::Text("code".into()),
            ]
        );
    }

    #[test]
    fn not_modifier_negates_any_match() {
        let mut builder = ClauseBuilder::default();
        let mut param = token_param("gender", TokenSystem::Any, "male");
        param.modifier = Some(Modifier::Not);
        let sql = builder.parameter("lr", &param);
        assert!(sql.starts_with("NOT EXISTS"));
    }

    #[test]
    fn or_values_are_parenthesized() {
        let mut builder = ClauseBuilder::default();
        let mut param = token_param("gender", TokenSystem::Any, "male");
        param.values.extend(token_param("gender", TokenSystem::Any, "female").values);
        let sql = builder.parameter("lr", &param);
        assert!(sql.starts_with("(EXISTS"));
        assert!(sql.contains(" OR EXISTS"));
    }

    #[test]
    fn number_prefixes_use_precision_bounds() {
        let (v, low, high) = parse_number("probability", "0.5").unwrap();
        let mut builder = ClauseBuilder::default();
        let sql = builder.number_predicate("sp.number_value", Prefix::Eq, v, low, high);
        assert_eq!(sql, "(sp.number_value >= $1::numeric AND sp.number_value < $2::numeric)");
        assert_eq!(builder.bind_params[0], BindValue::Text("0.45".into()));
        assert_eq!(builder.bind_params[1], BindValue::Text("0.55".into()));

        let sql = builder.number_predicate("sp.number_value", Prefix::Gt, v, low, high);
        assert_eq!(sql, "sp.number_value >= $3::numeric");
    }

    #[test]
    fn date_eq_requires_containment() {
        let mut builder = ClauseBuilder::default();
        let range = DateRange::parse("2020-03").unwrap();
        let sql = builder.date_predicate("sp", Prefix::Eq, &range);
        assert_eq!(
            sql,
            "(sp.date_start >= $1::timestamptz AND sp.date_end <= $2::timestamptz)"
        );
        assert_eq!(builder.bind_params[0], BindValue::Text("2020-03-01T00:00:00.000000Z".into()));
        assert_eq!(builder.bind_params[1], BindValue::Text("2020-04-01T00:00:00.000000Z".into()));
    }

    #[test]
    fn forward_chain_correlates_target_alias() {
        let mut next = QueryParameter::new("name", SearchParamType::String);
        next.values.push(value(Prefix::Eq, QueryValue::String("Smith".into())));
        let mut param = QueryParameter::new("subject", SearchParamType::Reference);
        param.chain = Some(Chain::Forward {
            target_type: "Patient".into(),
            next: Box::new(next),
        });
        let mut builder = ClauseBuilder::default();
        let sql = builder.parameter("lr", &param);
        assert!(sql.contains("JOIN logical_resources lr2 ON lr2.logical_resource_id = sp1.ref_logical_resource_id"));
        assert!(sql.contains("sp3.logical_resource_id = lr2.logical_resource_id"));
        assert!(sql.contains("sp3.str_value_norm LIKE"));
        assert!(builder.bind_params.contains(&BindValue::Text("smith%".into())));
    }

    #[test]
    fn composite_components_share_composite_id() {
        let (v, low, high) = parse_number("value-quantity", "5.4").unwrap();
        let components = vec![
            value(
                Prefix::Eq,
                QueryValue::Token {
                    system: TokenSystem::Any,
                    code: Some("8480-6".into()),
                    of_type: None,
                },
            ),
            value(
                Prefix::Gt,
                QueryValue::Quantity {
                    value: v,
                    low,
                    high,
                    system: None,
                    code: None,
                },
            ),
        ];
        let mut param = QueryParameter::new("code-value-quantity", SearchParamType::Composite);
        param.values.push(value(Prefix::Eq, QueryValue::Composite(components)));
        let mut builder = ClauseBuilder::default();
        let sql = builder.parameter("lr", &param);
        assert!(sql.contains("cp1.composite_parameter_name_id"));
        assert!(sql.contains("cp1.component_idx = 0"));
        assert!(sql.contains("cp2.composite_id = cp1.composite_id AND cp2.component_idx = 1"));
        assert!(sql.ends_with("))"));
    }

    #[test]
    fn missing_on_id_is_constant() {
        let mut param = QueryParameter::new("_id", SearchParamType::Token);
        param.values.push(value(Prefix::Eq, QueryValue::Missing(true)));
        let mut builder = ClauseBuilder::default();
        assert_eq!(builder.parameter("lr", &param), "NOT TRUE");
    }

    #[test]
    fn sort_uses_min_ascending_and_max_descending() {
        let mut builder = ClauseBuilder::default();
        let sort = SortParameter {
            code: "birthdate".into(),
            param_type: SearchParamType::Date,
            direction: SortDirection::Descending,
        };
        let sql = builder.sort_expression("lr", &sort).unwrap();
        assert!(sql.starts_with("(SELECT MAX(sp1.date_end) FROM date_values sp1"));
        assert!(sql.ends_with("DESC NULLS LAST"));

        let id_sort = SortParameter {
            code: "_id".into(),
            param_type: SearchParamType::Token,
            direction: SortDirection::Ascending,
        };
        assert_eq!(builder.sort_expression("lr", &id_sort).unwrap(), "lr.logical_id ASC NULLS LAST");
    }
}
