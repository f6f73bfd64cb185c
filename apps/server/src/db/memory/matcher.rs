//! Search evaluation over the in-memory value lists.

use super::{LogicalRow, MemoryState};
use crate::db::compare::{date_matches, haversine_km, instant_matches, number_matches};
use crate::db::stored_code;
use crate::models::ExtractedValue;
use chrono::{DateTime, Duration, Utc};
use meridian_search::normalize::normalize_string;
use meridian_search::{
    Chain, Modifier, QueryParameter, QueryParameterValue, QueryValue, SearchContext,
    SortDirection, SortParameter, TokenSystem,
};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Text(String),
    Number(Decimal),
    Time(DateTime<Utc>),
}

pub(super) struct Matcher<'a> {
    state: &'a MemoryState,
}

impl<'a> Matcher<'a> {
    pub(super) fn new(state: &'a MemoryState) -> Self {
        Self { state }
    }

    fn values(&self, row: &LogicalRow, code: &str) -> impl Iterator<Item = &'a ExtractedValue> + 'a {
        let code = code.to_string();
        self.state
            .values_of(row.logical_resource_id)
            .iter()
            .filter(move |v| v.code == code)
            .map(|v| &v.value)
    }

    fn live_rows_of(&self, resource_type: &str) -> impl Iterator<Item = &'a LogicalRow> + 'a {
        let resource_type = resource_type.to_string();
        self.state
            .logical
            .values()
            .filter(move |row| !row.deleted && row.resource_type == resource_type)
    }

    fn target(&self, value: &ExtractedValue) -> Option<&'a LogicalRow> {
        match value {
            ExtractedValue::Reference {
                resource_type: Some(t),
                id: Some(id),
                ..
            } => self.state.row(t, id).filter(|row| !row.deleted),
            _ => None,
        }
    }

    pub(super) fn matches_all(&self, row: &LogicalRow, parameters: &[QueryParameter]) -> bool {
        parameters.iter().all(|p| self.matches(row, p))
    }

    fn matches(&self, row: &LogicalRow, param: &QueryParameter) -> bool {
        if param.is_inclusion_criteria() {
            return param.inclusion_codes.iter().any(|code| {
                self.values(row, code)
                    .any(|v| param.values.iter().any(|q| value_matches(None, q, v)))
            });
        }

        match &param.chain {
            Some(Chain::Forward { target_type, next }) => {
                return self
                    .values(row, &param.code)
                    .filter_map(|v| self.target(v))
                    .any(|target| target.resource_type == *target_type && self.matches(target, next));
            }
            Some(Chain::Reverse {
                source_type,
                reference_code,
                next,
            }) => {
                return self.live_rows_of(source_type).any(|source| {
                    self.values(source, reference_code).any(|v| points_to(v, row)) && self.matches(source, next)
                });
            }
            None => {}
        }

        if let Some(QueryValue::Missing(missing)) = param.values.first().map(|v| &v.value) {
            let has_value = match param.code.as_str() {
                "_id" | "_lastUpdated" => true,
                code => self.values(row, code).next().is_some(),
            };
            return has_value != *missing;
        }

        let any_value = match param.code.as_str() {
            "_id" => param.values.iter().any(|q| match &q.value {
                QueryValue::Token { code: Some(code), .. } => *code == row.logical_id,
                _ => false,
            }),
            "_lastUpdated" => param.values.iter().any(|q| match &q.value {
                QueryValue::Date(range) => instant_matches(q.prefix, row.last_updated, range),
                _ => false,
            }),
            _ => param.values.iter().any(|q| {
                let code = stored_code(param, q);
                self.values(row, &code).any(|v| value_matches(param.modifier, q, v))
            }),
        };

        if param.modifier == Some(Modifier::Not) {
            !any_value
        } else {
            any_value
        }
    }

    pub(super) fn sort(&self, rows: &mut [&LogicalRow], sort: &[SortParameter]) {
        rows.sort_by_key(|row| row.logical_resource_id);
        if sort.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for s in sort {
                let ordering = compare_keys(self.sort_key(a, s), self.sort_key(b, s), s.direction);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    /// Smallest value for ascending sorts, largest for descending.
    fn sort_key(&self, row: &LogicalRow, sort: &SortParameter) -> Option<SortKey> {
        match sort.code.as_str() {
            "_id" => return Some(SortKey::Text(row.logical_id.clone())),
            "_lastUpdated" => return Some(SortKey::Time(row.last_updated)),
            _ => {}
        }
        let keys = self.values(row, &sort.code).filter_map(|v| match v {
            ExtractedValue::String { value } => Some(SortKey::Text(normalize_string(value))),
            ExtractedValue::Token { code, .. } => Some(SortKey::Text(code.clone())),
            ExtractedValue::Uri { value } => Some(SortKey::Text(value.clone())),
            ExtractedValue::Number { value, .. } | ExtractedValue::Quantity { value, .. } => {
                Some(SortKey::Number(*value))
            }
            ExtractedValue::Date { start, end } => Some(SortKey::Time(match sort.direction {
                SortDirection::Ascending => *start,
                SortDirection::Descending => *end - Duration::microseconds(1),
            })),
            _ => None,
        });
        match sort.direction {
            SortDirection::Ascending => keys.min(),
            SortDirection::Descending => keys.max(),
        }
    }

    /// `_include` and `_revinclude` targets of `matches`. Iterated
    /// parameters are applied again to each round's new resources.
    pub(super) fn includes(
        &self,
        context: &SearchContext,
        matches: &[&'a LogicalRow],
        max_depth: usize,
    ) -> Vec<&'a LogicalRow> {
        let mut seen: HashSet<i64> = matches.iter().map(|r| r.logical_resource_id).collect();
        let mut frontier: Vec<&'a LogicalRow> = matches.to_vec();
        let mut included = Vec::new();

        for depth in 0..max_depth.max(1) {
            let mut next: Vec<&'a LogicalRow> = Vec::new();
            for inc in context.includes.iter().filter(|i| depth == 0 || i.iterate) {
                for row in frontier.iter().filter(|r| r.resource_type == inc.source_type) {
                    for target in self.values(row, &inc.code).filter_map(|v| self.target(v)) {
                        if inc.target_type.as_deref().is_some_and(|t| t != target.resource_type) {
                            continue;
                        }
                        if seen.insert(target.logical_resource_id) {
                            next.push(target);
                        }
                    }
                }
            }
            for rev in context.revincludes.iter().filter(|i| depth == 0 || i.iterate) {
                for row in &frontier {
                    if rev.target_type.as_deref().is_some_and(|t| t != row.resource_type) {
                        continue;
                    }
                    for source in self.live_rows_of(&rev.source_type) {
                        if self.values(source, &rev.code).any(|v| points_to(v, row))
                            && seen.insert(source.logical_resource_id)
                        {
                            next.push(source);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            included.extend(next.iter().copied());
            frontier = next;
        }
        included
    }
}

fn compare_keys(a: Option<SortKey>, b: Option<SortKey>, direction: SortDirection) -> Ordering {
    match (a, b) {
        // Resources without a value sort last either way.
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match direction {
            SortDirection::Ascending => a.cmp(&b),
            SortDirection::Descending => b.cmp(&a),
        },
    }
}

fn points_to(value: &ExtractedValue, row: &LogicalRow) -> bool {
    matches!(
        value,
        ExtractedValue::Reference { resource_type: Some(t), id: Some(id), .. }
            if *t == row.resource_type && *id == row.logical_id
    )
}

fn value_matches(modifier: Option<Modifier>, query: &QueryParameterValue, stored: &ExtractedValue) -> bool {
    match (&query.value, stored) {
        (QueryValue::String(q), ExtractedValue::String { value }) => match modifier {
            Some(Modifier::Exact) => value == q,
            Some(Modifier::Contains) => normalize_string(value).contains(&normalize_string(q)),
            _ => normalize_string(value).starts_with(&normalize_string(q)),
        },
        (QueryValue::Uri(q), ExtractedValue::Uri { value }) => match modifier {
            Some(Modifier::Below) => value.starts_with(q.as_str()),
            Some(Modifier::Above) => q.starts_with(value.as_str()),
            _ => value == q,
        },
        (
            QueryValue::Token {
                system,
                code,
                of_type,
            },
            ExtractedValue::Token {
                system: stored_system,
                code: stored_code,
            },
        ) => {
            let system_ok = match of_type {
                Some((type_system, type_code)) => {
                    stored_system.as_deref() == Some(format!("{type_system}|{type_code}").as_str())
                }
                None => match system {
                    TokenSystem::Any => true,
                    TokenSystem::NoSystem => stored_system.is_none(),
                    TokenSystem::Is(s) => stored_system.as_deref() == Some(s.as_str()),
                },
            };
            system_ok && code.as_ref().map_or(true, |c| c == stored_code)
        }
        (QueryValue::Number { value, low, high }, ExtractedValue::Number { value: stored, .. }) => {
            number_matches(query.prefix, *stored, *value, *low, *high)
        }
        (QueryValue::Date(range), ExtractedValue::Date { start, end }) => date_matches(query.prefix, *start, *end, range),
        (
            QueryValue::Quantity {
                value,
                low,
                high,
                system,
                code,
            },
            ExtractedValue::Quantity {
                value: stored,
                system: stored_system,
                code: stored_code,
                unit,
                ..
            },
        ) => {
            let units_ok = match (system, code) {
                (Some(s), Some(c)) => stored_system.as_ref() == Some(s) && stored_code.as_ref() == Some(c),
                (None, Some(c)) => stored_code.as_ref() == Some(c) || unit.as_ref() == Some(c),
                (Some(s), None) => stored_system.as_ref() == Some(s),
                (None, None) => true,
            };
            units_ok && number_matches(query.prefix, *stored, *value, *low, *high)
        }
        (
            QueryValue::Reference {
                resource_type,
                id,
                url,
                version,
            },
            ExtractedValue::Reference {
                resource_type: stored_type,
                id: stored_id,
                url: stored_url,
                version: stored_version,
            },
        ) => {
            let target_ok = match (id, url) {
                (Some(id), _) => {
                    stored_id.as_ref() == Some(id)
                        && match (resource_type, stored_type) {
                            (Some(t), Some(st)) => t == st,
                            _ => true,
                        }
                }
                (None, Some(url)) => stored_url.as_ref() == Some(url),
                (None, None) => false,
            };
            target_ok && version.as_ref().map_or(true, |v| stored_version.as_ref() == Some(v))
        }
        (
            QueryValue::Near {
                latitude,
                longitude,
                distance_km,
            },
            ExtractedValue::Location {
                latitude: lat,
                longitude: lng,
            },
        ) => haversine_km(*latitude, *longitude, *lat, *lng) <= *distance_km,
        (QueryValue::Composite(components), ExtractedValue::Composite { components: stored }) => {
            components.len() == stored.len()
                && components
                    .iter()
                    .zip(stored)
                    .all(|(q, s)| value_matches(None, q, &s.value))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_search::{parse_number, DateRange, Prefix};

    fn q(value: QueryValue) -> QueryParameterValue {
        QueryParameterValue {
            prefix: Prefix::Eq,
            value,
            raw: String::new(),
        }
    }

    #[test]
    fn strings_match_normalized_prefix() {
        let stored = ExtractedValue::String { value: "Ångström".into() };
        assert!(value_matches(None, &q(QueryValue::String("ang".into())), &stored));
        assert!(!value_matches(
            Some(Modifier::Exact),
            &q(QueryValue::String("angstrom".into())),
            &stored
        ));
        assert!(value_matches(
            Some(Modifier::Contains),
            &q(QueryValue::String("STR".into())),
            &stored
        ));
    }

    #[test]
    fn token_system_forms() {
        let stored = ExtractedValue::Token {
            system: Some("http://loinc.org".into()),
            code: "1234-5".into(),
        };
        let token = |system: TokenSystem, code: Option<&str>| {
            q(QueryValue::Token {
                system,
                code: code.map(str::to_string),
                of_type: None,
            })
        };
        assert!(value_matches(None, &token(TokenSystem::Any, Some("1234-5")), &stored));
        assert!(value_matches(None, &token(TokenSystem::Is("http://loinc.org".into()), None), &stored));
        assert!(!value_matches(None, &token(TokenSystem::NoSystem, Some("1234-5")), &stored));
    }

    #[test]
    fn quantity_code_matches_unit() {
        let (value, low, high) = parse_number("q", "5.4").unwrap();
        let stored = ExtractedValue::Quantity {
            value,
            low,
            high,
            system: Some("http://unitsofmeasure.org".into()),
            code: Some("mg".into()),
            unit: Some("milligram".into()),
        };
        let query = |code: &str| {
            q(QueryValue::Quantity {
                value,
                low,
                high,
                system: None,
                code: Some(code.into()),
            })
        };
        assert!(value_matches(None, &query("mg"), &stored));
        assert!(value_matches(None, &query("milligram"), &stored));
        assert!(!value_matches(None, &query("g"), &stored));
    }

    #[test]
    fn composite_components_match_pairwise() {
        let day = DateRange::parse("2021-01-01").unwrap();
        let stored = ExtractedValue::Composite {
            components: vec![
                crate::models::ExtractedParameterValue::new(
                    "code",
                    meridian_search::SearchParamType::Token,
                    ExtractedValue::Token {
                        system: None,
                        code: "x".into(),
                    },
                ),
                crate::models::ExtractedParameterValue::new(
                    "date",
                    meridian_search::SearchParamType::Date,
                    ExtractedValue::Date {
                        start: day.lower,
                        end: day.upper,
                    },
                ),
            ],
        };
        let query = q(QueryValue::Composite(vec![
            q(QueryValue::Token {
                system: TokenSystem::Any,
                code: Some("x".into()),
                of_type: None,
            }),
            q(QueryValue::Date(DateRange::parse("2021").unwrap())),
        ]));
        assert!(value_matches(None, &query, &stored));
    }
}
