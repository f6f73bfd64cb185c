//! Change-log handlers
//!
//! - `GET /_history`: system history bundle built from the change log
//! - `GET /$changes`: raw change records for incremental consumers
//!
//! Both page forward with `_afterId` (the last `changeId` seen) and accept
//! `_since`, `_type` and `_count`.

use super::crud::fhir_json;
use crate::{
    api::{bundle, url as api_url},
    models::{ChangeRecord, ChangesQuery},
    state::AppState,
    Error, Result,
};
use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use serde_json::json;

fn parse_changes_query(items: &[(String, String)], max_count: usize) -> Result<ChangesQuery> {
    let mut query = ChangesQuery::default();
    for (key, value) in items {
        match key.as_str() {
            "_afterId" => {
                query.after_id = Some(
                    value
                        .parse()
                        .map_err(|_| Error::Validation(format!("Invalid _afterId '{}'", value)))?,
                );
            }
            "_since" => {
                let since = DateTime::parse_from_rfc3339(value)
                    .map_err(|_| Error::Validation(format!("Invalid _since '{}': expected an instant", value)))?;
                query.since = Some(since.with_timezone(&Utc));
            }
            "_type" => query.resource_type = Some(value.clone()),
            "_count" => {
                let count: usize = value
                    .parse()
                    .map_err(|_| Error::Validation(format!("Invalid _count '{}'", value)))?;
                query.limit = count.clamp(1, max_count);
            }
            _ => {}
        }
    }
    Ok(query)
}

/// A full page means more changes may follow.
fn next_after(changes: &[ChangeRecord], limit: usize) -> Option<i64> {
    (changes.len() >= limit)
        .then(|| changes.last().map(|c| c.change_id))
        .flatten()
}

/// System history (GET /_history)
pub async fn system_history(
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let items = api_url::parse_query_items(raw_query.as_deref());
    let query = parse_changes_query(&items, state.config.search.max_page_size)?;
    let changes = state.persistence.changes(&query).await?;

    let base_url = api_url::base_url(state.config.server.base_url.as_deref(), &headers);
    let body = bundle::change_history(&base_url, &changes, next_after(&changes, query.limit), &items);
    Ok(fhir_json(StatusCode::OK, &body))
}

/// Change log (GET /$changes)
pub async fn changes(State(state): State<AppState>, RawQuery(raw_query): RawQuery) -> Result<Response> {
    let items = api_url::parse_query_items(raw_query.as_deref());
    let query = parse_changes_query(&items, state.config.search.max_page_size)?;
    let changes = state.persistence.changes(&query).await?;

    let body = json!({
        "changes": changes,
        "nextAfterId": next_after(&changes, query.limit),
    });
    Ok(fhir_json(StatusCode::OK, &body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeType;

    #[test]
    fn changes_query_parameters() {
        let items = vec![
            ("_afterId".to_string(), "41".to_string()),
            ("_type".to_string(), "Patient".to_string()),
            ("_count".to_string(), "0".to_string()),
        ];
        let query = parse_changes_query(&items, 1000).unwrap();
        assert_eq!(query.after_id, Some(41));
        assert_eq!(query.resource_type.as_deref(), Some("Patient"));
        assert_eq!(query.limit, 1);

        let bad = vec![("_afterId".to_string(), "x".to_string())];
        assert!(parse_changes_query(&bad, 1000).is_err());
    }

    #[test]
    fn next_cursor_only_on_full_page() {
        let change = |id| ChangeRecord {
            change_id: id,
            resource_type: "Patient".into(),
            logical_id: "p".into(),
            version_id: 1,
            change_type: ChangeType::Create,
            changed_at: Utc::now(),
        };
        assert_eq!(next_after(&[change(1), change(2)], 2), Some(2));
        assert_eq!(next_after(&[change(1)], 2), None);
    }
}
