//! Instance interaction handlers
//!
//! - create: `POST /{type}` (conditional with `If-None-Exist`)
//! - read / vread: `GET /{type}/{id}`, `GET /{type}/{id}/_history/{vid}`
//! - update: `PUT /{type}/{id}` (`If-Match`, `If-None-Match: *`)
//! - delete: `DELETE /{type}/{id}`
//! - history: `GET /{type}/{id}/_history`

use crate::{
    api::{
        bundle,
        extractors::FhirBody,
        headers::{
            extract_if_match, extract_if_none_exist, extract_if_none_match_any,
            extract_prefer_preferences, insert_resource_headers, PreferReturn,
        },
        url as api_url,
    },
    models::{HistoryQuery, Resource, ResourceOperation, ResourceResult, UpdateParams},
    state::AppState,
    Error, Result,
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use meridian_search::MAX_OFFSET;
use serde_json::Value as JsonValue;

pub(crate) const FHIR_JSON: &str = "application/fhir+json; charset=utf-8";

/// JSON response with the FHIR content type.
pub(crate) fn fhir_json(status: StatusCode, body: &JsonValue) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON));
    response
}

fn versioned_location(base_url: &str, resource: &Resource) -> String {
    format!(
        "{}/{}/{}/_history/{}",
        base_url, resource.resource_type, resource.id, resource.version_id
    )
}

/// Status, headers and (unless `return=minimal`) body for a write.
fn write_response(result: ResourceResult, base_url: &str, prefer: PreferReturn) -> Response {
    let status = StatusCode::from_u16(result.operation.status_code()).unwrap_or(StatusCode::OK);
    let location = match result.operation {
        ResourceOperation::Created | ResourceOperation::Updated => {
            Some(versioned_location(base_url, &result.resource))
        }
        _ => None,
    };

    let mut response = match result.operation {
        ResourceOperation::NotModified | ResourceOperation::Deleted => status.into_response(),
        _ if prefer == PreferReturn::Minimal => status.into_response(),
        _ => fhir_json(status, &result.resource.resource),
    };
    insert_resource_headers(response.headers_mut(), &result.resource, location.as_deref());
    response
}

fn read_response(resource: Resource) -> Response {
    let mut response = fhir_json(StatusCode::OK, &resource.resource);
    insert_resource_headers(response.headers_mut(), &resource, None);
    response
}

/// Create a new resource (POST /{type})
///
/// - 201 Created with Location, ETag and Last-Modified
/// - `If-None-Exist`: 200 with the single match, 412 on several
pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    FhirBody(resource): FhirBody,
) -> Result<Response> {
    let prefs = extract_prefer_preferences(&headers);
    let base_url = api_url::base_url(state.config.server.base_url.as_deref(), &headers);

    let result = match extract_if_none_exist(&headers) {
        Some(criteria) => {
            state
                .persistence
                .conditional_create(&resource_type, resource, &criteria)
                .await?
        }
        None => state.persistence.create(&resource_type, resource).await?,
    };

    Ok(write_response(result, &base_url, prefs.return_pref))
}

/// Read the current version (GET /{type}/{id})
///
/// 410 Gone with the delete marker's ETag when deleted.
pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response> {
    let resource = state.persistence.read(&resource_type, &id).await?;
    Ok(read_response(resource))
}

/// Read one version (GET /{type}/{id}/_history/{vid})
pub async fn vread_resource(
    State(state): State<AppState>,
    Path((resource_type, id, vid)): Path<(String, String, String)>,
) -> Result<Response> {
    let version_id: i32 = vid
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid version id '{}'", vid)))?;
    let resource = state.persistence.vread(&resource_type, &id, version_id).await?;
    Ok(read_response(resource))
}

/// Update or create (PUT /{type}/{id})
///
/// - 200 on update, 201 when the id was new (or deleted)
/// - `If-Match` mismatch: 412
/// - `If-None-Match: *` on an existing resource: 412, or 304 when
///   configured
pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    FhirBody(resource): FhirBody,
) -> Result<Response> {
    let prefs = extract_prefer_preferences(&headers);
    let base_url = api_url::base_url(state.config.server.base_url.as_deref(), &headers);
    let params = UpdateParams {
        if_match: extract_if_match(&headers)?,
        if_none_match: extract_if_none_match_any(&headers)?,
    };

    let result = state
        .persistence
        .update(&resource_type, &id, resource, params)
        .await?;

    Ok(write_response(result, &base_url, prefs.return_pref))
}

/// Logical delete (DELETE /{type}/{id})
///
/// 204 with the ETag of the delete marker. Deleting a deleted resource is
/// a no-op that also answers 204.
pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response> {
    if !body.is_empty() {
        return Err(Error::InvalidResource(
            "DELETE request body must be empty".to_string(),
        ));
    }

    let result = state.persistence.delete(&resource_type, &id).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    insert_resource_headers(response.headers_mut(), &result.resource, None);
    Ok(response)
}

/// Parse `_count`, `_page` and `_since` for history.
fn parse_history_query(items: &[(String, String)], max_count: usize) -> Result<(HistoryQuery, usize)> {
    let mut query = HistoryQuery::default();
    let mut page = 1usize;

    for (key, value) in items {
        match key.as_str() {
            "_count" => {
                let count: usize = value
                    .parse()
                    .map_err(|_| Error::Validation(format!("Invalid _count '{}'", value)))?;
                query.count = count.min(max_count);
            }
            "_page" => {
                page = value
                    .parse()
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| Error::Validation(format!("Invalid _page '{}'", value)))?;
            }
            "_since" => {
                let since = DateTime::parse_from_rfc3339(value)
                    .map_err(|_| Error::Validation(format!("Invalid _since '{}': expected an instant", value)))?;
                query.since = Some(since.with_timezone(&Utc));
            }
            _ => {}
        }
    }
    query.offset = (page - 1)
        .checked_mul(query.count)
        .filter(|offset| *offset <= MAX_OFFSET)
        .ok_or_else(|| {
            Error::Validation(format!("Invalid _page '{}': beyond the last addressable entry", page))
        })?;
    Ok((query, page))
}

/// Instance history (GET /{type}/{id}/_history)
pub async fn resource_history(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let base_url = api_url::base_url(state.config.server.base_url.as_deref(), &headers);
    let items = api_url::parse_query_items(raw_query.as_deref());
    let (query, page) = parse_history_query(&items, state.config.search.max_page_size)?;

    let result = state.persistence.history(&resource_type, &id, &query).await?;

    let path = format!("{}/{}/_history", resource_type, id);
    let body = bundle::history(&base_url, &path, &items, query.count, page, &result);
    Ok(fhir_json(StatusCode::OK, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_paging_is_clamped() {
        let items = vec![
            ("_count".to_string(), "5000".to_string()),
            ("_page".to_string(), "3".to_string()),
        ];
        let (query, page) = parse_history_query(&items, 1000).unwrap();
        assert_eq!(query.count, 1000);
        assert_eq!(query.offset, 2000);
        assert_eq!(page, 3);

        let bad = vec![("_page".to_string(), "0".to_string())];
        assert!(parse_history_query(&bad, 1000).is_err());
    }

    #[test]
    fn history_page_past_addressable_range_is_invalid() {
        let items = vec![("_page".to_string(), usize::MAX.to_string())];
        assert!(matches!(
            parse_history_query(&items, 1000),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn history_since_is_an_instant() {
        let items = vec![("_since".to_string(), "2024-01-01T00:00:00Z".to_string())];
        assert!(parse_history_query(&items, 100).unwrap().0.since.is_some());
        let items = vec![("_since".to_string(), "2024-01-01".to_string())];
        assert!(parse_history_query(&items, 100).is_err());
    }
}
