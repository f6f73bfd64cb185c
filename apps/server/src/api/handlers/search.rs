//! Search handlers
//!
//! - Type search: `GET /{type}`, `POST /{type}/_search`
//! - System search: `GET /` (`_type` restricts the types)
//! - Compartment search: `GET /{compartment}/{id}/{type}`
//!
//! `Prefer: handling=strict|lenient` overrides the configured default for
//! unknown or invalid parameters.

use super::crud::fhir_json;
use crate::{
    api::{bundle, headers::extract_prefer_preferences, url as api_url},
    models::SearchResult,
    state::AppState,
    Error, Result,
};
use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use meridian_search::SearchContext;

/// Query string items, plus form-encoded body items for `POST _search`.
fn search_items(raw_query: Option<&str>, headers: &HeaderMap, body: Option<&Bytes>) -> Result<Vec<(String, String)>> {
    let mut items = api_url::parse_query_items(raw_query);

    if let Some(body) = body.filter(|b| !b.is_empty()) {
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let media_type = content_type.split(';').next().unwrap_or("").trim();
        if !media_type.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            return Err(Error::Validation(format!(
                "POST search requires Content-Type: application/x-www-form-urlencoded, got: {}",
                content_type
            )));
        }
        let form = std::str::from_utf8(body)
            .map_err(|_| Error::Validation("Search body is not valid UTF-8".to_string()))?;
        items.extend(api_url::parse_query_items(Some(form)));
    }

    Ok(items)
}

fn searchset_response(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    items: &[(String, String)],
    context: &SearchContext,
    result: &SearchResult,
) -> Response {
    let base_url = api_url::base_url(state.config.server.base_url.as_deref(), headers);
    let body = bundle::searchset(&base_url, path, items, context, result);
    let mut response = fhir_json(StatusCode::OK, &body);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Search resources of one type (GET /{type})
pub async fn search_type(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    run_type_search(&state, &resource_type, raw_query.as_deref(), &headers, None).await
}

/// Search resources of one type with a form body (POST /{type}/_search)
pub async fn search_type_post(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    run_type_search(&state, &resource_type, raw_query.as_deref(), &headers, Some(&body)).await
}

async fn run_type_search(
    state: &AppState,
    resource_type: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    body: Option<&Bytes>,
) -> Result<Response> {
    let items = search_items(raw_query, headers, body)?;
    let lenient = extract_prefer_preferences(headers).lenient();

    let (context, result) = state
        .persistence
        .search_query(Some(resource_type), &items, lenient)
        .await?;

    Ok(searchset_response(state, headers, resource_type, &items, &context, &result))
}

/// Search across all resource types (GET /)
pub async fn search_system(
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let items = search_items(raw_query.as_deref(), &headers, None)?;
    let lenient = extract_prefer_preferences(&headers).lenient();

    let (context, result) = state.persistence.search_query(None, &items, lenient).await?;

    Ok(searchset_response(&state, &headers, "", &items, &context, &result))
}

/// Resources of one type in a compartment (GET /{compartment}/{id}/{type})
pub async fn search_compartment(
    State(state): State<AppState>,
    Path((compartment, compartment_id, resource_type)): Path<(String, String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let items = search_items(raw_query.as_deref(), &headers, None)?;
    let lenient = extract_prefer_preferences(&headers).lenient();

    let (context, result) = state
        .persistence
        .compartment_search(&compartment, &compartment_id, &resource_type, &items, lenient)
        .await?;

    let path = format!("{}/{}/{}", compartment, compartment_id, resource_type);
    Ok(searchset_response(&state, &headers, &path, &items, &context, &result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_body_is_merged_with_query() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/x-www-form-urlencoded".parse().unwrap());
        let body = Bytes::from_static(b"family=Chalmers&_count=5");
        let items = search_items(Some("active=true"), &headers, Some(&body)).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], ("family".to_string(), "Chalmers".to_string()));
    }

    #[test]
    fn json_search_body_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let body = Bytes::from_static(b"{}");
        assert!(search_items(None, &headers, Some(&body)).is_err());
    }
}
