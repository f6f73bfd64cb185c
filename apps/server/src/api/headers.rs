//! HTTP header handling
//!
//! Request headers:
//! - `If-Match` - expected version for optimistic concurrency
//! - `If-None-Match: *` - create-only update
//! - `If-None-Exist` - conditional create
//! - `Prefer` - `return=minimal|representation`, `handling=strict|lenient`
//!
//! Response headers:
//! - `ETag` - version as weak ETag (`W/"3"`)
//! - `Last-Modified` - from `meta.lastUpdated`
//! - `Location` - versioned resource URL after create/update

use crate::{models::Resource, Error, Result};
use axum::http::{header, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};

/// Parse a weak or strong ETag (`W/"3"`, `"3"`) into a version id.
pub fn parse_etag(etag: &str) -> Option<i32> {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"').parse().ok()
}

pub fn format_etag(version: i32) -> String {
    format!("W/\"{}\"", version)
}

/// RFC 7232 HTTP date.
pub fn format_last_modified(last_updated: &DateTime<Utc>) -> String {
    last_updated.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferReturn {
    /// Status and headers only
    Minimal,
    #[default]
    Representation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferHandling {
    /// Unknown or invalid search parameters are skipped with a warning
    Lenient,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreferPreferences {
    pub return_pref: PreferReturn,
    /// `None` leaves the decision to the server configuration
    pub handling: Option<PreferHandling>,
}

impl PreferPreferences {
    /// Lenient override for the search parser.
    pub fn lenient(&self) -> Option<bool> {
        self.handling.map(|h| h == PreferHandling::Lenient)
    }
}

/// Parse the `Prefer` header. Preferences may be comma separated or sent as
/// repeated headers.
pub fn extract_prefer_preferences(headers: &HeaderMap) -> PreferPreferences {
    let mut prefs = PreferPreferences::default();

    let tokens = headers
        .get_all("prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split([',', ';']))
        .map(|t| t.trim().to_ascii_lowercase());

    for token in tokens {
        match token.as_str() {
            "return=minimal" => prefs.return_pref = PreferReturn::Minimal,
            "return=representation" => prefs.return_pref = PreferReturn::Representation,
            "handling=strict" => prefs.handling = Some(PreferHandling::Strict),
            "handling=lenient" => prefs.handling = Some(PreferHandling::Lenient),
            _ => {}
        }
    }

    prefs
}

/// `If-Match` as a version id.
///
/// # Errors
/// A present header that is not an ETag.
pub fn extract_if_match(headers: &HeaderMap) -> Result<Option<i32>> {
    let Some(value) = headers.get(header::IF_MATCH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(parse_etag)
        .map(Some)
        .ok_or_else(|| Error::Validation("If-Match must be an ETag like W/\"1\"".to_string()))
}

/// `If-None-Match: *` on update. Any other value is rejected: version based
/// conditional reads are not supported on writes.
pub fn extract_if_none_match_any(headers: &HeaderMap) -> Result<bool> {
    match headers.get(header::IF_NONE_MATCH).map(|v| v.to_str()) {
        None => Ok(false),
        Some(Ok(value)) if value.trim() == "*" => Ok(true),
        Some(_) => Err(Error::Validation(
            "If-None-Match on update only supports '*'".to_string(),
        )),
    }
}

/// `If-None-Exist` search criteria, parsed as a query string.
pub fn extract_if_none_exist(headers: &HeaderMap) -> Option<Vec<(String, String)>> {
    let value = headers.get("if-none-exist")?.to_str().ok()?;
    let value = value.trim().trim_start_matches('?');
    if value.is_empty() {
        return None;
    }
    Some(url::form_urlencoded::parse(value.as_bytes()).into_owned().collect())
}

/// Set `ETag`, `Last-Modified` and optionally `Location` for a resource.
pub fn insert_resource_headers(headers: &mut HeaderMap, resource: &Resource, location: Option<&str>) {
    if let Ok(value) = HeaderValue::from_str(&format_etag(resource.version_id)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format_last_modified(&resource.last_updated)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Some(location) = location.and_then(|l| HeaderValue::from_str(l).ok()) {
        headers.insert(header::LOCATION, location);
    }
}
