//! Resource level models returned by the persistence service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A FHIR resource with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Logical id
    pub id: String,

    /// Resource type (e.g., "Patient", "Observation")
    pub resource_type: String,

    /// Version id (starts at 1)
    pub version_id: i32,

    /// Full resource JSON. `Null` for delete markers.
    pub resource: JsonValue,

    pub last_updated: DateTime<Utc>,

    pub deleted: bool,
}

impl Resource {
    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version_id)
    }
}

/// Result of a resource operation
#[derive(Debug, Clone)]
pub struct ResourceResult {
    pub resource: Resource,
    pub operation: ResourceOperation,
}

/// Type of operation performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOperation {
    /// Resource was created (HTTP 201)
    Created,

    /// Resource was updated (HTTP 200)
    Updated,

    /// Nothing was written: `If-None-Exist` matched, or a delete hit an
    /// already deleted resource.
    NoOp,

    /// `If-None-Match: *` matched an existing resource and the server is
    /// configured to answer 304 instead of 412 (HTTP 304)
    NotModified,

    /// Resource was deleted (HTTP 204)
    Deleted,
}

impl ResourceOperation {
    pub fn status_code(&self) -> u16 {
        match self {
            ResourceOperation::Created => 201,
            ResourceOperation::Updated => 200,
            ResourceOperation::NoOp => 200,
            ResourceOperation::NotModified => 304,
            ResourceOperation::Deleted => 204,
        }
    }
}

/// Update preconditions taken from request headers
#[derive(Debug, Clone, Default)]
pub struct UpdateParams {
    /// Expected version (`If-Match: W/"n"`)
    pub if_match: Option<i32>,
    /// `If-None-Match: *`: only create, never overwrite
    pub if_none_match: bool,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub resource: Resource,
    pub method: HistoryMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMethod {
    Post,
    Put,
    Delete,
}

impl HistoryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryMethod::Post => "POST",
            HistoryMethod::Put => "PUT",
            HistoryMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryResult {
    pub entries: Vec<HistoryEntry>,
    pub total: Option<i64>,
}

/// Paging and filtering for instance history.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub count: usize,
    pub offset: usize,
    /// Only versions updated at or after this instant (`_since`)
    pub since: Option<DateTime<Utc>>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            count: meridian_search::DEFAULT_PAGE_SIZE,
            offset: 0,
            since: None,
        }
    }
}

/// Change-log entry kind, stored as a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    #[serde(rename = "C")]
    Create,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
}

impl ChangeType {
    pub fn as_code(&self) -> &'static str {
        match self {
            ChangeType::Create => "C",
            ChangeType::Update => "U",
            ChangeType::Delete => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "C" => Some(ChangeType::Create),
            "U" => Some(ChangeType::Update),
            "D" => Some(ChangeType::Delete),
            _ => None,
        }
    }

    pub fn history_method(&self) -> HistoryMethod {
        match self {
            ChangeType::Create => HistoryMethod::Post,
            ChangeType::Update => HistoryMethod::Put,
            ChangeType::Delete => HistoryMethod::Delete,
        }
    }
}

/// One row of the resource change log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Monotonic position in the change log
    pub change_id: i64,
    pub resource_type: String,
    pub logical_id: String,
    pub version_id: i32,
    pub change_type: ChangeType,
    pub changed_at: DateTime<Utc>,
}

/// Change-log read window (`$changes`).
#[derive(Debug, Clone)]
pub struct ChangesQuery {
    /// Return changes with `change_id > after_id`
    pub after_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub resource_type: Option<String>,
    pub limit: usize,
}

impl Default for ChangesQuery {
    fn default() -> Self {
        Self {
            after_id: None,
            since: None,
            resource_type: None,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEntryMode {
    Match,
    Include,
}

impl SearchEntryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchEntryMode::Match => "match",
            SearchEntryMode::Include => "include",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub resource: Resource,
    pub mode: SearchEntryMode,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entries: Vec<SearchEntry>,
    /// `None` when `_total=none`
    pub total: Option<i64>,
    /// Whether another page exists after this one
    pub has_next: bool,
    /// Parameters skipped in lenient mode
    pub warnings: Vec<String>,
}

/// What `$erase` removed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EraseOutcome {
    pub resource_type: String,
    pub logical_id: String,
    pub versions_erased: Vec<i32>,
    /// The whole logical resource (all versions) was removed
    pub logical_resource_erased: bool,
    /// Offloaded payloads to delete once the transaction committed
    #[serde(skip)]
    pub payload_keys: Vec<String>,
}

/// Result of one `$reindex` batch.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexOutcome {
    /// Logical resources visited
    pub processed: usize,
    /// Resources whose search values were rewritten
    pub reindexed: usize,
    /// Resources whose parameter hash was unchanged
    pub unchanged: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_codes_round_trip() {
        for t in [ChangeType::Create, ChangeType::Update, ChangeType::Delete] {
            assert_eq!(ChangeType::from_code(t.as_code()), Some(t));
        }
        assert_eq!(ChangeType::from_code("X"), None);
        assert_eq!(ChangeType::Delete.history_method(), HistoryMethod::Delete);
    }
}
