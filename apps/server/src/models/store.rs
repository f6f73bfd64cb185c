//! Records exchanged with the resource store.

use super::values::ExtractedParameterValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a version's JSON lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourcePayload {
    /// gzip compressed JSON stored in the resources table
    Inline(Vec<u8>),
    /// Stored by the payload backend under `key`
    Offloaded { key: String },
    /// Delete markers carry no body
    Empty,
}

/// One version row as stored.
#[derive(Debug, Clone)]
pub struct StoredVersion {
    pub logical_resource_id: i64,
    pub resource_type: String,
    pub logical_id: String,
    pub version_id: i32,
    pub last_updated: DateTime<Utc>,
    pub deleted: bool,
    pub payload: ResourcePayload,
}

/// Write request for one new version of a logical resource.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub resource_type: String,
    pub logical_id: String,
    /// Version being written. Must be greater than the stored current version.
    pub version_id: i32,
    pub last_updated: DateTime<Utc>,
    pub deleted: bool,
    pub payload: ResourcePayload,
    /// `None` for deletes
    pub parameter_hash: Option<String>,
    /// Only create: an existing, non-deleted resource short-circuits the write
    pub if_none_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionStatus {
    Modified,
    /// `if_none_match` was set and the resource exists. Nothing was written.
    IfNoneMatchExisted,
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub logical_resource_id: i64,
    pub status: InteractionStatus,
    /// Parameter hash stored before this write
    pub previous_parameter_hash: Option<String>,
    /// Version stored by this write, or the existing version when
    /// `IfNoneMatchExisted`
    pub version_id: i32,
    /// The logical resource did not exist before this write
    pub created: bool,
}

impl StoreOutcome {
    /// The stored search values are still those of `new_hash`.
    pub fn parameters_unchanged(&self, new_hash: Option<&str>) -> bool {
        matches!((self.previous_parameter_hash.as_deref(), new_hash), (Some(a), Some(b)) if a == b)
    }
}

/// Committed state of a logical resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalResourceState {
    pub logical_resource_id: i64,
    pub resource_type: String,
    pub logical_id: String,
    pub version_id: i32,
    pub last_updated: DateTime<Utc>,
    pub deleted: bool,
    pub parameter_hash: Option<String>,
    pub reindex_tstamp: Option<DateTime<Utc>>,
}

/// Search values for one logical resource, ready to be written.
#[derive(Debug, Clone)]
pub struct IndexedResource {
    pub logical_resource_id: i64,
    pub resource_type: String,
    pub logical_id: String,
    pub values: Vec<ExtractedParameterValue>,
}

/// A page of raw search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub matches: Vec<StoredVersion>,
    pub includes: Vec<StoredVersion>,
    pub total: Option<i64>,
    pub has_next: bool,
}
