//! Core traits for resource store backends

use crate::{
    models::{
        ChangeRecord, ChangesQuery, EraseOutcome, ExtractedParameterValue, HistoryQuery,
        IndexedResource, LogicalResourceState, SearchPage, StoreOutcome, StoreRequest,
        StoredVersion,
    },
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meridian_search::SearchContext;

/// Versioned storage of logical resources and their search values.
///
/// The store never looks inside payloads: bodies arrive already encoded and
/// are returned as stored. Every write goes through a [`StoreTransaction`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Start a write transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Current version of a logical resource, delete markers included.
    ///
    /// # Returns
    /// * `Ok(None)` - The logical resource was never stored (or was erased)
    async fn read(&self, resource_type: &str, logical_id: &str) -> Result<Option<StoredVersion>>;

    /// A specific version, delete markers included.
    async fn vread(
        &self,
        resource_type: &str,
        logical_id: &str,
        version_id: i32,
    ) -> Result<Option<StoredVersion>>;

    /// Versions newest first, plus the total number of matching versions.
    async fn history(
        &self,
        resource_type: &str,
        logical_id: &str,
        query: &HistoryQuery,
    ) -> Result<(Vec<StoredVersion>, i64)>;

    /// Change log entries in ascending change id order.
    async fn changes(&self, query: &ChangesQuery) -> Result<Vec<ChangeRecord>>;

    /// Execute a parsed search. Deleted resources never match.
    ///
    /// # Arguments
    /// * `max_include_depth` - Bound for `:iterate` inclusion rounds
    async fn search(&self, context: &SearchContext, max_include_depth: usize) -> Result<SearchPage>;

    /// Search values currently stored for a logical resource.
    async fn retrieve_index(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Vec<ExtractedParameterValue>>;

    /// Committed state of a logical resource.
    async fn logical_resource_state(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<LogicalResourceState>>;

    /// Logical resources not reindexed since `before` (never reindexed
    /// first), at most `batch` of them.
    async fn reindex_candidates(
        &self,
        before: DateTime<Utc>,
        batch: usize,
        resource_type: Option<&str>,
    ) -> Result<Vec<LogicalResourceState>>;

    async fn health_check(&self) -> Result<()>;
}

/// A write transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Store one new version (the upsert/versioning protocol).
    ///
    /// # Errors
    /// * `VersionConflict` - `request.version_id` is not newer than the
    ///   stored current version. Nothing was written.
    async fn store_resource(&mut self, request: &StoreRequest) -> Result<StoreOutcome>;

    /// Replace all search values of each resource.
    async fn replace_search_values(&mut self, resources: &[IndexedResource]) -> Result<()>;

    async fn update_parameter_hash(&mut self, logical_resource_id: i64, parameter_hash: &str) -> Result<()>;

    /// Lock an existing logical resource for the rest of the transaction and
    /// return its state.
    async fn lock_logical_resource(
        &mut self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<LogicalResourceState>>;

    async fn mark_reindexed(&mut self, logical_resource_id: i64, tstamp: DateTime<Utc>) -> Result<()>;

    /// Remove one non-current version, or the whole logical resource when
    /// `version_id` is `None`.
    async fn erase(
        &mut self,
        resource_type: &str,
        logical_id: &str,
        version_id: Option<i32>,
    ) -> Result<EraseOutcome>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
