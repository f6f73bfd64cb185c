//! In-memory resource store.
//!
//! A transaction owns the store's single writer lock until it commits or
//! rolls back, so transactions are fully serialized. Every mutation is
//! journaled and undone in reverse order on rollback (or when the
//! transaction is dropped unfinished).

mod matcher;

use super::traits::{ResourceStore, StoreTransaction};
use crate::models::{
    ChangeRecord, ChangeType, ChangesQuery, EraseOutcome, ExtractedParameterValue, HistoryQuery,
    IndexedResource, InteractionStatus, LogicalResourceState, ResourcePayload, SearchPage,
    StoreOutcome, StoreRequest, StoredVersion,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matcher::Matcher;
use meridian_search::{SearchContext, TotalMode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type IdentKey = (String, String);

#[derive(Debug, Clone)]
struct LogicalRow {
    logical_resource_id: i64,
    resource_type: String,
    logical_id: String,
    current_version: i32,
    deleted: bool,
    last_updated: DateTime<Utc>,
    parameter_hash: Option<String>,
    reindex_tstamp: Option<DateTime<Utc>>,
}

impl LogicalRow {
    fn state(&self) -> LogicalResourceState {
        LogicalResourceState {
            logical_resource_id: self.logical_resource_id,
            resource_type: self.resource_type.clone(),
            logical_id: self.logical_id.clone(),
            version_id: self.current_version,
            last_updated: self.last_updated,
            deleted: self.deleted,
            parameter_hash: self.parameter_hash.clone(),
            reindex_tstamp: self.reindex_tstamp,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    ident: HashMap<IdentKey, i64>,
    logical: BTreeMap<i64, LogicalRow>,
    versions: BTreeMap<(i64, i32), StoredVersion>,
    values: HashMap<i64, Vec<ExtractedParameterValue>>,
    changes: Vec<ChangeRecord>,
    next_logical_resource_id: i64,
    next_change_id: i64,
}

impl MemoryState {
    fn row(&self, resource_type: &str, logical_id: &str) -> Option<&LogicalRow> {
        self.ident
            .get(&(resource_type.to_string(), logical_id.to_string()))
            .and_then(|id| self.logical.get(id))
    }

    fn current_version(&self, row: &LogicalRow) -> Option<&StoredVersion> {
        self.versions.get(&(row.logical_resource_id, row.current_version))
    }

    fn values_of(&self, logical_resource_id: i64) -> &[ExtractedParameterValue] {
        self.values
            .get(&logical_resource_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Undo record. Each variant holds the value before the mutation.
enum Undo {
    Ident(IdentKey, Option<i64>),
    Logical(i64, Option<LogicalRow>),
    Version((i64, i32), Option<StoredVersion>),
    Values(i64, Option<Vec<ExtractedParameterValue>>),
    TruncateChanges(usize),
    RestoreChanges(Vec<ChangeRecord>),
}

#[derive(Clone, Default)]
pub struct MemoryResourceStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            journal: Vec::new(),
            finished: false,
        }))
    }

    async fn read(&self, resource_type: &str, logical_id: &str) -> Result<Option<StoredVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .row(resource_type, logical_id)
            .and_then(|row| state.current_version(row))
            .cloned())
    }

    async fn vread(&self, resource_type: &str, logical_id: &str, version_id: i32) -> Result<Option<StoredVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .row(resource_type, logical_id)
            .and_then(|row| state.versions.get(&(row.logical_resource_id, version_id)))
            .cloned())
    }

    async fn history(
        &self,
        resource_type: &str,
        logical_id: &str,
        query: &HistoryQuery,
    ) -> Result<(Vec<StoredVersion>, i64)> {
        let state = self.state.lock().await;
        let Some(row) = state.row(resource_type, logical_id) else {
            return Ok((Vec::new(), 0));
        };
        let id = row.logical_resource_id;
        let versions: Vec<&StoredVersion> = state
            .versions
            .range((id, i32::MIN)..=(id, i32::MAX))
            .rev()
            .map(|(_, v)| v)
            .filter(|v| query.since.map_or(true, |since| v.last_updated >= since))
            .collect();
        let total = versions.len() as i64;
        let page = versions
            .into_iter()
            .skip(query.offset)
            .take(query.count)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn changes(&self, query: &ChangesQuery) -> Result<Vec<ChangeRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .changes
            .iter()
            .filter(|c| query.after_id.map_or(true, |after| c.change_id > after))
            .filter(|c| query.since.map_or(true, |since| c.changed_at >= since))
            .filter(|c| {
                query
                    .resource_type
                    .as_deref()
                    .map_or(true, |t| c.resource_type == t)
            })
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn search(&self, context: &SearchContext, max_include_depth: usize) -> Result<SearchPage> {
        super::check_supported(context)?;
        let state = self.state.lock().await;
        let matcher = Matcher::new(&state);

        let types = context.searched_types();
        let mut rows: Vec<&LogicalRow> = state
            .logical
            .values()
            .filter(|row| !row.deleted)
            .filter(|row| types.is_empty() || types.iter().any(|t| *t == row.resource_type))
            .filter(|row| matcher.matches_all(row, &context.parameters))
            .collect();
        matcher.sort(&mut rows, &context.sort);

        let total = match context.total {
            TotalMode::None if !context.count_only() => None,
            _ => Some(rows.len() as i64),
        };
        if context.count_only() {
            return Ok(SearchPage {
                total,
                ..Default::default()
            });
        }

        let offset = context.offset();
        let has_next = rows.len() > offset + context.page_size;
        let page: Vec<&LogicalRow> = rows.into_iter().skip(offset).take(context.page_size).collect();
        let includes = matcher.includes(context, &page, max_include_depth);

        let load = |rows: Vec<&LogicalRow>| -> Vec<StoredVersion> {
            rows.into_iter()
                .filter_map(|row| state.current_version(row).cloned())
                .collect()
        };
        Ok(SearchPage {
            matches: load(page),
            includes: load(includes),
            total,
            has_next,
        })
    }

    async fn retrieve_index(&self, resource_type: &str, logical_id: &str) -> Result<Vec<ExtractedParameterValue>> {
        let state = self.state.lock().await;
        Ok(state
            .row(resource_type, logical_id)
            .map(|row| state.values_of(row.logical_resource_id).to_vec())
            .unwrap_or_default())
    }

    async fn logical_resource_state(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<LogicalResourceState>> {
        let state = self.state.lock().await;
        Ok(state.row(resource_type, logical_id).map(LogicalRow::state))
    }

    async fn reindex_candidates(
        &self,
        before: DateTime<Utc>,
        batch: usize,
        resource_type: Option<&str>,
    ) -> Result<Vec<LogicalResourceState>> {
        let state = self.state.lock().await;
        let mut rows: Vec<&LogicalRow> = state
            .logical
            .values()
            .filter(|row| !row.deleted)
            .filter(|row| resource_type.map_or(true, |t| row.resource_type == t))
            .filter(|row| row.reindex_tstamp.map_or(true, |ts| ts < before))
            .collect();
        rows.sort_by_key(|row| (row.reindex_tstamp, row.logical_resource_id));
        Ok(rows.into_iter().take(batch).map(LogicalRow::state).collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    journal: Vec<Undo>,
    finished: bool,
}

impl MemoryTransaction {
    fn set_ident(&mut self, key: IdentKey, value: Option<i64>) {
        let previous = match value {
            Some(id) => self.guard.ident.insert(key.clone(), id),
            None => self.guard.ident.remove(&key),
        };
        self.journal.push(Undo::Ident(key, previous));
    }

    fn set_logical(&mut self, id: i64, row: Option<LogicalRow>) {
        let previous = match row {
            Some(row) => self.guard.logical.insert(id, row),
            None => self.guard.logical.remove(&id),
        };
        self.journal.push(Undo::Logical(id, previous));
    }

    fn set_version(&mut self, key: (i64, i32), version: Option<StoredVersion>) {
        let previous = match version {
            Some(v) => self.guard.versions.insert(key, v),
            None => self.guard.versions.remove(&key),
        };
        self.journal.push(Undo::Version(key, previous));
    }

    fn set_values(&mut self, id: i64, values: Option<Vec<ExtractedParameterValue>>) {
        let previous = match values {
            Some(v) => self.guard.values.insert(id, v),
            None => self.guard.values.remove(&id),
        };
        self.journal.push(Undo::Values(id, previous));
    }

    fn push_change(&mut self, request: &StoreRequest, change_type: ChangeType) {
        self.journal.push(Undo::TruncateChanges(self.guard.changes.len()));
        self.guard.next_change_id += 1;
        let change_id = self.guard.next_change_id;
        self.guard.changes.push(ChangeRecord {
            change_id,
            resource_type: request.resource_type.clone(),
            logical_id: request.logical_id.clone(),
            version_id: request.version_id,
            change_type,
            changed_at: request.last_updated,
        });
    }

    fn row_by_id(&self, logical_resource_id: i64) -> Result<LogicalRow> {
        self.guard
            .logical
            .get(&logical_resource_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("Logical resource {logical_resource_id} does not exist")))
    }

    fn undo(&mut self) {
        let state = &mut *self.guard;
        for entry in self.journal.drain(..).rev() {
            match entry {
                Undo::Ident(key, Some(id)) => {
                    state.ident.insert(key, id);
                }
                Undo::Ident(key, None) => {
                    state.ident.remove(&key);
                }
                Undo::Logical(id, Some(row)) => {
                    state.logical.insert(id, row);
                }
                Undo::Logical(id, None) => {
                    state.logical.remove(&id);
                }
                Undo::Version(key, Some(v)) => {
                    state.versions.insert(key, v);
                }
                Undo::Version(key, None) => {
                    state.versions.remove(&key);
                }
                Undo::Values(id, Some(v)) => {
                    state.values.insert(id, v);
                }
                Undo::Values(id, None) => {
                    state.values.remove(&id);
                }
                Undo::TruncateChanges(len) => state.changes.truncate(len),
                Undo::RestoreChanges(changes) => state.changes = changes,
            }
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.undo();
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn store_resource(&mut self, request: &StoreRequest) -> Result<StoreOutcome> {
        let key = (request.resource_type.clone(), request.logical_id.clone());
        let existing = self
            .guard
            .ident
            .get(&key)
            .and_then(|id| self.guard.logical.get(id))
            .cloned();

        let (logical_resource_id, previous_hash, created) = match existing {
            None => {
                self.guard.next_logical_resource_id += 1;
                let id = self.guard.next_logical_resource_id;
                self.set_ident(key, Some(id));
                (id, None, true)
            }
            Some(row) => {
                if request.if_none_match && !row.deleted {
                    return Ok(StoreOutcome {
                        logical_resource_id: row.logical_resource_id,
                        status: InteractionStatus::IfNoneMatchExisted,
                        previous_parameter_hash: row.parameter_hash,
                        version_id: row.current_version,
                        created: false,
                    });
                }
                if request.version_id <= row.current_version {
                    return Err(Error::VersionConflict {
                        resource_type: request.resource_type.clone(),
                        id: request.logical_id.clone(),
                        requested: request.version_id,
                        current: row.current_version,
                    });
                }
                let unchanged = matches!(
                    (row.parameter_hash.as_deref(), request.parameter_hash.as_deref()),
                    (Some(a), Some(b)) if a == b
                );
                if !unchanged && self.guard.values.contains_key(&row.logical_resource_id) {
                    self.set_values(row.logical_resource_id, None);
                }
                (row.logical_resource_id, row.parameter_hash, row.deleted)
            }
        };

        let reindex_tstamp = self
            .guard
            .logical
            .get(&logical_resource_id)
            .and_then(|row| row.reindex_tstamp);
        self.set_logical(
            logical_resource_id,
            Some(LogicalRow {
                logical_resource_id,
                resource_type: request.resource_type.clone(),
                logical_id: request.logical_id.clone(),
                current_version: request.version_id,
                deleted: request.deleted,
                last_updated: request.last_updated,
                parameter_hash: request.parameter_hash.clone(),
                reindex_tstamp,
            }),
        );
        self.set_version(
            (logical_resource_id, request.version_id),
            Some(StoredVersion {
                logical_resource_id,
                resource_type: request.resource_type.clone(),
                logical_id: request.logical_id.clone(),
                version_id: request.version_id,
                last_updated: request.last_updated,
                deleted: request.deleted,
                payload: request.payload.clone(),
            }),
        );
        let change_type = if request.deleted {
            ChangeType::Delete
        } else if created {
            ChangeType::Create
        } else {
            ChangeType::Update
        };
        self.push_change(request, change_type);

        Ok(StoreOutcome {
            logical_resource_id,
            status: InteractionStatus::Modified,
            previous_parameter_hash: previous_hash,
            version_id: request.version_id,
            created,
        })
    }

    async fn replace_search_values(&mut self, resources: &[IndexedResource]) -> Result<()> {
        for resource in resources {
            self.row_by_id(resource.logical_resource_id)?;
            self.set_values(resource.logical_resource_id, Some(resource.values.clone()));
        }
        Ok(())
    }

    async fn update_parameter_hash(&mut self, logical_resource_id: i64, parameter_hash: &str) -> Result<()> {
        let mut row = self.row_by_id(logical_resource_id)?;
        row.parameter_hash = Some(parameter_hash.to_string());
        self.set_logical(logical_resource_id, Some(row));
        Ok(())
    }

    async fn lock_logical_resource(
        &mut self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<LogicalResourceState>> {
        Ok(self.guard.row(resource_type, logical_id).map(LogicalRow::state))
    }

    async fn mark_reindexed(&mut self, logical_resource_id: i64, tstamp: DateTime<Utc>) -> Result<()> {
        let mut row = self.row_by_id(logical_resource_id)?;
        row.reindex_tstamp = Some(tstamp);
        self.set_logical(logical_resource_id, Some(row));
        Ok(())
    }

    async fn erase(
        &mut self,
        resource_type: &str,
        logical_id: &str,
        version_id: Option<i32>,
    ) -> Result<EraseOutcome> {
        let row = self
            .guard
            .row(resource_type, logical_id)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: logical_id.to_string(),
            })?;
        let id = row.logical_resource_id;

        let erased_versions: Vec<i32> = match version_id {
            Some(v) if v == row.current_version => {
                return Err(Error::Validation(format!(
                    "Version {v} is the current version of {resource_type}/{logical_id}; erase the resource instead"
                )))
            }
            Some(v) => {
                if !self.guard.versions.contains_key(&(id, v)) {
                    return Err(Error::VersionNotFound {
                        resource_type: resource_type.to_string(),
                        id: logical_id.to_string(),
                        version_id: v,
                    });
                }
                vec![v]
            }
            None => self
                .guard
                .versions
                .range((id, i32::MIN)..=(id, i32::MAX))
                .map(|((_, v), _)| *v)
                .collect(),
        };

        let mut payload_keys = Vec::new();
        for v in &erased_versions {
            if let Some(StoredVersion {
                payload: ResourcePayload::Offloaded { key },
                ..
            }) = self.guard.versions.get(&(id, *v))
            {
                payload_keys.push(key.clone());
            }
            self.set_version((id, *v), None);
        }

        let previous_changes = self.guard.changes.clone();
        self.guard.changes.retain(|c| {
            !(c.resource_type == resource_type
                && c.logical_id == logical_id
                && (version_id.is_none() || Some(c.version_id) == version_id))
        });
        self.journal.push(Undo::RestoreChanges(previous_changes));

        let logical_resource_erased = version_id.is_none();
        if logical_resource_erased {
            self.set_values(id, None);
            self.set_logical(id, None);
            self.set_ident((resource_type.to_string(), logical_id.to_string()), None);
        }

        Ok(EraseOutcome {
            resource_type: resource_type.to_string(),
            logical_id: logical_id.to_string(),
            versions_erased: erased_versions,
            logical_resource_erased,
            payload_keys,
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.journal.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.undo();
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedValue;
    use meridian_search::SearchParamType;

    fn request(id: &str, version_id: i32, hash: Option<&str>) -> StoreRequest {
        StoreRequest {
            resource_type: "Patient".into(),
            logical_id: id.into(),
            version_id,
            last_updated: Utc::now(),
            deleted: hash.is_none(),
            payload: ResourcePayload::Inline(vec![version_id as u8]),
            parameter_hash: hash.map(str::to_string),
            if_none_match: false,
        }
    }

    fn indexed(logical_resource_id: i64, code: &str) -> IndexedResource {
        IndexedResource {
            logical_resource_id,
            resource_type: "Patient".into(),
            logical_id: "p1".into(),
            values: vec![ExtractedParameterValue::new(
                "gender",
                SearchParamType::Token,
                ExtractedValue::Token {
                    system: None,
                    code: code.into(),
                },
            )],
        }
    }

    #[tokio::test]
    async fn store_resource_versions_and_conflicts() {
        let store = MemoryResourceStore::new();

        let mut tx = store.begin().await.unwrap();
        let first = tx.store_resource(&request("p1", 1, Some("h1"))).await.unwrap();
        assert!(first.created);
        assert_eq!(first.previous_parameter_hash, None);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.store_resource(&request("p1", 1, Some("h1"))).await.unwrap_err();
        assert!(err.is_version_conflict());
        let second = tx.store_resource(&request("p1", 2, Some("h1"))).await.unwrap();
        assert!(!second.created);
        assert!(second.parameters_unchanged(Some("h1")));
        tx.commit().await.unwrap();

        assert_eq!(store.read("Patient", "p1").await.unwrap().unwrap().version_id, 2);
        let changes = store.changes(&ChangesQuery::default()).await.unwrap();
        let types: Vec<ChangeType> = changes.iter().map(|c| c.change_type).collect();
        assert_eq!(types, vec![ChangeType::Create, ChangeType::Update]);
    }

    #[tokio::test]
    async fn hash_change_clears_values_and_rollback_restores_them() {
        let store = MemoryResourceStore::new();
        let mut tx = store.begin().await.unwrap();
        let outcome = tx.store_resource(&request("p1", 1, Some("h1"))).await.unwrap();
        tx.replace_search_values(&[indexed(outcome.logical_resource_id, "female")])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.store_resource(&request("p1", 2, Some("h2"))).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.retrieve_index("Patient", "p1").await.unwrap().len(), 1);
        assert_eq!(store.read("Patient", "p1").await.unwrap().unwrap().version_id, 1);

        let mut tx = store.begin().await.unwrap();
        tx.store_resource(&request("p1", 2, Some("h2"))).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.retrieve_index("Patient", "p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryResourceStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.store_resource(&request("p1", 1, Some("h1"))).await.unwrap();
        }
        assert!(store.read("Patient", "p1").await.unwrap().is_none());
        assert!(store.changes(&ChangesQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn if_none_match_short_circuits() {
        let store = MemoryResourceStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.store_resource(&request("p1", 1, Some("h1"))).await.unwrap();
        let mut again = request("p1", 2, Some("h1"));
        again.if_none_match = true;
        let outcome = tx.store_resource(&again).await.unwrap();
        assert_eq!(outcome.status, InteractionStatus::IfNoneMatchExisted);
        assert_eq!(outcome.version_id, 1);
        tx.commit().await.unwrap();
        assert_eq!(store.read("Patient", "p1").await.unwrap().unwrap().version_id, 1);
    }

    #[tokio::test]
    async fn erase_version_and_resource() {
        let store = MemoryResourceStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.store_resource(&request("p1", 1, Some("h1"))).await.unwrap();
        tx.store_resource(&request("p1", 2, Some("h2"))).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.erase("Patient", "p1", Some(2)).await,
            Err(Error::Validation(_))
        ));
        let outcome = tx.erase("Patient", "p1", Some(1)).await.unwrap();
        assert_eq!(outcome.versions_erased, vec![1]);
        assert!(!outcome.logical_resource_erased);
        tx.commit().await.unwrap();
        assert!(store.vread("Patient", "p1", 1).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        let outcome = tx.erase("Patient", "p1", None).await.unwrap();
        assert!(outcome.logical_resource_erased);
        tx.commit().await.unwrap();
        assert!(store.read("Patient", "p1").await.unwrap().is_none());
        assert!(store.changes(&ChangesQuery::default()).await.unwrap().is_empty());
    }
}
