//! Persistence service - resource interactions on top of the store
//!
//! Assigns ids and versions, stamps `meta`, extracts search values,
//! encodes payloads and runs the store's upsert protocol. Search values are
//! written in the request transaction unless the parameter hash is
//! unchanged. With remote indexing enabled every version is handed to the
//! remote index consumer instead.

use crate::{
    config::{SearchConfig, StoreConfig},
    db::{rollback, ResourceStore, StoreTransaction},
    metrics,
    models::{
        ChangeRecord, ChangesQuery, EraseOutcome, HistoryEntry, HistoryMethod, HistoryQuery,
        HistoryResult, IndexedResource, InteractionStatus, LogicalResourceState, ReindexOutcome,
        Resource, ResourceOperation, ResourcePayload, ResourceResult, SearchEntry,
        SearchEntryMode, SearchResult, StoreOutcome, StoreRequest, StoredVersion, UpdateParams,
    },
    payload::PayloadCodec,
    remote_index::{RemoteIndexSubmitter, SearchParametersTransport, TransportHeader},
    services::{
        indexing::{IndexedValues, IndexingService},
        summary,
    },
    Error, Result,
};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use meridian_search::{
    is_valid_logical_id, is_valid_resource_type, parse_compartment_query, parse_query,
    ParseOptions, SearchContext, SearchParameterRegistry,
};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// One version to write.
struct VersionWrite<'a> {
    resource_type: &'a str,
    logical_id: &'a str,
    version_id: i32,
    last_updated: DateTime<Utc>,
    /// `None` writes a delete marker
    body: Option<&'a JsonValue>,
    if_none_match: bool,
}

pub struct PersistenceService {
    store: Arc<dyn ResourceStore>,
    codec: PayloadCodec,
    indexing: Arc<IndexingService>,
    remote: Option<Arc<RemoteIndexSubmitter>>,
    store_config: StoreConfig,
    search_config: SearchConfig,
}

/// Timestamps are kept at the precision the database stores.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Set `id`, `meta.versionId` and `meta.lastUpdated`.
fn populate_meta(resource: &mut JsonValue, id: &str, version_id: i32, last_updated: &DateTime<Utc>) {
    let Some(obj) = resource.as_object_mut() else {
        return;
    };
    obj.insert("id".to_string(), json!(id));
    let meta = obj.entry("meta").or_insert_with(|| json!({}));
    if !meta.is_object() {
        *meta = json!({});
    }
    meta["versionId"] = json!(version_id.to_string());
    meta["lastUpdated"] = json!(format_instant(last_updated));
}

fn history_method(version: &StoredVersion) -> HistoryMethod {
    if version.deleted {
        HistoryMethod::Delete
    } else if version.version_id == 1 {
        HistoryMethod::Post
    } else {
        HistoryMethod::Put
    }
}

impl PersistenceService {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        codec: PayloadCodec,
        indexing: Arc<IndexingService>,
        remote: Option<Arc<RemoteIndexSubmitter>>,
        store_config: StoreConfig,
        search_config: SearchConfig,
    ) -> Self {
        Self {
            store,
            codec,
            indexing,
            remote,
            store_config,
            search_config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SearchParameterRegistry> {
        self.indexing.registry()
    }

    pub fn is_remote_indexing(&self) -> bool {
        self.remote.is_some()
    }

    /// Parse options for a request. `lenient` overrides the configured
    /// default (`Prefer: handling=...`).
    pub fn parse_options(&self, lenient: Option<bool>) -> ParseOptions {
        ParseOptions {
            lenient: lenient.unwrap_or(self.search_config.lenient),
            default_page_size: self.search_config.default_page_size,
            max_page_size: self.search_config.max_page_size,
        }
    }

    /// Create a resource with a server assigned id (`POST /{type}`).
    pub async fn create(&self, resource_type: &str, mut resource: JsonValue) -> Result<ResourceResult> {
        validate_resource(resource_type, &resource)?;

        let id = Uuid::new_v4().to_string();
        let last_updated = now();
        populate_meta(&mut resource, &id, 1, &last_updated);

        let started = Instant::now();
        let result = self
            .write_version(VersionWrite {
                resource_type,
                logical_id: &id,
                version_id: 1,
                last_updated,
                body: Some(&resource),
                if_none_match: false,
            })
            .await;
        self.record("create", resource_type, started, &result);
        result?;

        Ok(ResourceResult {
            resource: Resource {
                id,
                resource_type: resource_type.to_string(),
                version_id: 1,
                resource,
                last_updated,
                deleted: false,
            },
            operation: ResourceOperation::Created,
        })
    }

    /// Conditional create (`If-None-Exist`). One match is returned as is,
    /// several matches fail the precondition.
    pub async fn conditional_create(
        &self,
        resource_type: &str,
        resource: JsonValue,
        criteria: &[(String, String)],
    ) -> Result<ResourceResult> {
        let mut context = parse_query(Some(resource_type), criteria, self.registry(), &self.parse_options(Some(false)))?;
        context.page_size = 2;
        context.page_number = 1;
        context.total = meridian_search::TotalMode::None;

        let page = self
            .store
            .search(&context, self.search_config.max_include_depth)
            .await?;
        match page.matches.as_slice() {
            [] => self.create(resource_type, resource).await,
            [existing] => Ok(ResourceResult {
                resource: self.to_resource(existing).await?,
                operation: ResourceOperation::NoOp,
            }),
            _ => Err(Error::PreconditionFailed(format!(
                "If-None-Exist criteria match more than one {}",
                resource_type
            ))),
        }
    }

    /// Update or create with a client id (`PUT /{type}/{id}`).
    ///
    /// Without `If-Match` a concurrent update is retried with the next
    /// version up to the configured retry count.
    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        mut resource: JsonValue,
        params: UpdateParams,
    ) -> Result<ResourceResult> {
        validate_resource(resource_type, &resource)?;
        validate_id(id)?;
        match resource.get("id") {
            None => {}
            Some(JsonValue::String(body_id)) if body_id == id => {}
            Some(JsonValue::String(body_id)) => {
                return Err(Error::InvalidResource(format!(
                    "Resource id '{}' does not match URL id '{}'",
                    body_id, id
                )))
            }
            Some(_) => return Err(Error::InvalidResource("Resource id must be a string".to_string())),
        }

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let current = self.store.read(resource_type, id).await?;

            if let Some(expected) = params.if_match {
                match &current {
                    None => {
                        return Err(Error::ResourceNotFound {
                            resource_type: resource_type.to_string(),
                            id: id.to_string(),
                        })
                    }
                    Some(current) if current.version_id != expected => {
                        return Err(Error::PreconditionFailed(format!(
                            "If-Match version {} does not match current version {}",
                            expected, current.version_id
                        )))
                    }
                    Some(_) => {}
                }
            }
            if current.is_none() && !self.store_config.allow_update_create {
                return Err(Error::MethodNotAllowed(
                    "Server does not allow client-defined resource ids. Use POST to create resources."
                        .to_string(),
                ));
            }

            let version_id = current.as_ref().map_or(1, |c| c.version_id + 1);
            let last_updated = now();
            populate_meta(&mut resource, id, version_id, &last_updated);

            let result = self
                .write_version(VersionWrite {
                    resource_type,
                    logical_id: id,
                    version_id,
                    last_updated,
                    body: Some(&resource),
                    if_none_match: params.if_none_match,
                })
                .await;

            match result {
                Ok(outcome) if outcome.status == InteractionStatus::IfNoneMatchExisted => {
                    self.record("update", resource_type, started, &Ok::<(), Error>(()));
                    return self.if_none_match_existed(resource_type, id).await;
                }
                Ok(outcome) => {
                    self.record("update", resource_type, started, &Ok::<(), Error>(()));
                    return Ok(ResourceResult {
                        resource: Resource {
                            id: id.to_string(),
                            resource_type: resource_type.to_string(),
                            version_id,
                            resource,
                            last_updated,
                            deleted: false,
                        },
                        operation: if outcome.created {
                            ResourceOperation::Created
                        } else {
                            ResourceOperation::Updated
                        },
                    });
                }
                Err(e) if e.is_version_conflict() => {
                    metrics::VERSION_CONFLICTS_TOTAL
                        .with_label_values(&[resource_type])
                        .inc();
                    if params.if_match.is_some() {
                        return Err(Error::PreconditionFailed(e.to_string()));
                    }
                    if attempt >= self.store_config.update_retry_count {
                        self.record("update", resource_type, started, &Err::<(), _>(&e));
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::debug!(
                        resource_type = %resource_type,
                        id = %id,
                        attempt,
                        "Retrying update after concurrent update"
                    );
                }
                Err(e) => {
                    self.record("update", resource_type, started, &Err::<(), _>(&e));
                    return Err(e);
                }
            }
        }
    }

    async fn if_none_match_existed(&self, resource_type: &str, id: &str) -> Result<ResourceResult> {
        if !self.store_config.if_none_match_not_modified {
            return Err(Error::PreconditionFailed(format!(
                "{}/{} already exists (If-None-Match)",
                resource_type, id
            )));
        }
        Ok(ResourceResult {
            resource: self.read(resource_type, id).await?,
            operation: ResourceOperation::NotModified,
        })
    }

    /// Logical delete: writes a delete marker version. Deleting a deleted
    /// resource returns its delete marker without writing.
    pub async fn delete(&self, resource_type: &str, id: &str) -> Result<ResourceResult> {
        validate_type(resource_type)?;
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let current = self
                .store
                .read(resource_type, id)
                .await?
                .ok_or_else(|| Error::ResourceNotFound {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                })?;
            if current.deleted {
                return Ok(ResourceResult {
                    resource: self.to_resource(&current).await?,
                    operation: ResourceOperation::NoOp,
                });
            }

            let version_id = current.version_id + 1;
            let last_updated = now();
            let result = self
                .write_version(VersionWrite {
                    resource_type,
                    logical_id: id,
                    version_id,
                    last_updated,
                    body: None,
                    if_none_match: false,
                })
                .await;

            match result {
                Ok(_) => {
                    self.record("delete", resource_type, started, &Ok::<(), Error>(()));
                    return Ok(ResourceResult {
                        resource: Resource {
                            id: id.to_string(),
                            resource_type: resource_type.to_string(),
                            version_id,
                            resource: JsonValue::Null,
                            last_updated,
                            deleted: true,
                        },
                        operation: ResourceOperation::Deleted,
                    });
                }
                Err(e) if e.is_version_conflict() && attempt < self.store_config.update_retry_count => {
                    metrics::VERSION_CONFLICTS_TOTAL
                        .with_label_values(&[resource_type])
                        .inc();
                    attempt += 1;
                }
                Err(e) => {
                    self.record("delete", resource_type, started, &Err::<(), _>(&e));
                    return Err(e);
                }
            }
        }
    }

    /// Current version. Deleted resources are `ResourceDeleted` (410).
    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Resource> {
        validate_type(resource_type)?;
        match self.store.read(resource_type, id).await? {
            Some(stored) if stored.deleted => Err(Error::ResourceDeleted {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: Some(stored.version_id),
            }),
            Some(stored) => self.to_resource(&stored).await,
            None => Err(Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }),
        }
    }

    pub async fn vread(&self, resource_type: &str, id: &str, version_id: i32) -> Result<Resource> {
        validate_type(resource_type)?;
        match self.store.vread(resource_type, id, version_id).await? {
            Some(stored) if stored.deleted => Err(Error::ResourceDeleted {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: Some(version_id),
            }),
            Some(stored) => self.to_resource(&stored).await,
            None => Err(Error::VersionNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id,
            }),
        }
    }

    /// Instance history, newest first.
    pub async fn history(&self, resource_type: &str, id: &str, query: &HistoryQuery) -> Result<HistoryResult> {
        validate_type(resource_type)?;
        let (versions, total) = self.store.history(resource_type, id, query).await?;
        if total == 0 && self.store.read(resource_type, id).await?.is_none() {
            return Err(Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        }

        let mut entries = Vec::with_capacity(versions.len());
        for version in &versions {
            entries.push(HistoryEntry {
                resource: self.to_resource(version).await?,
                method: history_method(version),
            });
        }
        Ok(HistoryResult {
            entries,
            total: Some(total),
        })
    }

    /// Parse and run a type (`Some`) or system (`None`) search.
    pub async fn search_query(
        &self,
        resource_type: Option<&str>,
        items: &[(String, String)],
        lenient: Option<bool>,
    ) -> Result<(SearchContext, SearchResult)> {
        let context = parse_query(resource_type, items, self.registry(), &self.parse_options(lenient))?;
        let result = self.search(&context).await?;
        Ok((context, result))
    }

    /// `/{compartment}/{id}/{type}`
    pub async fn compartment_search(
        &self,
        compartment: &str,
        compartment_id: &str,
        resource_type: &str,
        items: &[(String, String)],
        lenient: Option<bool>,
    ) -> Result<(SearchContext, SearchResult)> {
        let context = parse_compartment_query(
            compartment,
            compartment_id,
            resource_type,
            items,
            self.registry(),
            &self.parse_options(lenient),
        )?;
        let result = self.search(&context).await?;
        Ok((context, result))
    }

    pub async fn search(&self, context: &SearchContext) -> Result<SearchResult> {
        let started = Instant::now();
        let page = self
            .store
            .search(context, self.search_config.max_include_depth)
            .await?;

        let mut entries = Vec::with_capacity(page.matches.len() + page.includes.len());
        for stored in &page.matches {
            let mut resource = self.to_resource(stored).await?;
            resource.resource = self.shape(context, resource.resource)?;
            entries.push(SearchEntry {
                resource,
                mode: SearchEntryMode::Match,
            });
        }
        for stored in &page.includes {
            entries.push(SearchEntry {
                resource: self.to_resource(stored).await?,
                mode: SearchEntryMode::Include,
            });
        }

        let label = context.resource_type.as_deref().unwrap_or("system");
        metrics::SEARCH_RESULTS
            .with_label_values(&[label])
            .observe(page.matches.len() as f64);
        tracing::debug!(
            resource_type = %label,
            matches = page.matches.len(),
            includes = page.includes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Search executed"
        );

        Ok(SearchResult {
            entries,
            total: page.total,
            has_next: page.has_next,
            warnings: context.warnings.clone(),
        })
    }

    fn shape(&self, context: &SearchContext, resource: JsonValue) -> Result<JsonValue> {
        match context.summary {
            Some(mode) => Ok(summary::apply_summary(resource, mode)),
            None if !context.elements.is_empty() => summary::filter_elements(resource, &context.elements),
            None => Ok(resource),
        }
    }

    pub async fn changes(&self, query: &ChangesQuery) -> Result<Vec<ChangeRecord>> {
        if let Some(rt) = &query.resource_type {
            validate_type(rt)?;
        }
        self.store.changes(query).await
    }

    /// Physically remove one non-current version, or the whole logical
    /// resource. Offloaded payloads are deleted once the erase committed.
    pub async fn erase(&self, resource_type: &str, id: &str, version_id: Option<i32>) -> Result<EraseOutcome> {
        validate_type(resource_type)?;
        let mut tx = self.store.begin().await?;
        let outcome = match tx.erase(resource_type, id, version_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                rollback(tx).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        if self.codec.is_offloading() && !outcome.payload_keys.is_empty() {
            let scope = if outcome.logical_resource_erased { None } else { version_id };
            if let Err(e) = self.codec.erase(resource_type, id, scope).await {
                tracing::warn!(
                    resource_type = %resource_type,
                    id = %id,
                    error = %e,
                    "Failed to delete offloaded payloads of erased resource"
                );
            }
        }
        metrics::record_store_operation(resource_type, "erase", "success");
        tracing::info!(
            resource_type = %resource_type,
            id = %id,
            versions = ?outcome.versions_erased,
            "Erased resource"
        );
        Ok(outcome)
    }

    /// Recompute search values of up to `batch` logical resources not
    /// reindexed since `tstamp`. Values are rewritten only when the
    /// parameter hash changed.
    pub async fn reindex(
        &self,
        batch: usize,
        tstamp: DateTime<Utc>,
        resource_type: Option<&str>,
    ) -> Result<ReindexOutcome> {
        if let Some(rt) = resource_type {
            validate_type(rt)?;
        }
        let candidates = self
            .store
            .reindex_candidates(tstamp, batch, resource_type)
            .await?;

        let mut outcome = ReindexOutcome::default();
        for candidate in candidates {
            // Load the body before locking; the memory store serializes
            // reads behind its writer lock.
            let stored = self
                .store
                .read(&candidate.resource_type, &candidate.logical_id)
                .await?;
            let indexed = match &stored {
                Some(stored) if !stored.deleted => {
                    let body = self.codec.decode(&stored.payload).await?;
                    Some((stored.version_id, self.indexing.index(&candidate.resource_type, &body)))
                }
                _ => None,
            };

            let mut tx = self.store.begin().await?;
            match reindex_one(tx.as_mut(), &candidate, indexed, tstamp).await {
                Ok(rewritten) => {
                    tx.commit().await?;
                    outcome.processed += 1;
                    if rewritten {
                        outcome.reindexed += 1;
                    } else {
                        outcome.unchanged += 1;
                    }
                }
                Err(e) => {
                    rollback(tx).await;
                    return Err(e);
                }
            }
        }

        tracing::info!(
            processed = outcome.processed,
            reindexed = outcome.reindexed,
            unchanged = outcome.unchanged,
            "Reindex batch finished"
        );
        Ok(outcome)
    }

    /// Run one version write in its own transaction. Offloaded payloads of
    /// a write that did not commit are deleted again.
    async fn write_version(&self, write: VersionWrite<'_>) -> Result<StoreOutcome> {
        let indexed = write.body.map(|body| self.indexing.index(write.resource_type, body));
        let payload = match write.body {
            Some(body) => {
                self.codec
                    .encode(write.resource_type, write.logical_id, write.version_id, body)
                    .await?
            }
            None => ResourcePayload::Empty,
        };

        let request = StoreRequest {
            resource_type: write.resource_type.to_string(),
            logical_id: write.logical_id.to_string(),
            version_id: write.version_id,
            last_updated: write.last_updated,
            deleted: write.body.is_none(),
            payload,
            parameter_hash: indexed.as_ref().map(|i| i.hash.clone()),
            if_none_match: write.if_none_match,
        };

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.codec.discard(&request.payload).await;
                return Err(e);
            }
        };

        match self.apply_write(tx.as_mut(), &request, indexed).await {
            Ok(outcome) if outcome.status == InteractionStatus::Modified => match tx.commit().await {
                Ok(()) => Ok(outcome),
                Err(e) => {
                    self.codec.discard(&request.payload).await;
                    Err(e)
                }
            },
            Ok(outcome) => {
                rollback(tx).await;
                self.codec.discard(&request.payload).await;
                Ok(outcome)
            }
            Err(e) => {
                rollback(tx).await;
                self.codec.discard(&request.payload).await;
                Err(e)
            }
        }
    }

    async fn apply_write(
        &self,
        tx: &mut dyn StoreTransaction,
        request: &StoreRequest,
        indexed: Option<IndexedValues>,
    ) -> Result<StoreOutcome> {
        let outcome = tx.store_resource(request).await?;
        if outcome.status != InteractionStatus::Modified {
            return Ok(outcome);
        }
        let Some(indexed) = indexed else {
            return Ok(outcome);
        };

        // The consumer skips messages of superseded versions, so every
        // version hands off its values even when the hash is unchanged.
        if let Some(remote) = &self.remote {
            let transport = SearchParametersTransport::from_values(
                TransportHeader {
                    resource_type: request.resource_type.clone(),
                    logical_id: request.logical_id.clone(),
                    logical_resource_id: outcome.logical_resource_id,
                    version_id: request.version_id,
                    last_updated: request.last_updated,
                    parameter_hash: indexed.hash,
                },
                indexed.values,
            );
            remote.submit(transport).await?;
        } else if outcome.parameters_unchanged(Some(&indexed.hash)) {
            metrics::REINDEX_SKIPPED_TOTAL
                .with_label_values(&[&request.resource_type])
                .inc();
            tracing::debug!(
                resource_type = %request.resource_type,
                id = %request.logical_id,
                version_id = request.version_id,
                "Parameter hash unchanged, search values kept"
            );
        } else {
            metrics::SEARCH_VALUES_WRITTEN
                .with_label_values(&[&request.resource_type])
                .observe(indexed.values.len() as f64);
            tx.replace_search_values(&[IndexedResource {
                logical_resource_id: outcome.logical_resource_id,
                resource_type: request.resource_type.clone(),
                logical_id: request.logical_id.clone(),
                values: indexed.values,
            }])
            .await?;
        }
        Ok(outcome)
    }

    async fn to_resource(&self, stored: &StoredVersion) -> Result<Resource> {
        Ok(Resource {
            id: stored.logical_id.clone(),
            resource_type: stored.resource_type.clone(),
            version_id: stored.version_id,
            resource: self.codec.decode(&stored.payload).await?,
            last_updated: stored.last_updated,
            deleted: stored.deleted,
        })
    }

    fn record<T, E>(&self, operation: &str, resource_type: &str, started: Instant, result: &std::result::Result<T, E>) {
        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::record_store_operation(resource_type, operation, outcome);
        metrics::STORE_OPERATION_DURATION_SECONDS
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
    }
}

/// Returns whether search values were rewritten.
async fn reindex_one(
    tx: &mut dyn StoreTransaction,
    candidate: &LogicalResourceState,
    indexed: Option<(i32, IndexedValues)>,
    tstamp: DateTime<Utc>,
) -> Result<bool> {
    let Some(state) = tx
        .lock_logical_resource(&candidate.resource_type, &candidate.logical_id)
        .await?
    else {
        // Erased since the candidates were selected.
        return Ok(false);
    };

    let rewritten = match indexed {
        // A writer stored a newer version in between and indexed it itself.
        Some((version_id, _)) if version_id != state.version_id => false,
        Some((_, indexed)) if state.parameter_hash.as_deref() != Some(indexed.hash.as_str()) => {
            tx.replace_search_values(&[IndexedResource {
                logical_resource_id: state.logical_resource_id,
                resource_type: state.resource_type.clone(),
                logical_id: state.logical_id.clone(),
                values: indexed.values,
            }])
            .await?;
            tx.update_parameter_hash(state.logical_resource_id, &indexed.hash)
                .await?;
            true
        }
        _ => false,
    };
    tx.mark_reindexed(state.logical_resource_id, tstamp).await?;
    Ok(rewritten)
}

fn validate_type(resource_type: &str) -> Result<()> {
    if is_valid_resource_type(resource_type) {
        Ok(())
    } else {
        Err(Error::Validation(format!("Unknown resource type '{}'", resource_type)))
    }
}

fn validate_id(id: &str) -> Result<()> {
    if is_valid_logical_id(id) {
        Ok(())
    } else {
        Err(Error::InvalidResource(format!("Invalid resource id '{}'", id)))
    }
}

fn validate_resource(resource_type: &str, resource: &JsonValue) -> Result<()> {
    validate_type(resource_type)?;
    let obj = resource
        .as_object()
        .ok_or_else(|| Error::InvalidResource("Resource must be a JSON object".to_string()))?;
    match obj.get("resourceType").and_then(|v| v.as_str()) {
        Some(rt) if rt == resource_type => Ok(()),
        Some(rt) => Err(Error::InvalidResource(format!(
            "Resource type '{}' does not match endpoint type '{}'",
            rt, resource_type
        ))),
        None => Err(Error::InvalidResource("Missing resourceType".to_string())),
    }
}
