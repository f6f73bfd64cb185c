//! PostgreSQL resource store.
//!
//! Writers serialize on the `logical_resource_ident` row of the resource
//! (`SELECT ... FOR UPDATE`), which exists before the logical resource does.
//! Identities resolved inside a transaction are published to the shared
//! [`IdentityCache`] only after commit.

pub mod search;
pub(crate) mod values;

use super::identity_cache::{IdentityCache, LogicalResourceKey, PendingIdentities};
use super::traits::{ResourceStore, StoreTransaction};
use crate::models::{
    ChangeRecord, ChangeType, ChangesQuery, EraseOutcome, ExtractedParameterValue, HistoryQuery,
    IndexedResource, InteractionStatus, LogicalResourceState, ResourcePayload, SearchPage,
    StoreOutcome, StoreRequest, StoredVersion,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meridian_search::SearchContext;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const VERSION_SELECT: &str = "SELECT r.logical_resource_id, rt.resource_type, lr.logical_id, r.version_id,
            r.last_updated, r.is_deleted, r.data, r.payload_key
     FROM resources r
     JOIN logical_resources lr ON lr.logical_resource_id = r.logical_resource_id
     JOIN resource_types rt ON rt.resource_type_id = lr.resource_type_id";

const STATE_SELECT: &str = "SELECT lr.logical_resource_id, rt.resource_type, lr.logical_id, lr.current_version,
            lr.last_updated, lr.is_deleted, lr.parameter_hash, lr.reindex_tstamp
     FROM logical_resources lr
     JOIN resource_types rt ON rt.resource_type_id = lr.resource_type_id";

fn version_from_row(row: &PgRow) -> Result<StoredVersion> {
    let data: Option<Vec<u8>> = row.try_get("data")?;
    let payload_key: Option<String> = row.try_get("payload_key")?;
    let payload = match (data, payload_key) {
        (Some(bytes), _) => ResourcePayload::Inline(bytes),
        (None, Some(key)) => ResourcePayload::Offloaded { key },
        (None, None) => ResourcePayload::Empty,
    };
    Ok(StoredVersion {
        logical_resource_id: row.try_get("logical_resource_id")?,
        resource_type: row.try_get("resource_type")?,
        logical_id: row.try_get("logical_id")?,
        version_id: row.try_get("version_id")?,
        last_updated: row.try_get("last_updated")?,
        deleted: row.try_get("is_deleted")?,
        payload,
    })
}

fn state_from_row(row: &PgRow) -> Result<LogicalResourceState> {
    Ok(LogicalResourceState {
        logical_resource_id: row.try_get("logical_resource_id")?,
        resource_type: row.try_get("resource_type")?,
        logical_id: row.try_get("logical_id")?,
        version_id: row.try_get("current_version")?,
        last_updated: row.try_get("last_updated")?,
        deleted: row.try_get("is_deleted")?,
        parameter_hash: row.try_get("parameter_hash")?,
        reindex_tstamp: row.try_get("reindex_tstamp")?,
    })
}

fn split_payload(payload: &ResourcePayload) -> (Option<&[u8]>, Option<&str>) {
    match payload {
        ResourcePayload::Inline(bytes) => (Some(bytes.as_slice()), None),
        ResourcePayload::Offloaded { key } => (None, Some(key.as_str())),
        ResourcePayload::Empty => (None, None),
    }
}

/// Current versions of `ids`, in the order of `ids`.
pub(crate) async fn load_current_versions(conn: &mut PgConnection, ids: &[i64]) -> Result<Vec<StoredVersion>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("{VERSION_SELECT} WHERE r.logical_resource_id = ANY($1) AND r.version_id = lr.current_version");
    let rows = sqlx::query(&sql)
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;
    let mut by_id = HashMap::with_capacity(rows.len());
    for row in &rows {
        let version = version_from_row(row)?;
        by_id.insert(version.logical_resource_id, version);
    }
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

#[derive(Clone)]
pub struct PostgresResourceStore {
    pool: PgPool,
    cache: Arc<IdentityCache>,
    slow_statement: Duration,
}

impl PostgresResourceStore {
    pub fn new(pool: PgPool, cache: Arc<IdentityCache>, slow_statement_ms: u64) -> Self {
        Self {
            pool,
            cache,
            slow_statement: Duration::from_millis(slow_statement_ms),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Load every known resource type id into the identity cache.
    pub async fn preload(&self) -> Result<()> {
        let rows: Vec<(String, i32)> = sqlx::query_as("SELECT resource_type, resource_type_id FROM resource_types")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        self.cache.preload_resource_types(rows);
        Ok(())
    }

    async fn logical_resource_id(&self, resource_type: &str, logical_id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT lr.logical_resource_id
             FROM logical_resources lr
             JOIN resource_types rt ON rt.resource_type_id = lr.resource_type_id
             WHERE rt.resource_type = $1 AND lr.logical_id = $2",
        )
        .bind(resource_type)
        .bind(logical_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)
    }
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(Error::Database)?;
        Ok(Box::new(PostgresTransaction {
            tx: Some(tx),
            cache: self.cache.clone(),
            pending: PendingIdentities::default(),
            evicted: Vec::new(),
        }))
    }

    async fn read(&self, resource_type: &str, logical_id: &str) -> Result<Option<StoredVersion>> {
        let sql = format!(
            "{VERSION_SELECT} WHERE rt.resource_type = $1 AND lr.logical_id = $2 AND r.version_id = lr.current_version"
        );
        let row = sqlx::query(&sql)
            .bind(resource_type)
            .bind(logical_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn vread(&self, resource_type: &str, logical_id: &str, version_id: i32) -> Result<Option<StoredVersion>> {
        let sql = format!("{VERSION_SELECT} WHERE rt.resource_type = $1 AND lr.logical_id = $2 AND r.version_id = $3");
        let row = sqlx::query(&sql)
            .bind(resource_type)
            .bind(logical_id)
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn history(
        &self,
        resource_type: &str,
        logical_id: &str,
        query: &HistoryQuery,
    ) -> Result<(Vec<StoredVersion>, i64)> {
        let filter = "WHERE rt.resource_type = $1 AND lr.logical_id = $2
               AND ($3::timestamptz IS NULL OR r.last_updated >= $3)";
        let sql = format!("{VERSION_SELECT} {filter} ORDER BY r.version_id DESC LIMIT $4 OFFSET $5");
        let rows = sqlx::query(&sql)
            .bind(resource_type)
            .bind(logical_id)
            .bind(query.since)
            .bind(query.count as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        let versions = rows.iter().map(version_from_row).collect::<Result<Vec<_>>>()?;

        let count_sql = format!(
            "SELECT COUNT(*) FROM resources r
             JOIN logical_resources lr ON lr.logical_resource_id = r.logical_resource_id
             JOIN resource_types rt ON rt.resource_type_id = lr.resource_type_id
             {filter}"
        );
        let total: i64 = sqlx::query_scalar(&count_sql)
            .bind(resource_type)
            .bind(logical_id)
            .bind(query.since)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok((versions, total))
    }

    async fn changes(&self, query: &ChangesQuery) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query(
            "SELECT c.change_id, rt.resource_type, c.logical_id, c.version_id, c.change_type, c.changed_at
             FROM resource_change_log c
             JOIN resource_types rt ON rt.resource_type_id = c.resource_type_id
             WHERE ($1::bigint IS NULL OR c.change_id > $1)
               AND ($2::timestamptz IS NULL OR c.changed_at >= $2)
               AND ($3::text IS NULL OR rt.resource_type = $3)
             ORDER BY c.change_id
             LIMIT $4",
        )
        .bind(query.after_id)
        .bind(query.since)
        .bind(query.resource_type.as_deref())
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| {
                let code: String = row.try_get("change_type")?;
                let change_type = ChangeType::from_code(code.trim())
                    .ok_or_else(|| Error::Internal(format!("Unknown change type '{code}'")))?;
                Ok(ChangeRecord {
                    change_id: row.try_get("change_id")?,
                    resource_type: row.try_get("resource_type")?,
                    logical_id: row.try_get("logical_id")?,
                    version_id: row.try_get("version_id")?,
                    change_type,
                    changed_at: row.try_get("changed_at")?,
                })
            })
            .collect()
    }

    async fn search(&self, context: &SearchContext, max_include_depth: usize) -> Result<SearchPage> {
        super::check_supported(context)?;
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        search::execute(&mut conn, context, max_include_depth, self.slow_statement).await
    }

    async fn retrieve_index(&self, resource_type: &str, logical_id: &str) -> Result<Vec<ExtractedParameterValue>> {
        let Some(id) = self.logical_resource_id(resource_type, logical_id).await? else {
            return Ok(Vec::new());
        };
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        values::read_values(&mut conn, id).await
    }

    async fn logical_resource_state(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<LogicalResourceState>> {
        let sql = format!("{STATE_SELECT} WHERE rt.resource_type = $1 AND lr.logical_id = $2");
        let row = sqlx::query(&sql)
            .bind(resource_type)
            .bind(logical_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn reindex_candidates(
        &self,
        before: DateTime<Utc>,
        batch: usize,
        resource_type: Option<&str>,
    ) -> Result<Vec<LogicalResourceState>> {
        let sql = format!(
            "{STATE_SELECT}
             WHERE NOT lr.is_deleted
               AND (lr.reindex_tstamp IS NULL OR lr.reindex_tstamp < $1)
               AND ($2::text IS NULL OR rt.resource_type = $2)
             ORDER BY lr.reindex_tstamp NULLS FIRST, lr.logical_resource_id
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(before)
            .bind(resource_type)
            .bind(batch as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(state_from_row).collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}

pub struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    cache: Arc<IdentityCache>,
    pending: PendingIdentities,
    /// Identities removed by erase, evicted from the cache on commit
    evicted: Vec<LogicalResourceKey>,
}

impl PostgresTransaction {
    fn tx_mut(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| Error::Internal("Transaction already committed or rolled back".to_string()))
    }

    /// Split borrow of the connection and the identity state.
    fn parts(&mut self) -> Result<(&mut PgConnection, &IdentityCache, &mut PendingIdentities)> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::Internal("Transaction already committed or rolled back".to_string()))?;
        Ok((&mut **tx, &self.cache, &mut self.pending))
    }

    async fn insert_change(&mut self, logical_resource_id: i64, resource_type_id: i32, request: &StoreRequest, change_type: ChangeType) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO resource_change_log
                (logical_resource_id, resource_type_id, logical_id, version_id, change_type, changed_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(logical_resource_id)
        .bind(resource_type_id)
        .bind(&request.logical_id)
        .bind(request.version_id)
        .bind(change_type.as_code())
        .bind(request.last_updated)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn store_resource(&mut self, request: &StoreRequest) -> Result<StoreOutcome> {
        let (conn, cache, pending) = self.parts()?;
        let resource_type_id = values::resolve_resource_type(conn, cache, pending, &request.resource_type).await?;

        sqlx::query(
            "INSERT INTO logical_resource_ident (resource_type_id, logical_id)
             VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(resource_type_id)
        .bind(&request.logical_id)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;

        let logical_resource_id: i64 = sqlx::query_scalar(
            "SELECT logical_resource_id FROM logical_resource_ident
             WHERE resource_type_id = $1 AND logical_id = $2
             FOR UPDATE",
        )
        .bind(resource_type_id)
        .bind(&request.logical_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;
        pending.logical_resources.insert(
            (request.resource_type.clone(), request.logical_id.clone()),
            logical_resource_id,
        );

        let existing: Option<(i32, bool, Option<String>)> = sqlx::query_as(
            "SELECT current_version, is_deleted, parameter_hash
             FROM logical_resources WHERE logical_resource_id = $1",
        )
        .bind(logical_resource_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?;

        let (previous_hash, created) = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO logical_resources
                        (logical_resource_id, resource_type_id, logical_id, current_version, is_deleted, last_updated, parameter_hash)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(logical_resource_id)
                .bind(resource_type_id)
                .bind(&request.logical_id)
                .bind(request.version_id)
                .bind(request.deleted)
                .bind(request.last_updated)
                .bind(request.parameter_hash.as_deref())
                .execute(&mut *conn)
                .await
                .map_err(Error::Database)?;
                (None, true)
            }
            Some((current_version, deleted, parameter_hash)) => {
                if request.if_none_match && !deleted {
                    return Ok(StoreOutcome {
                        logical_resource_id,
                        status: InteractionStatus::IfNoneMatchExisted,
                        previous_parameter_hash: parameter_hash,
                        version_id: current_version,
                        created: false,
                    });
                }
                if request.version_id <= current_version {
                    return Err(Error::VersionConflict {
                        resource_type: request.resource_type.clone(),
                        id: request.logical_id.clone(),
                        requested: request.version_id,
                        current: current_version,
                    });
                }
                let unchanged = matches!(
                    (parameter_hash.as_deref(), request.parameter_hash.as_deref()),
                    (Some(a), Some(b)) if a == b
                );
                if !unchanged {
                    values::delete_values(conn, &[logical_resource_id]).await?;
                }
                sqlx::query(
                    "UPDATE logical_resources
                     SET current_version = $2, is_deleted = $3, last_updated = $4, parameter_hash = $5
                     WHERE logical_resource_id = $1",
                )
                .bind(logical_resource_id)
                .bind(request.version_id)
                .bind(request.deleted)
                .bind(request.last_updated)
                .bind(request.parameter_hash.as_deref())
                .execute(&mut *conn)
                .await
                .map_err(Error::Database)?;
                (parameter_hash, deleted)
            }
        };

        let (data, payload_key) = split_payload(&request.payload);
        sqlx::query(
            "INSERT INTO resources (logical_resource_id, version_id, last_updated, is_deleted, data, payload_key)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(logical_resource_id)
        .bind(request.version_id)
        .bind(request.last_updated)
        .bind(request.deleted)
        .bind(data)
        .bind(payload_key)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;

        let change_type = if request.deleted {
            ChangeType::Delete
        } else if created {
            ChangeType::Create
        } else {
            ChangeType::Update
        };
        self.insert_change(logical_resource_id, resource_type_id, request, change_type)
            .await?;

        Ok(StoreOutcome {
            logical_resource_id,
            status: InteractionStatus::Modified,
            previous_parameter_hash: previous_hash,
            version_id: request.version_id,
            created,
        })
    }

    async fn replace_search_values(&mut self, resources: &[IndexedResource]) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        let (conn, cache, pending) = self.parts()?;
        let ids = values::resolve_identities(conn, cache, pending, resources).await?;
        let logical_resource_ids: Vec<i64> = resources.iter().map(|r| r.logical_resource_id).collect();
        values::delete_values(conn, &logical_resource_ids).await?;
        let written = values::insert_values(conn, resources, &ids).await?;
        tracing::debug!(
            resources = resources.len(),
            rows = written,
            "Replaced search values"
        );
        Ok(())
    }

    async fn update_parameter_hash(&mut self, logical_resource_id: i64, parameter_hash: &str) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("UPDATE logical_resources SET parameter_hash = $2 WHERE logical_resource_id = $1")
            .bind(logical_resource_id)
            .bind(parameter_hash)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn lock_logical_resource(
        &mut self,
        resource_type: &str,
        logical_id: &str,
    ) -> Result<Option<LogicalResourceState>> {
        let tx = self.tx_mut()?;
        let sql = format!("{STATE_SELECT} WHERE rt.resource_type = $1 AND lr.logical_id = $2 FOR UPDATE OF lr");
        let row = sqlx::query(&sql)
            .bind(resource_type)
            .bind(logical_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn mark_reindexed(&mut self, logical_resource_id: i64, tstamp: DateTime<Utc>) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("UPDATE logical_resources SET reindex_tstamp = $2 WHERE logical_resource_id = $1")
            .bind(logical_resource_id)
            .bind(tstamp)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn erase(
        &mut self,
        resource_type: &str,
        logical_id: &str,
        version_id: Option<i32>,
    ) -> Result<EraseOutcome> {
        let state = self
            .lock_logical_resource(resource_type, logical_id)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: logical_id.to_string(),
            })?;
        let id = state.logical_resource_id;
        let tx = self.tx_mut()?;

        if let Some(v) = version_id {
            if v == state.version_id {
                return Err(Error::Validation(format!(
                    "Version {v} is the current version of {resource_type}/{logical_id}; erase the resource instead"
                )));
            }
        }

        let erased: Vec<(i32, Option<String>)> = sqlx::query_as(
            "DELETE FROM resources
             WHERE logical_resource_id = $1 AND ($2::int IS NULL OR version_id = $2)
             RETURNING version_id, payload_key",
        )
        .bind(id)
        .bind(version_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
        if let (Some(v), true) = (version_id, erased.is_empty()) {
            return Err(Error::VersionNotFound {
                resource_type: resource_type.to_string(),
                id: logical_id.to_string(),
                version_id: v,
            });
        }

        sqlx::query(
            "DELETE FROM resource_change_log
             WHERE logical_resource_id = $1 AND ($2::int IS NULL OR version_id = $2)",
        )
        .bind(id)
        .bind(version_id)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        let logical_resource_erased = version_id.is_none();
        if logical_resource_erased {
            values::delete_values(&mut **tx, &[id]).await?;
            sqlx::query("DELETE FROM logical_resources WHERE logical_resource_id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
            // The identity stays while other resources still reference it.
            let removed = sqlx::query(
                "DELETE FROM logical_resource_ident
                 WHERE logical_resource_id = $1
                   AND NOT EXISTS (SELECT 1 FROM ref_values WHERE ref_logical_resource_id = $1)",
            )
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();
            if removed > 0 {
                let key = (resource_type.to_string(), logical_id.to_string());
                self.pending.logical_resources.remove(&key);
                self.evicted.push(key);
            }
        }

        let mut versions_erased: Vec<i32> = erased.iter().map(|(v, _)| *v).collect();
        versions_erased.sort_unstable();
        Ok(EraseOutcome {
            resource_type: resource_type.to_string(),
            logical_id: logical_id.to_string(),
            versions_erased,
            logical_resource_erased,
            payload_keys: erased.into_iter().filter_map(|(_, key)| key).collect(),
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Internal("Transaction already committed".to_string()))?;
        tx.commit().await.map_err(Error::Database)?;

        for key in &self.evicted {
            self.cache.evict_logical_resource(key);
        }
        self.cache.publish(std::mem::take(&mut self.pending));
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Internal("Transaction already rolled back".to_string()))?;
        tx.rollback().await.map_err(Error::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_columns_are_exclusive() {
        let inline = ResourcePayload::Inline(vec![1, 2]);
        assert_eq!(split_payload(&inline), (Some(&[1u8, 2][..]), None));
        let offloaded = ResourcePayload::Offloaded { key: "Patient/p1/1".into() };
        assert_eq!(split_payload(&offloaded), (None, Some("Patient/p1/1")));
        assert_eq!(split_payload(&ResourcePayload::Empty), (None, None));
    }
}
