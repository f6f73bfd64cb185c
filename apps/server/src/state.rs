//! Shared application state

use crate::{
    config::{Config, StoreBackend},
    db::{IdentityCache, MemoryResourceStore, PostgresResourceStore, ResourceStore},
    payload::PayloadCodec,
    queue::{InlineJobQueue, JobQueue, PostgresJobQueue},
    remote_index::RemoteIndexSubmitter,
    services::{IndexingService, PersistenceService},
    Error, Result,
};
use meridian_search::SearchParameterRegistry;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobQueueKind {
    /// Persist jobs in Postgres and rely on background workers.
    Postgres,
    /// Keep jobs in process memory (tests, memory store).
    Inline,
}

#[derive(Debug, Clone)]
pub struct AppStateOptions {
    pub run_migrations: bool,
    pub job_queue: JobQueueKind,
    /// Size the pool with the `worker_pool_*` settings.
    pub worker_pool: bool,
}

impl Default for AppStateOptions {
    fn default() -> Self {
        Self {
            run_migrations: true,
            job_queue: JobQueueKind::Postgres,
            worker_pool: false,
        }
    }
}

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` with the memory store backend
    pub db_pool: Option<PgPool>,
    pub store: Arc<dyn ResourceStore>,
    pub job_queue: Arc<dyn JobQueue>,
    pub persistence: Arc<PersistenceService>,
}

impl AppState {
    /// Initialize the application state
    pub async fn new(config: Config) -> Result<Self> {
        let options = AppStateOptions {
            run_migrations: config.database.run_migrations,
            ..AppStateOptions::default()
        };
        Self::new_with_options(config, options).await
    }

    pub async fn new_with_options(config: Config, options: AppStateOptions) -> Result<Self> {
        tracing::info!(backend = ?config.store.backend, "Initializing application state...");

        let config_arc = Arc::new(config);

        let (db_pool, store): (Option<PgPool>, Arc<dyn ResourceStore>) = match config_arc.store.backend {
            StoreBackend::Postgres => {
                let pool = if options.worker_pool {
                    create_worker_db_pool(config_arc.as_ref()).await?
                } else {
                    create_db_pool(config_arc.as_ref()).await?
                };
                if options.run_migrations {
                    tracing::info!("Running database migrations...");
                    sqlx::migrate!("./migrations")
                        .run(&pool)
                        .await
                        .map_err(|e| Error::Internal(format!("Migration failed: {}", e)))?;
                }
                let cache = Arc::new(IdentityCache::new(&config_arc.identity_cache));
                let store = PostgresResourceStore::new(
                    pool.clone(),
                    cache,
                    config_arc.database.slow_statement_ms,
                );
                store.preload().await?;
                (Some(pool), Arc::new(store))
            }
            StoreBackend::Memory => (None, Arc::new(MemoryResourceStore::new())),
        };

        // Jobs live in the database only when there is one.
        let job_queue: Arc<dyn JobQueue> = match (options.job_queue, &db_pool) {
            (JobQueueKind::Postgres, Some(pool)) => Arc::new(PostgresJobQueue::new(
                pool.clone(),
                config_arc.workers.poll_interval_seconds,
            )),
            (JobQueueKind::Postgres, None) => {
                tracing::warn!("Memory store backend: using the in-process job queue");
                Arc::new(InlineJobQueue::new(config_arc.workers.poll_interval_seconds))
            }
            (JobQueueKind::Inline, _) => {
                Arc::new(InlineJobQueue::new(config_arc.workers.poll_interval_seconds))
            }
        };

        let persistence = build_persistence(config_arc.as_ref(), store.clone(), job_queue.clone())?;

        tracing::info!(
            remote_indexing = persistence.is_remote_indexing(),
            "Application state initialized successfully"
        );

        Ok(Self {
            config: config_arc,
            db_pool,
            store,
            job_queue,
            persistence,
        })
    }

    /// State on the memory store and the in-process job queue. No database
    /// is touched.
    pub fn in_memory(mut config: Config) -> Result<Self> {
        config.store.backend = StoreBackend::Memory;
        let config_arc = Arc::new(config);
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryResourceStore::new());
        let job_queue: Arc<dyn JobQueue> =
            Arc::new(InlineJobQueue::new(config_arc.workers.poll_interval_seconds));
        let persistence = build_persistence(config_arc.as_ref(), store.clone(), job_queue.clone())?;
        Ok(Self {
            config: config_arc,
            db_pool: None,
            store,
            job_queue,
            persistence,
        })
    }
}

fn build_persistence(
    config: &Config,
    store: Arc<dyn ResourceStore>,
    job_queue: Arc<dyn JobQueue>,
) -> Result<Arc<PersistenceService>> {
    let registry = Arc::new(load_registry(config)?);
    let indexing = Arc::new(IndexingService::new(registry));
    let codec = PayloadCodec::from_config(&config.payload)?;

    let remote = config.remote_index.enabled.then(|| {
        let submitter = RemoteIndexSubmitter::new(job_queue, &config.remote_index);
        tracing::info!(
            instance_id = %submitter.instance_id(),
            tenant = %config.remote_index.tenant,
            "Remote indexing enabled"
        );
        Arc::new(submitter)
    });

    Ok(Arc::new(PersistenceService::new(
        store,
        codec,
        indexing,
        remote,
        config.store.clone(),
        config.search.clone(),
    )))
}

/// Built-in search parameters plus the configured definition files.
pub fn load_registry(config: &Config) -> Result<SearchParameterRegistry> {
    let mut registry = SearchParameterRegistry::with_builtin()?;

    if let Some(path) = &config.search.search_parameters_file {
        let loaded = registry.load(&read_json(path)?)?;
        tracing::info!(path = %path, loaded, "Loaded search parameter definitions");
    }
    if let Some(path) = &config.search.compartments_file {
        registry.load_compartments(&read_json(path)?)?;
        tracing::info!(path = %path, "Loaded compartment definitions");
    }

    Ok(registry)
}

fn read_json(path: &str) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("Failed to read {}: {}", path, e)))?;
    serde_json::from_str(&text).map_err(|e| Error::Internal(format!("Failed to parse {}: {}", path, e)))
}

/// Connection pool for the server. Every connection gets the configured
/// statement and lock timeouts.
pub async fn create_db_pool(config: &Config) -> Result<PgPool> {
    connect_pool(
        config,
        config.database.pool_min_size,
        config.database.pool_max_size,
        config.database.pool_timeout_seconds,
    )
    .await
}

/// Smaller pool for the standalone worker process.
pub async fn create_worker_db_pool(config: &Config) -> Result<PgPool> {
    connect_pool(
        config,
        config.database.worker_pool_min_size,
        config.database.worker_pool_max_size,
        config.database.worker_pool_timeout_seconds,
    )
    .await
}

async fn connect_pool(config: &Config, min: u32, max: u32, timeout_seconds: u64) -> Result<PgPool> {
    tracing::info!("Creating database connection pool...");

    let statement_timeout = config.database.statement_timeout_seconds;
    let lock_timeout = config.database.lock_timeout_seconds;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(min)
        .max_connections(max)
        .acquire_timeout(std::time::Duration::from_secs(timeout_seconds))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = '{}s'", statement_timeout))
                    .execute(&mut *conn)
                    .await?;

                // Fail fast on lock waits; writers retry on conflict.
                sqlx::query(&format!("SET lock_timeout = '{}s'", lock_timeout))
                    .execute(&mut *conn)
                    .await?;

                Ok(())
            })
        })
        .connect(&config.database.url)
        .await
        .map_err(Error::Database)?;

    tracing::info!("Database pool created (min: {}, max: {})", min, max);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_state_without_database() {
        let state = AppState::in_memory(Config::default()).unwrap();
        assert!(state.db_pool.is_none());
        assert!(!state.persistence.is_remote_indexing());
    }

    #[test]
    fn remote_indexing_follows_config() {
        let mut config = Config::default();
        config.remote_index.enabled = true;
        let state = AppState::in_memory(config).unwrap();
        assert!(state.persistence.is_remote_indexing());
    }

    #[test]
    fn missing_definition_file_fails() {
        let mut config = Config::default();
        config.search.search_parameters_file = Some("/nonexistent/search-parameters.json".into());
        assert!(load_registry(&config).is_err());
    }
}
