//! Background workers for asynchronous processing
//!
//! Workers consume the job queue. Each worker type handles specific job
//! types:
//! - [`RemoteIndexWorker`]: `remote_index` messages, in batches
//! - [`ReindexWorker`]: `reindex` runs

mod base;
mod reindex_worker;
mod remote_index_worker;
mod runner;

pub use base::Worker;
pub use reindex_worker::ReindexWorker;
pub use remote_index_worker::RemoteIndexWorker;
pub use runner::{
    drain, jittered_duration, run_worker, run_worker_with_config, spawn_workers_with_config,
    WorkerRunnerConfig,
};

use crate::{config::Config, db::ResourceStore, queue::JobQueue, services::PersistenceService};
use std::sync::Arc;

/// Create all configured workers. The remote index consumer only runs when
/// remote indexing is enabled.
pub fn create_workers(
    config: &Config,
    store: Arc<dyn ResourceStore>,
    job_queue: Arc<dyn JobQueue>,
    persistence: Arc<PersistenceService>,
) -> Vec<Box<dyn Worker>> {
    let mut workers: Vec<Box<dyn Worker>> = Vec::with_capacity(2);

    if config.remote_index.enabled {
        workers.push(Box::new(RemoteIndexWorker::new(
            job_queue.clone(),
            store,
            &config.remote_index,
        )));
    }

    workers.push(Box::new(ReindexWorker::new(job_queue, persistence)));

    workers
}
