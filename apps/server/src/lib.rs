//! Meridian - FHIR resource persistence and search engine
//!
//! - Versioned resource store with optimistic concurrency over logical
//!   resources (Postgres, or in memory)
//! - Search parameter extraction with parameter hash deduplication
//! - Remote indexing handoff through the job queue
//! - Payload compression and blob offload
//! - FHIR REST API on axum

#![allow(
    clippy::too_many_arguments,      // Store and service operations carry many inputs
    clippy::type_complexity,         // Complex types are acceptable when they represent domain concepts
    clippy::large_enum_variant,      // Large enum variants acceptable; boxing may impact performance
)]

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod payload;
pub mod queue;
pub mod remote_index;
pub mod services;
pub mod state;
pub mod workers;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;
