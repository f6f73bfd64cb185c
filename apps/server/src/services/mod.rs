//! Business logic layer
//!
//! Services orchestrate store, payload codec, indexing and the remote
//! index handoff for the API handlers and workers.

pub mod indexing;
pub mod persistence;
pub mod summary;

pub use indexing::IndexingService;
pub use persistence::PersistenceService;
