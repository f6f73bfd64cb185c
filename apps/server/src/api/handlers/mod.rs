//! Request handlers for API endpoints
//!
//! Handlers parse headers and query items, call the persistence service and
//! shape the HTTP response. Errors render as OperationOutcome through
//! [`crate::Error`].

pub mod crud;
pub mod history;
pub mod metrics;
pub mod operations;
pub mod search;
