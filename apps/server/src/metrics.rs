//! Prometheus metrics for the HTTP surface, the resource store and the
//! background consumers.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
};

lazy_static! {
    // HTTP

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "fhir_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");

    pub static ref HTTP_REQUESTS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "fhir_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
        &["method", "path"]
    )
    .expect("Failed to register HTTP_REQUESTS_IN_FLIGHT");

    // Store

    /// Store operations by resource type, operation and outcome
    /// (`ok`, `conflict`, `not_modified`, `error`).
    pub static ref STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_store_operations_total",
        "Total number of resource store operations",
        &["resource_type", "operation", "outcome"]
    )
    .expect("Failed to register STORE_OPERATIONS_TOTAL");

    pub static ref STORE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "fhir_store_operation_duration_seconds",
        "Resource store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register STORE_OPERATION_DURATION_SECONDS");

    pub static ref VERSION_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_version_conflicts_total",
        "Concurrent updates rejected by the version check",
        &["resource_type"]
    )
    .expect("Failed to register VERSION_CONFLICTS_TOTAL");

    /// Writes whose parameter hash matched the stored one.
    pub static ref REINDEX_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_reindex_skipped_total",
        "Writes that skipped search value replacement because the parameter hash was unchanged",
        &["resource_type"]
    )
    .expect("Failed to register REINDEX_SKIPPED_TOTAL");

    pub static ref SEARCH_VALUES_WRITTEN: HistogramVec = register_histogram_vec!(
        "fhir_search_values_written",
        "Number of search values written per resource",
        &["resource_type"],
        vec![0.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]
    )
    .expect("Failed to register SEARCH_VALUES_WRITTEN");

    pub static ref SEARCH_RESULTS: HistogramVec = register_histogram_vec!(
        "fhir_search_results",
        "Number of match entries returned by search",
        &["resource_type"],
        vec![0.0, 1.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    )
    .expect("Failed to register SEARCH_RESULTS");

    // Remote index

    /// Consumer outcomes: `processed`, `skipped_mismatch`, `skipped_superseded`,
    /// `not_ready`, `expired`.
    pub static ref REMOTE_INDEX_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_remote_index_messages_total",
        "Remote index messages handled by the consumer",
        &["outcome"]
    )
    .expect("Failed to register REMOTE_INDEX_MESSAGES_TOTAL");

    pub static ref REMOTE_INDEX_SUBMITTED_TOTAL: IntCounter = register_int_counter!(
        "fhir_remote_index_submitted_total",
        "Remote index messages submitted by the producer"
    )
    .expect("Failed to register REMOTE_INDEX_SUBMITTED_TOTAL");

    pub static ref REMOTE_INDEX_BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "fhir_remote_index_batch_size",
        "Messages per consumer batch",
        &["worker"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]
    )
    .expect("Failed to register REMOTE_INDEX_BATCH_SIZE");

    // Identity cache

    pub static ref IDENTITY_CACHE_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_identity_cache_lookups_total",
        "Identity cache lookups by cache and result (hit, miss)",
        &["cache", "result"]
    )
    .expect("Failed to register IDENTITY_CACHE_LOOKUPS_TOTAL");

    // Jobs

    pub static ref JOBS_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_jobs_enqueued_total",
        "Total number of jobs enqueued",
        &["job_type"]
    )
    .expect("Failed to register JOBS_ENQUEUED_TOTAL");

    pub static ref JOBS_COMPLETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fhir_jobs_completed_total",
        "Total number of jobs completed",
        &["job_type", "status"]
    )
    .expect("Failed to register JOBS_COMPLETED_TOTAL");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "fhir_job_duration_seconds",
        "Job execution duration in seconds",
        &["job_type"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to register JOB_DURATION_SECONDS");
}

pub fn record_store_operation(resource_type: &str, operation: &str, outcome: &str) {
    STORE_OPERATIONS_TOTAL
        .with_label_values(&[resource_type, operation, outcome])
        .inc();
}

pub fn record_cache_lookup(cache: &str, hit: bool) {
    IDENTITY_CACHE_LOOKUPS_TOTAL
        .with_label_values(&[cache, if hit { "hit" } else { "miss" }])
        .inc();
}

/// Collapse ids out of a request path to keep label cardinality bounded.
pub fn sanitize_path(path: &str) -> String {
    let path = path.strip_prefix("/fhir").unwrap_or(path);
    let segments: Vec<&str> = path.split('/').collect();

    match segments.len() {
        0 | 1 => path.to_string(),
        // /Type, /_history, /$changes
        2 => segments.join("/"),
        3 if segments[2].starts_with('$') || segments[2] == "_search" || segments[2] == "_history" => {
            segments.join("/")
        }
        3 => format!("/{}/{{id}}", segments[1]),
        4 if segments[3] == "_history" => format!("/{}/{{id}}/_history", segments[1]),
        4 if segments[3].starts_with('$') => format!("/{}/{{id}}/{}", segments[1], segments[3]),
        // Compartment search: /Patient/{id}/Observation
        4 => format!("/{}/{{id}}/{}", segments[1], segments[3]),
        5 if segments[3] == "_history" => format!("/{}/{{id}}/_history/{{vid}}", segments[1]),
        _ => format!("/{}", segments[1]),
    }
}
