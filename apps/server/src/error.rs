//! Error types for the persistence engine and HTTP surface

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use meridian_search::SearchError;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Resource not found: {resource_type}/{id}")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Resource deleted: {resource_type}/{id}")]
    ResourceDeleted {
        resource_type: String,
        id: String,
        version_id: Option<i32>,
    },

    #[error("Version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: i32,
    },

    /// Another writer stored `current` (or later) before this request could
    /// store `requested`.
    #[error("Concurrent update of {resource_type}/{id}: requested version {requested}, current version {current}")]
    VersionConflict {
        resource_type: String,
        id: String,
        requested: i32,
        current: i32,
    },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Remote index error: {0}")]
    RemoteIndex(String),

    #[error("Job queue error: {0}")]
    JobQueue(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        Error::Payload(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_message, etag) = match &self {
            Error::ResourceNotFound { .. } | Error::NotFound(_) | Error::VersionNotFound { .. } => {
                (StatusCode::NOT_FOUND, self.to_string(), None)
            }
            Error::ResourceDeleted { version_id, .. } => {
                (StatusCode::GONE, self.to_string(), *version_id)
            }
            Error::InvalidResource(_) | Error::Validation(_) | Error::Search(_) => {
                (StatusCode::BAD_REQUEST, self.to_string(), None)
            }
            Error::MethodNotAllowed(_) => (StatusCode::METHOD_NOT_ALLOWED, self.to_string(), None),
            Error::VersionConflict { .. } => (StatusCode::CONFLICT, self.to_string(), None),
            Error::PreconditionFailed(_) => {
                (StatusCode::PRECONDITION_FAILED, self.to_string(), None)
            }
            Error::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, self.to_string(), None),
            Error::Database(_)
            | Error::Payload(_)
            | Error::RemoteIndex(_)
            | Error::JobQueue(_)
            | Error::Internal(_)
            | Error::Other(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = Json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "error",
                "code": status_to_fhir_code(status),
                "diagnostics": error_message
            }]
        }));

        let mut response = (status, body).into_response();

        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/fhir+json; charset=utf-8"),
        );

        // Deleted resources carry the ETag of the delete marker.
        if let Some(version_id) = etag {
            if let Ok(header_value) = format!("W/\"{}\"", version_id).parse() {
                response.headers_mut().insert(header::ETAG, header_value);
            }
        }

        response
    }
}

fn status_to_fhir_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid",
        StatusCode::NOT_FOUND => "not-found",
        StatusCode::GONE => "deleted",
        StatusCode::METHOD_NOT_ALLOWED => "not-supported",
        StatusCode::CONFLICT => "conflict",
        StatusCode::PRECONDITION_FAILED => "conflict",
        StatusCode::NOT_IMPLEMENTED => "not-supported",
        _ => "exception",
    }
}
