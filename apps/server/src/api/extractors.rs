//! Custom Axum extractors for FHIR content types.

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value as JsonValue;

/// JSON resource body (`application/fhir+json`, `application/json`, or no
/// content type). Other media types are rejected with 415.
pub struct FhirBody(pub JsonValue);

/// Error type for [`FhirBody`] extraction failures.
pub struct FhirBodyRejection {
    status: StatusCode,
    message: String,
}

impl IntoResponse for FhirBodyRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "error",
                "code": if self.status == StatusCode::UNSUPPORTED_MEDIA_TYPE { "not-supported" } else { "invalid" },
                "diagnostics": self.message,
            }]
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequest<S> for FhirBody
where
    S: Send + Sync,
{
    type Rejection = FhirBodyRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let media_type = content_type.split(';').next().unwrap_or("").trim().to_string();

        if !matches!(media_type.as_str(), "" | "application/fhir+json" | "application/json") {
            return Err(FhirBodyRejection {
                status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
                message: format!("Unsupported content type '{}': only JSON is accepted", media_type),
            });
        }

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| FhirBodyRejection {
                status: StatusCode::BAD_REQUEST,
                message: format!("Failed to read request body: {}", e),
            })?;

        let value: JsonValue = serde_json::from_slice(&bytes).map_err(|e| FhirBodyRejection {
            status: StatusCode::BAD_REQUEST,
            message: format!("Invalid JSON in request body: {}", e),
        })?;

        Ok(FhirBody(value))
    }
}
