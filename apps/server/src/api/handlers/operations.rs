//! Operation handlers
//!
//! - `POST /$reindex`: recompute search values of resources not reindexed
//!   since a timestamp. Runs one batch inline, or the whole pass as a
//!   background job with `Prefer: respond-async`.
//! - `POST /{type}/{id}/$erase`: physically remove a resource or one of its
//!   non-current versions.

use super::crud::fhir_json;
use crate::{
    queue::{JobPriority, ReindexJobParams, REINDEX_JOB},
    state::AppState,
    Error, Result,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use validator::Validate;

/// Batch size when `resourceCount` is not given.
const DEFAULT_REINDEX_BATCH: usize = 10;

#[derive(Debug, Default, Validate)]
struct ReindexRequest {
    tstamp: Option<DateTime<Utc>>,
    #[validate(length(min = 1, max = 64))]
    resource_type: Option<String>,
    #[validate(range(min = 1, max = 1000))]
    resource_count: Option<usize>,
}

/// Named values of a `Parameters` body. An empty body is an empty list.
fn parameters(body: &Bytes) -> Result<Vec<(String, JsonValue)>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidResource(format!("Invalid JSON in request body: {}", e)))?;
    if value.get("resourceType").and_then(|v| v.as_str()) != Some("Parameters") {
        return Err(Error::InvalidResource(
            "Operation input must be a Parameters resource".to_string(),
        ));
    }

    let params = value
        .get("parameter")
        .and_then(|p| p.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get("name")?.as_str()?.to_string();
                    let value = item
                        .as_object()?
                        .iter()
                        .find(|(k, _)| k.starts_with("value"))
                        .map(|(_, v)| v.clone())?;
                    Some((name, value))
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(params)
}

impl ReindexRequest {
    fn from_parameters(params: &[(String, JsonValue)]) -> Result<Self> {
        let mut request = Self::default();
        for (name, value) in params {
            match name.as_str() {
                "tstamp" => {
                    let raw = value.as_str().unwrap_or_default();
                    let tstamp = DateTime::parse_from_rfc3339(raw).map_err(|_| {
                        Error::Validation(format!("Invalid tstamp '{}': expected an instant", raw))
                    })?;
                    request.tstamp = Some(tstamp.with_timezone(&Utc));
                }
                "resourceType" => request.resource_type = value.as_str().map(str::to_string),
                "resourceCount" => {
                    request.resource_count = Some(
                        value
                            .as_u64()
                            .ok_or_else(|| Error::Validation("resourceCount must be an integer".to_string()))?
                            as usize,
                    );
                }
                other => {
                    return Err(Error::Validation(format!("Unknown $reindex parameter '{}'", other)));
                }
            }
        }
        request
            .validate()
            .map_err(|e| Error::Validation(format!("Invalid $reindex request: {}", e)))?;
        Ok(request)
    }
}

fn prefers_async(headers: &HeaderMap) -> bool {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("respond-async"))
}

/// POST /$reindex
pub async fn reindex(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let request = ReindexRequest::from_parameters(&parameters(&body)?)?;
    let tstamp = request.tstamp.unwrap_or_else(Utc::now);
    let batch_size = request.resource_count.unwrap_or(DEFAULT_REINDEX_BATCH);

    if prefers_async(&headers) {
        let job_params = ReindexJobParams {
            tstamp,
            resource_type: request.resource_type.clone(),
            batch_size,
        };
        let job_id = state
            .job_queue
            .enqueue(
                REINDEX_JOB.to_string(),
                serde_json::to_value(&job_params)
                    .map_err(|e| Error::Internal(format!("Failed to encode reindex job: {}", e)))?,
                JobPriority::Low,
                None,
            )
            .await?;
        tracing::info!(job_id = %job_id, tstamp = %tstamp, "Reindex job enqueued");

        let outcome = json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "information",
                "code": "informational",
                "diagnostics": format!("Reindex job {} accepted", job_id)
            }]
        });
        return Ok(fhir_json(StatusCode::ACCEPTED, &outcome));
    }

    let outcome = state
        .persistence
        .reindex(batch_size, tstamp, request.resource_type.as_deref())
        .await?;

    let body = json!({
        "resourceType": "Parameters",
        "parameter": [
            {"name": "processed", "valueInteger": outcome.processed},
            {"name": "reindexed", "valueInteger": outcome.reindexed},
            {"name": "unchanged", "valueInteger": outcome.unchanged}
        ]
    });
    Ok(fhir_json(StatusCode::OK, &body))
}

/// POST /{type}/{id}/$erase
///
/// An optional `version` parameter erases one non-current version.
pub async fn erase(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response> {
    let mut version_id = None;
    for (name, value) in parameters(&body)? {
        match name.as_str() {
            "version" => {
                version_id = Some(
                    value
                        .as_i64()
                        .and_then(|v| i32::try_from(v).ok())
                        .filter(|v| *v >= 1)
                        .ok_or_else(|| Error::Validation("version must be a positive integer".to_string()))?,
                );
            }
            other => return Err(Error::Validation(format!("Unknown $erase parameter '{}'", other))),
        }
    }

    let outcome = state.persistence.erase(&resource_type, &id, version_id).await?;

    let mut parameter = vec![json!({
        "name": "resourceErased",
        "valueBoolean": outcome.logical_resource_erased
    })];
    parameter.extend(
        outcome
            .versions_erased
            .iter()
            .map(|v| json!({"name": "versionErased", "valueInteger": v})),
    );
    let body = json!({"resourceType": "Parameters", "parameter": parameter});
    Ok(fhir_json(StatusCode::OK, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(value: JsonValue) -> Bytes {
        Bytes::from(value.to_string())
    }

    #[test]
    fn reindex_parameters_are_validated() {
        let params = parameters(&body(json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "tstamp", "valueString": "2024-01-01T00:00:00Z"},
                {"name": "resourceType", "valueString": "Patient"},
                {"name": "resourceCount", "valueInteger": 50}
            ]
        })))
        .unwrap();
        let request = ReindexRequest::from_parameters(&params).unwrap();
        assert_eq!(request.resource_count, Some(50));
        assert_eq!(request.resource_type.as_deref(), Some("Patient"));

        let too_many = vec![("resourceCount".to_string(), json!(5000))];
        assert!(ReindexRequest::from_parameters(&too_many).is_err());
    }

    #[test]
    fn empty_body_has_no_parameters() {
        assert!(parameters(&Bytes::new()).unwrap().is_empty());
        assert!(parameters(&body(json!({"resourceType": "Patient"}))).is_err());
    }

    #[test]
    fn respond_async_preference() {
        let mut headers = HeaderMap::new();
        headers.insert("prefer", "respond-async".parse().unwrap());
        assert!(prefers_async(&headers));
        assert!(!prefers_async(&HeaderMap::new()));
    }
}
