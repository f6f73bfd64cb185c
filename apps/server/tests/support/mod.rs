#![allow(dead_code)]

use anyhow::Context as _;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    Router,
};
use meridian::{api::create_router, AppState, Config};
use serde_json::Value;
use tower::ServiceExt as _;

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> anyhow::Result<Self> {
        Self::new_with_config(|_| {})
    }

    /// App on the memory store and in-process job queue.
    pub fn new_with_config(configure: impl FnOnce(&mut Config)) -> anyhow::Result<Self> {
        let mut config = Config::default();
        configure(&mut config);

        let state = AppState::in_memory(config).context("initialize AppState")?;
        let router = create_router(state.clone());
        Ok(Self { router, state })
    }

    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        self.request_with_headers(method, path_and_query, body, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
        extra_headers: &[(&str, &str)],
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(value)?),
            None => Body::empty(),
        };
        self.send(method, path_and_query, body, "application/fhir+json", extra_headers)
            .await
    }

    pub async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        body: Body,
        content_type: &str,
        extra_headers: &[(&str, &str)],
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let mut request = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header("host", "example.org")
            .header("accept", "application/fhir+json")
            .header("content-type", content_type)
            .body(body)
            .context("build request")?;

        for (name, value) in extra_headers {
            request.headers_mut().insert(
                name.parse::<HeaderName>().context("parse header name")?,
                value.parse::<HeaderValue>().context("parse header value")?,
            );
        }

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("dispatch request")?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .context("read response body")?;

        Ok((status, headers, body))
    }

    /// `PUT /fhir/{type}/{id}` that must succeed. Returns the stored body.
    pub async fn put(&self, resource_type: &str, id: &str, resource: &Value) -> anyhow::Result<Value> {
        let (status, _, body) = self
            .request(Method::PUT, &format!("/fhir/{resource_type}/{id}"), Some(resource))
            .await?;
        assert!(
            status == StatusCode::CREATED || status == StatusCode::OK,
            "PUT {resource_type}/{id} failed with {status}: {}",
            String::from_utf8_lossy(&body)
        );
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn get_json(&self, path_and_query: &str) -> anyhow::Result<(StatusCode, Value)> {
        let (status, _, body) = self.request(Method::GET, path_and_query, None).await?;
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).context("parse response JSON")?
        };
        Ok((status, value))
    }
}

pub fn patient(family: &str) -> Value {
    serde_json::json!({
        "resourceType": "Patient",
        "name": [{"family": family, "given": ["Peter"]}],
        "gender": "male",
        "birthDate": "1974-12-25"
    })
}

pub fn observation(subject: &str, code: &str) -> Value {
    serde_json::json!({
        "resourceType": "Observation",
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": code}]},
        "subject": {"reference": subject}
    })
}

pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(actual, expected, "{context}: expected {expected}, got {actual}");
}

pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Bundle entries, empty when the bundle has none.
pub fn entries(bundle: &Value) -> Vec<Value> {
    assert_eq!(bundle["resourceType"], "Bundle", "expected a Bundle: {bundle}");
    bundle["entry"].as_array().cloned().unwrap_or_default()
}

/// Ids of `match` entries of the given type, sorted.
pub fn match_ids(bundle: &Value, resource_type: &str) -> Vec<String> {
    let mut ids: Vec<String> = entries(bundle)
        .iter()
        .filter(|e| e["search"]["mode"] == "match")
        .filter(|e| e["resource"]["resourceType"] == resource_type)
        .filter_map(|e| e["resource"]["id"].as_str().map(str::to_string))
        .collect();
    ids.sort();
    ids
}

pub fn link<'a>(bundle: &'a Value, relation: &str) -> Option<&'a str> {
    bundle["link"]
        .as_array()?
        .iter()
        .find(|l| l["relation"] == relation)
        .and_then(|l| l["url"].as_str())
}

/// First `issue.code` of an OperationOutcome body.
pub fn issue_code(body: &Bytes) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    assert_eq!(value["resourceType"], "OperationOutcome");
    value["issue"][0]["code"].as_str().map(str::to_string)
}
