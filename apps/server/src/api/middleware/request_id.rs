//! Request ID middleware with OpenTelemetry trace context

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use opentelemetry::trace::TraceContextExt;
use std::time::Instant;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

/// Resource type of a `/fhir/{type}/...` path, if the first segment looks
/// like one.
fn resource_type_of(path: &str) -> Option<&str> {
    let first = path.strip_prefix("/fhir/")?.split('/').next()?;
    meridian_search::is_valid_resource_type(first).then_some(first)
}

/// Opens the root span of each request and assigns a request id.
///
/// - `X-Request-Id` in the response is the server id
/// - a different client `X-Request-Id` is echoed as `X-Correlation-Id`
/// - `X-Trace-Id` carries the OpenTelemetry trace id
#[tracing::instrument(
    name = "http_request",
    skip_all,
    fields(
        http.method = %req.method(),
        http.route = %req.uri().path(),
        otel.kind = "server",
        http.response.status_code = tracing::field::Empty,
        fhir.resource_type = tracing::field::Empty,
        request_id = tracing::field::Empty,
    )
)]
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let current_span = Span::current();
    let start = Instant::now();

    let client_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let server_id = Uuid::new_v4().to_string();
    current_span.record("request_id", server_id.as_str());

    let path = req.uri().path().to_string();
    let method = req.method().clone();
    if let Some(resource_type) = resource_type_of(&path) {
        current_span.record("fhir.resource_type", resource_type);
    }

    tracing::debug!(method = %method, path = %path, "Incoming request");

    let mut response = next.run(req).await;

    let status = response.status();
    current_span.record("http.response.status_code", status.as_u16());

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&server_id) {
        headers.insert("x-request-id", value);
    }

    let trace_id = current_span
        .context()
        .span()
        .span_context()
        .trace_id()
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert("x-trace-id", value);
    }

    if let Some(client_id) = client_id.filter(|id| *id != server_id) {
        if let Ok(value) = HeaderValue::from_str(&client_id) {
            headers.insert("x-correlation-id", value);
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_from_path() {
        assert_eq!(resource_type_of("/fhir/Patient/123"), Some("Patient"));
        assert_eq!(resource_type_of("/fhir/_history"), None);
        assert_eq!(resource_type_of("/metrics"), None);
    }
}
