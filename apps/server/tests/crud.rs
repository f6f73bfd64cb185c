//! Instance interactions over HTTP: create, read, vread, update, delete
//! and instance history.

mod support;

use axum::{body::Body, http::Method, http::StatusCode};
use serde_json::json;
use support::{assert_status, entries, header, issue_code, patient, TestApp};

#[tokio::test]
async fn create_assigns_id_and_version_headers() -> anyhow::Result<()> {
    let app = TestApp::new()?;

    let (status, headers, body) = app
        .request(Method::POST, "/fhir/Patient", Some(&patient("Chalmers")))
        .await?;
    assert_status(status, StatusCode::CREATED, "create");

    let created: serde_json::Value = serde_json::from_slice(&body)?;
    let id = created["id"].as_str().expect("created resource must have id");
    assert!(uuid::Uuid::parse_str(id).is_ok(), "id should be a UUID: {id}");
    assert_eq!(created["meta"]["versionId"], "1");
    assert!(created["meta"]["lastUpdated"].is_string());

    assert_eq!(header(&headers, "etag"), Some("W/\"1\""));
    assert!(header(&headers, "last-modified").is_some_and(|v| v.ends_with("GMT")));
    assert_eq!(
        header(&headers, "location"),
        Some(format!("http://example.org/fhir/Patient/{id}/_history/1").as_str())
    );
    Ok(())
}

#[tokio::test]
async fn create_rejects_mismatched_resource_type() -> anyhow::Result<()> {
    let app = TestApp::new()?;

    let (status, _, body) = app
        .request(Method::POST, "/fhir/Observation", Some(&patient("Chalmers")))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "type mismatch");
    assert_eq!(issue_code(&body).as_deref(), Some("invalid"));
    Ok(())
}

#[tokio::test]
async fn non_json_body_is_unsupported_media_type() -> anyhow::Result<()> {
    let app = TestApp::new()?;

    let (status, _, _) = app
        .send(
            Method::POST,
            "/fhir/Patient",
            Body::from("<Patient xmlns=\"http://hl7.org/fhir\"/>"),
            "application/fhir+xml",
            &[],
        )
        .await?;
    assert_status(status, StatusCode::UNSUPPORTED_MEDIA_TYPE, "xml body");
    Ok(())
}

#[tokio::test]
async fn return_minimal_omits_body() -> anyhow::Result<()> {
    let app = TestApp::new()?;

    let (status, headers, body) = app
        .request_with_headers(
            Method::POST,
            "/fhir/Patient",
            Some(&patient("Chalmers")),
            &[("prefer", "return=minimal")],
        )
        .await?;
    assert_status(status, StatusCode::CREATED, "create minimal");
    assert!(body.is_empty());
    assert!(header(&headers, "location").is_some());
    Ok(())
}

#[tokio::test]
async fn conditional_create_returns_single_match() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    let (status, _, body) = app
        .request_with_headers(
            Method::POST,
            "/fhir/Patient",
            Some(&patient("Chalmers")),
            &[("if-none-exist", "family=Chalmers")],
        )
        .await?;
    assert_status(status, StatusCode::OK, "conditional create with one match");
    let existing: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(existing["id"], "p1");

    app.put("Patient", "p2", &patient("Chalmers")).await?;
    let (status, _, _) = app
        .request_with_headers(
            Method::POST,
            "/fhir/Patient",
            Some(&patient("Chalmers")),
            &[("if-none-exist", "family=Chalmers")],
        )
        .await?;
    assert_status(status, StatusCode::PRECONDITION_FAILED, "conditional create with two matches");
    Ok(())
}

#[tokio::test]
async fn update_with_client_id_creates_then_updates() -> anyhow::Result<()> {
    let app = TestApp::new()?;

    let (status, headers, _) = app
        .request(Method::PUT, "/fhir/Patient/example", Some(&patient("Chalmers")))
        .await?;
    assert_status(status, StatusCode::CREATED, "update as create");
    assert_eq!(header(&headers, "etag"), Some("W/\"1\""));

    let (status, headers, body) = app
        .request(Method::PUT, "/fhir/Patient/example", Some(&patient("Windsor")))
        .await?;
    assert_status(status, StatusCode::OK, "update");
    assert_eq!(header(&headers, "etag"), Some("W/\"2\""));
    let updated: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(updated["meta"]["versionId"], "2");
    assert_eq!(updated["name"][0]["family"], "Windsor");
    Ok(())
}

#[tokio::test]
async fn update_rejects_body_id_mismatch() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    let mut resource = patient("Chalmers");
    resource["id"] = json!("other");

    let (status, _, _) = app
        .request(Method::PUT, "/fhir/Patient/example", Some(&resource))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "id mismatch");
    Ok(())
}

#[tokio::test]
async fn if_match_guards_concurrent_updates() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    let (status, _, _) = app
        .request_with_headers(
            Method::PUT,
            "/fhir/Patient/p1",
            Some(&patient("Windsor")),
            &[("if-match", "W/\"1\"")],
        )
        .await?;
    assert_status(status, StatusCode::OK, "matching If-Match");

    let (status, _, _) = app
        .request_with_headers(
            Method::PUT,
            "/fhir/Patient/p1",
            Some(&patient("Stale")),
            &[("if-match", "W/\"1\"")],
        )
        .await?;
    assert_status(status, StatusCode::PRECONDITION_FAILED, "stale If-Match");

    let (status, _, _) = app
        .request_with_headers(
            Method::PUT,
            "/fhir/Patient/p1",
            Some(&patient("Bad")),
            &[("if-match", "not-an-etag")],
        )
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "malformed If-Match");

    let (_, current) = app.get_json("/fhir/Patient/p1").await?;
    assert_eq!(current["name"][0]["family"], "Windsor");
    Ok(())
}

#[tokio::test]
async fn if_none_match_star_on_existing_resource() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    let (status, _, _) = app
        .request_with_headers(
            Method::PUT,
            "/fhir/Patient/p1",
            Some(&patient("Windsor")),
            &[("if-none-match", "*")],
        )
        .await?;
    assert_status(status, StatusCode::PRECONDITION_FAILED, "If-None-Match on existing");

    let (status, _, _) = app
        .request_with_headers(
            Method::PUT,
            "/fhir/Patient/p1",
            Some(&patient("Windsor")),
            &[("if-none-match", "W/\"1\"")],
        )
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "If-None-Match with a version");

    let (status, _, _) = app
        .request_with_headers(
            Method::PUT,
            "/fhir/Patient/fresh",
            Some(&patient("Windsor")),
            &[("if-none-match", "*")],
        )
        .await?;
    assert_status(status, StatusCode::CREATED, "If-None-Match on a new id");
    Ok(())
}

#[tokio::test]
async fn if_none_match_can_answer_not_modified() -> anyhow::Result<()> {
    let app = TestApp::new_with_config(|c| c.store.if_none_match_not_modified = true)?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    let (status, headers, body) = app
        .request_with_headers(
            Method::PUT,
            "/fhir/Patient/p1",
            Some(&patient("Windsor")),
            &[("if-none-match", "*")],
        )
        .await?;
    assert_status(status, StatusCode::NOT_MODIFIED, "If-None-Match configured as 304");
    assert!(body.is_empty());
    assert_eq!(header(&headers, "etag"), Some("W/\"1\""));
    Ok(())
}

#[tokio::test]
async fn update_create_can_be_disabled() -> anyhow::Result<()> {
    let app = TestApp::new_with_config(|c| c.store.allow_update_create = false)?;

    let (status, _, _) = app
        .request(Method::PUT, "/fhir/Patient/p1", Some(&patient("Chalmers")))
        .await?;
    assert_status(status, StatusCode::METHOD_NOT_ALLOWED, "update as create disabled");
    Ok(())
}

#[tokio::test]
async fn delete_then_read_is_gone() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    let (status, headers, body) = app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;
    assert_status(status, StatusCode::NO_CONTENT, "delete");
    assert!(body.is_empty());
    assert_eq!(header(&headers, "etag"), Some("W/\"2\""));

    let (status, headers, body) = app.request(Method::GET, "/fhir/Patient/p1", None).await?;
    assert_status(status, StatusCode::GONE, "read deleted");
    assert_eq!(header(&headers, "etag"), Some("W/\"2\""));
    assert_eq!(issue_code(&body).as_deref(), Some("deleted"));

    // Repeated delete is a no-op
    let (status, headers, _) = app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;
    assert_status(status, StatusCode::NO_CONTENT, "delete again");
    assert_eq!(header(&headers, "etag"), Some("W/\"2\""));

    let (status, _, _) = app.request(Method::DELETE, "/fhir/Patient/missing", None).await?;
    assert_status(status, StatusCode::NOT_FOUND, "delete unknown");
    Ok(())
}

#[tokio::test]
async fn update_after_delete_recreates() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;

    let (status, headers, _) = app
        .request(Method::PUT, "/fhir/Patient/p1", Some(&patient("Windsor")))
        .await?;
    assert_status(status, StatusCode::CREATED, "update over deleted");
    assert_eq!(header(&headers, "etag"), Some("W/\"3\""));
    Ok(())
}

#[tokio::test]
async fn vread_returns_each_version() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Windsor")).await?;
    app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;

    let (status, v1) = app.get_json("/fhir/Patient/p1/_history/1").await?;
    assert_status(status, StatusCode::OK, "vread 1");
    assert_eq!(v1["name"][0]["family"], "Chalmers");
    assert_eq!(v1["meta"]["versionId"], "1");

    let (status, v2) = app.get_json("/fhir/Patient/p1/_history/2").await?;
    assert_status(status, StatusCode::OK, "vread 2");
    assert_eq!(v2["name"][0]["family"], "Windsor");

    let (status, _) = app.get_json("/fhir/Patient/p1/_history/3").await?;
    assert_status(status, StatusCode::GONE, "vread delete marker");

    let (status, _) = app.get_json("/fhir/Patient/p1/_history/9").await?;
    assert_status(status, StatusCode::NOT_FOUND, "vread unknown version");

    let (status, _) = app.get_json("/fhir/Patient/p1/_history/abc").await?;
    assert_status(status, StatusCode::BAD_REQUEST, "vread non-numeric version");
    Ok(())
}

#[tokio::test]
async fn instance_history_is_newest_first() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Windsor")).await?;
    app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;

    let (status, bundle) = app.get_json("/fhir/Patient/p1/_history").await?;
    assert_status(status, StatusCode::OK, "history");
    assert_eq!(bundle["type"], "history");
    assert_eq!(bundle["total"], 3);

    let entries = entries(&bundle);
    let methods: Vec<&str> = entries
        .iter()
        .filter_map(|e| e["request"]["method"].as_str())
        .collect();
    assert_eq!(methods, vec!["DELETE", "PUT", "POST"]);
    assert!(entries[0].get("resource").is_none(), "delete entries carry no resource");
    assert_eq!(entries[1]["response"]["etag"], "W/\"2\"");
    assert_eq!(entries[2]["resource"]["name"][0]["family"], "Chalmers");

    let (status, page) = app.get_json("/fhir/Patient/p1/_history?_count=1&_page=2").await?;
    assert_status(status, StatusCode::OK, "history page 2");
    let entries = support::entries(&page);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["response"]["etag"], "W/\"2\"");
    assert!(support::link(&page, "next").is_some());
    assert!(support::link(&page, "previous").is_some());

    let (status, _) = app.get_json("/fhir/Patient/missing/_history").await?;
    assert_status(status, StatusCode::NOT_FOUND, "history of unknown resource");
    Ok(())
}

#[tokio::test]
async fn history_page_past_the_end_of_the_range_is_invalid() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    let (status, body) = app
        .get_json(&format!("/fhir/Patient/p1/_history?_page={}", u64::MAX))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "overflowing history _page");
    assert_eq!(body["resourceType"], "OperationOutcome");
    Ok(())
}

#[tokio::test]
async fn health_reports_store_and_queue() -> anyhow::Result<()> {
    let app = TestApp::new()?;

    let (status, body) = app.get_json("/health").await?;
    assert_status(status, StatusCode::OK, "health");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["remoteIndexing"], false);
    Ok(())
}

#[tokio::test]
async fn responses_carry_request_ids() -> anyhow::Result<()> {
    let app = TestApp::new()?;

    let (status, headers, _) = app
        .request_with_headers(
            Method::GET,
            "/fhir/Patient/missing",
            None,
            &[("x-request-id", "client-123")],
        )
        .await?;
    assert_status(status, StatusCode::NOT_FOUND, "read unknown resource");
    let server_id = header(&headers, "x-request-id").expect("server request id");
    assert!(uuid::Uuid::parse_str(server_id).is_ok());
    assert_eq!(header(&headers, "x-correlation-id"), Some("client-123"));
    Ok(())
}
