//! System history and the change log.

mod support;

use axum::http::{Method, StatusCode};
use support::{assert_status, entries, link, observation, patient, TestApp};

#[tokio::test]
async fn changes_are_recorded_in_commit_order() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Windsor")).await?;
    app.put("Observation", "o1", &observation("Patient/p1", "8867-4")).await?;
    app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;

    let (status, body) = app.get_json("/fhir/$changes").await?;
    assert_status(status, StatusCode::OK, "$changes");
    let changes = body["changes"].as_array().expect("changes array");
    let kinds: Vec<(&str, &str, i64)> = changes
        .iter()
        .map(|c| {
            (
                c["resourceType"].as_str().unwrap_or_default(),
                c["changeType"].as_str().unwrap_or_default(),
                c["versionId"].as_i64().unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("Patient", "C", 1),
            ("Patient", "U", 2),
            ("Observation", "C", 1),
            ("Patient", "D", 3),
        ]
    );

    let ids: Vec<i64> = changes.iter().filter_map(|c| c["changeId"].as_i64()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "change ids increase: {ids:?}");
    assert!(body["nextAfterId"].is_null());
    Ok(())
}

#[tokio::test]
async fn changes_page_with_after_id() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    for id in ["p1", "p2", "p3"] {
        app.put("Patient", id, &patient("Chalmers")).await?;
    }

    let (_, first) = app.get_json("/fhir/$changes?_count=2").await?;
    let first_changes = first["changes"].as_array().expect("changes array");
    assert_eq!(first_changes.len(), 2);
    let after = first["nextAfterId"].as_i64().expect("cursor on a full page");

    let (_, rest) = app.get_json(&format!("/fhir/$changes?_count=2&_afterId={after}")).await?;
    let rest_changes = rest["changes"].as_array().expect("changes array");
    assert_eq!(rest_changes.len(), 1);
    assert_eq!(rest_changes[0]["logicalId"], "p3");
    assert!(rest["nextAfterId"].is_null());
    Ok(())
}

#[tokio::test]
async fn changes_filter_by_type() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Observation", "o1", &observation("Patient/p1", "8867-4")).await?;

    let (_, body) = app.get_json("/fhir/$changes?_type=Observation").await?;
    let changes = body["changes"].as_array().expect("changes array");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["logicalId"], "o1");

    let (status, _) = app.get_json("/fhir/$changes?_afterId=abc").await?;
    assert_status(status, StatusCode::BAD_REQUEST, "non-numeric _afterId");
    Ok(())
}

#[tokio::test]
async fn system_history_bundle_from_change_log() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Windsor")).await?;
    app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;

    let (status, bundle) = app.get_json("/fhir/_history").await?;
    assert_status(status, StatusCode::OK, "system history");
    assert_eq!(bundle["type"], "history");

    let entries = entries(&bundle);
    let methods: Vec<&str> = entries
        .iter()
        .filter_map(|e| e["request"]["method"].as_str())
        .collect();
    assert_eq!(methods, vec!["POST", "PUT", "DELETE"]);
    assert_eq!(entries[2]["response"]["etag"], "W/\"3\"");
    assert_eq!(entries[0]["fullUrl"], "http://example.org/fhir/Patient/p1");

    let (_, paged) = app.get_json("/fhir/_history?_count=2").await?;
    assert_eq!(support::entries(&paged).len(), 2);
    assert!(link(&paged, "next").is_some_and(|l| l.contains("_afterId=")));
    Ok(())
}
