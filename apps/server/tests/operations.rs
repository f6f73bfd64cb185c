//! `$erase` and `$reindex`.

mod support;

use axum::http::{Method, StatusCode};
use meridian::{
    queue::JobStatus,
    workers::{create_workers, drain},
};
use serde_json::{json, Value};
use support::{assert_status, patient, TestApp};

fn parameter<'a>(parameters: &'a Value, name: &str) -> Vec<&'a Value> {
    parameters["parameter"]
        .as_array()
        .map(|items| items.iter().filter(|p| p["name"] == name).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn erase_single_version() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Windsor")).await?;

    let input = json!({
        "resourceType": "Parameters",
        "parameter": [{"name": "version", "valueInteger": 1}]
    });
    let (status, _, body) = app
        .request(Method::POST, "/fhir/Patient/p1/$erase", Some(&input))
        .await?;
    assert_status(status, StatusCode::OK, "erase version 1");
    let output: Value = serde_json::from_slice(&body)?;
    assert_eq!(parameter(&output, "resourceErased")[0]["valueBoolean"], false);
    assert_eq!(parameter(&output, "versionErased")[0]["valueInteger"], 1);

    let (status, _) = app.get_json("/fhir/Patient/p1/_history/1").await?;
    assert_status(status, StatusCode::NOT_FOUND, "erased version");
    let (status, current) = app.get_json("/fhir/Patient/p1").await?;
    assert_status(status, StatusCode::OK, "current version survives");
    assert_eq!(current["meta"]["versionId"], "2");
    Ok(())
}

#[tokio::test]
async fn erase_current_version_is_rejected() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    let input = json!({
        "resourceType": "Parameters",
        "parameter": [{"name": "version", "valueInteger": 1}]
    });
    let (status, _, _) = app
        .request(Method::POST, "/fhir/Patient/p1/$erase", Some(&input))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "erase current version");

    let bogus = json!({
        "resourceType": "Parameters",
        "parameter": [{"name": "everything", "valueBoolean": true}]
    });
    let (status, _, _) = app
        .request(Method::POST, "/fhir/Patient/p1/$erase", Some(&bogus))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "unknown $erase parameter");
    Ok(())
}

#[tokio::test]
async fn erase_whole_resource() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Windsor")).await?;

    let (status, _, body) = app
        .request(Method::POST, "/fhir/Patient/p1/$erase", None)
        .await?;
    assert_status(status, StatusCode::OK, "erase resource");
    let output: Value = serde_json::from_slice(&body)?;
    assert_eq!(parameter(&output, "resourceErased")[0]["valueBoolean"], true);
    assert_eq!(parameter(&output, "versionErased").len(), 2);

    let (status, _) = app.get_json("/fhir/Patient/p1").await?;
    assert_status(status, StatusCode::NOT_FOUND, "erased resource is unknown, not gone");
    let (_, bundle) = app.get_json("/fhir/Patient?family=windsor").await?;
    assert!(support::match_ids(&bundle, "Patient").is_empty());

    let (status, _, _) = app
        .request(Method::POST, "/fhir/Patient/p1/$erase", None)
        .await?;
    assert_status(status, StatusCode::NOT_FOUND, "erase unknown resource");
    Ok(())
}

#[tokio::test]
async fn reindex_runs_one_batch_synchronously() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    for id in ["p1", "p2", "p3"] {
        app.put("Patient", id, &patient("Chalmers")).await?;
    }

    let input = json!({
        "resourceType": "Parameters",
        "parameter": [
            {"name": "resourceType", "valueString": "Patient"},
            {"name": "resourceCount", "valueInteger": 2}
        ]
    });
    let (status, _, body) = app
        .request(Method::POST, "/fhir/$reindex", Some(&input))
        .await?;
    assert_status(status, StatusCode::OK, "sync reindex");
    let output: Value = serde_json::from_slice(&body)?;
    assert_eq!(parameter(&output, "processed")[0]["valueInteger"], 2);
    assert_eq!(parameter(&output, "unchanged")[0]["valueInteger"], 2);
    assert_eq!(parameter(&output, "reindexed")[0]["valueInteger"], 0);

    let too_many = json!({
        "resourceType": "Parameters",
        "parameter": [{"name": "resourceCount", "valueInteger": 5000}]
    });
    let (status, _, _) = app
        .request(Method::POST, "/fhir/$reindex", Some(&too_many))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "resourceCount above limit");
    Ok(())
}

#[tokio::test]
async fn reindex_respond_async_enqueues_a_job() -> anyhow::Result<()> {
    let app = TestApp::new()?;
    for id in ["p1", "p2", "p3"] {
        app.put("Patient", id, &patient("Chalmers")).await?;
    }

    let (status, _, body) = app
        .request_with_headers(
            Method::POST,
            "/fhir/$reindex",
            None,
            &[("prefer", "respond-async")],
        )
        .await?;
    assert_status(status, StatusCode::ACCEPTED, "async reindex");
    let outcome: Value = serde_json::from_slice(&body)?;
    let diagnostics = outcome["issue"][0]["diagnostics"].as_str().unwrap_or_default();
    let job_id: uuid::Uuid = diagnostics
        .split_whitespace()
        .nth(2)
        .expect("job id in diagnostics")
        .parse()?;

    let state = &app.state;
    let workers = create_workers(
        &state.config,
        state.store.clone(),
        state.job_queue.clone(),
        state.persistence.clone(),
    );
    let mut handled = 0;
    for worker in &workers {
        handled += drain(worker.as_ref(), state.job_queue.as_ref()).await?;
    }
    assert_eq!(handled, 1);

    let job = state.job_queue.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_items, 3);
    Ok(())
}
