//! Remote indexing: writes hand their search values to the job queue and
//! the consumer makes them searchable.

mod support;

use axum::http::Method;
use meridian::{
    workers::{create_workers, drain, Worker},
    AppState,
};
use support::{match_ids, patient, TestApp};

fn remote_app() -> anyhow::Result<TestApp> {
    TestApp::new_with_config(|c| {
        c.remote_index.enabled = true;
        c.remote_index.instance_id = Some("node-a".into());
    })
}

async fn consume(state: &AppState) -> anyhow::Result<usize> {
    let workers: Vec<Box<dyn Worker>> = create_workers(
        &state.config,
        state.store.clone(),
        state.job_queue.clone(),
        state.persistence.clone(),
    );
    let mut handled = 0;
    for worker in workers.iter().filter(|w| w.name() == "RemoteIndexWorker") {
        handled += drain(worker.as_ref(), state.job_queue.as_ref()).await?;
    }
    Ok(handled)
}

#[tokio::test]
async fn values_become_searchable_after_consumption() -> anyhow::Result<()> {
    let app = remote_app()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p2", &patient("Windsor")).await?;

    // The resource itself is readable right away.
    let (_, read) = app.get_json("/fhir/Patient/p1").await?;
    assert_eq!(read["name"][0]["family"], "Chalmers");

    let (_, before) = app.get_json("/fhir/Patient?family=chalmers").await?;
    assert!(match_ids(&before, "Patient").is_empty());

    assert_eq!(consume(&app.state).await?, 2);

    let (_, after) = app.get_json("/fhir/Patient?family=chalmers").await?;
    assert_eq!(match_ids(&after, "Patient"), vec!["p1"]);
    Ok(())
}

#[tokio::test]
async fn superseded_message_does_not_overwrite_newer_values() -> anyhow::Result<()> {
    let app = remote_app()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Windsor")).await?;

    // Both messages are consumed; only the current version's values stay.
    assert_eq!(consume(&app.state).await?, 2);

    let (_, old) = app.get_json("/fhir/Patient?family=chalmers").await?;
    assert!(match_ids(&old, "Patient").is_empty());
    let (_, current) = app.get_json("/fhir/Patient?family=windsor").await?;
    assert_eq!(match_ids(&current, "Patient"), vec!["p1"]);
    Ok(())
}

#[tokio::test]
async fn unchanged_parameters_still_index_the_current_version() -> anyhow::Result<()> {
    let app = remote_app()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;

    // Version 1's message is superseded; version 2 carries the values.
    assert_eq!(consume(&app.state).await?, 2);

    let (_, bundle) = app.get_json("/fhir/Patient?family=chalmers").await?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p1"]);
    Ok(())
}

#[tokio::test]
async fn delete_clears_values_without_a_message() -> anyhow::Result<()> {
    let app = remote_app()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    consume(&app.state).await?;

    app.request(Method::DELETE, "/fhir/Patient/p1", None).await?;
    assert_eq!(consume(&app.state).await?, 0);

    let (_, bundle) = app.get_json("/fhir/Patient?family=chalmers").await?;
    assert!(match_ids(&bundle, "Patient").is_empty());
    Ok(())
}

#[tokio::test]
async fn health_reports_remote_indexing() -> anyhow::Result<()> {
    let app = remote_app()?;
    let (_, body) = app.get_json("/health").await?;
    assert_eq!(body["remoteIndexing"], true);
    Ok(())
}
