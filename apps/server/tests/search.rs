//! Search over HTTP: parameter types, paging, includes, compartments and
//! strict or lenient handling.

mod support;

use axum::{body::Body, http::Method, http::StatusCode};
use serde_json::json;
use support::{assert_status, entries, link, match_ids, observation, patient, TestApp};

async fn seeded() -> anyhow::Result<TestApp> {
    let app = TestApp::new()?;
    app.put("Patient", "p1", &patient("Chalmers")).await?;
    app.put("Patient", "p2", &patient("Windsor")).await?;
    let mut female = patient("Chalmerson");
    female["gender"] = json!("female");
    female["birthDate"] = json!("1990-06-01");
    app.put("Patient", "p3", &female).await?;

    app.put("Observation", "o1", &observation("Patient/p1", "8867-4")).await?;
    app.put("Observation", "o2", &observation("Patient/p1", "9279-1")).await?;
    app.put("Observation", "o3", &observation("Patient/p2", "8867-4")).await?;
    Ok(app)
}

#[tokio::test]
async fn string_search_is_prefix_and_case_insensitive() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, bundle) = app.get_json("/fhir/Patient?family=chalm").await?;
    assert_status(status, StatusCode::OK, "family prefix");
    assert_eq!(bundle["type"], "searchset");
    assert_eq!(bundle["total"], 2);
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p1", "p3"]);

    let (_, bundle) = app.get_json("/fhir/Patient?family:exact=Chalmers").await?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p1"]);
    Ok(())
}

#[tokio::test]
async fn token_date_and_reference_parameters() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (_, bundle) = app.get_json("/fhir/Patient?gender=female").await?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p3"]);

    let (_, bundle) = app.get_json("/fhir/Patient?birthdate=ge1980-01-01").await?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p3"]);

    let (_, bundle) = app
        .get_json("/fhir/Observation?code=http://loinc.org|8867-4")
        .await?;
    assert_eq!(match_ids(&bundle, "Observation"), vec!["o1", "o3"]);

    let (_, bundle) = app.get_json("/fhir/Observation?subject=Patient/p1").await?;
    assert_eq!(match_ids(&bundle, "Observation"), vec!["o1", "o2"]);

    // Parameters are ANDed
    let (_, bundle) = app
        .get_json("/fhir/Observation?subject=Patient/p1&code=8867-4")
        .await?;
    assert_eq!(match_ids(&bundle, "Observation"), vec!["o1"]);
    Ok(())
}

#[tokio::test]
async fn deleted_resources_are_not_found() -> anyhow::Result<()> {
    let app = seeded().await?;
    app.request(Method::DELETE, "/fhir/Patient/p3", None).await?;

    let (_, bundle) = app.get_json("/fhir/Patient?family=chalm").await?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p1"]);
    Ok(())
}

#[tokio::test]
async fn updated_values_replace_old_ones() -> anyhow::Result<()> {
    let app = seeded().await?;
    app.put("Patient", "p1", &patient("Baker")).await?;

    let (_, bundle) = app.get_json("/fhir/Patient?family=chalm").await?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p3"]);
    let (_, bundle) = app.get_json("/fhir/Patient?family=baker").await?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p1"]);
    Ok(())
}

#[tokio::test]
async fn paging_links_follow_count_and_page() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (_, first) = app.get_json("/fhir/Patient?_sort=_id&_count=2").await?;
    assert_eq!(first["total"], 3);
    assert_eq!(match_ids(&first, "Patient"), vec!["p1", "p2"]);
    assert!(link(&first, "previous").is_none());
    let next = link(&first, "next").expect("next link on a full page");
    assert!(next.starts_with("http://example.org/fhir/Patient?"));
    assert!(next.contains("_page=2"));
    assert!(link(&first, "last").is_some_and(|l| l.contains("_page=2")));

    let path = next.trim_start_matches("http://example.org");
    let (_, second) = app.get_json(path).await?;
    assert_eq!(match_ids(&second, "Patient"), vec!["p3"]);
    assert!(link(&second, "next").is_none());
    assert!(link(&second, "previous").is_some());
    Ok(())
}

#[tokio::test]
async fn page_past_the_end_of_the_range_is_invalid() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, body) = app
        .get_json(&format!("/fhir/Patient?_page={}", u64::MAX))
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "overflowing _page");
    assert_eq!(body["issue"][0]["code"], "invalid");

    // Far beyond the last match but addressable: an empty page.
    let (status, bundle) = app.get_json("/fhir/Patient?_count=2&_page=1000000").await?;
    assert_status(status, StatusCode::OK, "distant _page");
    assert!(match_ids(&bundle, "Patient").is_empty());
    Ok(())
}

#[tokio::test]
async fn sort_descending() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (_, bundle) = app.get_json("/fhir/Patient?_sort=-family").await?;
    let all = entries(&bundle);
    let ids: Vec<&str> = all
        .iter()
        .filter_map(|e| e["resource"]["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["p2", "p3", "p1"]);
    Ok(())
}

#[tokio::test]
async fn include_adds_referenced_resources() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (_, bundle) = app
        .get_json("/fhir/Observation?code=9279-1&_include=Observation:subject")
        .await?;
    assert_eq!(match_ids(&bundle, "Observation"), vec!["o2"]);
    let all = entries(&bundle);
    let included: Vec<&str> = all
        .iter()
        .filter(|e| e["search"]["mode"] == "include")
        .filter_map(|e| e["resource"]["id"].as_str())
        .collect();
    assert_eq!(included, vec!["p1"]);
    Ok(())
}

#[tokio::test]
async fn compartment_search_limits_to_members() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, bundle) = app.get_json("/fhir/Patient/p1/Observation").await?;
    assert_status(status, StatusCode::OK, "compartment search");
    assert_eq!(match_ids(&bundle, "Observation"), vec!["o1", "o2"]);

    let (_, bundle) = app.get_json("/fhir/Patient/p1/Observation?code=8867-4").await?;
    assert_eq!(match_ids(&bundle, "Observation"), vec!["o1"]);
    Ok(())
}

#[tokio::test]
async fn unknown_parameter_strict_and_lenient() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, _, _) = app
        .request_with_headers(
            Method::GET,
            "/fhir/Patient?unknown-param=1",
            None,
            &[("prefer", "handling=strict")],
        )
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "strict unknown parameter");

    let (status, _, body) = app
        .request_with_headers(
            Method::GET,
            "/fhir/Patient?unknown-param=1&family=windsor",
            None,
            &[("prefer", "handling=lenient")],
        )
        .await?;
    assert_status(status, StatusCode::OK, "lenient unknown parameter");
    let bundle: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p2"]);
    let outcome = entries(&bundle)
        .into_iter()
        .find(|e| e["search"]["mode"] == "outcome")
        .expect("lenient warnings are reported");
    assert_eq!(outcome["resource"]["resourceType"], "OperationOutcome");
    assert_eq!(outcome["resource"]["issue"][0]["severity"], "warning");
    Ok(())
}

#[tokio::test]
async fn summary_count_returns_only_total() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, bundle) = app.get_json("/fhir/Observation?_summary=count").await?;
    assert_status(status, StatusCode::OK, "_summary=count");
    assert_eq!(bundle["total"], 3);
    assert!(entries(&bundle).is_empty());
    Ok(())
}

#[tokio::test]
async fn post_search_reads_form_body() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, _, body) = app
        .send(
            Method::POST,
            "/fhir/Patient/_search",
            Body::from("family=windsor"),
            "application/x-www-form-urlencoded",
            &[],
        )
        .await?;
    assert_status(status, StatusCode::OK, "POST _search");
    let bundle: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p2"]);

    let (status, _, _) = app
        .send(
            Method::POST,
            "/fhir/Patient/_search",
            Body::from("{\"family\": \"windsor\"}"),
            "application/json",
            &[],
        )
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "POST _search with JSON body");
    Ok(())
}

#[tokio::test]
async fn system_search_with_type_filter() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, bundle) = app.get_json("/fhir?_type=Patient,Observation&_id=p1,o1").await?;
    assert_status(status, StatusCode::OK, "system search");
    assert_eq!(match_ids(&bundle, "Patient"), vec!["p1"]);
    assert_eq!(match_ids(&bundle, "Observation"), vec!["o1"]);
    Ok(())
}

#[tokio::test]
async fn unsupported_token_modifier_is_not_implemented() -> anyhow::Result<()> {
    let app = seeded().await?;

    let (status, _) = app.get_json("/fhir/Observation?code:text=heart").await?;
    assert_status(status, StatusCode::NOT_IMPLEMENTED, "token :text");
    Ok(())
}
