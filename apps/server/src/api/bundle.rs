//! Bundle assembly for search, history and change-log responses.

use crate::{
    api::{headers::format_etag, url::query_string},
    models::{ChangeRecord, HistoryMethod, HistoryResult, Resource, SearchResult},
};
use axum::http::StatusCode;
use chrono::SecondsFormat;
use meridian_search::SearchContext;
use serde_json::{json, Value as JsonValue};

/// Paging and bookkeeping parameters rewritten on every link.
const PAGING_PARAMS: &[&str] = &["_page", "_count"];

fn status_line(code: StatusCode) -> String {
    match code.canonical_reason() {
        Some(r) => format!("{} {}", code.as_u16(), r),
        None => code.as_u16().to_string(),
    }
}

fn page_url(base_url: &str, path: &str, items: &[(String, String)], count: usize, page: usize) -> String {
    let mut link_items: Vec<(String, String)> = items
        .iter()
        .filter(|(k, _)| !PAGING_PARAMS.contains(&k.as_str()))
        .cloned()
        .collect();
    link_items.push(("_count".to_string(), count.to_string()));
    link_items.push(("_page".to_string(), page.to_string()));
    format!("{}/{}?{}", base_url, path, query_string(&link_items))
}

fn paging_links(
    base_url: &str,
    path: &str,
    items: &[(String, String)],
    count: usize,
    page: usize,
    has_next: bool,
    total: Option<i64>,
) -> Vec<JsonValue> {
    let mut links = vec![
        json!({"relation": "self", "url": page_url(base_url, path, items, count, page)}),
        json!({"relation": "first", "url": page_url(base_url, path, items, count, 1)}),
    ];
    if page > 1 {
        links.push(json!({"relation": "previous", "url": page_url(base_url, path, items, count, page - 1)}));
    }
    if has_next {
        links.push(json!({"relation": "next", "url": page_url(base_url, path, items, count, page.saturating_add(1))}));
    }
    if let Some(total) = total.filter(|_| count > 0) {
        let last = ((total.max(0) as usize) + count - 1) / count;
        links.push(json!({"relation": "last", "url": page_url(base_url, path, items, count, last.max(1))}));
    }
    links
}

fn full_url(base_url: &str, resource: &Resource) -> String {
    format!("{}/{}/{}", base_url, resource.resource_type, resource.id)
}

/// `Bundle.type = searchset`. Lenient-mode warnings come back as an
/// OperationOutcome entry with search mode `outcome`.
pub fn searchset(
    base_url: &str,
    path: &str,
    items: &[(String, String)],
    context: &SearchContext,
    result: &SearchResult,
) -> JsonValue {
    let mut entries: Vec<JsonValue> = result
        .entries
        .iter()
        .map(|entry| {
            json!({
                "fullUrl": full_url(base_url, &entry.resource),
                "resource": entry.resource.resource,
                "search": {"mode": entry.mode.as_str()}
            })
        })
        .collect();

    if !result.warnings.is_empty() {
        let issues: Vec<JsonValue> = result
            .warnings
            .iter()
            .map(|w| json!({"severity": "warning", "code": "not-supported", "diagnostics": w}))
            .collect();
        entries.push(json!({
            "resource": {"resourceType": "OperationOutcome", "issue": issues},
            "search": {"mode": "outcome"}
        }));
    }

    let mut bundle = json!({
        "resourceType": "Bundle",
        "type": "searchset"
    });
    if let Some(total) = result.total {
        bundle["total"] = json!(total);
    }
    bundle["link"] = json!(paging_links(
        base_url,
        path,
        items,
        context.page_size,
        context.page_number,
        result.has_next,
        result.total,
    ));
    bundle["entry"] = json!(entries);
    bundle
}

fn history_entry(base_url: &str, method: HistoryMethod, resource: &Resource) -> JsonValue {
    let response_status = match method {
        HistoryMethod::Delete => status_line(StatusCode::NO_CONTENT),
        HistoryMethod::Post => status_line(StatusCode::CREATED),
        HistoryMethod::Put => status_line(StatusCode::OK),
    };
    let url = match method {
        HistoryMethod::Post => resource.resource_type.clone(),
        _ => format!("{}/{}", resource.resource_type, resource.id),
    };

    let mut entry = json!({
        "fullUrl": full_url(base_url, resource),
        "request": {"method": method.as_str(), "url": url},
        "response": {
            "status": response_status,
            "etag": format_etag(resource.version_id),
            "lastModified": resource.last_updated.to_rfc3339_opts(SecondsFormat::Micros, true)
        }
    });
    if !resource.deleted {
        entry["resource"] = resource.resource.clone();
    }
    entry
}

/// `Bundle.type = history` for one resource, newest version first.
pub fn history(
    base_url: &str,
    path: &str,
    items: &[(String, String)],
    count: usize,
    page: usize,
    result: &HistoryResult,
) -> JsonValue {
    let has_next = result
        .total
        .map(|total| page.saturating_mul(count) < total.max(0) as usize)
        .unwrap_or(false);
    let entries: Vec<JsonValue> = result
        .entries
        .iter()
        .map(|e| history_entry(base_url, e.method, &e.resource))
        .collect();

    let mut bundle = json!({
        "resourceType": "Bundle",
        "type": "history"
    });
    if let Some(total) = result.total {
        bundle["total"] = json!(total);
    }
    bundle["link"] = json!(paging_links(base_url, path, items, count, page, has_next, result.total));
    bundle["entry"] = json!(entries);
    bundle
}

/// System history from the change log. Entries carry request and response
/// only; clients read the versions they need.
pub fn change_history(base_url: &str, changes: &[ChangeRecord], next_after: Option<i64>, items: &[(String, String)]) -> JsonValue {
    let entries: Vec<JsonValue> = changes
        .iter()
        .map(|change| {
            let method = change.change_type.history_method();
            json!({
                "fullUrl": format!("{}/{}/{}", base_url, change.resource_type, change.logical_id),
                "request": {
                    "method": method.as_str(),
                    "url": format!("{}/{}", change.resource_type, change.logical_id)
                },
                "response": {
                    "status": status_line(if method == HistoryMethod::Delete { StatusCode::NO_CONTENT } else { StatusCode::OK }),
                    "etag": format_etag(change.version_id),
                    "lastModified": change.changed_at.to_rfc3339_opts(SecondsFormat::Micros, true)
                }
            })
        })
        .collect();

    let mut links = Vec::new();
    if let Some(after) = next_after {
        let mut link_items: Vec<(String, String)> =
            items.iter().filter(|(k, _)| k != "_afterId").cloned().collect();
        link_items.push(("_afterId".to_string(), after.to_string()));
        links.push(json!({
            "relation": "next",
            "url": format!("{}/_history?{}", base_url, query_string(&link_items))
        }));
    }

    json!({
        "resourceType": "Bundle",
        "type": "history",
        "link": links,
        "entry": entries
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SearchEntry, SearchEntryMode};
    use chrono::Utc;

    fn resource(id: &str, version_id: i32) -> Resource {
        Resource {
            id: id.to_string(),
            resource_type: "Patient".to_string(),
            version_id,
            resource: json!({"resourceType": "Patient", "id": id}),
            last_updated: Utc::now(),
            deleted: false,
        }
    }

    #[test]
    fn searchset_links_follow_pages() {
        let mut context = SearchContext::new(Some("Patient".into()), 2);
        context.page_number = 2;
        let result = SearchResult {
            entries: vec![SearchEntry {
                resource: resource("a", 1),
                mode: SearchEntryMode::Match,
            }],
            total: Some(5),
            has_next: true,
            warnings: vec!["Unknown search parameter 'foo'".into()],
        };
        let items = vec![("name".to_string(), "smith".to_string()), ("_page".to_string(), "2".to_string())];
        let bundle = searchset("http://h/fhir", "Patient", &items, &context, &result);

        assert_eq!(bundle["total"], 5);
        let relations: Vec<&str> = bundle["link"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["relation"].as_str().unwrap())
            .collect();
        assert_eq!(relations, vec!["self", "first", "previous", "next", "last"]);
        assert_eq!(
            bundle["link"][3]["url"],
            "http://h/fhir/Patient?name=smith&_count=2&_page=3"
        );
        assert_eq!(bundle["link"][4]["url"], "http://h/fhir/Patient?name=smith&_count=2&_page=3");
        assert_eq!(bundle["entry"][0]["fullUrl"], "http://h/fhir/Patient/a");
        assert_eq!(bundle["entry"][1]["search"]["mode"], "outcome");
    }

    #[test]
    fn deleted_versions_have_no_resource() {
        let mut deleted = resource("a", 2);
        deleted.deleted = true;
        let entry = history_entry("http://h/fhir", HistoryMethod::Delete, &deleted);
        assert!(entry.get("resource").is_none());
        assert_eq!(entry["request"]["method"], "DELETE");
        assert_eq!(entry["response"]["etag"], "W/\"2\"");
    }
}
