//! URL helpers for absolute links in bundles and `Location` headers.

use axum::http::HeaderMap;

/// The FHIR base URL: the configured `server.base_url`, else
/// `{scheme}://{host}/fhir` from forwarding headers.
pub fn base_url(configured: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(base) = configured {
        return base.trim_end_matches('/').to_string();
    }

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");

    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    format!("{}://{}/fhir", scheme, host)
}

/// Serialize query items back into a query string.
pub fn query_string(items: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in items {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

/// Parse a query string or form body.
pub fn parse_query_items(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|s| url::form_urlencoded::parse(s.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_base_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "internal:8080".parse().unwrap());
        assert_eq!(
            base_url(Some("https://fhir.example.org/r4/"), &headers),
            "https://fhir.example.org/r4"
        );
        assert_eq!(base_url(None, &headers), "http://internal:8080/fhir");
    }

    #[test]
    fn query_items_round_trip_reserved_characters() {
        let items = parse_query_items(Some("name=J%C3%BCrgen&date=ge2020-01-01&code=http://loinc.org|1234-5"));
        assert_eq!(items[0].1, "Jürgen");
        assert_eq!(items[2].1, "http://loinc.org|1234-5");
        let qs = query_string(&items);
        assert_eq!(parse_query_items(Some(&qs)), items);
    }
}
