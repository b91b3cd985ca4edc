//! Request-path helpers: credential extraction, query assembly, upstream
//! parameter merging and ClickHouse error sniffing.

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode, Uri, header};
use base64::Engine as _;
use rand::Rng;

use crate::limits::BackendUser;

/// Default user assumed when a request carries no credentials at all.
pub const DEFAULT_USER: &str = "default";

/// Decoded URL query pairs, in client order.
pub fn query_params(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Params the gateway always assigns itself; client- or group-supplied
/// values for these are dropped before forwarding.
const RESERVED_PARAMS: &[&str] = &["user", "password", "query_id"];

/// Extracts credentials from Basic auth or the `user`/`password` query
/// params, falling back to the `default` user.
pub fn credentials(headers: &HeaderMap, params: &[(String, String)]) -> (String, String) {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Some(decoded) = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
            .and_then(|v| String::from_utf8(v).ok())
        {
            let (user, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
            return (user.to_string(), password.to_string());
        }
    }
    let lookup = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    match lookup("user") {
        Some(user) => (user, lookup("password").unwrap_or_default()),
        None => (DEFAULT_USER.to_string(), lookup("password").unwrap_or_default()),
    }
}

/// The full query text of a request: the `query` URL param, the body, or
/// both joined with a newline (ClickHouse concatenates them the same way).
pub fn full_query(params: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let param_query = params
        .iter()
        .find(|(k, _)| k == "query")
        .map(|(_, v)| v.as_bytes())
        .unwrap_or_default();
    match (param_query.is_empty(), body.is_empty()) {
        (false, false) => {
            let mut out = Vec::with_capacity(param_query.len() + 1 + body.len());
            out.extend_from_slice(param_query);
            out.push(b'\n');
            out.extend_from_slice(body);
            out
        }
        (false, true) => param_query.to_vec(),
        _ => body.to_vec(),
    }
}

/// Builds the upstream query string: client params minus reserved ones,
/// the user's param group filling in gaps, then gateway-assigned
/// credentials and query id.
pub fn upstream_params(
    client_params: &[(String, String)],
    group: Option<&[(String, String)]>,
    backend: &BackendUser,
    query_id: &str,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = client_params
        .iter()
        .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
        .cloned()
        .collect();
    if let Some(group) = group {
        for (k, v) in group {
            if !out.iter().any(|(existing, _)| existing == k) {
                out.push((k.clone(), v.clone()));
            }
        }
    }
    out.push(("user".to_string(), backend.name.clone()));
    out.push(("password".to_string(), backend.password.clone()));
    out.push(("query_id".to_string(), query_id.to_string()));
    out
}

/// The merged params that feed the cache fingerprint: everything sent
/// upstream except credentials, the query id and the query text itself.
pub fn fingerprint_params(
    client_params: &[(String, String)],
    group: Option<&[(String, String)]>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = client_params
        .iter()
        .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()) && k != "query")
        .cloned()
        .collect();
    if let Some(group) = group {
        for (k, v) in group {
            if !out.iter().any(|(existing, _)| existing == k) {
                out.push((k.clone(), v.clone()));
            }
        }
    }
    out
}

/// Whether the client accepts a gzip-compressed response body.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"))
}

/// Whether the request body is gzip-compressed.
pub fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
}

/// The requested output format: `X-ClickHouse-Format` header or the
/// `default_format` URL param.
pub fn output_format(headers: &HeaderMap, params: &[(String, String)]) -> Option<String> {
    headers
        .get("x-clickhouse-format")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .or_else(|| {
            params
                .iter()
                .find(|(k, _)| k == "default_format")
                .map(|(_, v)| v.clone())
        })
}

/// Detects a ClickHouse error travelling inside a 200 response. ClickHouse
/// reports late errors as `Code: <n>. DB::Exception: ...` in the body while
/// keeping the already-sent 200 status; such responses must never be
/// cached. The marker is matched anywhere in the first body chunk.
pub fn looks_like_clickhouse_error(chunk: &[u8]) -> bool {
    const MARKER: &[u8] = b"DB::Exception";
    chunk
        .windows(MARKER.len())
        .any(|window| window == MARKER)
}

/// Unique query id injected into every upstream request; used as the
/// KILL QUERY predicate on cancellation.
pub fn generate_query_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

/// Plain-text error response.
pub fn error_response(status: StatusCode, message: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message))
        .expect("static response construction cannot fail")
}

/// Plain-text error response that also asks the client to drop the
/// connection, used for requests the dispatcher refuses outright.
pub fn error_response_close(status: StatusCode, message: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CONNECTION, "close")
        .body(Body::from(message))
        .expect("static response construction cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config;

    fn backend() -> BackendUser {
        BackendUser::from_config(&config::ClusterUser {
            name: "ch-user".to_string(),
            password: "ch-pass".to_string(),
            ..Default::default()
        })
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_credentials_default() {
        let (user, password) = credentials(&HeaderMap::new(), &[]);
        assert_eq!(user, "default");
        assert_eq!(password, "");
    }

    #[test]
    fn test_credentials_query_params() {
        let p = params(&[("user", "web"), ("password", "secret")]);
        let (user, password) = credentials(&HeaderMap::new(), &p);
        assert_eq!(user, "web");
        assert_eq!(password, "secret");
    }

    #[test]
    fn test_credentials_basic_auth_wins() {
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("web:secret");
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        let p = params(&[("user", "other")]);
        let (user, password) = credentials(&headers, &p);
        assert_eq!(user, "web");
        assert_eq!(password, "secret");
    }

    #[test]
    fn test_credentials_basic_auth_no_password() {
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("web");
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        let (user, password) = credentials(&headers, &[]);
        assert_eq!(user, "web");
        assert_eq!(password, "");
    }

    #[test]
    fn test_full_query_param_and_body() {
        let p = params(&[("query", "SELECT 1")]);
        assert_eq!(full_query(&p, b""), b"SELECT 1");
        assert_eq!(full_query(&[], b"SELECT 2"), b"SELECT 2");
        assert_eq!(
            full_query(&p, b"FORMAT JSON"),
            b"SELECT 1\nFORMAT JSON"
        );
    }

    #[test]
    fn test_upstream_params_overrides_credentials() {
        let p = params(&[
            ("query", "SELECT 1"),
            ("user", "spoofed"),
            ("password", "spoofed"),
            ("query_id", "spoofed"),
            ("max_rows", "10"),
        ]);
        let out = upstream_params(&p, None, &backend(), "qid-1");
        assert!(out.contains(&("query".to_string(), "SELECT 1".to_string())));
        assert!(out.contains(&("max_rows".to_string(), "10".to_string())));
        assert!(out.contains(&("user".to_string(), "ch-user".to_string())));
        assert!(out.contains(&("password".to_string(), "ch-pass".to_string())));
        assert!(out.contains(&("query_id".to_string(), "qid-1".to_string())));
        assert_eq!(
            out.iter().filter(|(k, _)| k == "user").count(),
            1,
            "spoofed credentials must be dropped"
        );
    }

    #[test]
    fn test_upstream_params_group_does_not_override_client() {
        let p = params(&[("max_memory_usage", "100")]);
        let group = params(&[("max_memory_usage", "999"), ("max_threads", "4")]);
        let out = upstream_params(&p, Some(&group), &backend(), "qid");
        assert!(out.contains(&("max_memory_usage".to_string(), "100".to_string())));
        assert!(out.contains(&("max_threads".to_string(), "4".to_string())));
    }

    #[test]
    fn test_fingerprint_params_excludes_query_and_credentials() {
        let p = params(&[
            ("query", "SELECT 1"),
            ("user", "web"),
            ("password", "x"),
            ("query_id", "y"),
            ("max_rows", "10"),
        ]);
        let out = fingerprint_params(&p, None);
        assert_eq!(out, params(&[("max_rows", "10")]));
    }

    #[test]
    fn test_looks_like_clickhouse_error() {
        assert!(looks_like_clickhouse_error(
            b"Code: 60. DB::Exception: Table default.nope doesn't exist"
        ));
        assert!(looks_like_clickhouse_error(b"prefix DB::Exception suffix"));
        assert!(!looks_like_clickhouse_error(b"Ok.\n"));
        assert!(!looks_like_clickhouse_error(b""));
    }

    #[test]
    fn test_generate_query_id_unique() {
        let a = generate_query_id();
        let b = generate_query_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_accepts_gzip() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_gzip(&headers));
        headers.insert(header::ACCEPT_ENCODING, "gzip, deflate".parse().unwrap());
        assert!(accepts_gzip(&headers));
    }
}
