//! Transparent qBittorrent proxy
//!
//! `ANY /api/v2/{*path}` forwards to one instance's Web API, selected via
//! the `X-Armada-Instance` header, with the session cookie handled by the
//! pooled client. `torrents/reannounce` is intercepted for monitored
//! instances: hashes the controller takes over are stripped from the
//! upstream call; the rest pass through untouched.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::Response,
};

use crate::api::{AppError, AppState};

const INSTANCE_HEADER: &str = "x-armada-instance";

fn instance_id(headers: &HeaderMap) -> Result<i64, AppError> {
    headers
        .get(INSTANCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            AppError::bad_request(format!("{INSTANCE_HEADER} header with a valid id is required"))
        })
}

/// Pull the `hashes` form field out of an urlencoded reannounce body
fn parse_hashes(body: &[u8]) -> Vec<String> {
    url::form_urlencoded::parse(body)
        .find(|(k, _)| k == "hashes")
        .map(|(_, v)| v.split('|').map(|h| h.to_string()).collect())
        .unwrap_or_default()
}

pub async fn proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let id = instance_id(&headers)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    // Intercept reannounce for monitored instances. "all" cannot be split
    // per-hash, so it always passes through.
    if path == "torrents/reannounce" && method == Method::POST {
        let hashes = parse_hashes(&body);
        if !hashes.is_empty() && !hashes.iter().any(|h| h == "all") {
            let (handled, forward) = state.reannounce.intercept(id, &hashes).await;
            if !handled.is_empty() {
                tracing::debug!(
                    "Intercepted reannounce for instance {}: {} handled, {} forwarded",
                    id,
                    handled.len(),
                    forward.len()
                );
            }
            if forward.is_empty() {
                // Fully handled: answer the way qBittorrent would.
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("Ok."))
                    .map_err(|e| AppError::internal(e.to_string()))?);
            }
            let rebuilt: Vec<u8> = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("hashes", &forward.join("|"))
                .finish()
                .into_bytes();
            return forward_request(
                &state,
                id,
                &method,
                &path,
                uri.query(),
                Some("application/x-www-form-urlencoded"),
                rebuilt,
            )
            .await;
        }
    }

    forward_request(
        &state,
        id,
        &method,
        &path,
        uri.query(),
        content_type,
        body.to_vec(),
    )
    .await
}

/// Relay one request and hand the upstream response back unmodified
async fn forward_request(
    state: &AppState,
    id: i64,
    method: &Method,
    path: &str,
    query: Option<&str>,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> Result<Response, AppError> {
    let client = state.pool.get_client(id).await?;

    let path_and_query = match query {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };

    let upstream = client
        .raw_request(method.as_str(), &path_and_query, content_type, body)
        .await?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let upstream_content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;

    let mut builder = Response::builder().status(status);
    if let Some(ct) = upstream_content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| AppError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hashes() {
        let body = b"hashes=AAA%7CBBB&foo=bar";
        assert_eq!(parse_hashes(body), vec!["AAA", "BBB"]);
        assert!(parse_hashes(b"foo=bar").is_empty());
    }

    #[test]
    fn test_instance_header_required() {
        let headers = HeaderMap::new();
        assert!(instance_id(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(INSTANCE_HEADER, "3".parse().unwrap());
        assert_eq!(instance_id(&headers).unwrap(), 3);

        let mut headers = HeaderMap::new();
        headers.insert(INSTANCE_HEADER, "zero".parse().unwrap());
        assert!(instance_id(&headers).is_err());
    }
}
