//! Per-request access logging and request metrics.

use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::AsHeaderName;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use hyper::body::Body as _;

use crate::cache::X_CACHE;
use crate::http::request::X_REQUEST_ID;
use crate::observability::metrics;
use crate::proxy::rewrite::X_FORWARDED_FOR;

/// Whether the middleware writes a log line in addition to recording metrics.
#[derive(Debug, Clone, Copy)]
pub struct AccessLog {
    pub enabled: bool,
}

/// Record every request in metrics and, when enabled, log one line per request.
pub async fn access_log(
    State(log): State<AccessLog>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();
    let headers = request.headers();
    let req_content_length = request.body().size_hint().exact();
    let req_content_type = header_str(headers, &header::CONTENT_TYPE).to_string();
    let user_agent = header_str(headers, &header::USER_AGENT).to_string();
    let request_id = header_str(headers, &X_REQUEST_ID).to_string();
    let remote_addr = match header_str(headers, &X_FORWARDED_FOR) {
        "" => request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default(),
        forwarded => forwarded.to_string(),
    };

    let response = next.run(request).await;
    let elapsed = started.elapsed();

    let status = response.status().as_u16();
    let cache = match header_str(response.headers(), X_CACHE) {
        "" => "none",
        value => value,
    };
    metrics::record_request(method.as_str(), status, cache, elapsed);

    if log.enabled {
        tracing::info!(
            path = %path,
            status,
            dur = elapsed.as_millis() as u64,
            method = %method,
            req_content_length,
            req_content_type = %req_content_type,
            resp_content_length = response.body().size_hint().exact(),
            resp_content_type = %header_str(response.headers(), &header::CONTENT_TYPE),
            remote_addr = %remote_addr,
            user_agent = %user_agent,
            cache = %cache,
            query = %query,
            request_id = %request_id,
            "Request"
        );
    }

    response
}

fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> &str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}
