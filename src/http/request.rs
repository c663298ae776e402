//! Inbound request decoration.
//!
//! # Responsibilities
//! - Generate a request ID (UUID v4) when the client sent none
//! - Stamp `X-Request-Start: t=<unix millis>` for upstream queue-time metrics
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Client-supplied values are kept, never overwritten

use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_REQUEST_START: HeaderName = HeaderName::from_static("x-request-start");

/// Generates UUID v4 request IDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Layer that sets `X-Request-Id` on requests that lack one.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid)
}

/// Layer that copies the request's `X-Request-Id` onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(X_REQUEST_ID)
}

/// Add `X-Request-Start` to requests that do not already carry it.
pub async fn request_start(mut request: Request<Body>, next: Next) -> Response {
    if !request.headers().contains_key(X_REQUEST_START) {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        if let Ok(value) = HeaderValue::from_str(&format!("t={millis}")) {
            request.headers_mut().insert(X_REQUEST_START, value);
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, Router};
    use tower::ServiceExt;

    fn echo_app() -> Router {
        Router::new().fallback(|request: Request<Body>| async move {
            let headers = request.headers();
            format!(
                "{}|{}",
                headers
                    .get(X_REQUEST_START)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(""),
                headers
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
            )
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn request_start_added_when_missing() {
        let app = echo_app().layer(middleware::from_fn(request_start));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_text(response).await;
        let (start, _) = body.split_once('|').unwrap();
        let millis: u128 = start.strip_prefix("t=").unwrap().parse().unwrap();
        assert!(millis > 1_600_000_000_000);
    }

    #[tokio::test]
    async fn request_start_preserved_when_present() {
        let app = echo_app().layer(middleware::from_fn(request_start));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-request-start", "t=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(body_text(response).await.starts_with("t=42|"));
    }

    #[tokio::test]
    async fn request_id_generated_and_propagated() {
        let app = echo_app()
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer());
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(body_text(response).await.ends_with(&id));
    }

    #[tokio::test]
    async fn client_request_id_kept() {
        let app = echo_app()
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[X_REQUEST_ID], "abc-123");
    }
}
