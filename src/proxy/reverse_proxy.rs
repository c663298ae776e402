//! The service that forwards requests to the upstream.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::LengthLimitError;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tower::Service;

use crate::observability::metrics;
use crate::proxy::rewrite::{self, ForwardingContext, ListenerScheme, Target};
use crate::proxy::transport::{normalize_unix_socket_path, UpstreamClient};
use crate::proxy::ProxyError;

/// How the reverse proxy reaches and presents the upstream.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub target_url: String,
    /// HTML page served with 502 responses; read once at build time.
    pub bad_gateway_page: String,
    pub forward_headers: bool,
    /// Dial this UNIX socket instead of the target's host and port.
    pub unix_socket_path: Option<String>,
    pub h2c_enabled: bool,
}

struct Inner {
    target: Target,
    client: UpstreamClient,
    forward_headers: bool,
    bad_gateway_page: Option<Bytes>,
}

/// Forwards every request to a single upstream.
#[derive(Clone)]
pub struct ReverseProxy {
    inner: Arc<Inner>,
}

impl ReverseProxy {
    pub fn new(options: ProxyOptions) -> Result<Self, ProxyError> {
        let target = Target::parse(&options.target_url)?;
        let socket = options
            .unix_socket_path
            .as_deref()
            .and_then(normalize_unix_socket_path);
        let client = UpstreamClient::new(target.scheme(), socket.clone(), options.h2c_enabled);

        let bad_gateway_page = read_bad_gateway_page(&options.bad_gateway_page);

        tracing::info!(
            target = %options.target_url,
            transport = client.kind(),
            unix_socket = ?socket,
            forward_headers = options.forward_headers,
            bad_gateway_page = %options.bad_gateway_page,
            "Reverse proxy enabled"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                target,
                client,
                forward_headers: options.forward_headers,
                bad_gateway_page,
            }),
        })
    }

    /// Forward one request and produce the client response.
    pub async fn forward(&self, request: Request<Body>) -> Response<Body> {
        let (mut parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();

        let client_upgrade = if rewrite::upgrade_type(&parts.headers).is_some() {
            parts.extensions.remove::<OnUpgrade>()
        } else {
            None
        };

        let context = ForwardingContext {
            client_ip: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
            scheme: parts
                .extensions
                .get::<ListenerScheme>()
                .copied()
                .unwrap_or_default(),
            forward_headers: self.inner.forward_headers,
        };

        if let Err(e) = rewrite::rewrite_request(&mut parts, &self.inner.target, context) {
            return self.error_response(&path, &e);
        }

        let outbound = Request::from_parts(parts, body);
        match self.inner.client.request(outbound).await {
            Ok(response) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                self.tunnel(response, client_upgrade, &path)
            }
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                rewrite::remove_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => self.error_response(&path, &ProxyError::Upstream(e)),
        }
    }

    /// Relay bytes between client and upstream once both sides have switched protocols.
    fn tunnel(
        &self,
        mut response: Response<Incoming>,
        client_upgrade: Option<OnUpgrade>,
        path: &str,
    ) -> Response<Body> {
        let Some(client_upgrade) = client_upgrade else {
            tracing::warn!(path, "Upstream switched protocols but the client connection cannot be upgraded");
            metrics::record_upstream_error("bad_gateway");
            return self.bad_gateway();
        };

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let path = path.to_string();
        tokio::spawn(async move {
            let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Protocol upgrade failed");
                    return;
                }
            };

            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => {
                    tracing::debug!(path = %path, sent, received, "Upgraded connection closed");
                }
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "Upgraded connection ended with error");
                }
            }
        });

        let (parts, _body) = response.into_parts();
        Response::from_parts(parts, Body::empty())
    }

    fn error_response(&self, path: &str, error: &(dyn StdError + 'static)) -> Response<Body> {
        tracing::info!(path, error = %error, "Unable to proxy request");

        if is_request_entity_too_large(error) {
            metrics::record_upstream_error("body_too_large");
            return status_response(StatusCode::PAYLOAD_TOO_LARGE);
        }

        metrics::record_upstream_error("bad_gateway");
        self.bad_gateway()
    }

    fn bad_gateway(&self) -> Response<Body> {
        match &self.inner.bad_gateway_page {
            Some(page) => {
                let mut response = Response::new(Body::from(page.clone()));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
                response
            }
            None => status_response(StatusCode::BAD_GATEWAY),
        }
    }
}

impl Service<Request<Body>> for ReverseProxy {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.forward(request).await) })
    }
}

fn read_bad_gateway_page(path: &str) -> Option<Bytes> {
    if path.is_empty() {
        return None;
    }
    match std::fs::read(Path::new(path)) {
        Ok(content) => Some(Bytes::from(content)),
        Err(e) => {
            tracing::debug!(path, error = %e, "No custom 502 page found");
            None
        }
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Whether any error in the chain is a request body size violation.
fn is_request_entity_too_large(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::io::Write;

    fn options(target: &str) -> ProxyOptions {
        ProxyOptions {
            target_url: target.to_string(),
            ..ProxyOptions::default()
        }
    }

    async fn unreachable_target() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[test]
    fn invalid_target_is_rejected() {
        assert!(matches!(
            ReverseProxy::new(options("not a url")),
            Err(ProxyError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn length_limit_found_in_error_chain() {
        let err = http_body_util::Limited::new(Body::from("far too long"), 2)
            .collect()
            .await
            .unwrap_err();
        assert!(is_request_entity_too_large(err.as_ref()));

        let wrapped = axum::Error::new(err);
        assert!(is_request_entity_too_large(&wrapped));

        assert!(!is_request_entity_too_large(&std::io::Error::other("refused")));
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_bare_502() {
        let proxy = ReverseProxy::new(options(&unreachable_target().await)).unwrap();
        let response = proxy
            .forward(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_serves_error_page() {
        let mut page = tempfile::NamedTempFile::new().unwrap();
        write!(page, "<h1>down</h1>").unwrap();

        let proxy = ReverseProxy::new(ProxyOptions {
            bad_gateway_page: page.path().to_string_lossy().into_owned(),
            ..options(&unreachable_target().await)
        })
        .unwrap();

        let response = proxy
            .forward(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], "text/html");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "<h1>down</h1>");
    }
}
