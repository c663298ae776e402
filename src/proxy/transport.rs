//! Outbound connection strategies.
//!
//! Exactly one strategy is chosen when the proxy is built, in priority order:
//! a UNIX socket when one is configured, prior-knowledge HTTP/2 (h2c) for
//! plain-HTTP targets when enabled, otherwise HTTP/1.1 over TCP or TLS with
//! ALPN negotiated HTTP/2.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, Uri};
use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::{Client, Error as ClientError};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::UnixStream;
use tower::Service;

/// Accept `/path`, `unix:///path` and `unix://path`; blank input means no socket.
///
/// A bare relative path is resolved against the current directory.
pub fn normalize_unix_socket_path(input: &str) -> Option<PathBuf> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.strip_prefix("unix://") {
        Some(rest) if rest.starts_with('/') => Some(PathBuf::from(rest)),
        Some(rest) => Some(PathBuf::from(format!("/{rest}"))),
        None => Some(std::path::absolute(trimmed).unwrap_or_else(|_| PathBuf::from(trimmed))),
    }
}

/// Connector that ignores the request authority and dials a fixed UNIX socket.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: Arc<PathBuf>,
}

impl UnixConnector {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
        }
    }
}

impl Service<Uri> for UnixConnector {
    type Response = UnixConnection;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(path.as_path()).await?;
            Ok(UnixConnection(TokioIo::new(stream)))
        })
    }
}

/// A connected UNIX socket usable by the hyper client.
pub struct UnixConnection(TokioIo<UnixStream>);

impl Connection for UnixConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for UnixConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl Write for UnixConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

/// The HTTP client used to reach the upstream.
#[derive(Clone)]
pub enum UpstreamClient {
    Unix(Client<UnixConnector, Body>),
    H2c(Client<HttpConnector, Body>),
    Standard(Client<HttpsConnector<HttpConnector>, Body>),
}

impl UpstreamClient {
    /// Pick the strategy for a target with `scheme`.
    pub fn new(scheme: &str, unix_socket: Option<PathBuf>, h2c_enabled: bool) -> Self {
        if let Some(path) = unix_socket {
            return UpstreamClient::Unix(
                Client::builder(TokioExecutor::new()).build(UnixConnector::new(path)),
            );
        }

        if h2c_enabled && scheme == "http" {
            return UpstreamClient::H2c(
                Client::builder(TokioExecutor::new())
                    .http2_only(true)
                    .build(HttpConnector::new()),
            );
        }

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        UpstreamClient::Standard(Client::builder(TokioExecutor::new()).build(https))
    }

    pub async fn request(&self, request: Request<Body>) -> Result<Response<Incoming>, ClientError> {
        match self {
            UpstreamClient::Unix(client) => client.request(request).await,
            UpstreamClient::H2c(client) => client.request(request).await,
            UpstreamClient::Standard(client) => client.request(request).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamClient::Unix(_) => "unix",
            UpstreamClient::H2c(_) => "h2c",
            UpstreamClient::Standard(_) => "standard",
        }
    }
}
