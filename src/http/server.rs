//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Compose the handler stack: sendfile → cache → reverse proxy
//! - Wire up middleware (trace, request ID, access log, limits, compression)
//! - Serve plain HTTP, or HTTPS plus a plain-port redirect when TLS is configured
//! - Configure header-read timeout and HTTP/2 keep-alive on the listeners
//! - Drain connections gracefully on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::uri::Authority;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use axum::middleware;
use axum::{Extension, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::sync::broadcast;
use tower::{Layer, ServiceBuilder};
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::{Cache, CacheLayer};
use crate::config::{HttpConfig, ProxyConfig};
use crate::http::middleware::{access_log, AccessLog};
use crate::http::request::{propagate_request_id_layer, request_start, set_request_id_layer};
use crate::net::Listener;
use crate::proxy::{ListenerScheme, ProxyError, ProxyOptions, ReverseProxy, SendfileLayer};

/// Time open connections get to finish once shutdown starts.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sockets the server will serve, bound ahead of time.
pub struct Bindings {
    pub http: Listener,
    pub https: Option<(Listener, RustlsConfig)>,
}

/// HTTP server for the edge proxy.
pub struct HttpServer {
    config: HttpConfig,
    app: Router,
}

impl HttpServer {
    /// Build the application router. `cache` enables response caching.
    pub fn new(config: &ProxyConfig, cache: Option<Arc<dyn Cache>>) -> Result<Self, ProxyError> {
        let app = Self::build_router(config, cache)?;
        Ok(Self {
            config: config.http.clone(),
            app,
        })
    }

    /// The application router as seen through a listener of `scheme`.
    pub fn router(&self, scheme: ListenerScheme) -> Router {
        self.app.clone().layer(Extension(scheme))
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, cache: Option<Arc<dyn Cache>>) -> Result<Router, ProxyError> {
        let mut router = Router::new();

        if config.proxy.enabled {
            let proxy = ReverseProxy::new(ProxyOptions {
                target_url: config.resolved_target_url(),
                bad_gateway_page: config.proxy.bad_gateway_page.clone(),
                forward_headers: config.proxy.forward_headers,
                unix_socket_path: config.unix_socket_path().map(str::to_string),
                h2c_enabled: config.proxy.h2c_enabled,
            })?;

            let cache_layer = cache.map(|cache| {
                let max_body = config.proxy.cache.effective_max_body_bytes();
                tracing::info!(max_body_bytes = max_body, "Response cache enabled");
                CacheLayer::new(cache, max_body)
            });

            let sendfile = SendfileLayer::new(config.proxy.x_sendfile_enabled);
            router = match cache_layer {
                Some(cache_layer) => router.fallback_service(
                    ServiceBuilder::new()
                        .layer(sendfile)
                        .layer(cache_layer)
                        .service(proxy),
                ),
                None => router.fallback_service(sendfile.layer(proxy)),
            };
        } else {
            tracing::warn!("Reverse proxy disabled; every request will be answered with 404");
        }

        let http = &config.http;
        if http.gzip_enabled {
            router = router.layer(CompressionLayer::new());
        }
        if http.max_request_body_bytes > 0 {
            router = router.layer(RequestBodyLimitLayer::new(http.max_request_body_bytes));
        }
        if http.write_timeout_secs > 0 {
            router = router.layer(TimeoutLayer::new(Duration::from_secs(http.write_timeout_secs)));
        }
        if http.add_request_start_header {
            router = router.layer(middleware::from_fn(request_start));
        }

        Ok(router
            .layer(middleware::from_fn_with_state(
                AccessLog {
                    enabled: http.log_requests,
                },
                access_log,
            ))
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer())
            .layer(TraceLayer::new_for_http()))
    }

    /// Serve `bindings` until `shutdown` fires, then drain for up to
    /// [`GRACEFUL_SHUTDOWN_TIMEOUT`].
    pub async fn run(
        self,
        bindings: Bindings,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let plain_handle = Handle::new();
        let tls_handle = Handle::new();

        let handles = [plain_handle.clone(), tls_handle.clone()];
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server draining connections");
            for handle in handles {
                handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
            }
        });

        match bindings.https {
            None => {
                tracing::info!(address = %bindings.http.local_addr(), "HTTP server starting");
                serve_plain(
                    bindings.http,
                    self.router(ListenerScheme::Http),
                    &self.config,
                    plain_handle,
                )
                .await?;
            }
            Some((listener, tls)) => {
                tracing::info!(
                    http_address = %bindings.http.local_addr(),
                    https_address = %listener.local_addr(),
                    "HTTPS server starting, plain HTTP redirects"
                );
                tokio::try_join!(
                    serve_plain(
                        bindings.http,
                        redirect_router(self.config.https_port),
                        &self.config,
                        plain_handle,
                    ),
                    serve_tls(
                        listener,
                        tls,
                        self.router(ListenerScheme::Https),
                        &self.config,
                        tls_handle,
                    ),
                )?;
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn serve_plain(
    listener: Listener,
    app: Router,
    config: &HttpConfig,
    handle: Handle,
) -> Result<(), std::io::Error> {
    let mut server = axum_server::from_tcp(listener.into_std()).handle(handle);
    configure_protocol(server.http_builder(), config);
    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

async fn serve_tls(
    listener: Listener,
    tls: RustlsConfig,
    app: Router,
    config: &HttpConfig,
    handle: Handle,
) -> Result<(), std::io::Error> {
    let mut server = axum_server::from_tcp_rustls(listener.into_std(), tls).handle(handle);
    configure_protocol(server.http_builder(), config);
    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

fn configure_protocol(builder: &mut Builder<TokioExecutor>, config: &HttpConfig) {
    if config.read_timeout_secs > 0 {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(Duration::from_secs(config.read_timeout_secs));
    }
    if config.idle_timeout_secs > 0 {
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(Duration::from_secs(config.idle_timeout_secs));
    }
}

/// Router for the plain listener when TLS is on: everything moves to HTTPS.
fn redirect_router(https_port: u16) -> Router {
    Router::new().fallback(move |request: Request<Body>| async move {
        let location = https_location(&request, https_port);
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        if let Ok(location) = HeaderValue::from_str(&location) {
            response.headers_mut().insert(header::LOCATION, location);
        }
        response
    })
}

/// The HTTPS URL for `request`, keeping path and query. The port is only
/// spelled out when it is not 443.
fn https_location<B>(request: &Request<B>, https_port: u16) -> String {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
        .map(strip_port)
        .unwrap_or_default();

    let target_host = if !host.is_empty() && https_port != 443 {
        format!("{host}:{https_port}")
    } else {
        host
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("https://{target_host}{path}")
}

fn strip_port(host: &str) -> String {
    host.parse::<Authority>()
        .map(|authority| authority.host().to_string())
        .unwrap_or_else(|_| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn request(host: Option<&str>, uri: &str) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn https_location_drops_plain_port() {
        let location = https_location(&request(Some("example.com:8080"), "/a/b?x=1"), 443);
        assert_eq!(location, "https://example.com/a/b?x=1");
    }

    #[test]
    fn https_location_appends_non_default_port() {
        let location = https_location(&request(Some("example.com"), "/"), 8443);
        assert_eq!(location, "https://example.com:8443/");
    }

    #[test]
    fn https_location_handles_ipv6_and_missing_host() {
        assert_eq!(
            https_location(&request(Some("[::1]:80"), "/x"), 443),
            "https://[::1]/x"
        );
        assert_eq!(
            https_location(&request(None, "http://fallback.test:81/y"), 443),
            "https://fallback.test/y"
        );
    }

    #[tokio::test]
    async fn redirect_router_answers_301_and_closes() {
        let response = redirect_router(443)
            .oneshot(request(Some("example.com"), "/login?next=%2F"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()["connection"], "close");
        assert_eq!(
            response.headers()["location"],
            "https://example.com/login?next=%2F"
        );
    }

    #[tokio::test]
    async fn disabled_proxy_answers_not_found() {
        let mut config = ProxyConfig::default();
        config.proxy.enabled = false;
        let server = HttpServer::new(&config, None).unwrap();

        let response = server
            .router(ListenerScheme::Http)
            .oneshot(request(Some("example.com"), "/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[test]
    fn invalid_target_fails_to_build() {
        let mut config = ProxyConfig::default();
        config.proxy.target_url = "ftp://nope".into();
        assert!(matches!(
            HttpServer::new(&config, None),
            Err(ProxyError::InvalidTarget { .. })
        ));
    }
}
