//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Port the fronted application is assumed to listen on when nothing else is known.
pub const DEFAULT_TARGET_PORT: u16 = 3000;

/// Root configuration for the edge proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Client-facing listeners and HTTP middleware.
    pub http: HttpConfig,

    /// Reverse proxy, cache and X-Sendfile settings.
    pub proxy: ProxySettings,

    /// The supervised application process.
    pub upstream: UpstreamConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener and middleware configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Plain HTTP port.
    pub port: u16,

    /// HTTPS port, used only when `tls` is set.
    pub https_port: u16,

    /// Optional TLS configuration. When present, the plain port redirects to HTTPS.
    pub tls: Option<TlsConfig>,

    /// Time allowed for a client to send request headers, in seconds (0 = unlimited).
    pub read_timeout_secs: u64,

    /// Time allowed to produce a response, in seconds (0 = unlimited).
    pub write_timeout_secs: u64,

    /// HTTP/2 keep-alive interval for idle connections, in seconds (0 = disabled).
    pub idle_timeout_secs: u64,

    /// Maximum accepted request body size in bytes (0 = unlimited).
    pub max_request_body_bytes: usize,

    /// Compress client responses with gzip.
    pub gzip_enabled: bool,

    /// Emit one access log line per request.
    pub log_requests: bool,

    /// Add `X-Request-Start: t=<millis>` to inbound requests.
    pub add_request_start_header: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            https_port: 443,
            tls: None,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 60,
            max_request_body_bytes: 0,
            gzip_enabled: false,
            log_requests: true,
            add_request_start_header: true,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Reverse proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Register the reverse proxy as the fallback route.
    pub enabled: bool,

    /// Upstream URL. Derived from the upstream section when empty.
    pub target_url: String,

    /// HTML page returned with 502 when the upstream cannot be reached.
    pub bad_gateway_page: String,

    /// Trust inbound X-Forwarded-* headers instead of replacing them.
    pub forward_headers: bool,

    /// Speak prior-knowledge HTTP/2 to plain-HTTP upstreams.
    pub h2c_enabled: bool,

    /// Honour `X-Sendfile` response headers.
    pub x_sendfile_enabled: bool,

    /// Response cache.
    pub cache: CacheConfig,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_url: String::new(),
            bad_gateway_page: "public/502.html".to_string(),
            forward_headers: false,
            h2c_enabled: false,
            x_sendfile_enabled: true,
            cache: CacheConfig::default(),
        }
    }
}

/// Response cache limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Total bytes held by the memory cache.
    pub capacity_bytes: usize,

    /// Largest single encoded entry accepted by the memory cache.
    pub max_item_size_bytes: usize,

    /// Largest response body captured for caching (0 = same as `max_item_size_bytes`).
    pub max_response_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_bytes: 64 * 1024 * 1024,
            max_item_size_bytes: 1024 * 1024,
            max_response_body_bytes: 0,
        }
    }
}

impl CacheConfig {
    /// Body capture limit after applying the item-size fallback.
    pub fn effective_max_body_bytes(&self) -> usize {
        if self.max_response_body_bytes == 0 {
            self.max_item_size_bytes
        } else {
            self.max_response_body_bytes
        }
    }
}

/// Supervised application process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Start and supervise the command.
    pub enabled: bool,

    /// Command line, split with shell-like quoting.
    pub command: String,

    /// Extra arguments appended after the split command.
    pub args: Vec<String>,

    /// Working directory for the process (inherit when empty).
    pub working_directory: String,

    /// Signal sent on shutdown (TERM, INT, QUIT or KILL).
    pub stop_signal: String,

    /// Environment overrides.
    pub env: HashMap<String, String>,

    /// Port exported as `PORT` to the process.
    pub target_port: u16,

    /// UNIX socket the process binds; the proxy dials it and `PORT` is not exported.
    pub target_bind_socket: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: String::new(),
            args: Vec::new(),
            working_directory: String::new(),
            stop_signal: "SIGTERM".to_string(),
            env: HashMap::new(),
            target_port: 0,
            target_bind_socket: String::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: `pretty` or `json`.
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Resolve the URL requests are rewritten to.
    ///
    /// An explicit `proxy.target_url` wins. Otherwise, with a supervised upstream,
    /// a socket binding yields `http://localhost` (the socket is dialled directly)
    /// and a port binding yields `http://127.0.0.1:<port>`.
    pub fn resolved_target_url(&self) -> String {
        if !self.proxy.target_url.is_empty() || !self.upstream.enabled {
            return self.proxy.target_url.clone();
        }
        if !self.upstream.target_bind_socket.is_empty() {
            return "http://localhost".to_string();
        }
        let port = match self.upstream.target_port {
            0 => DEFAULT_TARGET_PORT,
            port => port,
        };
        format!("http://127.0.0.1:{port}")
    }

    /// UNIX socket the proxy dials, if the supervised upstream binds one.
    pub fn unix_socket_path(&self) -> Option<&str> {
        if self.upstream.enabled && !self.upstream.target_bind_socket.is_empty() {
            Some(self.upstream.target_bind_socket.as_str())
        } else {
            None
        }
    }

    /// Fill in `upstream.target_port` from the target URL when the upstream binds a port.
    pub fn derive_upstream_port(&mut self) {
        if !self.upstream.enabled
            || !self.upstream.target_bind_socket.is_empty()
            || self.upstream.target_port != 0
        {
            return;
        }
        self.upstream.target_port = url::Url::parse(&self.proxy.target_url)
            .ok()
            .and_then(|url| url.port())
            .unwrap_or(DEFAULT_TARGET_PORT);
    }
}
