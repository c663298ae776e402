//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize metrics, the response cache and the handler stack
//! - Bind listeners before the upstream process starts
//! - Run the upstream supervisor and the cache sweeper alongside the server
//! - Shut everything down on a signal, a server failure or an upstream exit
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The upstream exiting on its own ends the service; an unexpected exit is an error
//! - Shutdown order: stop accepting, stop the upstream, drain connections

use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};

use crate::cache::{Cache, MemoryCache};
use crate::config::{CacheConfig, HttpConfig, ProxyConfig};
use crate::http::server::{Bindings, HttpServer};
use crate::lifecycle::signals::wait_for_signal;
use crate::lifecycle::Shutdown;
use crate::net::{load_tls_config, Listener, ListenerError};
use crate::observability::metrics;
use crate::proxy::ProxyError;
use crate::upstream::{Supervisor, SupervisorError};

/// How often expired cache entries are swept.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Errors that stop the service.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build reverse proxy: {0}")]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to load TLS certificate: {0}")]
    Tls(#[source] std::io::Error),

    #[error("HTTP server failed: {0}")]
    Server(#[source] std::io::Error),

    #[error("upstream process failed: {0}")]
    Upstream(#[from] SupervisorError),

    #[error("upstream supervisor task failed: {0}")]
    UpstreamTask(#[from] JoinError),
}

enum Exit {
    Signal(&'static str),
    Server(Result<(), std::io::Error>),
    Upstream(Result<(), StartupError>),
}

/// Run the proxy until shutdown.
pub async fn run(config: ProxyConfig) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let memory_cache = if config.proxy.enabled {
        build_cache(&config.proxy.cache)
    } else {
        None
    };
    let server = HttpServer::new(
        &config,
        memory_cache.clone().map(|cache| cache as Arc<dyn Cache>),
    )?;
    let bindings = bind(&config.http).await?;

    let shutdown = Shutdown::new();
    if let Some(cache) = memory_cache {
        spawn_cache_sweeper(cache, shutdown.subscribe());
    }

    let supervisor = config
        .upstream
        .enabled
        .then(|| Arc::new(Supervisor::new(config.upstream.clone())));
    let mut upstream_task = supervisor.clone().map(|supervisor| {
        tokio::spawn(async move { supervisor.start().await })
    });

    let server_future = server.run(bindings, shutdown.subscribe());
    tokio::pin!(server_future);

    let exit = tokio::select! {
        name = wait_for_signal() => Exit::Signal(name),
        result = &mut server_future => Exit::Server(result),
        result = wait_upstream(&mut upstream_task) => Exit::Upstream(result),
    };

    let (mut outcome, server_done) = match exit {
        Exit::Signal(name) => {
            tracing::info!(signal = name, "Shutdown signal received");
            (Ok(()), false)
        }
        Exit::Server(result) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server stopped unexpectedly");
            }
            (result.map_err(StartupError::Server), true)
        }
        Exit::Upstream(result) => {
            match &result {
                Ok(()) => tracing::info!("Upstream process exited, shutting down"),
                Err(e) => tracing::error!(error = %e, "Upstream process failed, shutting down"),
            }
            (result, false)
        }
    };

    shutdown.trigger();

    if let Some(supervisor) = &supervisor {
        if let Err(e) = supervisor.stop().await {
            tracing::warn!(error = %e, "Failed to stop upstream process");
        }
    }
    if upstream_task.is_some() {
        if let Err(e) = wait_upstream(&mut upstream_task).await {
            tracing::warn!(error = %e, "Upstream process reported an error while stopping");
        }
    }

    if !server_done {
        if let Err(e) = server_future.await {
            tracing::error!(error = %e, "HTTP server failed while draining");
            outcome = outcome.and(Err(StartupError::Server(e)));
        }
    }

    tracing::info!("Shutdown complete");
    outcome
}

/// Create the memory cache when caching is enabled with usable limits.
pub fn build_cache(config: &CacheConfig) -> Option<Arc<MemoryCache>> {
    if !config.enabled {
        return None;
    }
    if config.capacity_bytes == 0
        || config.max_item_size_bytes == 0
        || config.effective_max_body_bytes() == 0
    {
        tracing::warn!(
            capacity_bytes = config.capacity_bytes,
            max_item_size_bytes = config.max_item_size_bytes,
            "Response cache disabled: limits must be greater than zero"
        );
        return None;
    }
    Some(Arc::new(MemoryCache::new(
        config.capacity_bytes,
        config.max_item_size_bytes,
    )))
}

async fn bind(config: &HttpConfig) -> Result<Bindings, StartupError> {
    let http = Listener::bind(config.port).await?;
    let https = match &config.tls {
        Some(tls) => {
            let rustls = load_tls_config(tls).await.map_err(StartupError::Tls)?;
            Some((Listener::bind(config.https_port).await?, rustls))
        }
        None => None,
    };
    Ok(Bindings { http, https })
}

/// Wait for the supervisor task to finish; never resolves when there is none.
async fn wait_upstream(
    task: &mut Option<JoinHandle<Result<(), SupervisorError>>>,
) -> Result<(), StartupError> {
    let Some(handle) = task.as_mut() else {
        return pending().await;
    };
    let result = handle.await;
    *task = None;
    Ok(result??)
}

fn spawn_cache_sweeper(cache: Arc<MemoryCache>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, entries = cache.len(), "Expired cache entries swept");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
