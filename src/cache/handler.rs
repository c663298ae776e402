//! Cache middleware.
//!
//! Looks requests up in a [`Cache`] backend, replays hits, and captures
//! cacheable misses on their way back to the client.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use tower::{Layer, Service};

use crate::cache::body::CaptureBody;
use crate::cache::cacheable::{self, CachedResponse};
use crate::cache::variant::{parse_vary, Variant};
use crate::cache::{Cache, CacheKey, CacheOutcome, X_CACHE};
use crate::observability::metrics;

struct CacheState {
    cache: Arc<dyn Cache>,
    max_body_size: usize,
    /// Base key to the header names its responses vary on.
    vary_index: RwLock<HashMap<CacheKey, Vec<HeaderName>>>,
}

impl CacheState {
    fn known_variant_headers(&self, base_key: CacheKey) -> Option<Vec<HeaderName>> {
        self.vary_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&base_key)
            .cloned()
    }

    fn remember_variant_headers(&self, base_key: CacheKey, names: &[HeaderName]) {
        if self.known_variant_headers(base_key).as_deref() == Some(names) {
            return;
        }

        let mut index = self.vary_index.write().unwrap_or_else(PoisonError::into_inner);
        if names.is_empty() {
            index.remove(&base_key);
        } else {
            index.insert(base_key, names.to_vec());
        }
    }

    fn fetch(&self, key: CacheKey) -> Option<CachedResponse> {
        let blob = self.cache.get(key)?;
        match CachedResponse::decode(&blob) {
            Ok(cached) => Some(cached),
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Discarding unreadable cache entry");
                None
            }
        }
    }

    /// Fetch `key` and confirm the entry belongs to this variant.
    ///
    /// When the stored response varies on a different header set than the
    /// variant assumed, the lookup is redone once with the corrected key. The
    /// declared header set of every hit is recorded under `base_key`.
    fn fetch_variant(
        &self,
        variant: &mut Variant,
        base_key: CacheKey,
        key: CacheKey,
    ) -> Option<CachedResponse> {
        let cached = self.fetch(key)?;

        let declared = parse_vary(&cached.headers);
        let hit = if declared.as_slice() != variant.header_names() {
            variant.apply_header_names(&declared);
            let corrected = self.fetch(variant.cache_key())?;
            variant.matches(&corrected.variant_headers).then_some(corrected)?
        } else {
            variant.matches(&cached.variant_headers).then_some(cached)?
        };

        self.remember_variant_headers(base_key, &declared);
        Some(hit)
    }

    fn lookup(&self, variant: &mut Variant) -> Option<CachedResponse> {
        let base_key = variant.cache_key();
        if let Some(names) = self.known_variant_headers(base_key) {
            variant.apply_header_names(&names);
        }

        let key = variant.cache_key();
        if let Some(cached) = self.fetch_variant(variant, base_key, key) {
            return Some(cached);
        }

        // Entries stored under the plain base key.
        if key != base_key {
            variant.apply_header_names(&[]);
            return self.fetch_variant(variant, base_key, base_key);
        }
        None
    }

    fn store(&self, mut variant: Variant, status: StatusCode, headers: HeaderMap, body: Bytes) {
        let Some(expires_at) = cacheable::cache_status(status, &headers, false, Instant::now())
        else {
            return;
        };

        variant.apply_header_names(&[]);
        let base_key = variant.cache_key();
        variant.set_response_headers(&headers);
        let key = variant.cache_key();
        self.remember_variant_headers(base_key, variant.header_names());

        let cached = CachedResponse::new(status, headers, body, variant.variant_headers());
        match cached.encode() {
            Ok(blob) => {
                tracing::debug!(key = %key, path = variant.path(), size = blob.len(), "Storing response in cache");
                self.cache.set(key, blob, expires_at);
                metrics::record_cache_store();
            }
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Failed to encode response for cache");
            }
        }
    }
}

/// Layer that adds response caching to a service.
#[derive(Clone)]
pub struct CacheLayer {
    state: Arc<CacheState>,
}

impl CacheLayer {
    /// `max_body_size` bounds how much of a response body is captured.
    pub fn new(cache: Arc<dyn Cache>, max_body_size: usize) -> Self {
        Self {
            state: Arc::new(CacheState {
                cache,
                max_body_size,
                vary_index: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Service produced by [`CacheLayer`].
#[derive(Clone)]
pub struct CacheService<S> {
    inner: S,
    state: Arc<CacheState>,
}

impl<S> Service<Request<Body>> for CacheService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut variant = Variant::new(&request);
            if let Some(cached) = state.lookup(&mut variant) {
                metrics::record_cache_outcome(CacheOutcome::Hit);
                return Ok(cached.replay(request.headers()));
            }

            if !is_cacheable_request(&request) {
                let mut response = inner.call(request).await?;
                set_outcome(response.headers_mut(), CacheOutcome::Bypass);
                metrics::record_cache_outcome(CacheOutcome::Bypass);
                return Ok(response);
            }

            let response = inner.call(request).await?;
            metrics::record_cache_outcome(CacheOutcome::Miss);

            let (mut parts, body) = response.into_parts();
            let status = parts.status;
            let origin_headers = parts.headers.clone();
            set_outcome(&mut parts.headers, CacheOutcome::Miss);

            let body = if cacheable::may_cache(status, &origin_headers) {
                let limit = state.max_body_size;
                Body::new(CaptureBody::new(body, limit, move |captured| {
                    state.store(variant, status, origin_headers, captured);
                }))
            } else {
                body
            };

            Ok(Response::from_parts(parts, body))
        })
    }
}

fn set_outcome(headers: &mut HeaderMap, outcome: CacheOutcome) {
    headers.insert(
        HeaderName::from_static(X_CACHE),
        HeaderValue::from_static(outcome.as_str()),
    );
}

/// Only plain GET/HEAD requests without ranges or protocol upgrades are cached.
fn is_cacheable_request<B>(request: &Request<B>) -> bool {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return false;
    }

    let headers = request.headers();
    if headers.contains_key(header::RANGE) {
        return false;
    }

    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));

    !connection_upgrade && !websocket
}
