//! Cacheability rules, the stored response format and replay.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheOutcome, X_CACHE};

/// Failure to turn a stored blob back into a response, or the reverse.
#[derive(Debug, Error)]
pub enum CacheCodecError {
    #[error("failed to encode cached response: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode cached response: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("stored status code {0} is invalid")]
    InvalidStatus(u16),

    #[error("stored header {0:?} is invalid")]
    InvalidHeader(String),
}

/// A response captured from the origin, ready for storage or replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Request header values of the variant that produced this response.
    pub variant_headers: HeaderMap,
}

#[derive(Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, Bytes)>,
    body: Bytes,
    variant_headers: Vec<(String, Bytes)>,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, variant_headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            body,
            variant_headers,
        }
    }

    /// Serialize for the storage backend. `Set-Cookie` never reaches the store.
    pub fn encode(&self) -> Result<Bytes, CacheCodecError> {
        let stored = StoredResponse {
            status: self.status.as_u16(),
            headers: header_pairs(&self.headers, Some(&header::SET_COOKIE)),
            body: self.body.clone(),
            variant_headers: header_pairs(&self.variant_headers, None),
        };
        Ok(Bytes::from(rmp_serde::to_vec(&stored)?))
    }

    pub fn decode(blob: &[u8]) -> Result<Self, CacheCodecError> {
        let stored: StoredResponse = rmp_serde::from_slice(blob)?;
        let status = StatusCode::from_u16(stored.status)
            .map_err(|_| CacheCodecError::InvalidStatus(stored.status))?;

        Ok(Self {
            status,
            headers: header_map(stored.headers)?,
            body: stored.body,
            variant_headers: header_map(stored.variant_headers)?,
        })
    }

    /// Build the client response for a cache hit.
    ///
    /// A matching `If-None-Match` yields `304 Not Modified` with headers only.
    pub fn replay(&self, request_headers: &HeaderMap) -> Response<Body> {
        let not_modified = self.etag_matches(request_headers);
        let (status, body) = if not_modified {
            (StatusCode::NOT_MODIFIED, Body::empty())
        } else {
            (self.status, Body::from(self.body.clone()))
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = self.headers.clone();
        response.headers_mut().insert(
            HeaderName::from_static(X_CACHE),
            HeaderValue::from_static(CacheOutcome::Hit.as_str()),
        );
        response
    }

    fn etag_matches(&self, request_headers: &HeaderMap) -> bool {
        let Some(etag) = self.headers.get(header::ETAG) else {
            return false;
        };
        let etag = etag.as_bytes();

        request_headers
            .get_all(header::IF_NONE_MATCH)
            .iter()
            .flat_map(|value| value.as_bytes().split(|b| *b == b','))
            .any(|candidate| candidate.trim_ascii() == etag)
    }
}

fn header_pairs(headers: &HeaderMap, skip: Option<&HeaderName>) -> Vec<(String, Bytes)> {
    headers
        .iter()
        .filter(|(name, _)| Some(*name) != skip)
        .map(|(name, value)| (name.as_str().to_string(), Bytes::copy_from_slice(value.as_bytes())))
        .collect()
}

fn header_map(pairs: Vec<(String, Bytes)>) -> Result<HeaderMap, CacheCodecError> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CacheCodecError::InvalidHeader(name.clone()))?;
        let header_value =
            HeaderValue::from_maybe_shared(value).map_err(|_| CacheCodecError::InvalidHeader(name))?;
        headers.append(header_name, header_value);
    }
    Ok(headers)
}

/// Freshness lifetimes beyond this are treated as this many seconds.
const MAX_AGE_CEILING_SECS: u64 = 1 << 31;

/// Whether a response may be requested for capture at all, judged on status and
/// headers before the body is seen.
pub fn may_cache(status: StatusCode, headers: &HeaderMap) -> bool {
    cache_status(status, headers, false, Instant::now()).is_some()
}

/// Decide whether a captured response is cacheable and until when.
///
/// Rules are applied in order: overflowed bodies, status outside 200..=399 or
/// 304, `Vary: *`, a `Cache-Control` lacking `public` or carrying `no-cache`,
/// and finally a positive `s-max-age` (preferred) or `max-age`.
pub fn cache_status(
    status: StatusCode,
    headers: &HeaderMap,
    overflowed: bool,
    now: Instant,
) -> Option<Instant> {
    if overflowed {
        return None;
    }

    let code = status.as_u16();
    if !(200..=399).contains(&code) || status == StatusCode::NOT_MODIFIED {
        return None;
    }

    if header_tokens(headers, &header::VARY).any(|token| token == "*") {
        return None;
    }

    let directives: Vec<String> = header_tokens(headers, &header::CACHE_CONTROL)
        .map(|token| token.to_ascii_lowercase())
        .collect();

    if !directives.iter().any(|d| d == "public") {
        return None;
    }
    if directives.iter().any(|d| d.starts_with("no-cache")) {
        return None;
    }

    let max_age = directive_value(&directives, "s-max-age")
        .or_else(|| directive_value(&directives, "s-maxage"))
        .or_else(|| directive_value(&directives, "max-age"))?;

    let seconds: u64 = max_age.trim_matches('"').parse().ok()?;
    if seconds == 0 {
        return None;
    }

    now.checked_add(Duration::from_secs(seconds.min(MAX_AGE_CEILING_SECS)))
}

fn header_tokens<'a>(headers: &'a HeaderMap, name: &HeaderName) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn directive_value<'a>(directives: &'a [String], name: &str) -> Option<&'a str> {
    directives.iter().find_map(|directive| {
        let (key, value) = directive.split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}
