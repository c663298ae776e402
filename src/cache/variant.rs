//! Cache key derivation for request variants.
//!
//! A request first hashes to a *base key* (method, path, normalized query,
//! host). Once a response's `Vary` header is known, the listed request header
//! values are folded into the hash so each variant gets its own key.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use url::form_urlencoded;
use xxhash_rust::xxh3::Xxh3;

use crate::cache::CacheKey;

/// The request characteristics that decide which cached entry applies.
#[derive(Debug, Clone)]
pub struct Variant {
    method: Method,
    path: String,
    query: String,
    host: String,
    request_headers: HeaderMap,
    header_names: Vec<HeaderName>,
}

impl Variant {
    /// Snapshot the parts of `request` that participate in the key.
    pub fn new<B>(request: &Request<B>) -> Self {
        Self::from_parts(request.method(), request.uri(), request.headers())
    }

    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();

        Self {
            method: method.clone(),
            path: uri.path().to_string(),
            query: normalize_query(uri.query()),
            host,
            request_headers: headers.clone(),
            header_names: Vec::new(),
        }
    }

    /// Learn the varying header names from a response's `Vary` header.
    pub fn set_response_headers(&mut self, response_headers: &HeaderMap) {
        self.header_names = parse_vary(response_headers);
    }

    /// Use a previously learned list of varying header names.
    pub fn apply_header_names(&mut self, names: &[HeaderName]) {
        self.header_names = names.to_vec();
    }

    pub fn header_names(&self) -> &[HeaderName] {
        &self.header_names
    }

    /// Hash the base components plus `name=value` for each varying header.
    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = Xxh3::new();
        for component in [
            self.method.as_str(),
            self.path.as_str(),
            self.query.as_str(),
            self.host.as_str(),
        ] {
            hasher.update(component.as_bytes());
            hasher.update(&[0]);
        }

        for name in &self.header_names {
            hasher.update(name.as_str().as_bytes());
            hasher.update(b"=");
            hasher.update(self.request_value(name));
            hasher.update(&[0]);
        }

        CacheKey::new(hasher.digest())
    }

    /// True when every varying header in `stored` equals the current request's value.
    pub fn matches(&self, stored: &HeaderMap) -> bool {
        self.header_names.iter().all(|name| {
            let stored_value = stored.get(name).map(HeaderValue::as_bytes).unwrap_or_default();
            stored_value == self.request_value(name)
        })
    }

    /// The request header values that make this variant unique.
    pub fn variant_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(self.header_names.len());
        for name in &self.header_names {
            if let Some(value) = self.request_headers.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        headers
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn request_value(&self, name: &HeaderName) -> &[u8] {
        self.request_headers
            .get(name)
            .map(HeaderValue::as_bytes)
            .unwrap_or_default()
    }
}

/// Sorted, deduplicated, lower-cased header names listed by `Vary`.
pub fn parse_vary(headers: &HeaderMap) -> Vec<HeaderName> {
    let mut names: Vec<HeaderName> = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();

    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    names.dedup();
    names
}

/// Re-encode a query string with keys sorted, keeping value order per key.
fn normalize_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}
