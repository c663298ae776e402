//! Outbound request rewriting.
//!
//! # Responsibilities
//! - Point the request URI at the target (scheme, authority, joined path and query)
//! - Strip hop-by-hop headers, keeping the upgrade handshake intact
//! - Set `X-Forwarded-For`, `X-Forwarded-Host` and `X-Forwarded-Proto`

use std::net::IpAddr;

use axum::http::request::Parts;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Uri, Version};

use crate::proxy::ProxyError;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that apply to a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Scheme of the listener a request arrived on, inserted as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerScheme {
    #[default]
    Http,
    Https,
}

impl ListenerScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerScheme::Http => "http",
            ListenerScheme::Https => "https",
        }
    }
}

/// The upstream every request is rewritten to.
#[derive(Debug, Clone)]
pub struct Target {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
}

impl Target {
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &str| ProxyError::InvalidTarget {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = url.parse().map_err(|_| invalid("not a valid URI"))?;
        let scheme = uri.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(invalid("scheme must be http or https"));
        }
        let authority = uri.authority().cloned().ok_or_else(|| invalid("missing host"))?;

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            base_query: uri.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    pub fn scheme(&self) -> &str {
        self.scheme.as_str()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Build the outbound URI for an inbound one.
    pub fn rewrite_uri(&self, inbound: &Uri) -> Result<Uri, ProxyError> {
        let path = join_path(&self.base_path, inbound.path());
        let query = match (self.base_query.as_deref(), inbound.query()) {
            (Some(base), Some(q)) if !q.is_empty() => Some(format!("{base}&{q}")),
            (Some(base), _) => Some(base.to_string()),
            (None, Some(q)) if !q.is_empty() => Some(q.to_string()),
            _ => None,
        };

        let path_and_query = match query {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };

        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(PathAndQuery::try_from(path_and_query)?)
            .build()?;
        Ok(uri)
    }
}

/// Join two paths with exactly one slash between them.
fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Settings that control forwarded-header handling.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingContext {
    pub client_ip: Option<IpAddr>,
    pub scheme: ListenerScheme,
    /// Trust and extend inbound `X-Forwarded-*` values.
    pub forward_headers: bool,
}

/// Rewrite `parts` in place for the upstream.
pub fn rewrite_request(
    parts: &mut Parts,
    target: &Target,
    context: ForwardingContext,
) -> Result<(), ProxyError> {
    let upgrade = upgrade_type(&parts.headers);
    let inbound_host = parts
        .headers
        .get(header::HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    parts.uri = target.rewrite_uri(&parts.uri)?;
    parts.version = Version::HTTP_11;

    let keep_trailers = parts
        .headers
        .get_all(header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("trailers"));

    remove_hop_by_hop(&mut parts.headers);
    if keep_trailers {
        parts.headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
    if let Some(upgrade) = upgrade {
        parts.headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        parts.headers.insert(header::UPGRADE, upgrade);
    }

    if let Ok(host) = HeaderValue::from_str(target.authority.as_str()) {
        parts.headers.insert(header::HOST, host);
    }

    set_forwarded_headers(&mut parts.headers, inbound_host, context);
    Ok(())
}

fn set_forwarded_headers(
    headers: &mut HeaderMap,
    inbound_host: Option<HeaderValue>,
    context: ForwardingContext,
) {
    let prior_for: Vec<String> = if context.forward_headers {
        headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };
    let prior_host = headers.get(&X_FORWARDED_HOST).cloned();
    let prior_proto = headers.get(&X_FORWARDED_PROTO).cloned();

    headers.remove(&X_FORWARDED_FOR);
    headers.remove(&X_FORWARDED_HOST);
    headers.remove(&X_FORWARDED_PROTO);

    let mut chain = prior_for;
    if let Some(ip) = context.client_ip {
        chain.push(ip.to_string());
    }
    if !chain.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = inbound_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(context.scheme.as_str()),
    );

    if context.forward_headers {
        if let Some(host) = prior_host.filter(|v| !v.is_empty()) {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(proto) = prior_proto.filter(|v| !v.is_empty()) {
            headers.insert(X_FORWARDED_PROTO, proto);
        }
    }
}

/// Remove hop-by-hop headers and any header named in `Connection`.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// The `Upgrade` value when the request asks for a protocol switch.
pub fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if requested {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}
