//! HTTP response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Request
//!     → variant.rs (base key, Vary-aware key)
//!     → handler.rs (lookup through the Cache backend)
//!         hit  → cacheable.rs (decode, replay / 304)
//!         miss → downstream service
//!              → body.rs (tee the body into a bounded buffer)
//!              → cacheable.rs (cacheability rules, encode)
//!              → Cache::set
//! ```
//!
//! # Design Decisions
//! - The handler only knows the two-method [`Cache`] contract; `memory.rs` is
//!   one implementation of it
//! - Capturing never delays or alters the bytes sent to the client
//! - Cache failures degrade to a miss, never to an error response
//! - Concurrent misses for one key are not coalesced; the last store wins

pub mod body;
pub mod cacheable;
pub mod handler;
pub mod memory;
pub mod variant;

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

pub use cacheable::{CacheCodecError, CachedResponse};
pub use handler::{CacheLayer, CacheService};
pub use memory::MemoryCache;
pub use variant::Variant;

/// Response header reporting how the cache treated a request.
pub const X_CACHE: &str = "x-cache";

/// 64-bit fingerprint of a request variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(u64);

impl CacheKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Storage backend used by the cache handler.
///
/// Implementations must be safe to call from many requests at once. A `set`
/// that cannot be honoured (too large, already expired) is dropped silently.
pub trait Cache: Send + Sync + 'static {
    fn get(&self, key: CacheKey) -> Option<Bytes>;

    fn set(&self, key: CacheKey, value: Bytes, expires_at: Instant);
}

/// How a response was served, as reported in `X-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Bypass => "bypass",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
