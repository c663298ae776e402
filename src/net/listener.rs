//! TCP listener binding.
//!
//! # Responsibilities
//! - Bind the plain and TLS ports before anything else starts
//! - Hand std listeners to the server in non-blocking mode
//! - Report the bound address (port 0 resolves to an ephemeral port)

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(SocketAddr, std::io::Error),
    /// Failed to hand the socket over to the server.
    Convert(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ListenerError::Convert(e) => write!(f, "Failed to prepare listener: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Bind(_, e) | ListenerError::Convert(e) => Some(e),
        }
    }
}

/// A bound listening socket, ready to be served.
#[derive(Debug)]
pub struct Listener {
    inner: std::net::TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind `port` on all IPv4 interfaces.
    pub async fn bind(port: u16) -> Result<Self, ListenerError> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
    }

    /// Bind an explicit address.
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ListenerError::Bind(addr, e))?;

        let local_addr = listener.local_addr().map_err(ListenerError::Convert)?;
        let inner = listener.into_std().map_err(ListenerError::Convert)?;
        inner.set_nonblocking(true).map_err(ListenerError::Convert)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self { inner, local_addr })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn into_std(self) -> std::net::TcpListener {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_port_is_resolved() {
        let listener = Listener::bind_addr("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(
            listener.into_std().local_addr().unwrap().ip().to_string(),
            "127.0.0.1"
        );
    }

    #[tokio::test]
    async fn port_in_use_is_bind_error() {
        let first = Listener::bind_addr("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let err = Listener::bind_addr(first.local_addr()).await.unwrap_err();
        assert!(matches!(err, ListenerError::Bind(addr, _) if addr == first.local_addr()));
        assert!(err.to_string().starts_with("Failed to bind"));
    }
}
