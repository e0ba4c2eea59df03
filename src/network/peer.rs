//! Remote peer addressing
//!
//! A session streams to either a fixed host/port or a peer looked up when
//! streaming starts, e.g. through a service discovery collaborator.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::error::NetworkError;

/// Produces the current peer host and port
pub trait PeerResolver: Send + Sync {
    fn resolve(&self) -> Option<(String, u16)>;
}

impl<F> PeerResolver for F
where
    F: Fn() -> Option<(String, u16)> + Send + Sync,
{
    fn resolve(&self) -> Option<(String, u16)> {
        self()
    }
}

/// "Resolve peer by name" capability of a discovery service
pub trait PeerDiscovery: Send + Sync {
    fn resolve(&self, name: &str) -> Option<(String, u16)>;
}

/// Resolver that asks a discovery service for a named peer
pub struct DiscoveryPeer {
    discovery: Arc<dyn PeerDiscovery>,
    name: String,
}

impl DiscoveryPeer {
    pub fn new(discovery: Arc<dyn PeerDiscovery>, name: impl Into<String>) -> Self {
        Self {
            discovery,
            name: name.into(),
        }
    }
}

impl PeerResolver for DiscoveryPeer {
    fn resolve(&self) -> Option<(String, u16)> {
        let found = self.discovery.resolve(&self.name);
        if found.is_none() {
            tracing::debug!("Discovery has no address for peer '{}'", self.name);
        }
        found
    }
}

/// Where to send audio
#[derive(Clone)]
pub enum PeerEndpoint {
    Fixed { host: String, port: u16 },
    Dynamic(Arc<dyn PeerResolver>),
}

impl PeerEndpoint {
    pub fn fixed(host: impl Into<String>, port: u16) -> Self {
        PeerEndpoint::Fixed {
            host: host.into(),
            port,
        }
    }

    /// Peer found by name through `discovery` at start time
    pub fn discovered(discovery: Arc<dyn PeerDiscovery>, name: impl Into<String>) -> Self {
        PeerEndpoint::Dynamic(Arc::new(DiscoveryPeer::new(discovery, name)))
    }

    /// Turn the endpoint into a socket address
    pub fn resolve(&self) -> Result<SocketAddr, NetworkError> {
        match self {
            PeerEndpoint::Fixed { host, port } => resolve_addr(host, *port),
            PeerEndpoint::Dynamic(resolver) => {
                let (host, port) = resolver
                    .resolve()
                    .ok_or_else(|| NetworkError::Unresolved("resolver returned no peer".to_string()))?;
                resolve_addr(&host, port)
            }
        }
    }
}

impl fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEndpoint::Fixed { host, port } => write!(f, "Fixed({}:{})", host, port),
            PeerEndpoint::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Resolve `host` (IP literal or name) and `port` to one socket address
pub fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(NetworkError::EmptyPeer);
    }
    if port == 0 {
        return Err(NetworkError::InvalidPeer(format!("{}:0", host)));
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::Unresolved(format!("{}: {}", host, e)))?
        .next()
        .ok_or_else(|| NetworkError::Unresolved(host.to_string()))
}
