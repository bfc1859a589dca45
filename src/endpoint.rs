//! Underlay endpoint descriptors
//!
//! An endpoint names one place a carrier can be opened: the network
//! (which fixes both the transport kind and the address family), the
//! local and remote socket addresses, and the MTU the carrier is
//! allowed to assume.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default MTU assumed when a configuration does not set one.
pub const DEFAULT_MTU: usize = 1400;

/// Network identifier of an underlay endpoint.
///
/// The names follow the conventional network strings: `tcp`/`tcp4`/
/// `tcp6` for stream carriers and `udp`/`udp4`/`udp6` for datagram
/// carriers. Anything else is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnderlayNetwork {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl UnderlayNetwork {
    /// The canonical network string.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnderlayNetwork::Tcp => "tcp",
            UnderlayNetwork::Tcp4 => "tcp4",
            UnderlayNetwork::Tcp6 => "tcp6",
            UnderlayNetwork::Udp => "udp",
            UnderlayNetwork::Udp4 => "udp4",
            UnderlayNetwork::Udp6 => "udp6",
        }
    }

    /// True for the stream (connection-oriented) networks.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            UnderlayNetwork::Tcp | UnderlayNetwork::Tcp4 | UnderlayNetwork::Tcp6
        )
    }

    /// True for the datagram networks.
    pub fn is_datagram(&self) -> bool {
        !self.is_stream()
    }

    /// Whether an address belongs to this network's family. The
    /// family-neutral networks accept both.
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            UnderlayNetwork::Tcp | UnderlayNetwork::Udp => true,
            UnderlayNetwork::Tcp4 | UnderlayNetwork::Udp4 => addr.is_ipv4(),
            UnderlayNetwork::Tcp6 | UnderlayNetwork::Udp6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for UnderlayNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(UnderlayNetwork::Tcp),
            "tcp4" => Ok(UnderlayNetwork::Tcp4),
            "tcp6" => Ok(UnderlayNetwork::Tcp6),
            "udp" => Ok(UnderlayNetwork::Udp),
            "udp4" => Ok(UnderlayNetwork::Udp4),
            "udp6" => Ok(UnderlayNetwork::Udp6),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl std::fmt::Display for UnderlayNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One place an underlay can be opened or bound.
///
/// Clients need `remote`; servers need `local`. The MTU must be
/// positive; constructors take it as `usize` and the config layer
/// rejects zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    network: UnderlayNetwork,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    mtu: usize,
}

impl Endpoint {
    pub fn new(
        network: UnderlayNetwork,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        mtu: usize,
    ) -> Self {
        Self {
            network,
            local,
            remote,
            mtu,
        }
    }

    /// Client-side endpoint: remote address only.
    pub fn client(network: UnderlayNetwork, remote: SocketAddr, mtu: usize) -> Self {
        Self::new(network, None, Some(remote), mtu)
    }

    /// Server-side endpoint: local address only.
    pub fn server(network: UnderlayNetwork, local: SocketAddr, mtu: usize) -> Self {
        Self::new(network, Some(local), None, mtu)
    }

    pub fn network(&self) -> UnderlayNetwork {
        self.network
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.local, self.remote) {
            (Some(l), Some(r)) => write!(f, "{} {} -> {}", self.network, l, r),
            (Some(l), None) => write!(f, "{} {}", self.network, l),
            (None, Some(r)) => write!(f, "{} -> {}", self.network, r),
            (None, None) => write!(f, "{} (unaddressed)", self.network),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parse() {
        assert_eq!("tcp".parse::<UnderlayNetwork>().unwrap(), UnderlayNetwork::Tcp);
        assert_eq!("udp6".parse::<UnderlayNetwork>().unwrap(), UnderlayNetwork::Udp6);
        assert!("sctp".parse::<UnderlayNetwork>().is_err());
    }

    #[test]
    fn test_network_kind() {
        assert!(UnderlayNetwork::Tcp4.is_stream());
        assert!(UnderlayNetwork::Udp.is_datagram());
        assert!(!UnderlayNetwork::Udp4.is_stream());
    }

    #[test]
    fn test_network_family() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(UnderlayNetwork::Tcp.accepts(&v4));
        assert!(UnderlayNetwork::Tcp.accepts(&v6));
        assert!(UnderlayNetwork::Tcp4.accepts(&v4));
        assert!(!UnderlayNetwork::Tcp4.accepts(&v6));
        assert!(UnderlayNetwork::Udp6.accepts(&v6));
        assert!(!UnderlayNetwork::Udp6.accepts(&v4));
    }

    #[test]
    fn test_endpoint_accessors() {
        let remote: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let ep = Endpoint::client(UnderlayNetwork::Tcp, remote, 1400);
        assert_eq!(ep.remote_addr(), Some(remote));
        assert_eq!(ep.local_addr(), None);
        assert_eq!(ep.mtu(), 1400);
        assert_eq!(ep.to_string(), "tcp -> 127.0.0.1:9000");
    }
}
