//! Configuration for velum controllers
//!
//! JSON-deserializable mirrors of the options the controller
//! recognizes, plus builders that produce a configured controller.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::endpoint::{Endpoint, UnderlayNetwork, DEFAULT_MTU};
use crate::error::{Error, Result};
use crate::mux::{Mux, Role};

/// Deserialize any of the option structs from a JSON file.
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
    parse_json(&raw)
}

/// Deserialize any of the option structs from a JSON string.
fn parse_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| Error::Config(format!("malformed options: {}", e)))
}

/// One server-side user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// Plaintext password; only consulted when `hashed_password` is
    /// absent or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Hex form of the stored password hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_password: Option<String>,
}

/// One listening or dialing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Network string: tcp/tcp4/tcp6/udp/udp4/udp6.
    pub network: String,
    #[serde(default)]
    pub local: Option<SocketAddr>,
    #[serde(default)]
    pub remote: Option<SocketAddr>,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

impl EndpointConfig {
    pub fn build(&self) -> Result<Endpoint> {
        let network: UnderlayNetwork = self.network.parse()?;
        if self.mtu == 0 {
            return Err(Error::Config(format!(
                "endpoint {} must have a positive MTU",
                self.network
            )));
        }
        for addr in [self.local, self.remote].into_iter().flatten() {
            if !network.accepts(&addr) {
                return Err(Error::Config(format!(
                    "{} is not a {} address",
                    addr, network
                )));
            }
        }
        Ok(Endpoint::new(network, self.local, self.remote, self.mtu))
    }
}

/// Options recognized by a client controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub password: String,
    /// Reuse bias; 0 disables underlay reuse.
    #[serde(default)]
    pub multiplex_factor: usize,
    pub endpoints: Vec<EndpointConfig>,
}

impl ClientConfig {
    /// Read client options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    /// Read client options from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        parse_json(json)
    }

    /// Build a configured client controller. Must be called within a
    /// Tokio runtime.
    pub fn build(&self) -> Result<Arc<Mux>> {
        if self.password.is_empty() {
            return Err(Error::Config("client password is not set".to_string()));
        }
        if self.endpoints.is_empty() {
            return Err(Error::Config("no endpoint configured".to_string()));
        }
        let endpoints = self
            .endpoints
            .iter()
            .map(|ep| {
                let endpoint = ep.build()?;
                if endpoint.remote_addr().is_none() {
                    return Err(Error::Config(format!(
                        "client endpoint {} has no remote address",
                        endpoint
                    )));
                }
                Ok(endpoint)
            })
            .collect::<Result<Vec<_>>>()?;

        let mux = Mux::new(Role::Client);
        mux.set_client_password(self.password.as_bytes().to_vec());
        mux.set_client_multiplex_factor(self.multiplex_factor);
        mux.set_endpoints(endpoints);
        Ok(mux)
    }
}

/// Options recognized by a server controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub users: HashMap<String, User>,
    pub endpoints: Vec<EndpointConfig>,
}

impl ServerConfig {
    /// Read server options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    /// Read server options from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        parse_json(json)
    }

    /// Build a configured server controller. Must be called within a
    /// Tokio runtime.
    pub fn build(&self) -> Result<Arc<Mux>> {
        if self.users.is_empty() {
            return Err(Error::Config("no user configured".to_string()));
        }
        for (name, user) in &self.users {
            let has_password = user.password.as_deref().is_some_and(|p| !p.is_empty());
            let has_hashed = user.hashed_password.as_deref().is_some_and(|h| !h.is_empty());
            if !has_password && !has_hashed {
                return Err(Error::Config(format!(
                    "user {} has neither a password nor a hashed password",
                    name
                )));
            }
        }
        if self.endpoints.is_empty() {
            return Err(Error::Config("no endpoint configured".to_string()));
        }
        let endpoints = self
            .endpoints
            .iter()
            .map(|ep| {
                let endpoint = ep.build()?;
                if endpoint.local_addr().is_none() {
                    return Err(Error::Config(format!(
                        "server endpoint {} has no local address",
                        endpoint
                    )));
                }
                Ok(endpoint)
            })
            .collect::<Result<Vec<_>>>()?;

        let mux = Mux::new(Role::Server);
        mux.set_server_users(self.users.clone());
        mux.set_endpoints(endpoints);
        Ok(mux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_config_builds() {
        let json = r#"{
            "password": "open sesame",
            "multiplex_factor": 4,
            "endpoints": [
                {"network": "tcp", "remote": "203.0.113.10:8964", "mtu": 1400}
            ]
        }"#;
        let config = ClientConfig::from_json(json).unwrap();
        assert_eq!(config.multiplex_factor, 4);
        let mux = config.build().unwrap();
        assert_eq!(mux.role(), Role::Client);
    }

    #[tokio::test]
    async fn test_server_config_builds() {
        let json = r#"{
            "users": {
                "alice": {"name": "alice", "password": "hunter2"}
            },
            "endpoints": [
                {"network": "udp4", "local": "0.0.0.0:8964"}
            ]
        }"#;
        let config = ServerConfig::from_json(json).unwrap();
        let mux = config.build().unwrap();
        assert_eq!(mux.role(), Role::Server);
    }

    #[test]
    fn test_endpoint_rejects_unknown_network() {
        let config = EndpointConfig {
            network: "sctp".to_string(),
            local: None,
            remote: Some("203.0.113.10:8964".parse().unwrap()),
            mtu: 1400,
        };
        assert!(matches!(
            config.build().unwrap_err(),
            Error::UnsupportedNetwork(_)
        ));
    }

    #[test]
    fn test_endpoint_rejects_zero_mtu() {
        let config = EndpointConfig {
            network: "tcp".to_string(),
            local: None,
            remote: Some("203.0.113.10:8964".parse().unwrap()),
            mtu: 0,
        };
        assert!(matches!(config.build().unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_endpoint_rejects_family_mismatch() {
        let config = EndpointConfig {
            network: "tcp6".to_string(),
            local: None,
            remote: Some("203.0.113.10:8964".parse().unwrap()),
            mtu: 1400,
        };
        assert!(matches!(config.build().unwrap_err(), Error::Config(_)));
    }

    #[tokio::test]
    async fn test_server_config_requires_credentials() {
        let json = r#"{
            "users": {
                "ghost": {"name": "ghost"}
            },
            "endpoints": [
                {"network": "tcp", "local": "127.0.0.1:8964"}
            ]
        }"#;
        let config = ServerConfig::from_json(json).unwrap();
        assert!(matches!(config.build().unwrap_err(), Error::Config(_)));
    }
}
