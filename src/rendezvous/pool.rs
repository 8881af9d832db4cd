//! Rotations-Ledger über Rendezvous-Endpunkte
//!
//! Hält keinen Gesundheitszustand; der Orchestrator entscheidet, wann
//! rotiert wird, und baut eine laufende Session vorher ab.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Rendezvous catalog is empty")]
    EmptyCatalog,

    #[error("Endpoint index {index} out of range (pool has {len} endpoints)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Endpoint {endpoint} has no valid URL: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
}

/// Ein Endpunkt des Rendezvous-Dienstes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Routing-Key des Dienstes
    pub key: String,
    pub secure: bool,
}

impl RendezvousEndpoint {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>, key: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            key: key.into(),
            secure,
        }
    }

    /// WebSocket-URL inklusive Routing-Key; der Pool nimmt nur Endpunkte an,
    /// für die sie sich bilden lässt
    pub fn url(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let mut url = Url::parse(&format!("{scheme}://{}:{}{path}", self.host, self.port))?;
        url.query_pairs_mut().append_pair("key", &self.key);
        Ok(url)
    }
}

impl std::fmt::Display for RendezvousEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}

/// Standard-Katalog der öffentlichen Rendezvous-Server
pub fn default_rendezvous_catalog() -> Vec<RendezvousEndpoint> {
    ["0.peerjs.com", "1.peerjs.com", "2.peerjs.com", "3.peerjs.com"]
        .into_iter()
        .map(|host| RendezvousEndpoint::new(host, 443, "/", "peerjs", true))
        .collect()
}

/// Geordnete Endpunkte plus aktueller Index
#[derive(Debug, Clone)]
pub struct RendezvousServerPool {
    endpoints: Vec<RendezvousEndpoint>,
    index: usize,
}

impl RendezvousServerPool {
    pub fn new(endpoints: Vec<RendezvousEndpoint>) -> Result<Self, PoolError> {
        if endpoints.is_empty() {
            return Err(PoolError::EmptyCatalog);
        }
        for endpoint in &endpoints {
            endpoint.url().map_err(|source| PoolError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                source,
            })?;
        }
        Ok(Self { endpoints, index: 0 })
    }

    pub fn current(&self) -> &RendezvousEndpoint {
        &self.endpoints[self.index]
    }

    /// Rotiert zum nächsten Endpunkt (mit Wrap-around)
    pub fn advance(&mut self) -> &RendezvousEndpoint {
        self.index = (self.index + 1) % self.endpoints.len();
        tracing::info!("Rendezvous endpoint rotated to {}", self.endpoints[self.index]);
        &self.endpoints[self.index]
    }

    /// Wählt einen Endpunkt explizit aus
    pub fn select(&mut self, index: usize) -> Result<&RendezvousEndpoint, PoolError> {
        if index >= self.endpoints.len() {
            return Err(PoolError::IndexOutOfRange {
                index,
                len: self.endpoints.len(),
            });
        }
        self.index = index;
        Ok(&self.endpoints[index])
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_wraps_around() {
        let mut pool = RendezvousServerPool::new(default_rendezvous_catalog()).unwrap();
        assert_eq!(pool.current().host, "0.peerjs.com");

        for expected in ["1.peerjs.com", "2.peerjs.com", "3.peerjs.com", "0.peerjs.com"] {
            assert_eq!(pool.advance().host, expected);
        }
        assert_eq!(pool.index(), 0);
    }

    #[test]
    fn test_select_and_errors() {
        assert_eq!(
            RendezvousServerPool::new(Vec::new()).unwrap_err(),
            PoolError::EmptyCatalog
        );

        let mut pool = RendezvousServerPool::new(default_rendezvous_catalog()).unwrap();
        assert_eq!(pool.select(2).unwrap().host, "2.peerjs.com");
        assert!(matches!(
            pool.select(9),
            Err(PoolError::IndexOutOfRange { index: 9, len: 4 })
        ));
        assert_eq!(pool.index(), 2);
    }

    #[test]
    fn test_url_contains_key_and_scheme() {
        let endpoint = RendezvousEndpoint::new("localhost", 9000, "myapp", "dev", false);
        let url = endpoint.url().unwrap();

        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/myapp");
        assert_eq!(url.query(), Some("key=dev"));
    }

    #[test]
    fn test_pool_rejects_endpoint_without_valid_url() {
        let mut catalog = default_rendezvous_catalog();
        catalog.push(RendezvousEndpoint::new("bad host", 443, "/", "peerjs", true));

        let err = RendezvousServerPool::new(catalog).unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidEndpoint { ref endpoint, .. } if endpoint == "bad host:443/"
        ));
    }
}
