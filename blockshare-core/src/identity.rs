//! Node identity: the host a node listens on plus its port.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a local or remote node. Used as the key of the peer-connection map.
///
/// Equality, ordering and hashing depend only on `(host, port)`, i.e. on [`NodeIdentity::key`].
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    host: String,
    port: u16,
}

impl NodeIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, the string form peers are told apart by.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
