//! BlockShare node: peer connections, request dispatch and parallel block downloads.

pub mod connection;
pub mod download;
pub mod handler;
pub mod node;

pub use connection::{Connection, ConnectionError};
pub use download::{DownloadCoordinator, DownloadError, DownloadReport};
pub use handler::ConnectionHandler;
pub use node::{ConnectError, HandshakeError, Node, PeerMap};
