//! Local node: identity, catalog, listening socket and the peer-connection map.
//!
//! The peer map is the only node-wide mutable state. It is never locked across network
//! I/O: callers copy out the connections they need and release the lock first.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use blockshare_core::scheduler::{self, SearchGroups};
use blockshare_core::{Config, FileSearchResult, Message, NodeIdentity, WorkFolder};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionError};
use crate::download::{DownloadCoordinator, DownloadError, DownloadReport};
use crate::handler::ConnectionHandler;

/// Live connections keyed by peer identity; at most one per identity.
pub type PeerMap = HashMap<NodeIdentity, Arc<Connection>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("cannot connect to self ({0})")]
    SelfConnection(NodeIdentity),
    #[error("failed to connect to {peer}: {source}")]
    Io {
        peer: NodeIdentity,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("cannot connect to self ({0})")]
    SelfConnection(NodeIdentity),
    #[error("connection timeout with peer {0}")]
    Timeout(NodeIdentity),
    #[error("connection rejected by peer {0}")]
    Rejected(NodeIdentity),
    #[error("peer {0} closed the connection during handshake")]
    Closed(NodeIdentity),
    #[error("handshake send failed: {0}")]
    Send(#[from] ConnectionError),
}

pub struct Node {
    identity: NodeIdentity,
    config: Config,
    catalog: Arc<WorkFolder>,
    peers: Mutex<PeerMap>,
    /// Woken whenever a connect attempt finishes, successful or not.
    peers_changed: Notify,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Bind the listening socket on all interfaces. Port 0 picks a free port, which
    /// then becomes the port in the node's identity.
    pub async fn bind(
        host: impl Into<String>,
        port: u16,
        catalog: WorkFolder,
        config: Config,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        let identity = NodeIdentity::new(host, local_addr.port());
        let (shutdown, _) = watch::channel(false);
        info!(%identity, folder = %catalog.root().display(), "node bound");
        Ok(Arc::new(Self {
            identity,
            config,
            catalog: Arc::new(catalog),
            peers: Mutex::new(PeerMap::new()),
            peers_changed: Notify::new(),
            listener: parking_lot::Mutex::new(Some(listener)),
            local_addr,
            shutdown,
        }))
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<WorkFolder> {
        &self.catalog
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until [`shutdown`](Self::shutdown), giving each one a handler task.
    /// Returns `Ok` on shutdown; any accept failure is logged and returned.
    pub async fn start_server(self: &Arc<Self>) -> io::Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "server already started",
            ));
        };
        let mut stop = self.shutdown.subscribe();
        info!(port = self.identity.port(), "node listening");
        loop {
            tokio::select! {
                _ = async { let _ = stop.wait_for(|s| *s).await; } => {
                    info!("server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted connection");
                        ConnectionHandler::new(Arc::new(Connection::new(stream)), self.clone()).spawn();
                    }
                    Err(e) => {
                        error!(error = %e, "server error");
                        return Err(e);
                    }
                }
            }
        }
    }

    pub fn start_server_async(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let _ = node.start_server().await;
        })
    }

    /// Close the listening socket; the accept loop ends cleanly.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Open a connection to `peer` and install it in the peer map, replacing (and closing)
    /// any previous connection for that identity. Handshake waiters are woken either way.
    pub async fn connect(&self, peer: &NodeIdentity) -> Result<(), ConnectError> {
        if *peer == self.identity {
            warn!(%peer, "refusing self-connection");
            return Err(ConnectError::SelfConnection(peer.clone()));
        }
        let result = match Connection::open(peer).await {
            Ok(conn) => {
                let replaced = self.peers.lock().await.insert(peer.clone(), Arc::new(conn));
                if let Some(old) = replaced {
                    old.close().await;
                }
                info!(%peer, "added new peer");
                Ok(())
            }
            Err(source) => {
                error!(%peer, error = %source, "failed to add peer");
                Err(ConnectError::Io {
                    peer: peer.clone(),
                    source,
                })
            }
        };
        self.peers_changed.notify_waiters();
        result
    }

    pub fn connect_async(self: &Arc<Self>, peer: NodeIdentity) -> JoinHandle<Result<(), ConnectError>> {
        let node = self.clone();
        tokio::spawn(async move { node.connect(&peer).await })
    }

    /// Connect to `peer` unless a live connection to it already exists.
    pub(crate) async fn ensure_peer(&self, peer: &NodeIdentity) -> Result<(), ConnectError> {
        if self.peer(peer).await.is_some_and(|c| c.is_alive()) {
            return Ok(());
        }
        self.connect(peer).await
    }

    /// Introduce this node to `peer` over the connection opened by [`connect`](Self::connect).
    ///
    /// Waits up to `handshake_timeout` for that connection to appear, sends
    /// `NewConnectionRequest` and accepts only an ack carrying our own identity.
    /// A wrong ack, or no ack in time, closes the connection.
    pub async fn handshake(&self, peer: &NodeIdentity) -> Result<(), HandshakeError> {
        if *peer == self.identity {
            return Err(HandshakeError::SelfConnection(peer.clone()));
        }
        let Some(conn) = self.wait_for_peer(peer).await else {
            warn!(%peer, "connection timeout");
            return Err(HandshakeError::Timeout(peer.clone()));
        };
        conn.send(&Message::NewConnectionRequest {
            host: self.identity.host().to_owned(),
            port: self.identity.port(),
        })
        .await?;
        let reply = tokio::time::timeout(self.config.handshake_timeout, conn.receive()).await;
        match reply {
            Ok(Some(Message::NewConnectionRequestAck { identity })) if identity == self.identity => {
                info!(%peer, "connection accepted by peer");
                Ok(())
            }
            Ok(Some(other)) => {
                warn!(%peer, kind = other.kind(), "connection rejected by peer");
                conn.close().await;
                Err(HandshakeError::Rejected(peer.clone()))
            }
            Ok(None) => Err(HandshakeError::Closed(peer.clone())),
            Err(_) => {
                warn!(%peer, "no handshake reply");
                conn.close().await;
                Err(HandshakeError::Timeout(peer.clone()))
            }
        }
    }

    async fn wait_for_peer(&self, peer: &NodeIdentity) -> Option<Arc<Connection>> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let changed = self.peers_changed.notified();
            if let Some(conn) = self.peer(peer).await.filter(|c| c.is_alive()) {
                return Some(conn);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = self.config.handshake_poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, changed).await;
        }
    }

    /// Remove and close the connection to `peer`. Returns false if there was none.
    pub async fn remove_peer(&self, peer: &NodeIdentity) -> bool {
        let removed = self.peers.lock().await.remove(peer);
        match removed {
            Some(conn) => {
                conn.close().await;
                info!(%peer, "removed peer");
                true
            }
            None => false,
        }
    }

    pub async fn peer(&self, peer: &NodeIdentity) -> Option<Arc<Connection>> {
        self.peers.lock().await.get(peer).cloned()
    }

    /// Identities in the peer map, alive or not, sorted.
    pub async fn peers(&self) -> Vec<NodeIdentity> {
        let mut ids: Vec<NodeIdentity> = self.peers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn snapshot(&self) -> PeerMap {
        self.peers.lock().await.clone()
    }

    /// Ask every live peer for files matching `word` and group the answers by content hash.
    /// Dead connections are skipped. With no peers at all nothing is sent.
    pub async fn search(&self, word: &str) -> SearchGroups {
        let targets: Vec<(NodeIdentity, Arc<Connection>)> = {
            let peers = self.peers.lock().await;
            if peers.is_empty() {
                info!("no peers connected, search ignored");
                return SearchGroups::new();
            }
            peers
                .iter()
                .filter_map(|(id, conn)| {
                    if conn.is_alive() {
                        Some((id.clone(), conn.clone()))
                    } else {
                        info!(peer = %id, "dead connection with peer");
                        None
                    }
                })
                .collect()
        };

        let mut queries = JoinSet::new();
        for (peer, conn) in targets {
            let msg = Message::WordSearch {
                word: word.to_owned(),
                sender_host: self.identity.host().to_owned(),
                sender_port: self.identity.port(),
            };
            queries.spawn(query_peer(peer, conn, msg));
        }
        let mut found = Vec::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(results) => found.extend(results),
                Err(e) => warn!(error = %e, "search task failed"),
            }
        }
        scheduler::group_by_content(found)
    }

    /// Fetch one file from the peers listed in `results` and save it in the local folder.
    pub async fn download(
        &self,
        file_name: &str,
        results: &[FileSearchResult],
    ) -> Result<DownloadReport, DownloadError> {
        let connections = self.snapshot().await;
        DownloadCoordinator::new(file_name, self.catalog.clone(), self.config.clone())
            .run(results, &connections)
            .await
    }

    /// Spawned form of [`download`](Self::download); the outcome arrives on the returned
    /// receiver, which can be awaited or read with `blocking_recv` from a non-runtime thread.
    pub fn download_async(
        self: &Arc<Self>,
        file_name: String,
        results: Vec<FileSearchResult>,
    ) -> oneshot::Receiver<Result<DownloadReport, DownloadError>> {
        let (tx, rx) = oneshot::channel();
        let node = self.clone();
        tokio::spawn(async move {
            let outcome = node.download(&file_name, &results).await;
            let _ = tx.send(outcome);
        });
        rx
    }
}

async fn query_peer(peer: NodeIdentity, conn: Arc<Connection>, msg: Message) -> Vec<FileSearchResult> {
    if let Err(e) = conn.send(&msg).await {
        warn!(%peer, error = %e, "search request failed");
        return Vec::new();
    }
    match conn.receive().await {
        Some(Message::SearchResults(results)) => {
            debug!(%peer, hits = results.len(), "search results");
            results
        }
        Some(other) => {
            warn!(%peer, kind = other.kind(), "unexpected reply to search");
            Vec::new()
        }
        None => {
            warn!(%peer, "no search reply from peer");
            Vec::new()
        }
    }
}
