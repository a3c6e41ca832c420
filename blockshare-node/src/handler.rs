//! Serves one accepted connection: handshakes and searches inline, block requests
//! through a bounded queue drained by a small worker pool.

use std::sync::Arc;

use blockshare_core::{BlockAnswer, BlockRequest, FileSearchResult, Message, NodeIdentity, WorkFolder};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::node::Node;

type RequestQueue = Arc<Mutex<mpsc::Receiver<BlockRequest>>>;

pub struct ConnectionHandler {
    connection: Arc<Connection>,
    node: Arc<Node>,
}

impl ConnectionHandler {
    pub fn new(connection: Arc<Connection>, node: Arc<Node>) -> Self {
        Self { connection, node }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Dispatch messages until the connection ends, then let the workers drain and close it.
    pub async fn run(self) {
        let config = self.node.config();
        let (tx, rx) = mpsc::channel(config.serve_queue_capacity.max(1));
        let queue: RequestQueue = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..config.serve_workers.max(1) {
            workers.spawn(serve_blocks(
                queue.clone(),
                self.connection.clone(),
                self.node.catalog().clone(),
            ));
        }

        let remote = self.connection.remote_addr();
        debug!(?remote, "handler started");
        while let Some(msg) = self.connection.receive().await {
            match msg {
                Message::NewConnectionRequest { host, port } => {
                    self.accept_peer(NodeIdentity::new(host, port)).await;
                }
                Message::WordSearch {
                    word,
                    sender_host,
                    sender_port,
                } => {
                    let results = self.search(&word);
                    debug!(%word, %sender_host, sender_port, hits = results.len(), "search");
                    if let Err(e) = self.connection.send(&Message::SearchResults(results)).await {
                        warn!(error = %e, "failed to send search results");
                    }
                }
                Message::FileBlockRequest(request) => {
                    // Bounded queue: a flood of requests stalls this loop instead of memory.
                    if tx.send(request).await.is_err() {
                        break;
                    }
                }
                other => warn!(?remote, kind = other.kind(), "unexpected message"),
            }
        }

        drop(tx);
        while workers.join_next().await.is_some() {}
        self.connection.close().await;
        debug!(?remote, "handler finished");
    }

    /// Connect back to a new peer (unless already connected) and acknowledge with its identity.
    async fn accept_peer(&self, peer: NodeIdentity) {
        info!(%peer, "new connection request");
        let node = self.node.clone();
        let target = peer.clone();
        tokio::spawn(async move {
            let _ = node.ensure_peer(&target).await;
        });
        let ack = Message::NewConnectionRequestAck { identity: peer };
        if let Err(e) = self.connection.send(&ack).await {
            warn!(error = %e, "failed to send connection ack");
        }
    }

    fn search(&self, word: &str) -> Vec<FileSearchResult> {
        let me = self.node.identity();
        self.node
            .catalog()
            .search_by_keyword(word)
            .into_iter()
            .map(|m| FileSearchResult {
                file_name: m.file_name,
                file_size: m.file_size,
                content_hash: m.content_hash,
                responder_host: me.host().to_owned(),
                responder_port: me.port(),
            })
            .collect()
    }
}

/// Answer queued block requests. Unknown hashes and offsets past the end get no reply.
async fn serve_blocks(queue: RequestQueue, connection: Arc<Connection>, catalog: Arc<WorkFolder>) {
    loop {
        let Some(request) = queue.lock().await.recv().await else {
            return;
        };
        let lookup = {
            let catalog = catalog.clone();
            let hash = request.content_hash.clone();
            tokio::task::spawn_blocking(move || catalog.get_block(&hash, request.offset))
        };
        let block = match lookup.await {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "block lookup panicked");
                None
            }
        };
        let Some(block) = block else {
            debug!(hash = %request.content_hash, offset = request.offset, "no such block");
            continue;
        };
        let answer = BlockAnswer::for_request(&request, block.data);
        if let Err(e) = connection.send(&Message::FileBlockAnswer(answer)).await {
            debug!(error = %e, "failed to send block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockshare_core::{integrity, Config};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    /// A serving node with one file, plus a raw client connection to its handler.
    async fn serve(block_size: u64) -> (tempfile::TempDir, Arc<Node>, Connection) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"0123456789").unwrap();
        let config = Config {
            block_size,
            ..Config::default()
        };
        let catalog = WorkFolder::open(dir.path(), &config).unwrap();
        let node = Node::bind("127.0.0.1", 0, catalog, config).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        ConnectionHandler::new(Arc::new(Connection::new(accepted.unwrap().0)), node.clone()).spawn();
        (dir, node, Connection::new(client.unwrap()))
    }

    fn request(offset: u64, length: u64, index: u32) -> Message {
        Message::FileBlockRequest(BlockRequest {
            content_hash: integrity::hash_bytes(b"0123456789"),
            offset,
            length,
            index,
        })
    }

    #[tokio::test]
    async fn answers_search_with_own_identity() {
        let (_dir, node, client) = serve(4).await;
        client
            .send(&Message::WordSearch {
                word: "NOTES".into(),
                sender_host: "127.0.0.1".into(),
                sender_port: 1,
            })
            .await
            .unwrap();
        match client.receive().await {
            Some(Message::SearchResults(results)) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].file_name, "notes.txt");
                assert_eq!(results[0].file_size, 10);
                assert_eq!(&results[0].responder(), node.identity());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn serves_every_block_once() {
        let (_dir, _node, client) = serve(4).await;
        for (i, offset) in [0u64, 4, 8].into_iter().enumerate() {
            client.send(&request(offset, 4.min(10 - offset), i as u32)).await.unwrap();
        }
        let mut got = Vec::new();
        for _ in 0..3 {
            match client.receive().await {
                Some(Message::FileBlockAnswer(a)) => got.push((a.offset, a.data)),
                other => panic!("unexpected {other:?}"),
            }
        }
        got.sort();
        assert_eq!(
            got,
            vec![(0, b"0123".to_vec()), (4, b"4567".to_vec()), (8, b"89".to_vec())]
        );
    }

    #[tokio::test]
    async fn unknown_block_gets_no_answer() {
        let (_dir, _node, client) = serve(4).await;
        client
            .send(&Message::FileBlockRequest(BlockRequest {
                content_hash: "nope".into(),
                offset: 0,
                length: 4,
                index: 0,
            }))
            .await
            .unwrap();
        client.send(&request(40, 4, 1)).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_millis(200), client.receive()).await;
        assert!(reply.is_err());
    }

    #[tokio::test]
    async fn acks_handshake_with_requester_identity() {
        let (_dir, _node, client) = serve(4).await;
        // Nothing listens on the requester's port; the connect-back fails but the ack is still sent.
        client
            .send(&Message::NewConnectionRequest {
                host: "127.0.0.1".into(),
                port: 1,
            })
            .await
            .unwrap();
        assert_eq!(
            client.receive().await,
            Some(Message::NewConnectionRequestAck {
                identity: NodeIdentity::new("127.0.0.1", 1)
            })
        );
    }

    #[tokio::test]
    async fn unexpected_message_is_ignored() {
        let (_dir, _node, client) = serve(4).await;
        client.send(&Message::SearchResults(Vec::new())).await.unwrap();
        client.send(&request(0, 4, 0)).await.unwrap();
        assert!(matches!(client.receive().await, Some(Message::FileBlockAnswer(_))));
    }
}
