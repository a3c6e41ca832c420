//! One download job: block requests fanned out to every live provider through a shared
//! queue, and a writer that assembles the file once no request is pending.
//!
//! The pending counter starts at the number of blocks. Each request taken off the queue
//! resolves exactly one count, answered or not, so the writer cannot wait forever on a
//! worker that gave up. When dispatch ends (queue drained, workers gone, or the dispatch
//! deadline hit) whatever is still pending is abandoned and the writer proceeds.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blockshare_core::scheduler::{self, BlockTally};
use blockshare_core::{
    create_request_list, BlockAnswer, BlockAssembly, BlockRequest, CatalogError, Config,
    FileSearchResult, Message, MissingBlocks, NodeIdentity, WorkFolder,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::node::PeerMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub elapsed: Duration,
    pub blocks_per_peer: BlockTally,
}

impl fmt::Display for DownloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Download complete: {}", self.path.display())?;
        write!(f, "{}", self.blocks_per_peer)?;
        write!(f, "Time elapsed: {:.2}s", self.elapsed.as_secs_f64())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no search results to download from")]
    NoResults,
    #[error("no live connection to any provider")]
    NoProviders,
    #[error("download failed: {0}")]
    Missing(#[from] MissingBlocks),
    #[error("failed to save download: {0}")]
    Persist(#[from] CatalogError),
    #[error("download task failed: {0}")]
    Task(String),
}

/// Shared state of one job. Lock order: answers, then tally.
struct DownloadJob {
    answers: Mutex<BlockAssembly>,
    tally: Mutex<BlockTally>,
    pending: watch::Sender<usize>,
}

impl DownloadJob {
    fn new(expected: usize) -> Self {
        let (pending, _) = watch::channel(expected);
        Self {
            answers: Mutex::new(BlockAssembly::new(expected)),
            tally: Mutex::new(BlockTally::new()),
            pending,
        }
    }

    fn record(&self, peer: &NodeIdentity, answer: BlockAnswer) {
        self.answers.lock().record(answer);
        self.tally.lock().record(peer);
    }

    fn resolve_one(&self) {
        self.pending.send_modify(|p| *p = p.saturating_sub(1));
    }

    fn abandon_remaining(&self) {
        self.pending.send_if_modified(|p| {
            let had = *p;
            *p = 0;
            had != 0
        });
    }
}

type RequestQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BlockRequest>>>;

pub struct DownloadCoordinator {
    id: Uuid,
    file_name: String,
    catalog: Arc<WorkFolder>,
    config: Config,
}

impl DownloadCoordinator {
    pub fn new(file_name: impl Into<String>, catalog: Arc<WorkFolder>, config: Config) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            catalog,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Download the file described by `results` (all with the same content hash) from the
    /// providers that have a live entry in `connections`.
    pub async fn run(
        &self,
        results: &[FileSearchResult],
        connections: &PeerMap,
    ) -> Result<DownloadReport, DownloadError> {
        let started = Instant::now();
        let Some(first) = results.first() else {
            return Err(DownloadError::NoResults);
        };
        let requests = create_request_list(&first.content_hash, first.file_size, self.config.block_size);

        let mut providers = Vec::new();
        for peer in scheduler::providers_for(results) {
            match connections.get(&peer).filter(|c| c.is_alive()) {
                Some(conn) => providers.push((peer, conn.clone())),
                None => warn!(job = %self.id, %peer, "no live connection to provider, skipped"),
            }
        }
        if providers.is_empty() && !requests.is_empty() {
            error!(job = %self.id, file = %self.file_name, "no live providers");
            return Err(DownloadError::NoProviders);
        }
        info!(
            job = %self.id,
            file = %self.file_name,
            blocks = requests.len(),
            providers = providers.len(),
            "download started"
        );

        let job = Arc::new(DownloadJob::new(requests.len()));
        let writer = tokio::spawn(write_when_complete(
            job.clone(),
            self.catalog.clone(),
            self.file_name.clone(),
            started,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        for request in requests {
            let _ = tx.send(request);
        }
        drop(tx);
        let queue: RequestQueue = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = JoinSet::new();
        for (peer, conn) in providers {
            workers.spawn(fetch_blocks(
                peer,
                conn,
                queue.clone(),
                job.clone(),
                self.config.queue_poll_timeout,
            ));
        }
        let dispatch = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(job = %self.id, error = %e, "download worker failed");
                }
            }
        };
        if tokio::time::timeout(self.config.dispatch_timeout, dispatch).await.is_err() {
            warn!(job = %self.id, "dispatch timed out, cancelling workers");
            workers.shutdown().await;
        }
        job.abandon_remaining();

        let outcome = match writer.await {
            Ok(outcome) => outcome,
            Err(e) => Err(DownloadError::Task(e.to_string())),
        };
        match &outcome {
            Ok(report) => info!(
                job = %self.id,
                path = %report.path.display(),
                blocks = report.blocks_per_peer.total(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "download complete"
            ),
            Err(e) => error!(job = %self.id, file = %self.file_name, error = %e, "download failed"),
        }
        outcome
    }
}

/// Pull requests until the queue stays empty for `poll` or the connection dies.
async fn fetch_blocks(
    peer: NodeIdentity,
    conn: Arc<Connection>,
    queue: RequestQueue,
    job: Arc<DownloadJob>,
    poll: Duration,
) {
    loop {
        let next = tokio::time::timeout(poll, async { queue.lock().await.recv().await }).await;
        let Ok(Some(request)) = next else {
            return;
        };
        let in_flight = InFlight::new(&conn, &peer);
        let reply = exchange(&conn, &request).await;
        in_flight.settle();
        match reply {
            Some(answer) => job.record(&peer, answer),
            None => debug!(%peer, index = request.index, "block not answered"),
        }
        job.resolve_one();
        if !conn.is_alive() {
            warn!(%peer, "connection lost during download");
            return;
        }
    }
}

/// Held across one request/reply exchange. Dropped unsettled (the worker was cancelled
/// between send and receive) it abandons the connection: the late reply, or the rest of a
/// half-read frame, would otherwise be taken as the answer to the next request on it.
struct InFlight<'a> {
    conn: &'a Connection,
    peer: &'a NodeIdentity,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(conn: &'a Connection, peer: &'a NodeIdentity) -> Self {
        Self {
            conn,
            peer,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(peer = %self.peer, "block request cancelled in flight, dropping connection");
            self.conn.abandon();
        }
    }
}

/// One request, one reply. A reply that does not match the request counts as no answer.
async fn exchange(conn: &Connection, request: &BlockRequest) -> Option<BlockAnswer> {
    conn.send(&Message::FileBlockRequest(request.clone())).await.ok()?;
    match conn.receive().await? {
        Message::FileBlockAnswer(answer) if answer.answers(request) => Some(answer),
        other => {
            warn!(kind = other.kind(), index = request.index, "unmatched reply to block request");
            None
        }
    }
}

async fn write_when_complete(
    job: Arc<DownloadJob>,
    catalog: Arc<WorkFolder>,
    file_name: String,
    started: Instant,
) -> Result<DownloadReport, DownloadError> {
    let mut pending = job.pending.subscribe();
    let _ = pending.wait_for(|p| *p == 0).await;

    let assembly = std::mem::replace(&mut *job.answers.lock(), BlockAssembly::new(0));
    let blocks = assembly.finish()?;
    let blocks_per_peer = job.tally.lock().clone();

    let path = tokio::task::spawn_blocking(move || {
        let path = catalog.timestamped_path(&file_name)?;
        let written = catalog.write_and_index(&path, &blocks)?;
        Ok::<_, CatalogError>(written.path)
    })
    .await
    .map_err(|e| DownloadError::Task(e.to_string()))??;

    Ok(DownloadReport {
        path,
        elapsed: started.elapsed(),
        blocks_per_peer,
    })
}
