//! Tunables shared by the catalog, connection handlers and download jobs.

use std::time::Duration;

use crate::block::DEFAULT_BLOCK_SIZE;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HANDSHAKE_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SERVE_WORKERS: usize = 5;
pub const DEFAULT_SERVE_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_BLOCK_CACHE_FILES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Transfer unit; the last block of a file may be shorter.
    pub block_size: u64,
    /// How long a handshake waits for the peer connection, and then for the ack.
    pub handshake_timeout: Duration,
    pub handshake_poll_interval: Duration,
    /// A download worker stops once the shared queue stays empty this long.
    pub queue_poll_timeout: Duration,
    /// Upper bound on a job's dispatch phase; workers still running are cancelled.
    pub dispatch_timeout: Duration,
    /// Block-serving workers per accepted connection.
    pub serve_workers: usize,
    pub serve_queue_capacity: usize,
    /// Files whose block maps stay cached. 0 disables eviction.
    pub block_cache_files: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_poll_interval: DEFAULT_HANDSHAKE_POLL,
            queue_poll_timeout: DEFAULT_QUEUE_POLL_TIMEOUT,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            serve_workers: DEFAULT_SERVE_WORKERS,
            serve_queue_capacity: DEFAULT_SERVE_QUEUE_CAPACITY,
            block_cache_files: DEFAULT_BLOCK_CACHE_FILES,
        }
    }
}
