//! Block cache: content hash -> (offset -> block), evicting whole files least-recently-used first.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::block::FileBlock;

/// Every block of one file, keyed by offset.
pub type BlockMap = HashMap<u64, FileBlock>;

pub struct BlockCache {
    files: LruCache<String, Arc<BlockMap>>,
}

impl BlockCache {
    /// Hold at most `capacity` files; 0 means no limit.
    pub fn new(capacity: usize) -> Self {
        let files = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self { files }
    }

    /// Cached blocks for `hash`, marking it most recently used.
    pub fn get(&mut self, hash: &str) -> Option<Arc<BlockMap>> {
        self.files.get(hash).cloned()
    }

    /// Cache the blocks of one file, evicting the oldest file past capacity.
    pub fn insert(&mut self, hash: String, blocks: BlockMap) -> Arc<BlockMap> {
        let blocks = Arc::new(blocks);
        self.files.put(hash, blocks.clone());
        blocks
    }

    /// Drop entries whose hash fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        let stale: Vec<String> = self
            .files
            .iter()
            .filter(|(h, _)| !keep(h.as_str()))
            .map(|(h, _)| h.clone())
            .collect();
        for h in stale {
            self.files.pop(&h);
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.files.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("files", &self.files.len())
            .field("capacity", &self.files.cap())
            .finish()
    }
}
