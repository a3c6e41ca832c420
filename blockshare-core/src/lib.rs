//! BlockShare protocol core.
//! No sockets here: the node crate owns connections and calls into these types.

pub mod block;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod scheduler;
pub mod wire;

pub use block::{create_request_list, BlockAssembly, FileBlock, MissingBlocks, DEFAULT_BLOCK_SIZE};
pub use catalog::{CatalogError, FileMetadata, WorkFolder};
pub use config::Config;
pub use identity::NodeIdentity;
pub use protocol::{BlockAnswer, BlockRequest, FileSearchResult, Message};
pub use scheduler::{BlockTally, SearchGroups};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
