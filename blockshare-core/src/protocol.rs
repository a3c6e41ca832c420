//! BlockShare wire protocol: message types exchanged between nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::NodeIdentity;

/// One file a peer offers in answer to a word search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSearchResult {
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    pub responder_host: String,
    pub responder_port: u16,
}

impl FileSearchResult {
    /// Identity of the node that reported this file.
    pub fn responder(&self) -> NodeIdentity {
        NodeIdentity::new(self.responder_host.clone(), self.responder_port)
    }
}

/// Ask a provider for one block of a file identified by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub content_hash: String,
    pub offset: u64,
    pub length: u64,
    pub index: u32,
}

/// Block payload sent back for a [`BlockRequest`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnswer {
    pub content_hash: String,
    pub offset: u64,
    pub length: u64,
    pub index: u32,
    pub data: Vec<u8>,
}

impl BlockAnswer {
    pub fn for_request(request: &BlockRequest, data: Vec<u8>) -> Self {
        Self {
            content_hash: request.content_hash.clone(),
            offset: request.offset,
            length: request.length,
            index: request.index,
            data,
        }
    }

    /// True if this answer carries the block `request` asked for with the requested length.
    pub fn answers(&self, request: &BlockRequest) -> bool {
        self.content_hash == request.content_hash
            && self.offset == request.offset
            && self.data.len() as u64 == request.length
    }
}

// Payload bytes are left out so answers can be logged.
impl fmt::Debug for BlockAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAnswer")
            .field("content_hash", &self.content_hash)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("index", &self.index)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// All wire message types. Encoding is bincode; the variant index tells types apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Initiator announces the identity it listens on.
    NewConnectionRequest { host: String, port: u16 },
    /// Acceptor echoes the initiator's identity as it registered it.
    NewConnectionRequestAck { identity: NodeIdentity },
    /// Case-insensitive file-name search.
    WordSearch {
        word: String,
        sender_host: String,
        sender_port: u16,
    },
    /// Every local match for one `WordSearch`, possibly empty.
    SearchResults(Vec<FileSearchResult>),
    FileBlockRequest(BlockRequest),
    FileBlockAnswer(BlockAnswer),
}

impl Message {
    /// Short type name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::NewConnectionRequest { .. } => "NewConnectionRequest",
            Message::NewConnectionRequestAck { .. } => "NewConnectionRequestAck",
            Message::WordSearch { .. } => "WordSearch",
            Message::SearchResults(_) => "SearchResults",
            Message::FileBlockRequest(_) => "FileBlockRequest",
            Message::FileBlockAnswer(_) => "FileBlockAnswer",
        }
    }
}
