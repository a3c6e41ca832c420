//! Blocks: split a file into fixed-size blocks, build the request list, reassemble answers.

use std::fmt;

use crate::protocol::{BlockAnswer, BlockRequest};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024; // 10 KiB

fn effective_block_size(block_size: u64) -> u64 {
    if block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    }
}

/// A contiguous slice of a file starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// One request per block, in file order: `index` i covers `offset = i * block_size`,
/// and the last block is truncated to the remaining bytes. A zero block size uses the default.
pub fn create_request_list(content_hash: &str, file_size: u64, block_size: u64) -> Vec<BlockRequest> {
    let size = effective_block_size(block_size);
    let mut out = Vec::with_capacity(file_size.div_ceil(size) as usize);
    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < file_size {
        out.push(BlockRequest {
            content_hash: content_hash.to_owned(),
            offset,
            length: size.min(file_size - offset),
            index,
        });
        offset += size;
        index += 1;
    }
    out
}

/// Cut file contents into blocks keyed by offset, using the same layout as [`create_request_list`].
pub fn split_into_blocks(bytes: &[u8], block_size: u64) -> Vec<FileBlock> {
    let size = effective_block_size(block_size) as usize;
    bytes
        .chunks(size)
        .enumerate()
        .map(|(i, data)| FileBlock {
            offset: (i * size) as u64,
            data: data.to_vec(),
        })
        .collect()
}

/// Answers collected for one download job. Arrival order is irrelevant; [`finish`](Self::finish)
/// orders blocks by offset.
#[derive(Debug, Default)]
pub struct BlockAssembly {
    expected: usize,
    answers: Vec<BlockAnswer>,
}

impl BlockAssembly {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            answers: Vec::with_capacity(expected),
        }
    }

    pub fn record(&mut self, answer: BlockAnswer) {
        self.answers.push(answer);
    }

    pub fn received(&self) -> usize {
        self.answers.len()
    }

    pub fn missing(&self) -> usize {
        self.expected.saturating_sub(self.answers.len())
    }

    /// Block payloads sorted by offset, or the number of blocks that never arrived.
    pub fn finish(mut self) -> Result<Vec<Vec<u8>>, MissingBlocks> {
        let missing = self.missing();
        if missing > 0 {
            return Err(MissingBlocks { missing });
        }
        self.answers.sort_by_key(|a| a.offset);
        Ok(self.answers.into_iter().map(|a| a.data).collect())
    }
}

/// A job ended with blocks that no peer delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub struct MissingBlocks {
    pub missing: usize,
}

impl fmt::Display for MissingBlocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.missing == 1 {
            write!(f, "1 block missing")
        } else {
            write!(f, "{} blocks missing", self.missing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn request_list_for_ten_bytes_of_four() {
        let reqs = create_request_list("h", 10, 4);
        let layout: Vec<(u64, u64, u32)> = reqs.iter().map(|r| (r.offset, r.length, r.index)).collect();
        assert_eq!(layout, vec![(0, 4, 0), (4, 4, 1), (8, 2, 2)]);
        assert!(reqs.iter().all(|r| r.content_hash == "h"));
    }

    #[test]
    fn request_list_exact_multiple() {
        let reqs = create_request_list("h", 90, 30);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[2].length, 30);
    }

    #[test]
    fn request_list_empty_file() {
        assert!(create_request_list("h", 0, 30).is_empty());
    }

    #[test]
    fn zero_block_size_uses_default() {
        let reqs = create_request_list("h", DEFAULT_BLOCK_SIZE * 2 + 1, 0);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[2].length, 1);
    }

    #[test]
    fn request_list_shape_for_random_sizes() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let size: u64 = rng.gen_range(0..5_000);
            let block: u64 = rng.gen_range(1..300);
            let reqs = create_request_list("h", size, block);
            assert_eq!(reqs.len() as u64, size.div_ceil(block));
            for (i, r) in reqs.iter().enumerate() {
                assert_eq!(r.offset, i as u64 * block);
                assert_eq!(r.index as usize, i);
            }
            if let Some(last) = reqs.last() {
                let rem = size % block;
                assert_eq!(last.length, if rem == 0 { block } else { rem });
            }
        }
    }

    #[test]
    fn split_and_reassemble_out_of_order() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut original = vec![0u8; rng.gen_range(1..2_000)];
            rng.fill_bytes(&mut original);
            let block: u64 = rng.gen_range(1..128);
            let reqs = create_request_list("h", original.len() as u64, block);
            let blocks = split_into_blocks(&original, block);
            assert_eq!(blocks.len(), reqs.len());

            let mut assembly = BlockAssembly::new(reqs.len());
            for (req, b) in reqs.iter().zip(blocks).rev() {
                assert_eq!(req.offset, b.offset);
                assembly.record(BlockAnswer::for_request(req, b.data));
            }
            assert_eq!(assembly.finish().unwrap().concat(), original);
        }
    }

    #[test]
    fn missing_answers_are_counted() {
        let reqs = create_request_list("h", 10, 4);
        let mut assembly = BlockAssembly::new(reqs.len());
        assembly.record(BlockAnswer::for_request(&reqs[0], vec![0; 4]));
        assembly.record(BlockAnswer::for_request(&reqs[1], vec![0; 4]));
        assert_eq!(assembly.received(), 2);
        let err = assembly.finish().unwrap_err();
        assert_eq!(err, MissingBlocks { missing: 1 });
        assert_eq!(err.to_string(), "1 block missing");
        assert_eq!(MissingBlocks { missing: 3 }.to_string(), "3 blocks missing");
    }

    #[test]
    fn empty_job_finishes_with_no_blocks() {
        assert!(BlockAssembly::new(0).finish().unwrap().is_empty());
    }
}
