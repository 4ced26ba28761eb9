//! Reassembly of chunked position updates.
//!
//! Large `portfolio_positions` updates are split into `chunk_count` events
//! with a 1-based `chunk_index`. Chunks are buffered per portfolio and
//! released together once all of them arrived.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

#[derive(Debug)]
struct ChunkBuffer<T> {
    expected: usize,
    chunks: BTreeMap<usize, Vec<T>>,
}

#[derive(Debug)]
pub struct ChunkReassembler<T> {
    buffers: HashMap<String, ChunkBuffer<T>>,
}

impl<T> Default for ChunkReassembler<T> {
    fn default() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }
}

impl<T> ChunkReassembler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers one chunk.
    ///
    /// Returns the concatenated records once every chunk is present, `None`
    /// while the update is still being assembled. An update without chunk
    /// information is complete by itself.
    pub fn submit(
        &mut self,
        portfolio_uuid: &str,
        chunk_index: Option<usize>,
        chunk_count: Option<usize>,
        records: Vec<T>,
    ) -> Option<Vec<T>> {
        let count = chunk_count.unwrap_or(1);
        let index = match chunk_index {
            Some(index) if count > 1 => index,
            _ => {
                self.buffers.remove(portfolio_uuid);
                return Some(records);
            }
        };

        let buffer = self
            .buffers
            .entry(portfolio_uuid.to_string())
            .or_insert_with(|| ChunkBuffer {
                expected: count,
                chunks: BTreeMap::new(),
            });
        if buffer.expected != count {
            debug!(
                portfolio = portfolio_uuid,
                previous = buffer.expected,
                expected = count,
                "chunk count changed, discarding buffered chunks"
            );
            buffer.expected = count;
            buffer.chunks.clear();
        }
        buffer.chunks.insert(index, records);

        if buffer.chunks.len() < buffer.expected {
            return None;
        }

        let buffer = self.buffers.remove(portfolio_uuid)?;
        let expected = buffer.expected;
        let mut chunks = buffer.chunks;
        let assembled = (1..=expected)
            .filter_map(|i| chunks.remove(&i))
            .flatten()
            .collect();
        Some(assembled)
    }

    /// Drops any partial update, e.g. after the backend reported an error.
    pub fn clear(&mut self, portfolio_uuid: &str) {
        self.buffers.remove(portfolio_uuid);
    }

    pub fn is_assembling(&self, portfolio_uuid: &str) -> bool {
        self.buffers.contains_key(portfolio_uuid)
    }

    pub fn clear_all(&mut self) {
        self.buffers.clear();
    }
}
