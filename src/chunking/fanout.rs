//! Parallel chunking of independent documents on a bounded worker pool.

use super::chunker::DocumentChunker;
use super::document::{Chunk, Document};
use anyhow::Result;
use rayon::prelude::*;
use std::time::Instant;

/// Bounded worker pool that chunks documents in parallel.
///
/// `chunk_all` returns only after every document has been chunked, and the
/// flattened result keeps input document order regardless of which worker
/// finished first.
pub struct ChunkPool {
    pool: rayon::ThreadPool,
    chunker: DocumentChunker,
}

impl ChunkPool {
    /// Build a pool with `workers` threads.
    pub fn new(chunker: DocumentChunker, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("chunker-{}", i))
            .build()?;
        Ok(Self { pool, chunker })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Chunk every document and merge the results into one flat, ordered list.
    pub fn chunk_all(&self, documents: &[Document], max_tokens_per_chunk: u64) -> Vec<Chunk> {
        let start = Instant::now();
        let chunker = &self.chunker;

        let per_document: Vec<Vec<Chunk>> = self.pool.install(|| {
            documents
                .par_iter()
                .map(|doc| chunker.chunk(doc, max_tokens_per_chunk))
                .collect()
        });

        let chunks: Vec<Chunk> = per_document.into_iter().flatten().collect();
        tracing::info!(
            "Chunked {} documents into {} chunks on {} workers in {:.2?}",
            documents.len(),
            chunks.len(),
            self.workers(),
            start.elapsed()
        );
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::TokenEstimator;
    use std::sync::Arc;

    #[test]
    fn test_parallel_matches_sequential() {
        let chunker = DocumentChunker::new(Arc::new(TokenEstimator::default()), 1, 200);
        let documents: Vec<Document> = (0..24)
            .map(|d| {
                let text = (0..d + 1)
                    .map(|s| format!("Document {} has sentence {} with a few words.", d, s))
                    .collect::<Vec<_>>()
                    .join(" ");
                Document::new(format!("doc-{}", d), text)
            })
            .collect();

        let sequential: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| chunker.chunk(doc, 45))
            .collect();

        let pool = ChunkPool::new(chunker, 4).unwrap();
        assert_eq!(pool.workers(), 4);
        assert_eq!(pool.chunk_all(&documents, 45), sequential);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let chunker = DocumentChunker::new(Arc::new(TokenEstimator::default()), 1, 10);
        let pool = ChunkPool::new(chunker, 0).unwrap();
        assert_eq!(pool.workers(), 1);
        assert!(pool.chunk_all(&[], 10).is_empty());
    }
}
