//! Best-fit-decreasing packing of chunks into token-bounded batches.

use super::document::Chunk;
use serde::Serialize;
use std::cmp::Reverse;

/// A group of chunks whose summed estimate fits the batch ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// Chunks in placement order
    pub chunks: Vec<Chunk>,

    /// Sum of the chunks' estimates
    pub estimated_tokens: u64,
}

impl Batch {
    fn open(chunk: Chunk) -> Self {
        Self {
            estimated_tokens: chunk.estimated_tokens,
            chunks: vec![chunk],
        }
    }

    fn push(&mut self, chunk: Chunk) {
        self.estimated_tokens += chunk.estimated_tokens;
        self.chunks.push(chunk);
    }

    /// Ids of the chunks in this batch.
    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.iter().map(Chunk::id).collect()
    }

    /// Number of chunks in this batch.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the batch holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Packs chunks from any number of documents into batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchPacker {
    max_tokens_per_batch: u64,
}

impl BatchPacker {
    /// Create a packer for the given per-batch ceiling.
    pub fn new(max_tokens_per_batch: u64) -> Self {
        Self { max_tokens_per_batch }
    }

    /// Per-batch ceiling.
    pub fn max_tokens_per_batch(&self) -> u64 {
        self.max_tokens_per_batch
    }

    /// Pack chunks, returning the batches and the ids of chunks that were skipped
    /// because they exceed the ceiling on their own.
    ///
    /// Chunks are placed largest first into the open batch with the least
    /// remaining room that still fits; ties go to the batch opened earliest.
    /// Equal-sized chunks keep their input order, so the output is deterministic.
    pub fn pack(&self, chunks: Vec<Chunk>) -> (Vec<Batch>, Vec<String>) {
        let limit = self.max_tokens_per_batch;

        let mut ordered = chunks;
        ordered.sort_by_key(|c| Reverse(c.estimated_tokens));

        let mut batches: Vec<Batch> = Vec::new();
        let mut skipped = Vec::new();

        for chunk in ordered {
            if chunk.estimated_tokens > limit {
                tracing::warn!(
                    "Skipping chunk {} (~{} tokens exceeds batch ceiling of {})",
                    chunk.id(),
                    chunk.estimated_tokens,
                    limit
                );
                skipped.push(chunk.id());
                continue;
            }

            let mut best: Option<(usize, u64)> = None;
            for (idx, batch) in batches.iter().enumerate() {
                let remaining = limit - batch.estimated_tokens;
                if remaining < chunk.estimated_tokens {
                    continue;
                }
                if best.map_or(true, |(_, tightest)| remaining < tightest) {
                    best = Some((idx, remaining));
                }
            }

            match best {
                Some((idx, _)) => batches[idx].push(chunk),
                None => batches.push(Batch::open(chunk)),
            }
        }

        (batches, skipped)
    }
}

/// Convenience wrapper around [`BatchPacker::pack`].
pub fn pack(chunks: Vec<Chunk>, max_tokens_per_batch: u64) -> (Vec<Batch>, Vec<String>) {
    BatchPacker::new(max_tokens_per_batch).pack(chunks)
}

/// Outcome of chunking and packing a document set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PackingPlan {
    /// Batches in the order they were opened
    pub batches: Vec<Batch>,

    /// Ids of chunks too large for any batch
    pub skipped: Vec<String>,

    /// Documents that were chunked
    pub total_documents: usize,

    /// Chunks produced across all documents
    pub total_chunks: usize,
}

impl PackingPlan {
    /// Summed estimate of every packed chunk.
    pub fn packed_tokens(&self) -> u64 {
        self.batches.iter().map(|b| b.estimated_tokens).sum()
    }

    /// Number of chunks placed in batches.
    pub fn packed_chunks(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Mean fill ratio of the batches against a ceiling, in [0, 1].
    pub fn fill_ratio(&self, max_tokens_per_batch: u64) -> f64 {
        if self.batches.is_empty() || max_tokens_per_batch == 0 {
            return 0.0;
        }
        self.packed_tokens() as f64 / (self.batches.len() as u64 * max_tokens_per_batch) as f64
    }
}

impl std::fmt::Display for PackingPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Documents: {}, Chunks: {}, Batches: {}, Packed tokens: {}, Skipped: {}",
            self.total_documents,
            self.total_chunks,
            self.batches.len(),
            self.packed_tokens(),
            self.skipped.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, tokens: u64) -> Chunk {
        Chunk {
            document_id: doc.to_string(),
            index: 0,
            total: 1,
            text: format!("{} body", doc),
            estimated_tokens: tokens,
        }
    }

    fn doc_ids(batch: &Batch) -> Vec<&str> {
        batch.chunks.iter().map(|c| c.document_id.as_str()).collect()
    }

    #[test]
    fn test_best_fit_decreasing_example() {
        let chunks = vec![
            chunk("D", 20_000),
            chunk("C", 30_000),
            chunk("A", 40_000),
            chunk("B", 35_000),
        ];
        let (batches, skipped) = pack(chunks, 100_000);

        assert!(skipped.is_empty());
        assert_eq!(batches.len(), 2);
        assert_eq!(doc_ids(&batches[0]), vec!["A", "B", "D"]);
        assert_eq!(batches[0].estimated_tokens, 95_000);
        assert_eq!(doc_ids(&batches[1]), vec!["C"]);
        assert_eq!(batches[1].estimated_tokens, 30_000);
    }

    #[test]
    fn test_oversized_chunks_are_skipped_not_dropped() {
        let chunks = vec![chunk("small", 10), chunk("huge", 500), chunk("mid", 90)];
        let (batches, skipped) = pack(chunks, 100);

        assert_eq!(skipped, vec!["huge#0".to_string()]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].estimated_tokens, 100);
        assert!(batches
            .iter()
            .flat_map(|b| b.chunks.iter())
            .all(|c| c.document_id != "huge"));
    }

    #[test]
    fn test_tightest_fit_wins() {
        // After A(60) and B(50) open two batches (rem 40, 50), C(40) should go to A's batch
        let chunks = vec![chunk("A", 60), chunk("B", 50), chunk("C", 40)];
        let (batches, _) = pack(chunks, 100);

        assert_eq!(doc_ids(&batches[0]), vec!["A", "C"]);
        assert_eq!(doc_ids(&batches[1]), vec!["B"]);
    }

    #[test]
    fn test_equal_remaining_prefers_earliest_batch() {
        let chunks = vec![chunk("A", 70), chunk("B", 70), chunk("C", 30)];
        let (batches, _) = pack(chunks, 100);

        assert_eq!(doc_ids(&batches[0]), vec!["A", "C"]);
        assert_eq!(doc_ids(&batches[1]), vec!["B"]);
    }

    #[test]
    fn test_equal_sizes_keep_input_order() {
        let chunks = vec![chunk("first", 60), chunk("second", 60), chunk("third", 60)];
        let (batches, _) = pack(chunks, 100);

        let order: Vec<&str> = batches.iter().flat_map(|b| doc_ids(b)).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_no_batch_exceeds_ceiling() {
        let chunks: Vec<Chunk> = (0..200u64)
            .map(|i| chunk(&format!("d{}", i), (i * 37) % 113 + 1))
            .collect();
        let total: u64 = chunks.iter().map(|c| c.estimated_tokens).sum();
        let (batches, skipped) = pack(chunks, 120);

        assert!(skipped.is_empty());
        assert!(batches.iter().all(|b| b.estimated_tokens <= 120));
        assert_eq!(batches.iter().map(|b| b.estimated_tokens).sum::<u64>(), total);
        assert_eq!(batches.iter().map(Batch::len).sum::<usize>(), 200);
    }

    #[test]
    fn test_empty_input() {
        let (batches, skipped) = pack(Vec::new(), 100);
        assert!(batches.is_empty());
        assert!(skipped.is_empty());
    }

    #[test]
    fn test_plan_display_and_fill() {
        let (batches, skipped) = pack(vec![chunk("A", 50), chunk("B", 25)], 100);
        let plan = PackingPlan {
            batches,
            skipped,
            total_documents: 2,
            total_chunks: 2,
        };

        assert_eq!(plan.packed_tokens(), 75);
        assert_eq!(plan.packed_chunks(), 2);
        assert!((plan.fill_ratio(100) - 0.75).abs() < 1e-9);
        let display = format!("{}", plan);
        assert!(display.contains("Batches: 1"));
        assert!(display.contains("Skipped: 0"));
    }
}
