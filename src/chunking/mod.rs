//! Document chunking and batch packing.

mod chunker;
mod document;
mod fanout;
mod packer;

pub use chunker::{split_sentences, DocumentChunker, CHUNK_SEPARATOR};
pub use document::{Chunk, Document};
pub use fanout::ChunkPool;
pub use packer::{pack, Batch, BatchPacker, PackingPlan};
