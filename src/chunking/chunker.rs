//! Sentence-aware document chunking bounded by a per-request token ceiling.
//!
//! Documents that fit the ceiling pass through as a single chunk. Larger ones
//! are split into sentences and greedily re-joined; a sentence that alone
//! exceeds the ceiling is split on word boundaries instead. Chunks never share
//! content, so joining a document's chunks with [`CHUNK_SEPARATOR`] yields every
//! sentence exactly once, in order.

use super::document::{Chunk, Document};
use crate::config::ProviderProfile;
use crate::estimate::TokenEstimator;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Separator placed between sentences (and fallback words) inside a chunk.
pub const CHUNK_SEPARATOR: &str = " ";

fn paragraph_break_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t\r]*\n").expect("static regex is valid"))
}

fn sentence_boundary_regex() -> &'static Regex {
    // Terminal punctuation, optional closing quote/bracket, whitespace, capital letter.
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[.!?]["')\]]*\s+\p{Lu}"#).expect("static regex is valid"))
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, piece: &'a str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece);
    }
}

/// Split text into trimmed sentence-like units, in order.
///
/// Boundaries are paragraph breaks (a blank line) and terminal punctuation
/// followed by whitespace and an uppercase letter.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();

    for paragraph in paragraph_break_regex().split(text) {
        let mut start = 0;
        for m in sentence_boundary_regex().find_iter(paragraph) {
            // The match ends just after the capital that opens the next sentence
            let capital_len = paragraph[..m.end()]
                .chars()
                .next_back()
                .map(char::len_utf8)
                .unwrap_or(0);
            let end = m.end() - capital_len;
            push_trimmed(&mut sentences, &paragraph[start..end]);
            start = end;
        }
        push_trimmed(&mut sentences, &paragraph[start..]);
    }

    sentences
}

/// Splits documents into ordered, non-overlapping chunks.
///
/// Blank documents (empty or whitespace-only) produce no chunks.
#[derive(Clone)]
pub struct DocumentChunker {
    estimator: Arc<TokenEstimator>,
    min_chunk_words: usize,
    max_chunk_words: usize,
}

impl DocumentChunker {
    /// Create a chunker with explicit word bounds for the fallback splitter.
    pub fn new(estimator: Arc<TokenEstimator>, min_chunk_words: usize, max_chunk_words: usize) -> Self {
        Self {
            estimator,
            min_chunk_words,
            max_chunk_words: max_chunk_words.max(1),
        }
    }

    /// Create a chunker using the word bounds of a provider profile.
    pub fn from_profile(estimator: Arc<TokenEstimator>, profile: &ProviderProfile) -> Self {
        Self::new(estimator, profile.min_chunk_words, profile.max_chunk_words)
    }

    /// Estimator shared by this chunker.
    pub fn estimator(&self) -> &Arc<TokenEstimator> {
        &self.estimator
    }

    /// Chunk one document so that each chunk's estimate fits `max_tokens_per_chunk`.
    ///
    /// A single word larger than the ceiling cannot be split further and is
    /// emitted as its own (oversized) chunk.
    pub fn chunk(&self, document: &Document, max_tokens_per_chunk: u64) -> Vec<Chunk> {
        if document.is_blank() {
            tracing::debug!("Document {} is blank, producing no chunks", document.id);
            return Vec::new();
        }

        let max_tokens = max_tokens_per_chunk.max(1);
        let whole = self.estimator.estimate(&document.text);
        if whole <= max_tokens {
            return vec![Chunk {
                document_id: document.id.clone(),
                index: 0,
                total: 1,
                text: document.text.clone(),
                estimated_tokens: whole,
            }];
        }

        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();

        for sentence in split_sentences(&document.text) {
            let candidate = if current.is_empty() {
                sentence.to_string()
            } else {
                format!("{}{}{}", current, CHUNK_SEPARATOR, sentence)
            };

            if self.estimator.estimate_uncached(&candidate) <= max_tokens {
                current = candidate;
                continue;
            }

            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }

            if self.estimator.estimate_uncached(sentence) <= max_tokens {
                current = sentence.to_string();
            } else {
                pieces.extend(self.split_words(sentence, max_tokens));
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }

        let total = pieces.len();
        tracing::debug!(
            "Document {} (~{} tokens) split into {} chunks of <= {} tokens",
            document.id,
            whole,
            total,
            max_tokens
        );

        pieces
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                document_id: document.id.clone(),
                index,
                total,
                estimated_tokens: self.estimator.estimate(&text),
                text,
            })
            .collect()
    }

    /// Greedy word-level split of a sentence that exceeds the ceiling on its own.
    fn split_words(&self, sentence: &str, max_tokens: u64) -> Vec<String> {
        let mut groups: Vec<Vec<&str>> = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for word in sentence.split_whitespace() {
            if !current.is_empty() {
                let full = current.len() >= self.max_chunk_words;
                let overflow = !full && {
                    current.push(word);
                    let tokens = self.estimator.estimate_uncached(&current.join(CHUNK_SEPARATOR));
                    current.pop();
                    tokens > max_tokens
                };
                if full || overflow {
                    groups.push(std::mem::take(&mut current));
                }
            }
            current.push(word);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        // Fold an undersized tail into its predecessor when the result still fits
        if groups.len() >= 2 && groups[groups.len() - 1].len() < self.min_chunk_words {
            let tail = groups.len() - 1;
            let merged: Vec<&str> = groups[tail - 1]
                .iter()
                .chain(groups[tail].iter())
                .copied()
                .collect();
            if self.estimator.estimate_uncached(&merged.join(CHUNK_SEPARATOR)) <= max_tokens {
                groups.truncate(tail - 1);
                groups.push(merged);
            }
        }

        groups.into_iter().map(|words| words.join(CHUNK_SEPARATOR)).collect()
    }
}
