//! Heuristic token estimation with a bounded LRU cache.
//!
//! The estimate blends three cheap signals (word count, character count and a
//! lexical token count) so that prose, code and punctuation-heavy text all land
//! reasonably close to what a real tokenizer reports. Results are memoized by a
//! hash of the whitespace-normalized text; the cache is bounded so that long
//! runs over large corpora keep a fixed memory footprint.

use lru::LruCache;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// Texts shorter than this (in characters) use the character shortcut.
pub const SHORT_TEXT_CHARS: usize = 32;

const DEFAULT_CACHE_ENTRIES: usize = 4_096;

fn lexical_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+|[^\w\s]|\s+").expect("static regex is valid"))
}

/// Calibration constants for the blended estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorWeights {
    /// Multiplier applied to the whitespace-separated word count
    pub per_word: f64,
    /// Divisor applied to the character count
    pub chars_per_token: f64,
    /// Multiplier applied to the lexical token count
    pub per_lexical_token: f64,
    /// Weight of the lexical estimate relative to the other two
    pub lexical_weight: f64,
    /// Final safety multiplier
    pub safety_factor: f64,
}

impl Default for EstimatorWeights {
    fn default() -> Self {
        Self {
            per_word: 1.3,
            chars_per_token: 4.0,
            per_lexical_token: 0.9,
            lexical_weight: 2.0,
            safety_factor: 1.05,
        }
    }
}

impl EstimatorWeights {
    /// Estimate tokens for already-normalized text, bypassing any cache.
    pub fn estimate_normalized(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }

        let chars = text.chars().count();
        if chars < SHORT_TEXT_CHARS {
            return (chars as u64).div_ceil(4).max(1);
        }

        let words = text.split_whitespace().count() as f64;
        let lexical = lexical_token_regex().find_iter(text).count() as f64;

        let by_words = words * self.per_word;
        let by_chars = chars as f64 / self.chars_per_token;
        let by_lexical = lexical * self.per_lexical_token;

        let blended = (by_words + by_chars + by_lexical * self.lexical_weight)
            / (2.0 + self.lexical_weight);

        ((blended * self.safety_factor).floor() as u64).max(1)
    }
}

/// Collapse whitespace runs to single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

fn text_key(normalized: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic, cached token estimator.
///
/// The estimate is a pure function of the whitespace-normalized text, so two
/// inputs differing only in spacing share a cache entry and an estimate.
pub struct TokenEstimator {
    weights: EstimatorWeights,
    cache: Mutex<LruCache<u64, u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_ENTRIES)
    }
}

impl TokenEstimator {
    /// Create an estimator with default weights and the given cache bound.
    pub fn new(cache_entries: usize) -> Self {
        Self::with_weights(EstimatorWeights::default(), cache_entries)
    }

    /// Create an estimator using a custom weighting strategy.
    pub fn with_weights(weights: EstimatorWeights, cache_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            weights,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Weights in use.
    pub fn weights(&self) -> &EstimatorWeights {
        &self.weights
    }

    /// Estimate the token cost of `text`.
    pub fn estimate(&self, text: &str) -> u64 {
        let normalized = normalize_whitespace(text);
        if normalized.is_empty() {
            return 0;
        }

        let key = text_key(&normalized);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(&tokens) = cache.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return tokens;
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let tokens = self.weights.estimate_normalized(&normalized);

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, tokens);
        }
        tokens
    }

    /// Estimate without consulting or filling the cache.
    ///
    /// Used for transient candidate strings.
    pub fn estimate_uncached(&self, text: &str) -> u64 {
        self.weights.estimate_normalized(&normalize_whitespace(text))
    }

    /// Number of entries currently cached.
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Cache hits since creation.
    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses since creation.
    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
