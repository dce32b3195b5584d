//! Embedding capability, content-addressed caching and batched provider calls.
//!
//! ```text
//! texts ──normalize──► CacheKey(model, sha256) ──hit──► vector
//!                                  │
//!                                 miss
//!                                  ▼
//!                 plan_batches (item + token limits)
//!                                  ▼
//!                 EmbeddingBackend::embed_texts (with retry)
//!                                  ▼
//!                          cache.put, reassemble in input order
//! ```
//!
//! | Type | Role |
//! |------|------|
//! | [`Embed`] | What the tree builder and updater consume |
//! | [`EmbeddingBackend`] | Raw provider call, implemented by the host service |
//! | [`EmbeddingProvider`] | Normalization, cache, batching, retry |
//! | [`EmbedderPool`] | One provider handle per worker thread |
//! | [`MemoryEmbeddingCache`] / [`SqliteEmbeddingCache`] | Cache storage |

mod batch;
mod cache;
mod pool;
mod provider;

use sha2::{Digest, Sha256};

use crate::error::{ProviderError, Result};

pub use batch::{estimate_tokens, plan_batches};
pub(crate) use batch::tokens_for_chars;
pub use cache::{
    EmbeddingCache, MemoryEmbeddingCache, SqliteEmbeddingCache, DEFAULT_MEMORY_CAPACITY,
};
pub use pool::EmbedderPool;
pub use provider::{CacheStats, EmbeddingProvider};

/// The embedding capability consumed by tree construction and maintenance.
pub trait Embed {
    /// Key under which vectors are stored in `Node::embeddings`.
    fn model_id(&self) -> &str;

    /// Embed one text.
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()])?;
        out.pop().ok_or_else(|| {
            crate::Error::InvariantViolation("embed_batch returned no vector for one text".into())
        })
    }

    /// Embed many texts; `output[i]` belongs to `texts[i]`.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

impl<E: Embed + ?Sized> Embed for &E {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts)
    }
}

/// One raw call to an embedding provider.
///
/// Implementations should not retry: [`EmbeddingProvider`] classifies
/// [`ProviderError`]s and retries transient ones itself.
pub trait EmbeddingBackend: Send {
    /// Provider model id.
    fn model_id(&self) -> &str;

    /// Embed already-normalized texts in one request.
    fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

/// Cache key: model id plus the sha256 of the normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Embedding model id.
    pub model_id: String,
    /// Lowercase hex sha256 of the normalized text.
    pub text_hash: String,
}

impl CacheKey {
    /// Build a key from a text that is already normalized.
    pub fn new(model_id: impl Into<String>, normalized_text: &str) -> Self {
        Self {
            model_id: model_id.into(),
            text_hash: sha256_hex(normalized_text),
        }
    }
}

/// Lowercase hex sha256 of a string.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic text normalization applied before hashing and embedding.
///
/// Newlines become spaces, whitespace runs collapse to one space, the result
/// is trimmed and cut to at most `max_chars` characters.
pub fn normalize_text(text: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_chars.saturating_mul(4)));
    let mut count = 0;
    for word in text.split_whitespace() {
        if count >= max_chars {
            break;
        }
        if count > 0 {
            out.push(' ');
            count += 1;
            if count >= max_chars {
                break;
            }
        }
        for ch in word.chars() {
            if count >= max_chars {
                break;
            }
            out.push(ch);
            count += 1;
        }
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    out
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        na += x as f64 * x as f64;
        nb += y as f64 * y as f64;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_and_trims() {
        assert_eq!(normalize_text("  hello\n\nworld \t again  ", 100), "hello world again");
        assert_eq!(normalize_text("line one\r\nline two", 100), "line one line two");
        assert_eq!(normalize_text("", 10), "");
    }

    #[test]
    fn test_normalize_truncates_by_chars() {
        assert_eq!(normalize_text("abcdef ghij", 4), "abcd");
        // Truncation never leaves a trailing space.
        assert_eq!(normalize_text("abc def", 4), "abc");
        // Multi-byte characters are counted, not bytes.
        assert_eq!(normalize_text("ééééé", 3), "ééé");
    }

    #[test]
    fn test_equivalent_texts_share_a_key() {
        let a = CacheKey::new("m", &normalize_text("same\ntext", 100));
        let b = CacheKey::new("m", &normalize_text("  same   text ", 100));
        let c = CacheKey::new("other", &normalize_text("same text", 100));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.text_hash.len(), 64);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
