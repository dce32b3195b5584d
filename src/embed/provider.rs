//! Cached, batched, retrying embedding provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{normalize_text, plan_batches, CacheKey, Embed, EmbeddingBackend, EmbeddingCache};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Phase, Result};
use crate::retry::RetryPolicy;

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Texts served from the cache.
    pub hits: u64,
    /// Texts sent to the backend.
    pub misses: u64,
    /// Backend calls made.
    pub backend_calls: u64,
}

/// [`Embed`] implementation over a backend and a cache.
pub struct EmbeddingProvider<B, C> {
    backend: B,
    cache: C,
    config: EmbeddingConfig,
    retry: RetryPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    backend_calls: AtomicU64,
}

impl<B: EmbeddingBackend, C: EmbeddingCache> EmbeddingProvider<B, C> {
    /// Wrap `backend` with `cache`.
    ///
    /// `config.model_id` names the vectors; it normally matches
    /// `backend.model_id()`.
    pub fn new(backend: B, cache: C, config: EmbeddingConfig, retry: RetryPolicy) -> Result<Self> {
        let checked = crate::config::RaptorConfig::default()
            .with_embedding(config.clone())
            .with_retry(retry.clone());
        checked.validate()?;
        if backend.model_id() != config.model_id {
            debug!(
                backend = backend.model_id(),
                configured = %config.model_id,
                "embedding model id differs from backend id; using configured id"
            );
        }
        Ok(Self {
            backend,
            cache,
            config,
            retry,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            backend_calls: AtomicU64::new(0),
        })
    }

    /// Hit/miss counters since construction.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
        }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Normalize a text the way this provider does before hashing.
    pub fn normalize(&self, text: &str) -> String {
        normalize_text(text, self.config.max_text_chars)
    }

    fn call_backend(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.retry.run(Phase::Embedding, || {
            let _ = self.backend_calls.fetch_add(1, Ordering::Relaxed);
            self.backend.embed_texts(texts)
        })?;
        if vectors.len() != texts.len() {
            return Err(Error::InvariantViolation(format!(
                "embedding backend returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }
}

impl<B: EmbeddingBackend, C: EmbeddingCache> Embed for EmbeddingProvider<B, C> {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let normalized: Vec<String> = texts.iter().map(|t| self.normalize(t)).collect();
        let keys: Vec<CacheKey> = normalized
            .iter()
            .map(|t| CacheKey::new(self.config.model_id.as_str(), t))
            .collect();

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        // Unique missing texts in first-seen order, and where each lands.
        let mut pending: Vec<usize> = Vec::new();
        let mut waiting: HashMap<&CacheKey, Vec<usize>> = HashMap::new();

        for (i, key) in keys.iter().enumerate() {
            if let Some(slots) = waiting.get_mut(key) {
                slots.push(i);
                continue;
            }
            match self.cache.get(key)? {
                Some(vector) => {
                    let _ = self.hits.fetch_add(1, Ordering::Relaxed);
                    results[i] = Some(vector);
                }
                None => {
                    let _ = self.misses.fetch_add(1, Ordering::Relaxed);
                    pending.push(i);
                    let _ = waiting.insert(key, vec![i]);
                }
            }
        }

        if !pending.is_empty() {
            let missing: Vec<String> = pending.iter().map(|&i| normalized[i].clone()).collect();
            let plan = plan_batches(
                &missing,
                self.config.max_batch_items,
                self.config.max_batch_tokens,
            );
            debug!(
                misses = missing.len(),
                calls = plan.len(),
                model_id = %self.config.model_id,
                "embedding cache misses"
            );

            for range in plan {
                let vectors = self.call_backend(&missing[range.clone()])?;
                for (offset, vector) in range.zip(vectors) {
                    let origin = pending[offset];
                    let key = &keys[origin];
                    self.cache.put(key, &vector)?;
                    if let Some(slots) = waiting.get(key) {
                        for &slot in slots {
                            results[slot] = Some(vector.clone());
                        }
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(results.len());
        let mut dim: Option<usize> = None;
        for (i, slot) in results.into_iter().enumerate() {
            let vector = slot.ok_or_else(|| {
                Error::InvariantViolation(format!("no embedding produced for input {i}"))
            })?;
            match dim {
                None => dim = Some(vector.len()),
                Some(d) if d != vector.len() => {
                    return Err(Error::DimensionMismatch {
                        expected: d,
                        found: vector.len(),
                    })
                }
                _ => {}
            }
            out.push(vector);
        }
        Ok(out)
    }
}
