//! Worker pool for large embedding batches.

use std::sync::Mutex;

use rayon::prelude::*;

use super::Embed;
use crate::error::{Error, Result};

/// Pool of embedding handles, one per worker.
///
/// A batch is cut into contiguous shards; shard `i` runs on worker `i` with
/// that worker's own handle (its own connection, its own cache handle). The
/// shards are concatenated back in input order.
pub struct EmbedderPool<E> {
    handles: Vec<Mutex<E>>,
    model_id: String,
    min_shard: usize,
}

impl<E: Embed + Send> EmbedderPool<E> {
    /// Create a pool from per-worker handles. All handles must share a model id.
    pub fn new(handles: Vec<E>) -> Result<Self> {
        let Some(first) = handles.first() else {
            return Err(Error::invalid("handles", "pool needs at least one handle"));
        };
        let model_id = first.model_id().to_string();
        if let Some(other) = handles.iter().find(|h| h.model_id() != model_id) {
            return Err(Error::invalid(
                "handles",
                format!(
                    "mixed model ids in pool: {model_id} and {}",
                    other.model_id()
                ),
            ));
        }
        Ok(Self {
            handles: handles.into_iter().map(Mutex::new).collect(),
            model_id,
            min_shard: 1,
        })
    }

    /// Do not split batches into shards smaller than this.
    pub fn with_min_shard(mut self, min_shard: usize) -> Self {
        self.min_shard = min_shard.max(1);
        self
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    fn shard_size(&self, n: usize) -> usize {
        n.div_ceil(self.handles.len()).max(self.min_shard)
    }
}

impl<E: Embed + Send> Embed for EmbedderPool<E> {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let shard = self.shard_size(texts.len());
        let shards: Vec<&[String]> = texts.chunks(shard).collect();

        let parts: Vec<Result<Vec<Vec<f32>>>> = shards
            .par_iter()
            .zip(self.handles.par_iter())
            .map(|(shard, handle)| {
                let handle = handle.lock().map_err(|_| {
                    Error::InvariantViolation("embedding worker handle poisoned".into())
                })?;
                handle.embed_batch(shard)
            })
            .collect();

        let mut out = Vec::with_capacity(texts.len());
        for part in parts {
            out.extend(part?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread::ThreadId;

    struct ThreadTagging {
        seen: Mutex<HashSet<ThreadId>>,
    }

    impl Embed for ThreadTagging {
        fn model_id(&self) -> &str {
            "tagging"
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let _ = self.seen.lock().unwrap().insert(std::thread::current().id());
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, t.bytes().map(f32::from).sum()])
                .collect())
        }
    }

    fn pool(workers: usize) -> EmbedderPool<ThreadTagging> {
        let handles = (0..workers)
            .map(|_| ThreadTagging {
                seen: Mutex::new(HashSet::new()),
            })
            .collect();
        EmbedderPool::new(handles).unwrap()
    }

    #[test]
    fn test_pool_preserves_order() {
        let p = pool(4);
        let texts: Vec<String> = (0..37).map(|i| format!("chunk-{i:03}")).collect();
        let out = p.embed_batch(&texts).unwrap();
        assert_eq!(out.len(), texts.len());
        for (text, v) in texts.iter().zip(&out) {
            assert_eq!(v[1], text.bytes().map(f32::from).sum::<f32>());
        }
    }

    #[test]
    fn test_each_worker_uses_its_own_handle() {
        let p = pool(3);
        let texts: Vec<String> = (0..9).map(|i| i.to_string()).collect();
        let _ = p.embed_batch(&texts).unwrap();
        for handle in &p.handles {
            let handle = handle.lock().unwrap();
            assert_eq!(handle.seen.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(EmbedderPool::<ThreadTagging>::new(Vec::new()).is_err());
    }

    #[test]
    fn test_small_batch_uses_fewer_workers() {
        let p = pool(8).with_min_shard(16);
        let texts: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let out = p.embed_batch(&texts).unwrap();
        assert_eq!(out.len(), 5);
        let used = p
            .handles
            .iter()
            .filter(|h| !h.lock().unwrap().seen.lock().unwrap().is_empty())
            .count();
        assert_eq!(used, 1);
    }
}
