use std::sync::atomic::{AtomicU64, Ordering};

use strata::embed::{EmbeddingBackend, MemoryEmbeddingCache};
use strata::summarize::from_fn;
use strata::{
    EmbeddingProvider, HealthCheck, IncrementalUpdater, ProviderError, RaptorConfig,
};

/// Bag-of-words hashed into 32 buckets. Stands in for a real embedding API.
struct HashedWords {
    calls: AtomicU64,
}

impl EmbeddingBackend for HashedWords {
    fn model_id(&self) -> &str {
        "hashed-words"
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let _ = self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 32];
                for word in text.split_whitespace() {
                    let bucket = word.bytes().fold(7usize, |h, b| h.wrapping_mul(31) ^ b as usize);
                    v[bucket % 32] += 1.0;
                }
                v
            })
            .collect())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Small end-to-end run: build over two topics, then absorb new chunks
    // with the cheap strategies and finally rebuild the upper layers.
    let config = RaptorConfig::from_toml_str(
        r#"
        [embedding]
        model_id = "hashed-words"

        [build]
        max_layers = 3
        target_top_nodes = 4
        "#,
    )?;

    let provider = EmbeddingProvider::new(
        HashedWords { calls: AtomicU64::new(0) },
        MemoryEmbeddingCache::new(),
        config.embedding.clone(),
        config.retry.clone(),
    )?;

    // A summarizer that keeps the first few words of every child.
    let summarizer = from_fn(|context: &str, layer: usize, _max_tokens: usize| {
        let heads: Vec<String> = context
            .split("\n\n")
            .map(|part| part.split_whitespace().take(3).collect::<Vec<_>>().join(" "))
            .collect();
        Ok(format!("[L{layer}] {}", heads.join("; ")))
    });

    let topics = [
        ("rust", ["ownership rules", "borrow checker", "trait objects", "lifetimes"]),
        ("garden", ["tomato seedlings", "compost heap", "pruning roses", "watering"]),
        ("sailing", ["tacking upwind", "reefing sails", "mooring lines", "tide tables"]),
    ];
    let mut chunks = Vec::new();
    for (topic, notes) in &topics {
        for note in notes {
            for part in ["basics", "pitfalls"] {
                chunks.push(format!("{topic} {note} {part}"));
            }
        }
    }

    let updater = IncrementalUpdater::new(&provider, summarizer, &config)?;
    let mut tree = updater.builder().build(&chunks)?;
    println!(
        "built: {} nodes, {} layers, {} roots",
        tree.len(),
        tree.num_layers(),
        tree.root_nodes().len()
    );

    let leaves = updater.prepare_leaves(&tree, &["rust async runtimes basics"])?;
    let report = updater.attach_to_layer_one(&mut tree, leaves)?.into_result()?;
    println!("attach: {:?} updated, {:?} created", report.updated_parents, report.created_parents);

    let report = updater.ingest(&mut tree, &["garden raised beds pitfalls", "chess openings"])?;
    println!("ingest: {} attached, {} failed", report.attached.len(), report.failed.len());

    let health = tree.health_check();
    println!("{health}");

    let _ = updater.rebuild_upper_layers(&mut tree, 0)?;
    println!(
        "rebuilt: {} nodes, {} layers; cache {:?}",
        tree.len(),
        tree.num_layers(),
        provider.stats()
    );

    for id in tree.root_nodes() {
        if let Some(node) = tree.get(*id) {
            println!("  {node}");
        }
    }
    Ok(())
}
