//! Incremental maintenance of a built tree.
//!
//! Rebuilding a tree for every new chunk is expensive: every summary above
//! the leaves is an LLM call. The updater offers cheaper strategies, each
//! trading accuracy for cost:
//!
//! | Operation | Touches | Cost |
//! |-----------|---------|------|
//! | [`attach_to_layer_one`](IncrementalUpdater::attach_to_layer_one) | layers 0-1 | one summary per touched parent |
//! | [`propagate_upward`](IncrementalUpdater::propagate_upward) | affected path to the top | one summary per touched node |
//! | [`merge_trees`](IncrementalUpdater::merge_trees) | source leaves, then propagation | as propagation |
//! | [`rebuild_upper_layers`](IncrementalUpdater::rebuild_upper_layers) | everything above a layer | a full build of those layers |
//!
//! Layers the cheap strategies skip drift: their summaries no longer cover
//! everything beneath them. A periodic rebuild corrects that.
//!
//! ## One round
//!
//! Every strategy is built from the same round, moving nodes of layer `L`
//! under parents on `L + 1`:
//!
//! ```text
//!   node ──cosine──► best parent on L+1 ──≥ threshold──► join it
//!                                      └─< threshold──► new parent (node alone)
//! ```
//!
//! New parents created earlier in the round match later nodes through their
//! first child's vector. Every touched parent is then summarized once and
//! re-embedded; children, text and embedding are committed together.
//! A parent whose summary or embedding fails is left as it was, and the
//! nodes bound for it are reported as failed. New leaves bound for it are
//! not inserted, so the same leaves can be retried.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::builder::TreeBuilder;
use super::node::{Node, NodeId};
use super::tree::Tree;
use crate::config::{IncrementalConfig, RaptorConfig};
use crate::embed::{cosine_similarity, Embed};
use crate::error::{Error, Phase, Result};
use crate::summarize::{bounded_context, Summarizer};

/// A node that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    /// The node that was not attached.
    pub node_id: NodeId,
    /// Where it failed.
    pub phase: Phase,
    /// Error text.
    pub message: String,
}

/// Outcome of an incremental operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateReport {
    /// `(child, parent)` pairs committed.
    pub attached: Vec<(NodeId, NodeId)>,
    /// Parents created.
    pub created_parents: Vec<NodeId>,
    /// Existing parents re-summarized.
    pub updated_parents: Vec<NodeId>,
    /// Input ids already present in the tree.
    pub skipped: Vec<NodeId>,
    /// Nodes that could not be applied.
    pub failed: Vec<NodeFailure>,
}

impl UpdateReport {
    /// No failures.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Nothing changed and nothing failed.
    pub fn is_noop(&self) -> bool {
        self.attached.is_empty()
            && self.created_parents.is_empty()
            && self.updated_parents.is_empty()
            && self.failed.is_empty()
    }

    /// Turn partial failure into [`Error::PartialUpdate`].
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        Err(Error::PartialUpdate {
            failed: self.failed.len(),
            total: self.failed.len() + self.attached.len(),
        })
    }

    fn fail(&mut self, node_id: NodeId, err: &Error) {
        self.failed.push(NodeFailure {
            node_id,
            phase: err.phase().unwrap_or(Phase::Summarization),
            message: err.to_string(),
        });
    }
}

/// A node moving under a parent this round.
struct Pending {
    id: NodeId,
    text: String,
    vector: Vec<f32>,
    /// Inserted when its parent commits; `None` when already in the tree.
    node: Option<Node>,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Existing(NodeId),
    Fresh(usize),
}

/// Parent-to-be and the members bound for it.
struct Plan {
    target: Target,
    members: Vec<usize>,
    summary: Option<String>,
}

/// Applies new content to an existing tree.
pub struct IncrementalUpdater<E, S> {
    builder: TreeBuilder<E, S>,
    config: IncrementalConfig,
}

impl<E: Embed, S: Summarizer> IncrementalUpdater<E, S> {
    /// Create an updater. Fails if `config` is invalid.
    pub fn new(embedder: E, summarizer: S, config: &RaptorConfig) -> Result<Self> {
        let builder = TreeBuilder::new(embedder, summarizer, config)?;
        Ok(Self {
            builder,
            config: config.incremental.clone(),
        })
    }

    /// Reuse a configured builder (its tokenizer and clusterer carry over).
    pub fn from_builder(builder: TreeBuilder<E, S>, config: IncrementalConfig) -> Result<Self> {
        RaptorConfig::default()
            .with_incremental(config.clone())
            .validate()?;
        Ok(Self { builder, config })
    }

    /// The builder used for summaries and rebuilds.
    pub fn builder(&self) -> &TreeBuilder<E, S> {
        &self.builder
    }

    /// Incremental parameters.
    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    /// Leaf nodes for `chunks`, with fresh ids after `tree.next_id()` and
    /// embeddings from one batch call. Nothing is inserted.
    pub fn prepare_leaves<T: AsRef<str>>(&self, tree: &Tree, chunks: &[T]) -> Result<Vec<Node>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.as_ref().to_string()).collect();
        let vectors = self.builder.embedder().embed_batch(&texts)?;
        if vectors.len() != texts.len() {
            return Err(Error::InvariantViolation(format!(
                "{} embeddings for {} chunks",
                vectors.len(),
                texts.len()
            )));
        }
        let model_id = self.builder.model_id();
        let start = tree.next_id();
        Ok(texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| Node::leaf(start + i, text).with_embedding(model_id, vector))
            .collect())
    }

    /// Attach new leaves under layer-1 parents.
    ///
    /// Leaves whose id is already in the tree are skipped, so repeating a
    /// call is harmless. Layers above 1 are not touched.
    pub fn attach_to_layer_one(&self, tree: &mut Tree, leaves: Vec<Node>) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();
        let pending = self.pending_leaves(tree, leaves, &mut report)?;
        if pending.is_empty() {
            return Ok(report);
        }
        let count = pending.len();
        let _touched = self.round(tree, pending, 0, &mut report)?;
        tree.refresh_roots();
        info!(
            leaves = count,
            attached = report.attached.len(),
            created = report.created_parents.len(),
            updated = report.updated_parents.len(),
            failed = report.failed.len(),
            "attached leaves to layer 1"
        );
        Ok(report)
    }

    /// Re-fit `affected` nodes of `layer` into the layers above.
    ///
    /// Rounds run up to the top layer as it was when the call started; a
    /// call starting at the top adds exactly one layer.
    pub fn propagate_upward(
        &self,
        tree: &mut Tree,
        affected: &[NodeId],
        layer: usize,
    ) -> Result<UpdateReport> {
        if layer > tree.num_layers() {
            return Err(Error::invalid(
                "layer",
                format!("layer {layer} is above the top layer {}", tree.num_layers()),
            ));
        }
        let mut report = UpdateReport::default();
        let pending = self.existing_nodes(tree, affected, layer)?;
        self.propagate_from(tree, pending, layer, &mut report)?;
        Ok(report)
    }

    /// Embed `chunks`, insert them as leaves, and propagate to the top.
    pub fn ingest<T: AsRef<str>>(&self, tree: &mut Tree, chunks: &[T]) -> Result<UpdateReport> {
        let leaves = self.prepare_leaves(tree, chunks)?;
        let mut report = UpdateReport::default();
        let pending = self.pending_leaves(tree, leaves, &mut report)?;
        self.propagate_from(tree, pending, 0, &mut report)?;
        Ok(report)
    }

    /// Move the leaves of `source` into `destination`.
    ///
    /// Source leaves are re-numbered from `destination.next_id()` in
    /// ascending source-id order; their text, embeddings, keywords and
    /// metadata are kept and the source hierarchy is discarded.
    pub fn merge_trees(&self, destination: &mut Tree, source: &Tree) -> Result<UpdateReport> {
        let mut source_ids: Vec<NodeId> = source.leaf_nodes().to_vec();
        source_ids.sort_unstable();
        let start = destination.next_id();
        let leaves: Vec<Node> = source_ids
            .iter()
            .enumerate()
            .filter_map(|(i, &sid)| source.get(sid).map(|n| (i, n)))
            .map(|(i, n)| {
                let mut leaf = n.clone();
                leaf.id = start + i;
                leaf.layer = 0;
                leaf.children.clear();
                leaf
            })
            .collect();
        debug!(leaves = leaves.len(), start, "merging source leaves");

        let mut report = UpdateReport::default();
        let pending = self.pending_leaves(destination, leaves, &mut report)?;
        self.propagate_from(destination, pending, 0, &mut report)?;
        Ok(report)
    }

    /// Discard everything above `retained_layer` and rebuild it.
    ///
    /// Works on a copy: if any embedding or summary fails, `tree` is left
    /// exactly as it was.
    pub fn rebuild_upper_layers(&self, tree: &mut Tree, retained_layer: usize) -> Result<UpdateReport> {
        let mut rebuilt = tree.clone();
        let removed = rebuilt.truncate_above(retained_layer)?;
        info!(retained_layer, removed = removed.len(), "rebuilding upper layers");
        if let Err(err) = self.builder.construct_layers(&mut rebuilt, retained_layer) {
            warn!(retained_layer, error = %err, "rebuild failed, tree unchanged");
            return Err(err);
        }
        let created = ((retained_layer + 1)..=rebuilt.num_layers())
            .flat_map(|l| rebuilt.layer(l).iter().copied())
            .collect();
        *tree = rebuilt;
        Ok(UpdateReport {
            created_parents: created,
            ..UpdateReport::default()
        })
    }

    fn propagate_from(
        &self,
        tree: &mut Tree,
        mut pending: Vec<Pending>,
        layer: usize,
        report: &mut UpdateReport,
    ) -> Result<()> {
        let stop = tree.num_layers().max(layer + 1);
        let mut current = layer;
        while !pending.is_empty() {
            let touched = self.round(tree, pending, current, report)?;
            current += 1;
            if current >= stop {
                break;
            }
            pending = self.existing_nodes(tree, &touched, current)?;
        }
        tree.refresh_roots();
        info!(
            from_layer = layer,
            top = tree.num_layers(),
            created = report.created_parents.len(),
            updated = report.updated_parents.len(),
            failed = report.failed.len(),
            "propagated upward"
        );
        Ok(())
    }

    /// New leaves not yet in the tree, with embeddings for the active model.
    fn pending_leaves(
        &self,
        tree: &Tree,
        leaves: Vec<Node>,
        report: &mut UpdateReport,
    ) -> Result<Vec<Pending>> {
        let model_id = self.builder.model_id().to_string();
        let mut seen = BTreeSet::new();
        let mut fresh = Vec::new();
        for leaf in leaves {
            if tree.contains(leaf.id) || !seen.insert(leaf.id) {
                report.skipped.push(leaf.id);
                continue;
            }
            if leaf.layer != 0 || !leaf.children.is_empty() {
                return Err(Error::invalid(
                    "leaves",
                    format!("node {} is not a leaf", leaf.id),
                ));
            }
            fresh.push(leaf);
        }

        let missing: Vec<usize> = fresh
            .iter()
            .enumerate()
            .filter(|(_, n)| n.embedding(&model_id).is_none())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| fresh[i].text.clone()).collect();
            let vectors = self.builder.embedder().embed_batch(&texts)?;
            if vectors.len() != texts.len() {
                return Err(Error::InvariantViolation(format!(
                    "{} embeddings for {} leaves",
                    vectors.len(),
                    texts.len()
                )));
            }
            for (i, vector) in missing.into_iter().zip(vectors) {
                let _ = fresh[i].embeddings.insert(model_id.clone(), vector);
            }
        }

        fresh
            .into_iter()
            .map(|node| -> Result<Pending> {
                let vector = node
                    .embedding(&model_id)
                    .map(<[f32]>::to_vec)
                    .ok_or_else(|| Error::InvariantViolation(format!("leaf {} not embedded", node.id)))?;
                Ok(Pending {
                    id: node.id,
                    text: node.text.clone(),
                    vector,
                    node: Some(node),
                })
            })
            .collect()
    }

    /// Nodes already in the tree at `layer`, embedded for the active model.
    fn existing_nodes(&self, tree: &mut Tree, ids: &[NodeId], layer: usize) -> Result<Vec<Pending>> {
        let model_id = self.builder.model_id().to_string();
        let mut unembedded = Vec::new();
        for &id in ids {
            let node = tree
                .get(id)
                .ok_or_else(|| Error::InvariantViolation(format!("unknown node {id}")))?;
            if node.layer != layer {
                return Err(Error::invalid(
                    "affected",
                    format!("node {id} is on layer {}, not {layer}", node.layer),
                ));
            }
            if node.embedding(&model_id).is_none() {
                unembedded.push((id, node.text.clone()));
            }
        }
        if !unembedded.is_empty() {
            let texts: Vec<String> = unembedded.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.builder.embedder().embed_batch(&texts)?;
            for ((id, _), vector) in unembedded.into_iter().zip(vectors) {
                tree.set_embedding(id, &model_id, vector)?;
            }
        }

        let mut out = Vec::with_capacity(ids.len());
        let mut seen = BTreeSet::new();
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let node = tree
                .get(id)
                .ok_or_else(|| Error::InvariantViolation(format!("unknown node {id}")))?;
            let vector = node
                .embedding(&model_id)
                .map(<[f32]>::to_vec)
                .ok_or_else(|| Error::InvariantViolation(format!("node {id} not embedded")))?;
            out.push(Pending {
                id,
                text: node.text.clone(),
                vector,
                node: None,
            });
        }
        Ok(out)
    }

    /// Match `items` (layer `layer`) to parents on `layer + 1`, summarize and
    /// commit. Returns the parents created or updated.
    fn round(
        &self,
        tree: &mut Tree,
        mut items: Vec<Pending>,
        layer: usize,
        report: &mut UpdateReport,
    ) -> Result<Vec<NodeId>> {
        let parent_layer = layer + 1;
        let model_id = self.builder.model_id().to_string();
        let threshold = self.config.similarity_threshold;

        let mut existing: Vec<(NodeId, Vec<f32>)> = Vec::new();
        for parent in tree.layer_nodes(parent_layer) {
            let vector = parent.embedding(&model_id).ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "parent {} has no '{model_id}' embedding",
                    parent.id
                ))
            })?;
            existing.push((parent.id, vector.to_vec()));
        }

        // Match phase: no tree mutation.
        let mut joins: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        let mut fresh: Vec<(Vec<f32>, Vec<usize>)> = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            let mut best: Option<(f64, Target)> = None;
            let candidates = existing
                .iter()
                .map(|(pid, v)| (Target::Existing(*pid), v))
                .chain(fresh.iter().enumerate().map(|(f, (proxy, _))| (Target::Fresh(f), proxy)));
            for (target, vector) in candidates {
                let sim = cosine_similarity(&item.vector, vector);
                if best.as_ref().map_or(true, |(b, _)| sim > *b) {
                    best = Some((sim, target));
                }
            }
            match best {
                Some((sim, Target::Existing(pid))) if sim >= threshold => {
                    joins.entry(pid).or_default().push(idx);
                }
                Some((sim, Target::Fresh(f))) if sim >= threshold => fresh[f].1.push(idx),
                _ => fresh.push((item.vector.clone(), vec![idx])),
            }
        }
        debug!(
            layer,
            items = items.len(),
            joined = joins.len(),
            new_parents = fresh.len(),
            "matched nodes to parents"
        );

        let mut plans: Vec<Plan> = joins
            .into_iter()
            .map(|(pid, members)| Plan {
                target: Target::Existing(pid),
                members,
                summary: None,
            })
            .chain(fresh.into_iter().enumerate().map(|(f, (_, members))| Plan {
                target: Target::Fresh(f),
                members,
                summary: None,
            }))
            .collect();

        // Summaries.
        for plan in &mut plans {
            let context = self.plan_context(tree, plan, &items)?;
            match self.builder.summarize_context(&context, parent_layer) {
                Ok(summary) => plan.summary = Some(summary),
                Err(err) if err.is_invariant_violation() => return Err(err),
                Err(err) => {
                    warn!(layer = parent_layer, error = %err, "summary failed, parent left as-is");
                    for &m in &plan.members {
                        report.fail(items[m].id, &err);
                    }
                }
            }
        }

        // One embedding batch for every summary that succeeded.
        let ready: Vec<usize> = (0..plans.len()).filter(|&p| plans[p].summary.is_some()).collect();
        let texts: Vec<String> = ready
            .iter()
            .filter_map(|&p| plans[p].summary.clone())
            .collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            match self.builder.embedder().embed_batch(&texts) {
                Ok(v) if v.len() == texts.len() => v,
                Ok(v) => {
                    return Err(Error::InvariantViolation(format!(
                        "{} embeddings for {} summaries",
                        v.len(),
                        texts.len()
                    )))
                }
                Err(err) if err.is_invariant_violation() => return Err(err),
                Err(err) => {
                    warn!(layer = parent_layer, error = %err, "summary embedding failed");
                    for &p in &ready {
                        for &m in &plans[p].members {
                            report.fail(items[m].id, &err);
                        }
                    }
                    return Ok(Vec::new());
                }
            }
        };

        // Commit.
        let mut next_fresh = items
            .iter()
            .map(|i| i.id + 1)
            .max()
            .unwrap_or(0)
            .max(tree.next_id());
        let mut touched = Vec::new();
        for (p, vector) in ready.into_iter().zip(vectors) {
            let plan = &mut plans[p];
            let Some(summary) = plan.summary.take() else {
                continue;
            };
            for &m in &plan.members {
                if let Some(node) = items[m].node.take() {
                    tree.insert_node(node)?;
                }
            }
            let member_ids: Vec<NodeId> = plan.members.iter().map(|&m| items[m].id).collect();
            let embeddings = BTreeMap::from([(model_id.clone(), vector)]);

            let parent_id = match plan.target {
                Target::Existing(pid) => {
                    tree.update_parent(pid, &member_ids, summary, embeddings)?;
                    report.updated_parents.push(pid);
                    pid
                }
                Target::Fresh(_) => {
                    let id = next_fresh.max(tree.next_id());
                    next_fresh = id + 1;
                    let mut node = Node::internal(id, summary, parent_layer, member_ids.iter().copied());
                    node.embeddings = embeddings;
                    tree.insert_node(node)?;
                    report.created_parents.push(id);
                    id
                }
            };
            report
                .attached
                .extend(member_ids.iter().map(|&child| (child, parent_id)));
            touched.push(parent_id);
        }
        Ok(touched)
    }

    /// Context for one parent: members first, then the parent's other
    /// children from the highest id down.
    fn plan_context(&self, tree: &Tree, plan: &Plan, items: &[Pending]) -> Result<String> {
        let cap = self.config.max_children_for_summary;
        let mut texts: Vec<&str> = plan.members.iter().map(|&m| items[m].text.as_str()).collect();
        if let Target::Existing(pid) = plan.target {
            let parent = tree
                .get(pid)
                .ok_or_else(|| Error::InvariantViolation(format!("unknown parent {pid}")))?;
            for &child in parent.children.iter().rev() {
                if texts.len() >= cap {
                    break;
                }
                if plan.members.iter().any(|&m| items[m].id == child) {
                    continue;
                }
                let node = tree.get(child).ok_or_else(|| {
                    Error::InvariantViolation(format!("parent {pid} lists missing child {child}"))
                })?;
                texts.push(node.text.as_str());
            }
        }
        texts.truncate(cap);
        Ok(bounded_context(
            &texts,
            self.builder.tokenizer(),
            self.config.max_context_tokens,
        ))
    }
}

impl<E, S> std::fmt::Debug for IncrementalUpdater<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalUpdater")
            .field("config", &self.config)
            .field("builder", &self.builder)
            .finish()
    }
}
