//! Tree node.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Node identifier. Unique within a tree, assigned in increasing order and
/// never reused.
pub type NodeId = usize;

/// A node in a retrieval tree.
///
/// Leaves (layer 0) hold original chunks; nodes above hold summaries of
/// their children. Embeddings are keyed by model id so a tree can carry
/// vectors from more than one model across a model switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// Chunk text for leaves, summary text above.
    pub text: String,
    /// Depth in tree (0 = leaves).
    pub layer: usize,
    /// Child node IDs (empty for leaves).
    #[serde(default)]
    pub children: BTreeSet<NodeId>,
    /// Embedding per model id.
    #[serde(default)]
    pub embeddings: BTreeMap<String, Vec<f32>>,
    /// Optional keywords.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    /// Optional free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Node {
    /// Create a new leaf node.
    pub fn leaf(id: NodeId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            layer: 0,
            children: BTreeSet::new(),
            embeddings: BTreeMap::new(),
            keywords: None,
            metadata: None,
        }
    }

    /// Create a new internal (summary) node.
    pub fn internal(
        id: NodeId,
        text: impl Into<String>,
        layer: usize,
        children: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            layer,
            children: children.into_iter().collect(),
            embeddings: BTreeMap::new(),
            keywords: None,
            metadata: None,
        }
    }

    /// Attach an embedding for `model_id`.
    pub fn with_embedding(mut self, model_id: impl Into<String>, vector: Vec<f32>) -> Self {
        let _ = self.embeddings.insert(model_id.into(), vector);
        self
    }

    /// Attach keywords.
    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check if this is a leaf node.
    pub fn is_leaf(&self) -> bool {
        self.layer == 0
    }

    /// Embedding for `model_id`, if present.
    pub fn embedding(&self, model_id: &str) -> Option<&[f32]> {
        self.embeddings.get(model_id).map(Vec::as_slice)
    }

    /// Replace the summary text and its embeddings in one step.
    ///
    /// Embeddings of the old text are dropped: they no longer describe it.
    pub fn replace_summary(&mut self, text: String, embeddings: BTreeMap<String, Vec<f32>>) {
        self.text = text;
        self.embeddings = embeddings;
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_leaf() {
            write!(f, "Leaf[{}]: {}", self.id, self.text)
        } else {
            write!(
                f,
                "Node[{}] L{} ({} children): {}",
                self.id,
                self.layer,
                self.children.len(),
                self.text
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_and_internal() {
        let leaf = Node::leaf(3, "chunk").with_embedding("m", vec![1.0, 0.0]);
        assert!(leaf.is_leaf());
        assert_eq!(leaf.embedding("m"), Some(&[1.0, 0.0][..]));
        assert!(leaf.embedding("other").is_none());

        let parent = Node::internal(4, "summary", 1, [3, 1, 3]);
        assert!(!parent.is_leaf());
        assert_eq!(parent.children.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_replace_summary_swaps_text_and_vectors_together() {
        let mut node = Node::internal(1, "old", 1, [0])
            .with_embedding("a", vec![1.0])
            .with_embedding("b", vec![2.0]);
        let fresh: BTreeMap<String, Vec<f32>> = [("a".to_string(), vec![3.0])].into_iter().collect();
        node.replace_summary("new".into(), fresh);
        assert_eq!(node.text, "new");
        assert_eq!(node.embedding("a"), Some(&[3.0][..]));
        assert!(node.embedding("b").is_none());
    }

    #[test]
    fn test_optional_fields_skipped_in_json() {
        let node = Node::leaf(0, "x");
        let json = serde_json::to_string(&node).unwrap();
        assert!(!json.contains("keywords"));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_display() {
        assert_eq!(Node::leaf(2, "hi").to_string(), "Leaf[2]: hi");
        assert!(Node::internal(5, "sum", 2, [1]).to_string().starts_with("Node[5] L2"));
    }
}
