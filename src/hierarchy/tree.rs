//! Layered retrieval tree.
//!
//! ```text
//! layer_to_nodes
//!   2 │ [40]                  ◄── root_nodes
//!   1 │ [30, 31, 32]
//!   0 │ [0, 1, 2, ..., 29]    ◄── leaf_nodes
//! ```
//!
//! All structural changes go through `Tree` methods, which check the
//! invariants before touching anything:
//!
//! - `layer_to_nodes` has exactly the keys `0..=num_layers`
//! - `root_nodes` is the id list of the top layer
//! - every child exists and sits on a lower layer
//! - every node above layer 0 has at least one child
//!
//! Ids are never reused: the tree keeps a high-water mark that survives
//! [`Tree::truncate_above`] and serialization.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::node::{Node, NodeId};
use crate::error::{Error, Result};

/// A multi-layer tree of chunks and summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TreeRepr")]
pub struct Tree {
    all_nodes: BTreeMap<NodeId, Node>,
    leaf_nodes: Vec<NodeId>,
    root_nodes: Vec<NodeId>,
    layer_to_nodes: BTreeMap<usize, Vec<NodeId>>,
    num_layers: usize,
    next_id: NodeId,
}

/// Unchecked wire form; converted through [`Tree::check_invariants`].
#[derive(Deserialize)]
struct TreeRepr {
    all_nodes: BTreeMap<NodeId, Node>,
    leaf_nodes: Vec<NodeId>,
    root_nodes: Vec<NodeId>,
    layer_to_nodes: BTreeMap<usize, Vec<NodeId>>,
    num_layers: usize,
    #[serde(default)]
    next_id: NodeId,
}

impl TryFrom<TreeRepr> for Tree {
    type Error = Error;

    fn try_from(repr: TreeRepr) -> Result<Self> {
        // Older files carry no mark; never hand out a stored id.
        let stored_next = repr
            .all_nodes
            .last_key_value()
            .map(|(&id, _)| id + 1)
            .unwrap_or(0);
        let tree = Tree {
            all_nodes: repr.all_nodes,
            leaf_nodes: repr.leaf_nodes,
            root_nodes: repr.root_nodes,
            layer_to_nodes: repr.layer_to_nodes,
            num_layers: repr.num_layers,
            next_id: repr.next_id.max(stored_next),
        };
        tree.check_invariants()?;
        Ok(tree)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Create a new empty tree (a single empty leaf layer).
    pub fn new() -> Self {
        Self {
            all_nodes: BTreeMap::new(),
            leaf_nodes: Vec::new(),
            root_nodes: Vec::new(),
            layer_to_nodes: BTreeMap::from([(0, Vec::new())]),
            num_layers: 0,
            next_id: 0,
        }
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.all_nodes.len()
    }

    /// Check if tree is empty.
    pub fn is_empty(&self) -> bool {
        self.all_nodes.is_empty()
    }

    /// Height of the tree: the index of the top layer.
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Get a node by ID.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.all_nodes.get(&id)
    }

    /// Whether a node with this id exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.all_nodes.contains_key(&id)
    }

    /// Iterate over all nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.all_nodes.values()
    }

    /// Ids at layer 0.
    pub fn leaf_nodes(&self) -> &[NodeId] {
        &self.leaf_nodes
    }

    /// Ids at the top layer.
    pub fn root_nodes(&self) -> &[NodeId] {
        &self.root_nodes
    }

    /// Ids at `layer`, in insertion order. Empty above the top layer.
    pub fn layer(&self, layer: usize) -> &[NodeId] {
        self.layer_to_nodes
            .get(&layer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes at `layer`.
    pub fn layer_nodes(&self, layer: usize) -> impl Iterator<Item = &Node> {
        self.layer(layer).iter().filter_map(|id| self.all_nodes.get(id))
    }

    /// Next free id: one past the largest id this tree has ever held
    /// (0 when nothing was ever inserted). Removed ids are not reused.
    pub fn next_id(&self) -> NodeId {
        self.next_id
    }

    /// Insert a node.
    ///
    /// The node may sit on any existing layer or open the layer directly
    /// above the top. Its children must already be in the tree, on lower
    /// layers.
    pub fn insert_node(&mut self, node: Node) -> Result<()> {
        if self.all_nodes.contains_key(&node.id) {
            return Err(Error::InvariantViolation(format!(
                "duplicate node id {}",
                node.id
            )));
        }
        if node.layer > self.num_layers + 1 {
            return Err(Error::InvariantViolation(format!(
                "node {} on layer {} but the top layer is {}",
                node.id, node.layer, self.num_layers
            )));
        }
        if node.layer == 0 && !node.children.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "leaf {} has children",
                node.id
            )));
        }
        self.check_children(node.id, node.layer, &node.children)?;

        if node.layer == self.num_layers + 1 {
            self.num_layers += 1;
            let _ = self.layer_to_nodes.insert(self.num_layers, Vec::new());
        }
        if node.layer == 0 {
            self.leaf_nodes.push(node.id);
        }
        self.layer_to_nodes.entry(node.layer).or_default().push(node.id);
        self.next_id = self.next_id.max(node.id + 1);
        let _ = self.all_nodes.insert(node.id, node);
        self.refresh_roots();
        Ok(())
    }

    /// Add `children` to parent `id` and replace its summary in one step.
    pub fn update_parent(
        &mut self,
        id: NodeId,
        children: &[NodeId],
        text: String,
        embeddings: BTreeMap<String, Vec<f32>>,
    ) -> Result<()> {
        let layer = self
            .all_nodes
            .get(&id)
            .map(|n| n.layer)
            .ok_or_else(|| Error::InvariantViolation(format!("unknown parent {id}")))?;
        if layer == 0 {
            return Err(Error::InvariantViolation(format!(
                "cannot add children to leaf {id}"
            )));
        }
        let added: BTreeSet<NodeId> = children.iter().copied().collect();
        self.check_children(id, layer, &added)?;

        let node = self
            .all_nodes
            .get_mut(&id)
            .ok_or_else(|| Error::InvariantViolation(format!("unknown parent {id}")))?;
        node.children.extend(added);
        node.replace_summary(text, embeddings);
        Ok(())
    }

    /// Set one model's embedding on a node.
    pub fn set_embedding(&mut self, id: NodeId, model_id: &str, vector: Vec<f32>) -> Result<()> {
        let node = self
            .all_nodes
            .get_mut(&id)
            .ok_or_else(|| Error::InvariantViolation(format!("unknown node {id}")))?;
        let _ = node.embeddings.insert(model_id.to_string(), vector);
        Ok(())
    }

    /// Remove every node above `layer` and make `layer` the top.
    ///
    /// Returns the removed nodes.
    pub fn truncate_above(&mut self, layer: usize) -> Result<Vec<Node>> {
        if layer > self.num_layers {
            return Err(Error::invalid(
                "retained_layer",
                format!("layer {layer} is above the top layer {}", self.num_layers),
            ));
        }
        let mut removed = Vec::new();
        for l in (layer + 1)..=self.num_layers {
            if let Some(ids) = self.layer_to_nodes.remove(&l) {
                for id in ids {
                    if let Some(node) = self.all_nodes.remove(&id) {
                        removed.push(node);
                    }
                }
            }
        }
        self.num_layers = layer;
        self.refresh_roots();
        Ok(removed)
    }

    /// Reset `root_nodes` to the top layer.
    pub fn refresh_roots(&mut self) {
        self.root_nodes = self.layer(self.num_layers).to_vec();
    }

    fn check_children(&self, id: NodeId, layer: usize, children: &BTreeSet<NodeId>) -> Result<()> {
        if layer > 0 && children.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "internal node {id} has no children"
            )));
        }
        for child in children {
            match self.all_nodes.get(child) {
                None => {
                    return Err(Error::InvariantViolation(format!(
                        "node {id} references missing child {child}"
                    )))
                }
                Some(c) if c.layer >= layer => {
                    return Err(Error::InvariantViolation(format!(
                        "node {id} on layer {layer} has child {child} on layer {}",
                        c.layer
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Verify every structural invariant.
    pub fn check_invariants(&self) -> Result<()> {
        let keys: Vec<usize> = self.layer_to_nodes.keys().copied().collect();
        let expected: Vec<usize> = (0..=self.num_layers).collect();
        if keys != expected {
            return Err(Error::InvariantViolation(format!(
                "layer keys {keys:?} do not match 0..={}",
                self.num_layers
            )));
        }
        if self.root_nodes != self.layer(self.num_layers) {
            return Err(Error::InvariantViolation(
                "root_nodes differ from the top layer".into(),
            ));
        }
        if self.leaf_nodes != self.layer(0) {
            return Err(Error::InvariantViolation(
                "leaf_nodes differ from layer 0".into(),
            ));
        }

        let mut listed = 0usize;
        for (&layer, ids) in &self.layer_to_nodes {
            for id in ids {
                let node = self.all_nodes.get(id).ok_or_else(|| {
                    Error::InvariantViolation(format!("layer {layer} lists missing node {id}"))
                })?;
                if node.layer != layer {
                    return Err(Error::InvariantViolation(format!(
                        "node {id} is listed on layer {layer} but claims layer {}",
                        node.layer
                    )));
                }
                listed += 1;
            }
        }
        if listed != self.all_nodes.len() {
            return Err(Error::InvariantViolation(format!(
                "{} nodes stored but {listed} listed by layer",
                self.all_nodes.len()
            )));
        }

        for node in self.all_nodes.values() {
            if node.layer == 0 && !node.children.is_empty() {
                return Err(Error::InvariantViolation(format!(
                    "leaf {} has children",
                    node.id
                )));
            }
            self.check_children(node.id, node.layer, &node.children)?;
        }
        Ok(())
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to indented JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON, re-checking the invariants.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a JSON value, re-checking the invariants.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree() -> Tree {
        let mut tree = Tree::new();
        for id in 0..4 {
            tree.insert_node(Node::leaf(id, format!("leaf {id}")).with_embedding("m", vec![id as f32]))
                .unwrap();
        }
        tree.insert_node(Node::internal(4, "a", 1, [0, 1])).unwrap();
        tree.insert_node(Node::internal(5, "b", 1, [2, 3])).unwrap();
        tree.insert_node(Node::internal(6, "root", 2, [4, 5])).unwrap();
        tree
    }

    #[test]
    fn test_empty_tree() {
        let tree = Tree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.num_layers(), 0);
        assert_eq!(tree.next_id(), 0);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_layers_and_roots() {
        let tree = small_tree();
        assert_eq!(tree.num_layers(), 2);
        assert_eq!(tree.leaf_nodes(), &[0, 1, 2, 3]);
        assert_eq!(tree.root_nodes(), &[6]);
        assert_eq!(tree.layer(1), &[4, 5]);
        assert_eq!(tree.next_id(), 7);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_rejects_bad_nodes() {
        let mut tree = small_tree();
        assert!(tree.insert_node(Node::leaf(3, "dup")).unwrap_err().is_invariant_violation());
        assert!(tree
            .insert_node(Node::internal(9, "skip", 4, [6]))
            .unwrap_err()
            .is_invariant_violation());
        assert!(tree
            .insert_node(Node::internal(9, "ghost", 1, [42]))
            .unwrap_err()
            .is_invariant_violation());
        assert!(tree
            .insert_node(Node::internal(9, "same layer", 1, [4]))
            .unwrap_err()
            .is_invariant_violation());
        assert!(tree
            .insert_node(Node::internal(9, "childless", 1, []))
            .unwrap_err()
            .is_invariant_violation());
        // Nothing changed.
        assert_eq!(tree, small_tree());
    }

    #[test]
    fn test_update_parent_commits_children_and_summary() {
        let mut tree = small_tree();
        tree.insert_node(Node::leaf(7, "late")).unwrap();
        let vectors = BTreeMap::from([("m".to_string(), vec![9.0])]);
        tree.update_parent(4, &[7], "a + late".into(), vectors).unwrap();
        let parent = tree.get(4).unwrap();
        assert!(parent.children.contains(&7));
        assert_eq!(parent.text, "a + late");
        assert_eq!(parent.embedding("m"), Some(&[9.0][..]));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_truncate_above() {
        let mut tree = small_tree();
        let removed = tree.truncate_above(1).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(tree.num_layers(), 1);
        assert_eq!(tree.root_nodes(), &[4, 5]);
        tree.check_invariants().unwrap();

        assert!(tree.truncate_above(3).is_err());
        let removed = tree.truncate_above(0).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.root_nodes(), tree.leaf_nodes());
    }

    #[test]
    fn test_next_id_not_reused_after_truncate() {
        let mut tree = small_tree();
        let _ = tree.truncate_above(1).unwrap();
        // 6 was removed but stays spent.
        assert_eq!(tree.next_id(), 7);
        tree.insert_node(Node::internal(tree.next_id(), "new root", 2, [4, 5]))
            .unwrap();
        assert!(tree.get(7).is_some());
        assert_eq!(tree.next_id(), 8);
    }

    #[test]
    fn test_next_id_survives_round_trip() {
        let mut tree = small_tree();
        let _ = tree.truncate_above(0).unwrap();
        assert_eq!(tree.next_id(), 7);
        let back = Tree::from_json(&tree.to_json().unwrap()).unwrap();
        assert_eq!(back.next_id(), 7);

        // A file without the mark falls back to one past the largest id.
        let mut value = small_tree().to_value().unwrap();
        let _ = value.as_object_mut().unwrap().remove("next_id");
        assert_eq!(Tree::from_value(value).unwrap().next_id(), 7);
    }

    #[test]
    fn test_json_round_trip() {
        let tree = small_tree();
        let json = tree.to_json().unwrap();
        assert_eq!(Tree::from_json(&json).unwrap(), tree);
        let value = tree.to_value().unwrap();
        assert_eq!(Tree::from_value(value).unwrap(), tree);
    }

    #[test]
    fn test_deserialization_rejects_broken_structure() {
        let mut value = small_tree().to_value().unwrap();
        value["root_nodes"] = serde_json::json!([4]);
        assert!(Tree::from_value(value).is_err());

        let mut value = small_tree().to_value().unwrap();
        value["all_nodes"]["6"]["children"] = serde_json::json!([4, 99]);
        assert!(Tree::from_value(value).is_err());
    }
}
