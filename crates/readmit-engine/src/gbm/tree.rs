//! Regression tree used by the boosted ensemble.
//!
//! Nodes live in a flat array, root at index 0. Numeric splits send `x <= threshold`
//! left and NaN in the learned direction. Categorical splits keep the categories seen on
//! each side during training; anything else (including categories never seen at
//! training time) follows the node's default direction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::preprocess::FeatureVector;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitRule {
    Numeric {
        threshold: f64,
        missing_left: bool,
    },
    Categorical {
        left: BTreeSet<String>,
        right: BTreeSet<String>,
        default_left: bool,
    },
}

impl SplitRule {
    /// Routing decision for one feature vector.
    pub fn goes_left(&self, x: &FeatureVector, feature: usize) -> bool {
        match self {
            SplitRule::Numeric { threshold, missing_left } => {
                let v = x.numeric(feature);
                if v.is_nan() {
                    *missing_left
                } else {
                    v <= *threshold
                }
            }
            SplitRule::Categorical { left, right, default_left } => match x.category(feature) {
                Some(c) if left.contains(c) => true,
                Some(c) if right.contains(c) => false,
                _ => *default_left,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
        cover: f64,
    },
    Split {
        feature: usize,
        rule: SplitRule,
        left: usize,
        right: usize,
        cover: f64,
        gain: f64,
    },
}

impl TreeNode {
    pub fn cover(&self) -> f64 {
        match self {
            TreeNode::Leaf { cover, .. } | TreeNode::Split { cover, .. } => *cover,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<TreeNode>,
}

impl Tree {
    pub(crate) fn from_nodes(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &TreeNode {
        &self.nodes[index]
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match &nodes[idx] {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    pub fn leaf_index(&self, x: &FeatureVector) -> usize {
        let mut idx = 0usize;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { .. } => return idx,
                TreeNode::Split { feature, rule, left, right, .. } => {
                    idx = if rule.goes_left(x, *feature) { *left } else { *right };
                }
            }
        }
    }

    pub fn predict(&self, x: &FeatureVector) -> f64 {
        match &self.nodes[self.leaf_index(x)] {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split { .. } => 0.0,
        }
    }

    /// Cover-weighted mean leaf value. Child weights are normalised by the sum of the
    /// children's covers so this is exactly the baseline TreeSHAP decomposes against.
    pub fn expected_value(&self) -> f64 {
        self.expected_value_at(0)
    }

    fn expected_value_at(&self, idx: usize) -> f64 {
        match &self.nodes[idx] {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split { left, right, .. } => {
                let (wl, wr) = self.child_weights(*left, *right);
                wl * self.expected_value_at(*left) + wr * self.expected_value_at(*right)
            }
        }
    }

    /// Fraction of training cover flowing to each child.
    pub fn child_weights(&self, left: usize, right: usize) -> (f64, f64) {
        let cl = self.nodes[left].cover();
        let cr = self.nodes[right].cover();
        let total = cl + cr;
        if total > 0.0 {
            (cl / total, cr / total)
        } else {
            (0.5, 0.5)
        }
    }

    /// Structural check used when loading an artifact: child links in range and acyclic
    /// (children always come after their parent), features within `n_features`.
    pub fn validate(&self, n_features: usize) -> std::result::Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split { feature, left, right, cover, .. } = node {
                if *feature >= n_features {
                    return Err(format!("node {i} splits on feature {feature} of {n_features}"));
                }
                if *left <= i || *right <= i || *left >= self.nodes.len() || *right >= self.nodes.len() {
                    return Err(format!("node {i} has invalid children {left}/{right}"));
                }
                if !cover.is_finite() {
                    return Err(format!("node {i} has non-finite cover"));
                }
            }
            if let TreeNode::Leaf { value, .. } = node {
                if !value.is_finite() {
                    return Err(format!("leaf {i} has non-finite value"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::preprocess::FeatureValue;

    /// age <= 60 ? (race in {A} ? 1.0 : -1.0) : 2.0
    pub(crate) fn sample_tree() -> Tree {
        Tree::from_nodes(vec![
            TreeNode::Split {
                feature: 0,
                rule: SplitRule::Numeric { threshold: 60.0, missing_left: false },
                left: 1,
                right: 4,
                cover: 10.0,
                gain: 3.0,
            },
            TreeNode::Split {
                feature: 1,
                rule: SplitRule::Categorical {
                    left: ["A".to_string()].into_iter().collect(),
                    right: ["B".to_string(), "missing".to_string()].into_iter().collect(),
                    default_left: false,
                },
                left: 2,
                right: 3,
                cover: 6.0,
                gain: 1.0,
            },
            TreeNode::Leaf { value: 1.0, cover: 2.0 },
            TreeNode::Leaf { value: -1.0, cover: 4.0 },
            TreeNode::Leaf { value: 2.0, cover: 4.0 },
        ])
    }

    fn vector(age: f64, race: &str) -> FeatureVector {
        FeatureVector::from_values(vec![FeatureValue::Numeric(age), FeatureValue::Category(race.into())])
    }

    #[test]
    fn test_routing() {
        let tree = sample_tree();
        assert_eq!(tree.predict(&vector(50.0, "A")), 1.0);
        assert_eq!(tree.predict(&vector(60.0, "B")), -1.0);
        assert_eq!(tree.predict(&vector(61.0, "A")), 2.0);
        // NaN follows the learned missing direction (right)
        assert_eq!(tree.predict(&vector(f64::NAN, "A")), 2.0);
        // Unseen category takes the default direction
        assert_eq!(tree.predict(&vector(50.0, "Z")), -1.0);
    }

    #[test]
    fn test_expected_value_is_cover_weighted() {
        let tree = sample_tree();
        // 0.6 * (1/3 * 1 + 2/3 * -1) + 0.4 * 2
        let expected = 0.6 * (1.0 / 3.0 - 2.0 / 3.0) + 0.8;
        assert!((tree.expected_value() - expected).abs() < 1e-12);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.n_leaves(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_links() {
        let mut nodes = sample_tree().nodes().to_vec();
        if let TreeNode::Split { left, .. } = &mut nodes[1] {
            *left = 0;
        }
        assert!(Tree::from_nodes(nodes).validate(2).is_err());
        assert!(sample_tree().validate(1).is_err());
        assert!(sample_tree().validate(2).is_ok());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&sample_tree()).unwrap();
        let back: Tree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample_tree());
        assert!(json.contains("\"type\":\"categorical\""));
    }
}
