//! Per-prediction feature attribution for the boosted ensemble.
//!
//! [`TreeShapExplainer`] computes exact path-dependent TreeSHAP values: for each tree,
//! every root-to-leaf path is walked once while tracking the proportion of feature
//! subsets that reach it. The values satisfy
//! `expected_value + Σ values[i] == predict_raw(x)` up to floating-point rounding.

use serde::{Deserialize, Serialize};

use readmit_common::{ReadmitError, Result};

use crate::gbm::{GbmModel, Tree, TreeNode};
use crate::manifest::FeatureManifest;
use crate::preprocess::{FeatureValue, FeatureVector};

/// Signed push of one feature on the raw (log-odds) score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub feature: String,
    pub value: f64,
    /// Canonical input value of the feature, for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
}

/// Manifest-wide attribution before any filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub expected_value: f64,
    pub values: Vec<f64>,
}

impl Attribution {
    /// `expected_value + Σ values`.
    pub fn reconstructed(&self) -> f64 {
        self.expected_value + self.values.iter().sum::<f64>()
    }
}

/// Attribution seam used by the scoring service. A failure here never aborts scoring.
pub trait AttributionEngine: Send + Sync {
    fn attribute(&self, model: &GbmModel, x: &FeatureVector) -> Result<Attribution>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeShapExplainer;

impl AttributionEngine for TreeShapExplainer {
    fn attribute(&self, model: &GbmModel, x: &FeatureVector) -> Result<Attribution> {
        if x.len() != model.n_features() {
            return Err(ReadmitError::Attribution(format!(
                "vector has {} slots, model expects {}",
                x.len(),
                model.n_features()
            )));
        }
        let mut values = vec![0.0f64; model.n_features()];
        for tree in model.trees() {
            tree_shap(tree, x, &mut values);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ReadmitError::Attribution("non-finite attribution".into()));
        }
        Ok(Attribution { expected_value: model.expected_value(), values })
    }
}

/// Keep slots the caller actually supplied, drop exact zeros, and rank by absolute
/// value. Ties keep manifest order. `limit` bounds the result length.
pub fn rank_contributions(
    manifest: &FeatureManifest,
    x: &FeatureVector,
    attribution: &Attribution,
    limit: Option<usize>,
) -> Vec<Contribution> {
    let mut ranked: Vec<Contribution> = manifest
        .features()
        .iter()
        .enumerate()
        .filter(|(i, _)| x.is_present(*i))
        .filter_map(|(i, spec)| {
            let value = attribution.values.get(i).copied()?;
            (value != 0.0).then(|| Contribution {
                feature: spec.name.clone(),
                value,
                observed: observed_value(x, i),
            })
        })
        .collect();
    // sort_by is stable, so equal magnitudes stay in manifest order
    ranked.sort_by(|a, b| b.value.abs().total_cmp(&a.value.abs()));
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
}

fn observed_value(x: &FeatureVector, slot: usize) -> Option<String> {
    match x.get(slot)? {
        FeatureValue::Category(c) => Some(c.clone()),
        FeatureValue::Numeric(v) if v.fract() == 0.0 && v.abs() < 1e15 => Some(format!("{}", *v as i64)),
        FeatureValue::Numeric(v) => Some(format!("{v}")),
    }
}

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

fn tree_shap(tree: &Tree, x: &FeatureVector, phi: &mut [f64]) {
    if tree.nodes().is_empty() {
        return;
    }
    recurse(tree, x, phi, 0, Vec::with_capacity(16), 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    tree: &Tree,
    x: &FeatureVector,
    phi: &mut [f64],
    node: usize,
    mut path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    extend_path(&mut path, zero_fraction, one_fraction, feature);

    match tree.node(node) {
        TreeNode::Leaf { value, .. } => {
            for i in 1..path.len() {
                let w = unwound_path_sum(&path, i);
                let el = path[i];
                if let Some(f) = el.feature {
                    phi[f] += w * (el.one_fraction - el.zero_fraction) * value;
                }
            }
        }
        TreeNode::Split { feature: split, rule, left, right, .. } => {
            let (hot, cold) = if rule.goes_left(x, *split) { (*left, *right) } else { (*right, *left) };
            let (w_left, w_right) = tree.child_weights(*left, *right);
            let (w_hot, w_cold) = if hot == *left { (w_left, w_right) } else { (w_right, w_left) };

            // A feature seen earlier on this path is undone so it is counted once
            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            if let Some(k) = (1..path.len()).find(|&k| path[k].feature == Some(*split)) {
                incoming_zero = path[k].zero_fraction;
                incoming_one = path[k].one_fraction;
                unwind_path(&mut path, k);
            }

            recurse(tree, x, phi, hot, path.clone(), incoming_zero * w_hot, incoming_one, Some(*split));
            recurse(tree, x, phi, cold, path, incoming_zero * w_cold, 0.0, Some(*split));
        }
    }
}

fn extend_path(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let d = depth as f64;
    for i in (0..depth).rev() {
        let fi = i as f64;
        path[i + 1].weight += one_fraction * path[i].weight * (fi + 1.0) / (d + 1.0);
        path[i].weight = zero_fraction * path[i].weight * (d - fi) / (d + 1.0);
    }
}

fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let d = depth as f64;
    let one = path[index].one_fraction;
    let zero = path[index].zero_fraction;
    let mut next_one_portion = path[depth].weight;

    for i in (0..depth).rev() {
        let fi = i as f64;
        if one != 0.0 {
            let tmp = path[i].weight;
            path[i].weight = next_one_portion * (d + 1.0) / ((fi + 1.0) * one);
            next_one_portion = tmp - path[i].weight * zero * (d - fi) / (d + 1.0);
        } else {
            path[i].weight = path[i].weight * (d + 1.0) / (zero * (d - fi));
        }
    }
    for i in index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let d = depth as f64;
    let one = path[index].one_fraction;
    let zero = path[index].zero_fraction;
    let mut next_one_portion = path[depth].weight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        let fi = i as f64;
        if one != 0.0 {
            let tmp = next_one_portion * (d + 1.0) / ((fi + 1.0) * one);
            total += tmp;
            next_one_portion = path[i].weight - tmp * zero * ((d - fi) / (d + 1.0));
        } else if zero != 0.0 {
            total += (path[i].weight / zero) / ((d - fi) / (d + 1.0));
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gbm::tree::tests::sample_tree;
    use crate::gbm::{SplitRule, TreeNode};
    use crate::manifest::FeatureKind;
    use crate::preprocess::MISSING_CATEGORY;

    fn vector(age: f64, race: &str) -> FeatureVector {
        FeatureVector::from_values(vec![FeatureValue::Numeric(age), FeatureValue::Category(race.into())])
    }

    fn model_of(trees: Vec<Tree>) -> GbmModel {
        GbmModel::new(2, -1.25, 0.1, 1.0, trees)
    }

    /// Conditional expectation with the features in `known` fixed to `x`.
    fn cond_expectation(tree: &Tree, x: &FeatureVector, known: &[bool], node: usize) -> f64 {
        match tree.node(node) {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split { feature, rule, left, right, .. } => {
                if known[*feature] {
                    let next = if rule.goes_left(x, *feature) { *left } else { *right };
                    cond_expectation(tree, x, known, next)
                } else {
                    let (wl, wr) = tree.child_weights(*left, *right);
                    wl * cond_expectation(tree, x, known, *left) + wr * cond_expectation(tree, x, known, *right)
                }
            }
        }
    }

    /// Exact Shapley values by subset enumeration.
    fn brute_force(tree: &Tree, x: &FeatureVector, n: usize) -> Vec<f64> {
        let fact = |k: usize| (1..=k).product::<usize>() as f64;
        let mut phi = vec![0.0; n];
        for i in 0..n {
            for mask in 0..(1usize << n) {
                if mask & (1 << i) != 0 {
                    continue;
                }
                let size = mask.count_ones() as usize;
                let weight = fact(size) * fact(n - size - 1) / fact(n);
                let without: Vec<bool> = (0..n).map(|j| mask & (1 << j) != 0).collect();
                let mut with = without.clone();
                with[i] = true;
                phi[i] += weight * (cond_expectation(tree, x, &with, 0) - cond_expectation(tree, x, &without, 0));
            }
        }
        phi
    }

    /// Splits on feature 0 twice along one path.
    fn repeated_feature_tree() -> Tree {
        Tree::from_nodes(vec![
            TreeNode::Split {
                feature: 0,
                rule: SplitRule::Numeric { threshold: 50.0, missing_left: true },
                left: 1,
                right: 2,
                cover: 12.0,
                gain: 1.0,
            },
            TreeNode::Leaf { value: -0.5, cover: 5.0 },
            TreeNode::Split {
                feature: 1,
                rule: SplitRule::Categorical {
                    left: ["A".to_string()].into_iter().collect(),
                    right: ["B".to_string()].into_iter().collect(),
                    default_left: true,
                },
                left: 3,
                right: 6,
                cover: 7.0,
                gain: 1.0,
            },
            TreeNode::Split {
                feature: 0,
                rule: SplitRule::Numeric { threshold: 70.0, missing_left: false },
                left: 4,
                right: 5,
                cover: 4.0,
                gain: 1.0,
            },
            TreeNode::Leaf { value: 0.3, cover: 1.5 },
            TreeNode::Leaf { value: 1.1, cover: 2.5 },
            TreeNode::Leaf { value: 0.2, cover: 3.0 },
        ])
    }

    #[test]
    fn test_matches_brute_force_shapley() {
        for tree in [sample_tree(), repeated_feature_tree()] {
            for x in [vector(55.0, "A"), vector(75.0, "B"), vector(f64::NAN, "Z"), vector(65.0, MISSING_CATEGORY)] {
                let mut phi = vec![0.0; 2];
                tree_shap(&tree, &x, &mut phi);
                let expected = brute_force(&tree, &x, 2);
                for (a, b) in phi.iter().zip(&expected) {
                    assert!((a - b).abs() < 1e-12, "{phi:?} vs {expected:?}");
                }
            }
        }
    }

    #[test]
    fn test_additivity_across_ensemble() {
        let model = model_of(vec![sample_tree(), repeated_feature_tree(), sample_tree()]);
        for x in [vector(40.0, "A"), vector(80.0, "B"), vector(f64::NAN, MISSING_CATEGORY)] {
            let attribution = TreeShapExplainer.attribute(&model, &x).unwrap();
            assert!((attribution.reconstructed() - model.predict_raw(&x)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_wrong_width_is_an_error() {
        let model = model_of(vec![sample_tree()]);
        let x = FeatureVector::from_values(vec![FeatureValue::Numeric(1.0)]);
        assert!(TreeShapExplainer.attribute(&model, &x).is_err());
    }

    #[test]
    fn test_ranking_filters_absent_and_orders_by_magnitude() {
        let manifest = FeatureManifest::from_pairs([
            ("age", FeatureKind::Numeric),
            ("race", FeatureKind::Categorical),
            ("num_medications", FeatureKind::Numeric),
            ("diag_1", FeatureKind::Categorical),
        ])
        .unwrap();
        let x = FeatureVector::from_values(vec![
            FeatureValue::Numeric(75.0),
            FeatureValue::Category(MISSING_CATEGORY.into()),
            FeatureValue::Numeric(12.0),
            FeatureValue::Category("428".into()),
        ]);
        let attribution = Attribution { expected_value: 0.0, values: vec![0.2, 0.9, -0.2, 0.5] };

        let ranked = rank_contributions(&manifest, &x, &attribution, None);
        let names: Vec<&str> = ranked.iter().map(|c| c.feature.as_str()).collect();
        // race is absent; age and num_medications tie and keep manifest order
        assert_eq!(names, vec!["diag_1", "age", "num_medications"]);

        assert_eq!(ranked[1].observed.as_deref(), Some("75"));

        let top = rank_contributions(&manifest, &x, &attribution, Some(1));
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].feature, "diag_1");
        assert_eq!(top[0].observed.as_deref(), Some("428"));
    }
}
