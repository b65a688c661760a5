//! Gradient-boosted decision trees for binary classification.
//!
//! Second-order boosting on log-loss with histogram split finding. Categorical slots
//! are split natively (many-vs-many partitions of the canonical category strings), so
//! no one-hot expansion is needed, and NaN numeric values get their own branch
//! direction at every split instead of being imputed.
//!
//! # Layout
//!
//! - [`tree`]: node array, routing and per-tree expected value
//! - [`train`]: binning, histograms, the boosting loop and early stopping

pub mod train;
pub mod tree;

use serde::{Deserialize, Serialize};

use readmit_common::{ReadmitError, Result};

use crate::logistic::sigmoid;
use crate::manifest::{FeatureKind, FeatureManifest};
use crate::preprocess::FeatureVector;

pub use train::{GbmTrainer, GbmTrainingOutcome};
pub use tree::{SplitRule, Tree, TreeNode};

/// Trained ensemble. Raw output is `base_score + Σ tree(x)` in log-odds space; leaf
/// values already include the learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmModel {
    n_features: usize,
    base_score: f64,
    learning_rate: f64,
    scale_pos_weight: f64,
    trees: Vec<Tree>,
    /// Summed split gain per manifest slot.
    gain_by_feature: Vec<f64>,
}

impl GbmModel {
    pub(crate) fn new(
        n_features: usize,
        base_score: f64,
        learning_rate: f64,
        scale_pos_weight: f64,
        trees: Vec<Tree>,
    ) -> Self {
        let mut gain_by_feature = vec![0.0f64; n_features];
        for tree in &trees {
            for node in tree.nodes() {
                if let TreeNode::Split { feature, gain, .. } = node {
                    gain_by_feature[*feature] += gain;
                }
            }
        }
        Self { n_features, base_score, learning_rate, scale_pos_weight, trees, gain_by_feature }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn scale_pos_weight(&self) -> f64 {
        self.scale_pos_weight
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Log-odds score before any calibration.
    pub fn predict_raw(&self, x: &FeatureVector) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict(x)).sum::<f64>()
    }

    pub fn predict_proba(&self, x: &FeatureVector) -> f64 {
        sigmoid(self.predict_raw(x))
    }

    pub fn predict_raw_batch(&self, xs: &[FeatureVector]) -> Vec<f64> {
        xs.iter().map(|x| self.predict_raw(x)).collect()
    }

    /// Baseline of the additive decomposition: the raw score expected under the
    /// training cover distribution.
    pub fn expected_value(&self) -> f64 {
        self.base_score + self.trees.iter().map(Tree::expected_value).sum::<f64>()
    }

    /// Gain-based importance per manifest slot, normalised to sum to 100.
    pub fn feature_importance(&self) -> Vec<f64> {
        let total: f64 = self.gain_by_feature.iter().sum();
        if total <= 0.0 {
            return vec![0.0; self.n_features];
        }
        self.gain_by_feature.iter().map(|g| 100.0 * g / total).collect()
    }

    /// Reject a model that cannot be evaluated against `manifest`: slot count, feature
    /// indices, and split kinds must all agree.
    pub fn validate(&self, manifest: &FeatureManifest) -> Result<()> {
        if self.n_features != manifest.len() {
            return Err(ReadmitError::SchemaDrift {
                artifact: "gbm_model".into(),
                expected: format!("{} features", manifest.len()),
                found: format!("{} features", self.n_features),
            });
        }
        if self.gain_by_feature.len() != self.n_features || !self.base_score.is_finite() {
            return Err(ReadmitError::Artifact("gbm model header is inconsistent".into()));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            tree.validate(self.n_features)
                .map_err(|e| ReadmitError::Artifact(format!("tree {t}: {e}")))?;
            for node in tree.nodes() {
                if let TreeNode::Split { feature, rule, .. } = node {
                    let kind = manifest.get(*feature).map(|f| f.kind);
                    let consistent = matches!(
                        (kind, rule),
                        (Some(FeatureKind::Numeric), SplitRule::Numeric { .. })
                            | (Some(FeatureKind::Categorical), SplitRule::Categorical { .. })
                    );
                    if !consistent {
                        return Err(ReadmitError::SchemaDrift {
                            artifact: "gbm_model".into(),
                            expected: format!("split kind matching slot {feature}"),
                            found: format!("tree {t} splits slot {feature} with the wrong kind"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gbm::tree::tests::sample_tree;
    use crate::manifest::FeatureManifest;
    use crate::preprocess::FeatureValue;

    fn model() -> GbmModel {
        GbmModel::new(2, -0.5, 0.1, 1.0, vec![sample_tree(), sample_tree()])
    }

    #[test]
    fn test_raw_score_sums_trees() {
        let x = FeatureVector::from_values(vec![FeatureValue::Numeric(70.0), FeatureValue::Category("A".into())]);
        assert!((model().predict_raw(&x) - 3.5).abs() < 1e-12);
        let p = model().predict_proba(&x);
        assert!(p > 0.9 && p < 1.0);
    }

    #[test]
    fn test_importance_normalised() {
        let imp = model().feature_importance();
        assert!((imp.iter().sum::<f64>() - 100.0).abs() < 1e-9);
        assert!((imp[0] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_detects_kind_mismatch() {
        let ok = FeatureManifest::from_pairs([("age", FeatureKind::Numeric), ("race", FeatureKind::Categorical)]).unwrap();
        assert!(model().validate(&ok).is_ok());
        let swapped =
            FeatureManifest::from_pairs([("age", FeatureKind::Categorical), ("race", FeatureKind::Categorical)]).unwrap();
        assert!(matches!(model().validate(&swapped), Err(ReadmitError::SchemaDrift { .. })));
        let short = FeatureManifest::from_pairs([("age", FeatureKind::Numeric)]).unwrap();
        assert!(model().validate(&short).is_err());
    }
}
