//! Second-stage logistic regression over the two base learners' probabilities.
//!
//! Fit only on validation-partition outputs. Adoption is judged on cross-fitted AUC so
//! the meta-learner is not credited for scoring rows it was fit on.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use readmit_common::{ReadmitError, Result, StackingConfig};

use crate::logistic::LogisticModel;
use crate::metrics::roc_auc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingMetaLearner {
    /// Weights on `[p_gbm, p_linear]`.
    pub weights: [f64; 2],
    pub intercept: f64,
}

impl StackingMetaLearner {
    pub fn fit(p_gbm: &[f64], p_linear: &[f64], labels: &[u8], l2: f64) -> Result<Self> {
        if p_gbm.len() != p_linear.len() {
            return Err(ReadmitError::Training("stacking inputs differ in length".into()));
        }
        let rows: Vec<Vec<f64>> = p_gbm.iter().zip(p_linear).map(|(&a, &b)| vec![a, b]).collect();
        let model = LogisticModel::fit(&rows, labels, l2)?;
        Ok(Self { weights: [model.weights[0], model.weights[1]], intercept: model.intercept })
    }

    pub fn predict(&self, p_gbm: f64, p_linear: f64) -> f64 {
        crate::logistic::sigmoid(self.intercept + self.weights[0] * p_gbm + self.weights[1] * p_linear)
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.iter().chain([&self.intercept]).any(|v| !v.is_finite()) {
            return Err(ReadmitError::Artifact("stacker parameters are not finite".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingReport {
    pub gbm_auc: f64,
    pub linear_auc: f64,
    pub stacked_auc_in_sample: Option<f64>,
    pub stacked_auc_cross_fit: Option<f64>,
    pub stacker: Option<StackingMetaLearner>,
    pub adopted: bool,
    pub reason: String,
}

impl StackingReport {
    /// Base-learner numbers only; no meta-learner was fit.
    pub fn skipped(p_gbm: &[f64], p_linear: &[f64], labels: &[u8], reason: String) -> Self {
        Self {
            gbm_auc: roc_auc(labels, p_gbm),
            linear_auc: roc_auc(labels, p_linear),
            stacked_auc_in_sample: None,
            stacked_auc_cross_fit: None,
            stacker: None,
            adopted: false,
            reason,
        }
    }
}

/// Fit and evaluate the meta-learner. `folds[i]` is the cross-fit fold of validation row `i`.
pub fn fit_stacker(
    p_gbm: &[f64],
    p_linear: &[f64],
    labels: &[u8],
    folds: &[usize],
    config: &StackingConfig,
) -> StackingReport {
    let mut report = StackingReport::skipped(p_gbm, p_linear, labels, String::new());
    let (gbm_auc, linear_auc) = (report.gbm_auc, report.linear_auc);
    let best_base = gbm_auc.max(linear_auc);

    if !config.enabled {
        report.reason = "stacking disabled".into();
        return report;
    }

    let stacker = match StackingMetaLearner::fit(p_gbm, p_linear, labels, config.l2) {
        Ok(s) => s,
        Err(e) => {
            warn!("Meta-learner fit failed: {e}");
            report.reason = format!("fit failed: {e}");
            return report;
        }
    };
    let in_sample: Vec<f64> = p_gbm.iter().zip(p_linear).map(|(&a, &b)| stacker.predict(a, b)).collect();
    report.stacked_auc_in_sample = Some(roc_auc(labels, &in_sample));

    let cross_fit = match cross_fitted_scores(p_gbm, p_linear, labels, folds, config) {
        Ok(scores) => roc_auc(labels, &scores),
        Err(e) => {
            warn!("Meta-learner cross-fit failed: {e}");
            report.stacker = Some(stacker);
            report.reason = format!("cross-fit failed: {e}");
            return report;
        }
    };
    report.stacked_auc_cross_fit = Some(cross_fit);

    let floor = best_base - config.tolerance;
    report.adopted = cross_fit >= floor;
    report.reason = if report.adopted {
        format!("cross-fitted AUC {cross_fit:.4} >= {floor:.4}")
    } else {
        format!("cross-fitted AUC {cross_fit:.4} below best base learner {best_base:.4} minus tolerance")
    };
    info!(
        "Stacking: gbm AUC={gbm_auc:.4}, linear AUC={linear_auc:.4}, stacked in-sample={:.4}, cross-fit={cross_fit:.4}, adopted={}",
        report.stacked_auc_in_sample.unwrap_or(f64::NAN),
        report.adopted
    );
    report.stacker = Some(stacker);
    report
}

fn cross_fitted_scores(
    p_gbm: &[f64],
    p_linear: &[f64],
    labels: &[u8],
    folds: &[usize],
    config: &StackingConfig,
) -> Result<Vec<f64>> {
    if folds.len() != labels.len() {
        return Err(ReadmitError::Training("fold assignment length mismatch".into()));
    }
    let k = folds.iter().copied().max().map_or(0, |m| m + 1);
    let mut out = vec![0.0f64; labels.len()];
    for fold in 0..k {
        let (mut g, mut l, mut y) = (Vec::new(), Vec::new(), Vec::new());
        for i in (0..labels.len()).filter(|&i| folds[i] != fold) {
            g.push(p_gbm[i]);
            l.push(p_linear[i]);
            y.push(labels[i]);
        }
        let model = StackingMetaLearner::fit(&g, &l, &y, config.l2)?;
        for i in (0..labels.len()).filter(|&i| folds[i] == fold) {
            out[i] = model.predict(p_gbm[i], p_linear[i]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two noisy views of the same latent risk; each misses part of the signal.
    fn base_outputs() -> (Vec<f64>, Vec<f64>, Vec<u8>, Vec<usize>) {
        let n = 600;
        let mut g = Vec::with_capacity(n);
        let mut l = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let a = ((i * 13) % 17) as f64 / 17.0;
            let b = ((i * 7) % 19) as f64 / 19.0;
            let label = u8::from(a + b > 1.0);
            g.push(0.2 + 0.6 * a);
            l.push(0.2 + 0.6 * b);
            y.push(label);
        }
        let folds = (0..n).map(|i| i % 5).collect();
        (g, l, y, folds)
    }

    #[test]
    fn test_stacking_combines_complementary_learners() {
        let (g, l, y, folds) = base_outputs();
        let report = fit_stacker(&g, &l, &y, &folds, &StackingConfig { l2: 1e-3, ..StackingConfig::default() });
        assert!(report.adopted, "{}", report.reason);
        assert!(report.stacked_auc_cross_fit.unwrap() > report.gbm_auc.max(report.linear_auc));
        let s = report.stacker.unwrap();
        assert!(s.weights[0] > 0.0 && s.weights[1] > 0.0);
    }

    #[test]
    fn test_useless_second_learner_not_rewarded() {
        let (g, _, y, folds) = base_outputs();
        // Linear learner identical to the tree: stacking adds nothing but must not regress much
        let report = fit_stacker(&g, &g, &y, &folds, &StackingConfig::default());
        let cross = report.stacked_auc_cross_fit.unwrap();
        assert_eq!(report.adopted, cross >= report.gbm_auc - 0.005);
    }

    #[test]
    fn test_disabled() {
        let (g, l, y, folds) = base_outputs();
        let report = fit_stacker(&g, &l, &y, &folds, &StackingConfig { enabled: false, ..StackingConfig::default() });
        assert!(!report.adopted);
        assert!(report.stacker.is_none());
    }
}
