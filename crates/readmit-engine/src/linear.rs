//! Linear baseline: one-hot categoricals, standardised numerics, L1 logistic regression.
//!
//! The encoder is part of the trained model and is serialised with it, so a model can
//! never be paired with an encoder of a different shape.

use ndarray::{aview1, s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use readmit_common::{LinearConfig, ReadmitError, Result};

use crate::logistic::{logit, sigmoid};
use crate::manifest::{FeatureKind, FeatureManifest};
use crate::preprocess::{FeatureVector, MISSING_CATEGORY};

/// Sparse design row: parallel column indices and values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseRow {
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseRow {
    fn push(&mut self, index: usize, value: f64) {
        if value != 0.0 {
            self.indices.push(index);
            self.values.push(value);
        }
    }

    pub fn dot(&self, weights: ArrayView1<'_, f64>) -> f64 {
        self.indices.iter().zip(&self.values).map(|(&i, v)| weights[i] * v).sum()
    }

    fn squared_norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncodedColumn {
    OneHot {
        slot: usize,
        name: String,
        /// Sorted training categories; column `offset + i` is `categories[i]`.
        categories: Vec<String>,
        offset: usize,
    },
    Numeric {
        slot: usize,
        name: String,
        mean: f64,
        std: f64,
        offset: usize,
        /// Column of the 0/1 missingness indicator, if enabled.
        indicator: Option<usize>,
    },
}

/// Fitted encoder state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearEncoder {
    columns: Vec<EncodedColumn>,
    width: usize,
}

impl LinearEncoder {
    pub fn fit(manifest: &FeatureManifest, rows: &[FeatureVector], missing_indicators: bool) -> Self {
        let mut columns = Vec::with_capacity(manifest.len());
        let mut offset = 0usize;
        for (slot, spec) in manifest.features().iter().enumerate() {
            match spec.kind {
                FeatureKind::Categorical => {
                    let categories: Vec<String> = rows
                        .iter()
                        .map(|x| x.category(slot).unwrap_or(MISSING_CATEGORY))
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    let width = categories.len();
                    columns.push(EncodedColumn::OneHot { slot, name: spec.name.clone(), categories, offset });
                    offset += width;
                }
                FeatureKind::Numeric => {
                    let imputed = Array1::from_iter(rows.iter().map(|x| impute(x.numeric(slot))));
                    let mean = imputed.mean().unwrap_or(0.0);
                    let std = match imputed.std(0.0) {
                        sd if sd > 1e-12 => sd,
                        _ => 1.0,
                    };
                    let indicator = missing_indicators.then_some(offset + 1);
                    columns.push(EncodedColumn::Numeric { slot, name: spec.name.clone(), mean, std, offset, indicator });
                    offset += if missing_indicators { 2 } else { 1 };
                }
            }
        }
        Self { columns, width: offset }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn columns(&self) -> &[EncodedColumn] {
        &self.columns
    }

    /// Unseen categories encode as all zeros; NaN numerics impute to zero before scaling.
    pub fn encode(&self, x: &FeatureVector) -> SparseRow {
        let mut row = SparseRow::default();
        for column in &self.columns {
            match column {
                EncodedColumn::OneHot { slot, categories, offset, .. } => {
                    if let Some(c) = x.category(*slot) {
                        if let Ok(i) = categories.binary_search_by(|probe| probe.as_str().cmp(c)) {
                            row.push(offset + i, 1.0);
                        }
                    }
                }
                EncodedColumn::Numeric { slot, mean, std, offset, indicator, .. } => {
                    let raw = x.numeric(*slot);
                    row.push(*offset, (impute(raw) - mean) / std);
                    if let Some(ind) = indicator {
                        row.push(*ind, if raw.is_nan() { 1.0 } else { 0.0 });
                    }
                }
            }
        }
        row
    }

    /// Human-readable name of every design column.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.width];
        for column in &self.columns {
            match column {
                EncodedColumn::OneHot { name, categories, offset, .. } => {
                    for (i, c) in categories.iter().enumerate() {
                        names[offset + i] = format!("{name}={c}");
                    }
                }
                EncodedColumn::Numeric { name, offset, indicator, .. } => {
                    names[*offset] = name.clone();
                    if let Some(ind) = indicator {
                        names[*ind] = format!("{name}_missing");
                    }
                }
            }
        }
        names
    }

    fn validate(&self, manifest: &FeatureManifest) -> Result<()> {
        let drift = |found: String| ReadmitError::SchemaDrift {
            artifact: "linear_model".into(),
            expected: format!("{} manifest slots", manifest.len()),
            found,
        };
        if self.columns.len() != manifest.len() {
            return Err(drift(format!("{} encoded slots", self.columns.len())));
        }
        let mut expected_offset = 0usize;
        for column in &self.columns {
            let (slot, name, kind, offset, width) = match column {
                EncodedColumn::OneHot { slot, name, categories, offset } => {
                    (*slot, name, FeatureKind::Categorical, *offset, categories.len())
                }
                EncodedColumn::Numeric { slot, name, offset, indicator, .. } => {
                    (*slot, name, FeatureKind::Numeric, *offset, 1 + usize::from(indicator.is_some()))
                }
            };
            match manifest.get(slot) {
                Some(spec) if &spec.name == name && spec.kind == kind => {}
                _ => return Err(drift(format!("slot {slot} encoded as {name:?} ({})", kind.as_str()))),
            }
            if offset != expected_offset {
                return Err(ReadmitError::Artifact(format!("encoder column {name:?} has offset {offset}")));
            }
            expected_offset += width;
        }
        if expected_offset != self.width {
            return Err(ReadmitError::Artifact("encoder width does not match its columns".into()));
        }
        Ok(())
    }
}

fn impute(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}

/// Fitted linear baseline with its encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    encoder: LinearEncoder,
    weights: Vec<f64>,
    intercept: f64,
}

impl LinearModel {
    pub fn encoder(&self) -> &LinearEncoder {
        &self.encoder
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn decision(&self, x: &FeatureVector) -> f64 {
        self.intercept + self.encoder.encode(x).dot(aview1(&self.weights))
    }

    pub fn predict_proba(&self, x: &FeatureVector) -> f64 {
        sigmoid(self.decision(x))
    }

    /// Non-zero coefficients sorted by absolute size.
    pub fn nonzero_coefficients(&self) -> Vec<(String, f64)> {
        let names = self.encoder.column_names();
        let mut coefs: Vec<(String, f64)> = names
            .into_iter()
            .zip(self.weights.iter().copied())
            .filter(|(_, w)| *w != 0.0)
            .collect();
        coefs.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        coefs
    }

    pub fn validate(&self, manifest: &FeatureManifest) -> Result<()> {
        self.encoder.validate(manifest)?;
        if self.weights.len() != self.encoder.width() {
            return Err(ReadmitError::Artifact(format!(
                "linear model has {} weights for {} encoded columns",
                self.weights.len(),
                self.encoder.width()
            )));
        }
        if !self.intercept.is_finite() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err(ReadmitError::Artifact("linear model weights are not finite".into()));
        }
        Ok(())
    }

    /// Fit on preprocessed rows.
    ///
    /// Minimises `(1/n)·Σ logloss + λ‖w‖₁` with `λ = 1 / (C·n)`, which is the scaled
    /// form of `C·Σ logloss + ‖w‖₁`. Solved by FISTA with adaptive restart; the
    /// intercept is not penalised.
    pub fn fit(
        manifest: &FeatureManifest,
        rows: &[FeatureVector],
        labels: &[u8],
        config: &LinearConfig,
    ) -> Result<Self> {
        if rows.is_empty() || rows.len() != labels.len() {
            return Err(ReadmitError::Training("linear fit needs matching non-empty inputs".into()));
        }
        let positives = labels.iter().filter(|&&y| y == 1).count();
        if positives == 0 || positives == labels.len() {
            return Err(ReadmitError::InsufficientData("linear fit needs both classes".into()));
        }

        let encoder = LinearEncoder::fit(manifest, rows, config.missing_indicators);
        let design: Vec<SparseRow> = rows.iter().map(|x| encoder.encode(x)).collect();
        let n = design.len() as f64;
        let d = encoder.width();
        let lambda = 1.0 / (config.inverse_regularization * n);
        // Lipschitz bound of the mean log-loss gradient, intercept column included
        let lipschitz = 0.25 * (design.iter().map(|r| r.squared_norm() + 1.0).sum::<f64>() / n);
        let step = 1.0 / lipschitz;
        info!(
            "Fitting L1 logistic regression: {} rows, {} columns, lambda={:.3e}",
            design.len(),
            d,
            lambda
        );

        // Parameters: weights followed by the intercept
        let mut w = Array1::<f64>::zeros(d + 1);
        w[d] = logit(positives as f64 / n);
        let mut momentum = w.clone();
        let mut t = 1.0f64;
        let mut converged_at = None;

        for iter in 0..config.max_iter {
            let grad = mean_gradient(&design, labels, momentum.view());
            let mut next = &momentum - &(&grad * step);
            next.slice_mut(s![..d]).mapv_inplace(|v| soft_threshold(v, step * lambda));

            let moved = &next - &w;
            let delta = moved.fold(0.0f64, |m, v| m.max(v.abs()));

            // Restart momentum when it points uphill
            let uphill = (&momentum - &next).dot(&moved);
            let t_next = if uphill > 0.0 { 1.0 } else { (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0 };
            let beta = if uphill > 0.0 { 0.0 } else { (t - 1.0) / t_next };
            momentum = &next + &(&moved * beta);
            w = next;
            t = t_next;

            if delta < config.tolerance {
                converged_at = Some(iter + 1);
                break;
            }
        }

        if w.iter().any(|v| !v.is_finite()) {
            return Err(ReadmitError::Training("linear fit diverged".into()));
        }
        match converged_at {
            Some(iters) => debug!("FISTA converged after {iters} iterations"),
            None => info!("FISTA reached max_iter={} before tolerance {}", config.max_iter, config.tolerance),
        }

        let model = Self { encoder, weights: w.slice(s![..d]).to_vec(), intercept: w[d] };
        info!("Linear baseline keeps {} of {} coefficients", model.nonzero_coefficients().len(), d);
        Ok(model)
    }
}

fn mean_gradient(design: &[SparseRow], labels: &[u8], params: ArrayView1<'_, f64>) -> Array1<f64> {
    let d = params.len() - 1;
    let n = design.len() as f64;
    let weights = params.slice(s![..d]);
    let mut grad = Array1::<f64>::zeros(d + 1);
    for (row, &y) in design.iter().zip(labels) {
        let r = sigmoid(params[d] + row.dot(weights)) - f64::from(y);
        for (&i, v) in row.indices.iter().zip(&row.values) {
            grad[i] += r * v;
        }
        grad[d] += r;
    }
    grad /= n;
    grad
}

fn soft_threshold(v: f64, threshold: f64) -> f64 {
    if v > threshold {
        v - threshold
    } else if v < -threshold {
        v + threshold
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::roc_auc;
    use crate::preprocess::FeatureValue;

    fn manifest() -> FeatureManifest {
        FeatureManifest::from_pairs([("c", FeatureKind::Categorical), ("x", FeatureKind::Numeric), ("noise", FeatureKind::Numeric)])
            .unwrap()
    }

    fn row(c: &str, x: f64, noise: f64) -> FeatureVector {
        FeatureVector::from_values(vec![
            FeatureValue::Category(c.to_string()),
            FeatureValue::Numeric(x),
            FeatureValue::Numeric(noise),
        ])
    }

    fn data() -> (Vec<FeatureVector>, Vec<u8>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..400 {
            let x = (i % 40) as f64 / 4.0;
            let c = ["A", "B", "C"][i % 3];
            let noise = ((i * 7919) % 13) as f64;
            let logit = x - 5.0 + if c == "C" { 2.0 } else { 0.0 };
            // Deterministic label: positive when the logit clears a per-row offset
            let offset = ((i * 37) % 11) as f64 / 2.5 - 2.0;
            labels.push(u8::from(logit > offset));
            rows.push(row(c, if i % 10 == 0 { f64::NAN } else { x }, noise));
        }
        (rows, labels)
    }

    #[test]
    fn test_encoder_layout() {
        let (rows, _) = data();
        let enc = LinearEncoder::fit(&manifest(), &rows, true);
        // 3 one-hot + (value, indicator) × 2
        assert_eq!(enc.width(), 7);
        assert_eq!(enc.column_names()[0], "c=A");
        assert_eq!(enc.column_names()[4], "x_missing");
    }

    #[test]
    fn test_unseen_category_encodes_to_zero() {
        let (rows, _) = data();
        let enc = LinearEncoder::fit(&manifest(), &rows, true);
        let encoded = enc.encode(&row("Z", 1.0, 1.0));
        assert!(encoded.indices.iter().all(|&i| i >= 3));
    }

    #[test]
    fn test_missing_numeric_imputes_zero_with_indicator() {
        let (rows, _) = data();
        let enc = LinearEncoder::fit(&manifest(), &rows, true);
        let missing = enc.encode(&row("A", f64::NAN, 0.0));
        let zero = enc.encode(&row("A", 0.0, 0.0));
        let value_col = |r: &SparseRow| r.indices.iter().position(|&i| i == 3).map(|p| r.values[p]);
        // Same imputed value in the numeric column; only the indicator differs
        assert_eq!(value_col(&missing), value_col(&zero));
        assert!(missing.indices.contains(&4));
        assert!(!zero.indices.contains(&4));
    }

    #[test]
    fn test_fit_learns_and_sparsifies() {
        let (rows, labels) = data();
        let config = LinearConfig { inverse_regularization: 0.05, ..LinearConfig::default() };
        let model = LinearModel::fit(&manifest(), &rows, &labels, &config).unwrap();
        let scores: Vec<f64> = rows.iter().map(|x| model.predict_proba(x)).collect();
        assert!(roc_auc(&labels, &scores) > 0.85);
        let coefs = model.nonzero_coefficients();
        assert_eq!(coefs[0].0, "x");
        assert!(model.validate(&manifest()).is_ok());
    }

    #[test]
    fn test_validate_rejects_other_manifest() {
        let (rows, labels) = data();
        let model = LinearModel::fit(&manifest(), &rows, &labels, &LinearConfig::default()).unwrap();
        let other = FeatureManifest::from_pairs([("c", FeatureKind::Categorical), ("x", FeatureKind::Numeric)]).unwrap();
        assert!(matches!(model.validate(&other), Err(ReadmitError::SchemaDrift { .. })));
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
        assert_eq!(soft_threshold(2.0, 0.5), 1.5);
        assert_eq!(soft_threshold(-2.0, 0.5), -1.5);
    }
}
