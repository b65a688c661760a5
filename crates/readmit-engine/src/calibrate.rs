//! Platt scaling on the tree model's raw log-odds.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use readmit_common::{CalibrationConfig, Result};

use crate::logistic::{sigmoid, LogisticModel};
use crate::metrics::ScoreReport;

/// `p = σ(slope · raw + intercept)`. Monotone whenever `slope > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattCalibrator {
    pub slope: f64,
    pub intercept: f64,
}

impl PlattCalibrator {
    pub fn fit(raw_scores: &[f64], labels: &[u8], l2: f64) -> Result<Self> {
        let rows: Vec<Vec<f64>> = raw_scores.iter().map(|&s| vec![s]).collect();
        let model = LogisticModel::fit(&rows, labels, l2)?;
        Ok(Self { slope: model.weights[0], intercept: model.intercept })
    }

    pub fn apply(&self, raw: f64) -> f64 {
        sigmoid(self.slope * raw + self.intercept)
    }

    pub fn is_monotone(&self) -> bool {
        self.slope > 0.0 && self.slope.is_finite() && self.intercept.is_finite()
    }
}

/// Before/after comparison on the validation partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub uncalibrated: ScoreReport,
    pub calibrated: Option<ScoreReport>,
    pub calibrator: Option<PlattCalibrator>,
    pub adopted: bool,
    pub reason: String,
}

/// Fit a calibrator on validation raw scores and decide whether to adopt it.
/// Rejection is not an error; the report says why and serving uses `σ(raw)`.
pub fn fit_calibrator(raw_scores: &[f64], labels: &[u8], config: &CalibrationConfig) -> CalibrationReport {
    let raw_probs: Vec<f64> = raw_scores.iter().map(|&s| sigmoid(s)).collect();
    let uncalibrated = ScoreReport::compute(labels, &raw_probs, config.ece_bins);

    if !config.enabled {
        return CalibrationReport {
            uncalibrated,
            calibrated: None,
            calibrator: None,
            adopted: false,
            reason: "calibration disabled".into(),
        };
    }

    let calibrator = match PlattCalibrator::fit(raw_scores, labels, config.l2) {
        Ok(c) => c,
        Err(e) => {
            warn!("Platt fit failed, serving uncalibrated probabilities: {e}");
            return CalibrationReport {
                uncalibrated,
                calibrated: None,
                calibrator: None,
                adopted: false,
                reason: format!("fit failed: {e}"),
            };
        }
    };

    let cal_probs: Vec<f64> = raw_scores.iter().map(|&s| calibrator.apply(s)).collect();
    let calibrated = ScoreReport::compute(labels, &cal_probs, config.ece_bins);
    info!(
        "Platt slope={:.4} intercept={:.4}; AUC {:.4} -> {:.4}, Brier {:.4} -> {:.4}, ECE {:.4} -> {:.4}",
        calibrator.slope,
        calibrator.intercept,
        uncalibrated.auc,
        calibrated.auc,
        uncalibrated.brier,
        calibrated.brier,
        uncalibrated.ece,
        calibrated.ece
    );

    let (adopted, reason) = if !calibrator.is_monotone() {
        (false, format!("slope {:.4} is not positive", calibrator.slope))
    } else if calibrated.auc < uncalibrated.auc - 1e-12 {
        (false, format!("calibrated AUC {:.4} below raw {:.4}", calibrated.auc, uncalibrated.auc))
    } else {
        (true, "monotone and rank-preserving".to_string())
    };
    if !adopted {
        warn!("Calibrator rejected: {reason}");
    }

    CalibrationReport {
        uncalibrated,
        calibrated: Some(calibrated),
        calibrator: Some(calibrator),
        adopted,
        reason,
    }
}
