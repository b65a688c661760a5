//! Offline training run: split → base learners → calibration → stacking → report.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use readmit_common::{EngineConfig, Result, ScoringMode};

use crate::artifacts::{ArtifactEnvelope, ArtifactKind, ArtifactStore, ModelBundle, RunIdentity};
use crate::band::BandPolicy;
use crate::calibrate::{fit_calibrator, CalibrationReport};
use crate::dataset::Dataset;
use crate::gbm::GbmTrainer;
use crate::inference::FeatureImportance;
use crate::linear::LinearModel;
use crate::logistic::sigmoid;
use crate::metrics::{band_outcomes, BandOutcome, ScoreReport};
use crate::preprocess::FeaturePreprocessor;
use crate::split::{SplitProvider, TrainValSplit};
use crate::stacking::{fit_stacker, StackingReport};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbmSummary {
    pub best_iteration: usize,
    pub iterations_run: usize,
    pub n_trees: usize,
    pub stopped_early: bool,
    pub scale_pos_weight: f64,
    pub validation: ScoreReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSummary {
    pub encoded_columns: usize,
    pub nonzero_coefficients: usize,
    pub top_coefficients: Vec<(String, f64)>,
    pub validation: ScoreReport,
}

/// Everything measured during one run. Persisted as `training_report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub identity: RunIdentity,
    pub n_rows: usize,
    pub excluded_rows: usize,
    pub n_features: usize,
    pub n_train: usize,
    pub n_validation: usize,
    pub train_positive_rate: f64,
    pub validation_positive_rate: f64,
    pub gbm: GbmSummary,
    pub linear: LinearSummary,
    pub calibration: CalibrationReport,
    pub stacking: StackingReport,
    /// Scorer that `auto` serving mode resolves to for this run.
    pub served_mode: ScoringMode,
    pub served: ScoreReport,
    pub bands: Vec<BandOutcome>,
    pub global_importance: Vec<FeatureImportance>,
}

#[derive(Debug, Clone)]
pub struct TrainingOutput {
    pub bundle: ModelBundle,
    pub split: TrainValSplit,
    pub report: TrainingReport,
}

pub struct TrainingPipeline {
    config: EngineConfig,
}

impl TrainingPipeline {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Train every component on one shared split.
    pub fn run(&self, dataset: &Dataset) -> Result<TrainingOutput> {
        let cfg = &self.config;
        cfg.validate()?;
        dataset.ensure_both_classes()?;

        let manifest = Arc::clone(dataset.manifest());
        let identity = RunIdentity::new(&manifest);
        info!(
            run_id = %identity.run_id,
            rows = dataset.len(),
            excluded = dataset.excluded_rows(),
            features = manifest.len(),
            positives = dataset.positive_count(),
            "training run started"
        );

        let preprocessor = FeaturePreprocessor::with_missing_tokens(Arc::clone(&manifest), cfg.dataset.missing_tokens.clone());
        let vectors = dataset.feature_vectors(&preprocessor);
        let labels = dataset.labels();

        let provider = SplitProvider::new(cfg.split.seed, cfg.split.validation_fraction)?;
        let split = provider.split(labels)?;
        let (train_x, valid_x) = (split.select_train(&vectors), split.select_validation(&vectors));
        let (train_y, valid_y) = (split.train_labels(labels), split.validation_labels(labels));
        let rate = |y: &[u8]| y.iter().filter(|&&v| v == 1).count() as f64 / y.len().max(1) as f64;
        info!(
            train = train_y.len(),
            validation = valid_y.len(),
            train_positive_rate = rate(&train_y),
            validation_positive_rate = rate(&valid_y),
            "stratified split"
        );

        // Base learner 1: boosted trees
        let outcome = GbmTrainer::new(cfg.gbm.clone()).train(&manifest, &train_x, &train_y, &valid_x, &valid_y)?;
        let gbm = outcome.model;
        let raw_valid = gbm.predict_raw_batch(&valid_x);
        let p_gbm: Vec<f64> = raw_valid.iter().map(|&r| sigmoid(r)).collect();
        let gbm_summary = GbmSummary {
            best_iteration: outcome.best_iteration,
            iterations_run: outcome.iterations_run,
            n_trees: gbm.n_trees(),
            stopped_early: outcome.stopped_early,
            scale_pos_weight: outcome.scale_pos_weight,
            validation: ScoreReport::compute(&valid_y, &p_gbm, cfg.calibration.ece_bins),
        };
        info!(
            auc = gbm_summary.validation.auc,
            trees = gbm_summary.n_trees,
            best_iteration = gbm_summary.best_iteration,
            "gradient-boosted trees trained"
        );

        // Base learner 2: linear baseline
        let linear = LinearModel::fit(&manifest, &train_x, &train_y, &cfg.linear)?;
        let p_linear: Vec<f64> = valid_x.iter().map(|x| linear.predict_proba(x)).collect();
        let coefficients = linear.nonzero_coefficients();
        let linear_summary = LinearSummary {
            encoded_columns: linear.encoder().width(),
            nonzero_coefficients: coefficients.len(),
            top_coefficients: coefficients.into_iter().take(15).collect(),
            validation: ScoreReport::compute(&valid_y, &p_linear, cfg.calibration.ece_bins),
        };
        info!(auc = linear_summary.validation.auc, nonzero = linear_summary.nonzero_coefficients, "linear baseline trained");

        let calibration = fit_calibrator(&raw_valid, &valid_y, &cfg.calibration);
        let calibrator = if calibration.adopted { calibration.calibrator } else { None };

        let stacking = match provider.stratified_folds(&valid_y, cfg.stacking.cv_folds) {
            Ok(folds) => fit_stacker(&p_gbm, &p_linear, &valid_y, &folds, &cfg.stacking),
            Err(e) => {
                warn!("Skipping stacking cross-fit: {e}");
                StackingReport::skipped(&p_gbm, &p_linear, &valid_y, format!("cross-fit folds unavailable: {e}"))
            }
        };
        let stacker = if stacking.adopted { stacking.stacker.clone() } else { None };

        let served_mode = if stacker.is_some() { ScoringMode::Stacked } else { ScoringMode::Tree };
        let served_probs: Vec<f64> = match (&stacker, &calibrator) {
            (Some(s), _) => p_gbm.iter().zip(&p_linear).map(|(&a, &b)| s.predict(a, b)).collect(),
            (None, Some(c)) => raw_valid.iter().map(|&r| c.apply(r)).collect(),
            (None, None) => p_gbm.clone(),
        };
        let served = ScoreReport::compute(&valid_y, &served_probs, cfg.calibration.ece_bins);
        let policy = BandPolicy::from_config(&cfg.bands)?;
        let bands = band_outcomes(&valid_y, &served_probs, &policy);
        for b in &bands {
            info!(band = b.band.as_str(), count = b.count, observed_rate = b.observed_rate, "validation band");
        }

        let global_importance = FeatureImportance::ranked(&manifest, &gbm);
        let report = TrainingReport {
            identity: identity.clone(),
            n_rows: dataset.len(),
            excluded_rows: dataset.excluded_rows(),
            n_features: manifest.len(),
            n_train: train_y.len(),
            n_validation: valid_y.len(),
            train_positive_rate: rate(&train_y),
            validation_positive_rate: rate(&valid_y),
            gbm: gbm_summary,
            linear: linear_summary,
            calibration,
            stacking,
            served_mode,
            served,
            bands,
            global_importance,
        };
        info!(
            mode = ?report.served_mode,
            auc = report.served.auc,
            brier = report.served.brier,
            ece = report.served.ece,
            "training run finished"
        );

        let bundle = ModelBundle {
            identity,
            manifest: manifest.as_ref().clone(),
            missing_tokens: preprocessor.missing_tokens().to_vec(),
            gbm,
            linear,
            calibrator,
            stacker,
        };
        Ok(TrainingOutput { bundle, split, report })
    }

    /// Train and persist every artifact into `store`.
    pub fn run_and_save(&self, dataset: &Dataset, store: &ArtifactStore) -> Result<TrainingOutput> {
        let output = self.run(dataset)?;
        let id = &output.bundle.identity;
        store.save_split(id, &output.split)?;
        store.write(&ArtifactEnvelope::new(ArtifactKind::TrainingReport, id, &output.report))?;
        store.save_bundle(&output.bundle)?;
        Ok(output)
    }
}
