//! Online scoring.
//!
//! [`ScoringService`] is an immutable composition of the loaded artifacts. Each request
//! runs `received → preprocessed → scored → calibrated → attributed → banded →
//! returned`; only artifact loading can fail; per-request calibration and
//! attribution problems degrade to documented fallbacks. [`ServiceHandle`] swaps in a
//! freshly loaded service without touching the one in use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use readmit_common::{EngineConfig, ReadmitError, Result, ScoringMode};

use crate::artifacts::{ArtifactStore, ModelBundle};
use crate::attribution::{rank_contributions, AttributionEngine, Contribution, TreeShapExplainer};
use crate::band::{BandPolicy, RiskBand};
use crate::calibrate::PlattCalibrator;
use crate::dataset::Dataset;
use crate::explain::{Summarizer, TemplateSummarizer};
use crate::gbm::GbmModel;
use crate::linear::LinearModel;
use crate::logistic::sigmoid;
use crate::manifest::FeatureManifest;
use crate::metrics::{band_outcomes, BandOutcome, ScoreReport};
use crate::preprocess::{FeaturePreprocessor, FeatureVector, RawRecord, RawValue};
use crate::stacking::StackingMetaLearner;

/// Per-request lifecycle, logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Preprocessed,
    Scored,
    Calibrated,
    Attributed,
    Banded,
    Returned,
}

/// Which scorer produced the served probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scorer {
    Tree,
    CalibratedTree,
    Stacked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub probability: f64,
    pub band: RiskBand,
    /// Present features only, ranked by absolute value. Empty when attribution failed.
    pub contributions: Vec<Contribution>,
    pub scorer: Scorer,
    /// Tree log-odds before calibration.
    pub raw_score: f64,
    /// Attribution baseline; absent when attribution failed.
    pub expected_value: Option<f64>,
}

impl Prediction {
    pub fn contribution_map(&self) -> BTreeMap<String, f64> {
        self.contributions.iter().map(|c| (c.feature.clone(), c.value)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

impl FeatureImportance {
    /// Gain-based importance, highest first; ties keep manifest order.
    pub fn ranked(manifest: &FeatureManifest, model: &GbmModel) -> Vec<Self> {
        let mut ranked: Vec<Self> = manifest
            .names()
            .zip(model.feature_importance())
            .map(|(name, importance)| Self { feature: name.to_string(), importance })
            .collect();
        ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        ranked
    }
}

/// One field changed, everything else held fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterfactual {
    pub field: String,
    pub original: Option<RawValue>,
    pub replacement: RawValue,
    pub before: Prediction,
    pub after: Prediction,
    pub delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    Summarizer,
    TemplateFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub prediction: Prediction,
    pub summary: String,
    pub source: SummarySource,
}

pub struct ScoringService {
    run_id: Uuid,
    manifest: Arc<FeatureManifest>,
    preprocessor: FeaturePreprocessor,
    gbm: GbmModel,
    linear: LinearModel,
    calibrator: Option<PlattCalibrator>,
    stacker: Option<StackingMetaLearner>,
    mode: ScoringMode,
    policy: BandPolicy,
    max_contributions: Option<usize>,
    summary_drivers: usize,
    attribution: Arc<dyn AttributionEngine>,
}

impl std::fmt::Debug for ScoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringService")
            .field("run_id", &self.run_id)
            .field("features", &self.manifest.len())
            .field("trees", &self.gbm.n_trees())
            .field("calibrated", &self.calibrator.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}

impl ScoringService {
    /// Load and verify every artifact in `store`. Any artifact defect is returned here.
    pub fn load(store: &ArtifactStore, config: &EngineConfig) -> Result<Self> {
        let bundle = store.load_bundle()?;
        Self::from_bundle(bundle, config)
    }

    pub fn from_bundle(bundle: ModelBundle, config: &EngineConfig) -> Result<Self> {
        bundle.validate()?;
        let policy = BandPolicy::from_config(&config.bands)?;
        let mode = match (config.inference.mode, bundle.stacker.is_some()) {
            (ScoringMode::Auto, true) | (ScoringMode::Stacked, true) => ScoringMode::Stacked,
            (ScoringMode::Stacked, false) => {
                warn!("stacked scoring requested but no stacker artifact is available; using the tree model");
                ScoringMode::Tree
            }
            _ => ScoringMode::Tree,
        };
        if mode == ScoringMode::Tree && bundle.calibrator.is_none() {
            warn!("no calibrator available; serving uncalibrated tree probabilities");
        }

        let manifest = Arc::new(bundle.manifest);
        let preprocessor = FeaturePreprocessor::with_missing_tokens(Arc::clone(&manifest), bundle.missing_tokens);
        Ok(Self {
            run_id: bundle.identity.run_id,
            manifest,
            preprocessor,
            gbm: bundle.gbm,
            linear: bundle.linear,
            calibrator: bundle.calibrator,
            stacker: bundle.stacker,
            mode,
            policy,
            max_contributions: config.inference.contribution_limit(),
            summary_drivers: config.inference.summary_drivers,
            attribution: Arc::new(TreeShapExplainer),
        })
    }

    /// Replace the attribution engine.
    pub fn with_attribution_engine(mut self, engine: Arc<dyn AttributionEngine>) -> Self {
        self.attribution = engine;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn manifest(&self) -> &Arc<FeatureManifest> {
        &self.manifest
    }

    pub fn preprocessor(&self) -> &FeaturePreprocessor {
        &self.preprocessor
    }

    /// Resolved scoring mode, never `Auto`.
    pub fn mode(&self) -> ScoringMode {
        self.mode
    }

    pub fn has_calibrator(&self) -> bool {
        self.calibrator.is_some()
    }

    pub fn band_policy(&self) -> &BandPolicy {
        &self.policy
    }

    pub fn predict(&self, record: &RawRecord) -> Prediction {
        debug!(stage = ?Stage::Received, fields = record.len());
        let x = self.preprocessor.transform(record);
        debug!(stage = ?Stage::Preprocessed, present = x.present_count());
        self.predict_vector(&x)
    }

    /// Score an already preprocessed vector. Contributions are limited to slots that
    /// are present in `x`.
    pub fn predict_vector(&self, x: &FeatureVector) -> Prediction {
        let raw_score = self.gbm.predict_raw(x);
        debug!(stage = ?Stage::Scored, raw_score);

        let (probability, scorer) = self.serve(raw_score, x);
        debug!(stage = ?Stage::Calibrated, probability, scorer = ?scorer);

        let (contributions, expected_value) = match self.attribution.attribute(&self.gbm, x) {
            Ok(attribution) => (
                rank_contributions(&self.manifest, x, &attribution, self.max_contributions),
                Some(attribution.expected_value),
            ),
            Err(e) => {
                warn!("attribution failed, returning no contributions: {e}");
                (Vec::new(), None)
            }
        };
        debug!(stage = ?Stage::Attributed, contributions = contributions.len());

        let band = self.policy.classify(probability);
        debug!(stage = ?Stage::Banded, band = band.as_str());

        let prediction = Prediction { probability, band, contributions, scorer, raw_score, expected_value };
        debug!(stage = ?Stage::Returned);
        prediction
    }

    fn serve(&self, raw_score: f64, x: &FeatureVector) -> (f64, Scorer) {
        let (probability, scorer) = match (&self.stacker, self.mode) {
            (Some(stacker), ScoringMode::Stacked) => {
                let p_linear = self.linear.predict_proba(x);
                (stacker.predict(sigmoid(raw_score), p_linear), Scorer::Stacked)
            }
            _ => match &self.calibrator {
                Some(c) => (c.apply(raw_score), Scorer::CalibratedTree),
                None => (sigmoid(raw_score), Scorer::Tree),
            },
        };
        if probability.is_finite() {
            (probability.clamp(0.0, 1.0), scorer)
        } else {
            warn!("{scorer:?} produced a non-finite probability; using the uncalibrated tree score");
            (sigmoid(raw_score), Scorer::Tree)
        }
    }

    /// Served probability without attribution.
    pub fn predict_probability(&self, x: &FeatureVector) -> f64 {
        self.serve(self.gbm.predict_raw(x), x).0
    }

    pub fn predict_batch(&self, records: &[RawRecord]) -> Vec<Prediction> {
        records.iter().map(|r| self.predict(r)).collect()
    }

    /// Rescore with one field replaced. Fails only when `field` is not a model feature.
    pub fn counterfactual(&self, record: &RawRecord, field: &str, replacement: RawValue) -> Result<Counterfactual> {
        if self.manifest.index_of(field).is_none() {
            return Err(ReadmitError::Dataset(format!("{field:?} is not a model feature")));
        }
        let before = self.predict(record);
        let mut modified = record.clone();
        modified.insert(field, replacement.clone());
        let after = self.predict(&modified);
        Ok(Counterfactual {
            field: field.to_string(),
            original: record.get(field).cloned(),
            replacement,
            delta: after.probability - before.probability,
            before,
            after,
        })
    }

    pub fn global_importance(&self) -> Vec<FeatureImportance> {
        FeatureImportance::ranked(&self.manifest, &self.gbm)
    }

    /// Score and summarise. A failing summarizer is replaced by the template text.
    pub fn explain(&self, record: &RawRecord, summarizer: &dyn Summarizer) -> Explanation {
        let prediction = self.predict(record);
        let drivers = &prediction.contributions[..prediction.contributions.len().min(self.summary_drivers)];
        match summarizer.summarize(prediction.probability, prediction.band, drivers) {
            Ok(summary) => Explanation { prediction, summary, source: SummarySource::Summarizer },
            Err(e) => {
                warn!("summarizer failed, using template: {e}");
                let template = TemplateSummarizer::new(self.summary_drivers);
                let summary = format!(
                    "Readmission risk is {} (score {:.2}).\nTop factors:\n{}\n(Automated explanation unavailable: {e}.)",
                    prediction.band,
                    prediction.probability,
                    template.driver_block(drivers)
                );
                Explanation { prediction, summary, source: SummarySource::TemplateFallback }
            }
        }
    }
}

/// Served-probability quality on a labelled dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub run_id: Uuid,
    pub mode: ScoringMode,
    pub n_rows: usize,
    pub report: ScoreReport,
    pub bands: Vec<BandOutcome>,
}

impl ScoringService {
    /// Score every record of `dataset` with the served scorer and compare to its labels.
    pub fn evaluate(&self, dataset: &Dataset, ece_bins: usize) -> Result<Evaluation> {
        dataset.ensure_both_classes()?;
        let probs: Vec<f64> = dataset
            .records()
            .iter()
            .map(|r| self.predict_probability(&self.preprocessor.transform(r)))
            .collect();
        let report = ScoreReport::compute(dataset.labels(), &probs, ece_bins);
        let bands = band_outcomes(dataset.labels(), &probs, &self.policy);
        info!(rows = dataset.len(), auc = report.auc, brier = report.brier, ece = report.ece, "evaluation finished");
        Ok(Evaluation { run_id: self.run_id, mode: self.mode, n_rows: dataset.len(), report, bands })
    }
}

/// Shared, swappable reference to the current service.
#[derive(Debug)]
pub struct ServiceHandle {
    current: RwLock<Arc<ScoringService>>,
}

impl ServiceHandle {
    pub fn new(service: ScoringService) -> Self {
        Self { current: RwLock::new(Arc::new(service)) }
    }

    /// The service to use for one request. Callers keep it for the whole request.
    pub fn get(&self) -> Arc<ScoringService> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install a new service and return the previous one. In-flight requests keep
    /// scoring with the `Arc` they already hold.
    pub fn swap(&self, service: ScoringService) -> Arc<ScoringService> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(service))
    }

    /// Load a fresh service from `store` and swap it in; the current one stays if loading fails.
    pub fn reload(&self, store: &ArtifactStore, config: &EngineConfig) -> Result<Arc<ScoringService>> {
        let service = ScoringService::load(store, config)?;
        Ok(self.swap(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::RunIdentity;
    use crate::gbm::tree::tests::sample_tree;
    use crate::manifest::FeatureKind;
    use crate::preprocess::FeatureValue;
    use readmit_common::{LinearConfig, ReadmitError};

    fn bundle() -> ModelBundle {
        let manifest =
            FeatureManifest::from_pairs([("age", FeatureKind::Numeric), ("race", FeatureKind::Categorical)]).unwrap();
        let rows: Vec<FeatureVector> = (0..20)
            .map(|i| {
                let race = if i % 2 == 0 { "A" } else { "B" };
                FeatureVector::from_values(vec![
                    FeatureValue::Numeric(30.0 + 3.0 * i as f64),
                    FeatureValue::Category(race.into()),
                ])
            })
            .collect();
        let labels: Vec<u8> = (0..20).map(|i| u8::from(i >= 10)).collect();
        let linear = LinearModel::fit(&manifest, &rows, &labels, &LinearConfig::default()).unwrap();
        ModelBundle {
            identity: RunIdentity::new(&manifest),
            gbm: GbmModel::new(2, 0.0, 1.0, 1.0, vec![sample_tree()]),
            manifest,
            missing_tokens: readmit_common::engine_config::default_missing_tokens(),
            linear,
            calibrator: None,
            stacker: None,
        }
    }

    fn service() -> ScoringService {
        ScoringService::from_bundle(bundle(), &EngineConfig::default()).unwrap()
    }

    struct FailingAttribution;

    impl AttributionEngine for FailingAttribution {
        fn attribute(&self, _: &GbmModel, _: &FeatureVector) -> Result<crate::attribution::Attribution> {
            Err(ReadmitError::Attribution("boom".into()))
        }
    }

    struct FailingSummarizer;

    impl Summarizer for FailingSummarizer {
        fn summarize(&self, _: f64, _: RiskBand, _: &[Contribution]) -> Result<String> {
            Err(ReadmitError::Summary("service unavailable".into()))
        }
    }

    #[test]
    fn test_tree_mode_without_calibrator() {
        let svc = service();
        assert_eq!(svc.mode(), ScoringMode::Tree);
        let p = svc.predict(&RawRecord::new().with("age", 50.0).with("race", "A"));
        assert_eq!(p.scorer, Scorer::Tree);
        assert!((p.raw_score - 1.0).abs() < 1e-12);
        assert!((p.probability - sigmoid(1.0)).abs() < 1e-12);
        assert_eq!(p.band, RiskBand::High);
    }

    #[test]
    fn test_absent_features_have_no_contribution() {
        let svc = service();
        let p = svc.predict(&RawRecord::new().with("age", 70.0));
        // race is missing and dropped even though its Shapley value is non-zero
        assert_eq!(p.contributions.len(), 1);
        assert_eq!(p.contributions[0].feature, "age");
        assert!((p.contributions[0].value - 1.6).abs() < 1e-9);
        assert_eq!(p.contributions[0].observed.as_deref(), Some("70"));
        assert!((p.expected_value.unwrap() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_calibrator_applied_in_tree_mode() {
        let mut b = bundle();
        b.calibrator = Some(PlattCalibrator { slope: 0.5, intercept: -0.25 });
        let svc = ScoringService::from_bundle(b, &EngineConfig::default()).unwrap();
        let p = svc.predict(&RawRecord::new().with("age", 50.0).with("race", "A"));
        assert_eq!(p.scorer, Scorer::CalibratedTree);
        assert!((p.probability - sigmoid(0.25)).abs() < 1e-12);
        assert_eq!(p.band, RiskBand::Medium);
    }

    #[test]
    fn test_stacked_mode_falls_back_without_stacker() {
        let mut config = EngineConfig::default();
        config.inference.mode = ScoringMode::Stacked;
        let svc = ScoringService::from_bundle(bundle(), &config).unwrap();
        assert_eq!(svc.mode(), ScoringMode::Tree);

        let mut b = bundle();
        b.stacker = Some(StackingMetaLearner { weights: [2.0, 1.0], intercept: -1.0 });
        let svc = ScoringService::from_bundle(b, &EngineConfig::default()).unwrap();
        assert_eq!(svc.mode(), ScoringMode::Stacked);
        let p = svc.predict(&RawRecord::new().with("age", 75.0).with("race", "B"));
        assert_eq!(p.scorer, Scorer::Stacked);
    }

    #[test]
    fn test_attribution_failure_still_scores() {
        let svc = service().with_attribution_engine(Arc::new(FailingAttribution));
        let record = RawRecord::new().with("age", 50.0).with("race", "B");
        let p = svc.predict(&record);
        assert!(p.contributions.is_empty());
        assert!(p.expected_value.is_none());
        assert!((p.probability - service().predict(&record).probability).abs() < 1e-15);
    }

    #[test]
    fn test_counterfactual() {
        let svc = service();
        let record = RawRecord::new().with("age", 70.0).with("race", "A");
        let cf = svc.counterfactual(&record, "age", RawValue::Number(50.0)).unwrap();
        assert_eq!(cf.original, Some(RawValue::Number(70.0)));
        assert!((cf.before.raw_score - 2.0).abs() < 1e-12);
        assert!((cf.after.raw_score - 1.0).abs() < 1e-12);
        assert!(cf.delta < 0.0);

        let err = svc.counterfactual(&record, "weight", RawValue::from("[75-100)")).unwrap_err();
        assert!(matches!(err, ReadmitError::Dataset(_)));
    }

    #[test]
    fn test_summarizer_failure_uses_template() {
        let svc = service();
        let record = RawRecord::new().with("age", 70.0).with("race", "A");
        let ok = svc.explain(&record, &TemplateSummarizer::default());
        assert_eq!(ok.source, SummarySource::Summarizer);

        let fallback = svc.explain(&record, &FailingSummarizer);
        assert_eq!(fallback.source, SummarySource::TemplateFallback);
        assert!(fallback.summary.starts_with("Readmission risk is high"));
        assert!(fallback.summary.contains("age 70"));
        assert!(fallback.summary.contains("service unavailable"));
    }

    #[test]
    fn test_global_importance_ranked() {
        let ranked = service().global_importance();
        assert_eq!(ranked[0].feature, "age");
        assert!((ranked[0].importance - 75.0).abs() < 1e-9);
        assert!((ranked.iter().map(|f| f.importance).sum::<f64>() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_handle_swap_keeps_in_flight_service() {
        let handle = ServiceHandle::new(service());
        let in_flight = handle.get();
        let replacement = service();
        let new_id = replacement.run_id();
        let previous = handle.swap(replacement);
        assert_eq!(previous.run_id(), in_flight.run_id());
        assert_eq!(handle.get().run_id(), new_id);
        // the old service still scores
        let p = in_flight.predict(&RawRecord::new().with("age", 20.0));
        assert!(p.probability > 0.0 && p.probability < 1.0);
    }
}
