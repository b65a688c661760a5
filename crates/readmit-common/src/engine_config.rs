//! Engine configuration for training and serving.
//!
//! Every field carries a serde default so a partial TOML/JSON file (or none at all)
//! yields a usable configuration. Defaults mirror the tuned readmission training run.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ReadmitError, Result};

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Training dataset layout
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Train/validation partitioning
    #[serde(default)]
    pub split: SplitConfig,

    /// Gradient-boosted tree learner
    #[serde(default)]
    pub gbm: GbmConfig,

    /// L1 logistic regression baseline
    #[serde(default)]
    pub linear: LinearConfig,

    /// Platt scaling
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Second-stage meta-learner
    #[serde(default)]
    pub stacking: StackingConfig,

    /// Risk band thresholds
    #[serde(default)]
    pub bands: BandConfig,

    /// Online serving options
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Artifact locations
    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

// ── Dataset ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Outcome column name
    #[serde(default = "default_outcome_column")]
    pub outcome_column: String,

    /// Outcome labels mapped to the positive class
    #[serde(default = "default_positive_labels")]
    pub positive_labels: Vec<String>,

    /// Outcome labels mapped to the negative class. Rows with any other label are excluded.
    #[serde(default = "default_negative_labels")]
    pub negative_labels: Vec<String>,

    /// Identifier columns, never used as features
    #[serde(default = "default_id_columns")]
    pub id_columns: Vec<String>,

    /// Leakage-prone columns dropped before training
    #[serde(default = "default_drop_columns")]
    pub drop_columns: Vec<String>,

    /// Raw tokens meaning "no value"
    #[serde(default = "default_missing_tokens")]
    pub missing_tokens: Vec<String>,

    /// Force these columns to be categorical
    #[serde(default)]
    pub categorical_columns: Vec<String>,

    /// Force these columns to be numeric
    #[serde(default)]
    pub numeric_columns: Vec<String>,
}

fn default_outcome_column() -> String { "readmitted".to_string() }
fn default_positive_labels() -> Vec<String> { vec!["<30".to_string()] }
fn default_negative_labels() -> Vec<String> { vec!["NO".to_string()] }
fn default_id_columns() -> Vec<String> {
    vec!["encounter_id".to_string(), "patient_nbr".to_string()]
}
fn default_drop_columns() -> Vec<String> { vec!["discharge_disposition_id".to_string()] }
pub fn default_missing_tokens() -> Vec<String> { vec!["?".to_string(), String::new()] }

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            outcome_column: default_outcome_column(),
            positive_labels: default_positive_labels(),
            negative_labels: default_negative_labels(),
            id_columns: default_id_columns(),
            drop_columns: default_drop_columns(),
            missing_tokens: default_missing_tokens(),
            categorical_columns: vec![],
            numeric_columns: vec![],
        }
    }
}

// ── Split ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Fraction of each class held out for validation
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
}

fn default_seed() -> u64 { 42 }
fn default_validation_fraction() -> f64 { 0.2 }

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            validation_fraction: default_validation_fraction(),
        }
    }
}

// ── Gradient boosting ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStoppingMetric {
    Auc,
    LogLoss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbmConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// L2 regularisation on leaf weights
    #[serde(default = "default_l2_leaf_reg")]
    pub l2_leaf_reg: f64,

    /// Minimum hessian sum in each child
    #[serde(default = "default_min_child_weight")]
    pub min_child_weight: f64,

    /// Minimum gain required to split
    #[serde(default)]
    pub min_split_gain: f64,

    /// Row fraction sampled per tree
    #[serde(default = "default_subsample")]
    pub subsample: f64,

    /// Feature fraction sampled per depth level
    #[serde(default = "default_colsample_bylevel")]
    pub colsample_bylevel: f64,

    /// Maximum quantile bins per numeric feature
    #[serde(default = "default_max_bins")]
    pub max_bins: usize,

    /// Stop after this many iterations without validation improvement
    #[serde(default = "default_early_stopping_rounds")]
    pub early_stopping_rounds: usize,

    #[serde(default = "default_early_stopping_metric")]
    pub early_stopping_metric: EarlyStoppingMetric,

    /// Override the negative/positive ratio used as positive-class weight
    #[serde(default)]
    pub scale_pos_weight: Option<f64>,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Log boosting progress every N iterations
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

fn default_iterations() -> usize { 2000 }
fn default_learning_rate() -> f64 { 0.03 }
fn default_max_depth() -> usize { 8 }
fn default_l2_leaf_reg() -> f64 { 6.0 }
fn default_min_child_weight() -> f64 { 1.0 }
fn default_subsample() -> f64 { 0.8 }
fn default_colsample_bylevel() -> f64 { 0.8 }
fn default_max_bins() -> usize { 128 }
fn default_early_stopping_rounds() -> usize { 50 }
fn default_early_stopping_metric() -> EarlyStoppingMetric { EarlyStoppingMetric::Auc }
fn default_log_every() -> usize { 200 }

impl Default for GbmConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            learning_rate: default_learning_rate(),
            max_depth: default_max_depth(),
            l2_leaf_reg: default_l2_leaf_reg(),
            min_child_weight: default_min_child_weight(),
            min_split_gain: 0.0,
            subsample: default_subsample(),
            colsample_bylevel: default_colsample_bylevel(),
            max_bins: default_max_bins(),
            early_stopping_rounds: default_early_stopping_rounds(),
            early_stopping_metric: default_early_stopping_metric(),
            scale_pos_weight: None,
            seed: default_seed(),
            log_every: default_log_every(),
        }
    }
}

// ── Linear baseline ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Inverse L1 regularisation strength (sklearn-style C)
    #[serde(default = "default_inverse_regularization")]
    pub inverse_regularization: f64,

    #[serde(default = "default_linear_max_iter")]
    pub max_iter: usize,

    /// Convergence tolerance on the max coefficient change
    #[serde(default = "default_linear_tolerance")]
    pub tolerance: f64,

    /// Add a 0/1 missingness column per numeric feature
    #[serde(default = "default_true")]
    pub missing_indicators: bool,
}

fn default_inverse_regularization() -> f64 { 1.0 }
fn default_linear_max_iter() -> usize { 5000 }
fn default_linear_tolerance() -> f64 { 1e-6 }
fn default_true() -> bool { true }

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            inverse_regularization: default_inverse_regularization(),
            max_iter: default_linear_max_iter(),
            tolerance: default_linear_tolerance(),
            missing_indicators: true,
        }
    }
}

// ── Calibration ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// L2 strength on the Platt slope (sklearn default C = 1)
    #[serde(default = "default_platt_l2")]
    pub l2: f64,

    /// Bins for expected calibration error
    #[serde(default = "default_ece_bins")]
    pub ece_bins: usize,
}

fn default_platt_l2() -> f64 { 1.0 }
fn default_ece_bins() -> usize { 10 }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l2: default_platt_l2(),
            ece_bins: default_ece_bins(),
        }
    }
}

// ── Stacking ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Stacked AUC may trail the best base learner by at most this much
    #[serde(default = "default_stacking_tolerance")]
    pub tolerance: f64,

    /// Folds used to cross-fit the meta-learner on validation rows
    #[serde(default = "default_cv_folds")]
    pub cv_folds: usize,

    #[serde(default = "default_platt_l2")]
    pub l2: f64,
}

fn default_stacking_tolerance() -> f64 { 0.005 }
fn default_cv_folds() -> usize { 5 }

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance: default_stacking_tolerance(),
            cv_folds: default_cv_folds(),
            l2: default_platt_l2(),
        }
    }
}

// ── Bands ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandConfig {
    /// Probabilities below this are low risk
    #[serde(default = "default_low_upper")]
    pub low_upper: f64,

    /// Probabilities at or above this are high risk
    #[serde(default = "default_high_lower")]
    pub high_lower: f64,
}

fn default_low_upper() -> f64 { 0.33 }
fn default_high_lower() -> f64 { 0.66 }

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            low_upper: default_low_upper(),
            high_lower: default_high_lower(),
        }
    }
}

// ── Inference ─────────────────────────────────────────────────────────────────

/// Which scorer produces the served probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Stacked if a stacker artifact was adopted at training time, tree otherwise
    Auto,
    /// Gradient-boosted tree, Platt-calibrated when available
    Tree,
    /// Meta-learner over tree and linear probabilities
    Stacked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_scoring_mode")]
    pub mode: ScoringMode,

    /// Upper bound on surfaced contributions; `0` surfaces every present feature
    #[serde(default = "default_max_contributions")]
    pub max_contributions: usize,

    /// Drivers handed to the summarizer
    #[serde(default = "default_summary_drivers")]
    pub summary_drivers: usize,
}

fn default_scoring_mode() -> ScoringMode { ScoringMode::Auto }
fn default_max_contributions() -> usize { 10 }
fn default_summary_drivers() -> usize { 3 }

impl InferenceConfig {
    /// `max_contributions` as a bound, `None` when unlimited.
    pub fn contribution_limit(&self) -> Option<usize> {
        (self.max_contributions > 0).then_some(self.max_contributions)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            mode: default_scoring_mode(),
            max_contributions: default_max_contributions(),
            summary_drivers: default_summary_drivers(),
        }
    }
}

// ── Artifacts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_artifact_dir")]
    pub dir: String,
}

fn default_artifact_dir() -> String { "./artifacts".to_string() }

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self { dir: default_artifact_dir() }
    }
}

// ── Helper Methods ─────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values no training run or serving process could honour.
    pub fn validate(&self) -> Result<()> {
        let fraction = self.split.validation_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ReadmitError::Config(format!(
                "split.validation_fraction must be in (0, 1), got {fraction}"
            )));
        }
        if self.dataset.positive_labels.is_empty() || self.dataset.negative_labels.is_empty() {
            return Err(ReadmitError::Config(
                "dataset needs at least one positive and one negative label".into(),
            ));
        }
        if let Some(label) = self
            .dataset
            .positive_labels
            .iter()
            .find(|l| self.dataset.negative_labels.contains(l))
        {
            return Err(ReadmitError::Config(format!(
                "outcome label {label:?} is both positive and negative"
            )));
        }

        let gbm = &self.gbm;
        if gbm.iterations == 0 || gbm.max_depth == 0 {
            return Err(ReadmitError::Config("gbm.iterations and gbm.max_depth must be > 0".into()));
        }
        if !(gbm.learning_rate > 0.0 && gbm.learning_rate <= 1.0) {
            return Err(ReadmitError::Config(format!(
                "gbm.learning_rate must be in (0, 1], got {}",
                gbm.learning_rate
            )));
        }
        for (name, value) in [("subsample", gbm.subsample), ("colsample_bylevel", gbm.colsample_bylevel)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ReadmitError::Config(format!("gbm.{name} must be in (0, 1], got {value}")));
            }
        }
        if gbm.max_bins < 2 {
            return Err(ReadmitError::Config("gbm.max_bins must be at least 2".into()));
        }
        if gbm.l2_leaf_reg < 0.0 || gbm.min_child_weight < 0.0 {
            return Err(ReadmitError::Config("gbm regularisation terms must be non-negative".into()));
        }
        if let Some(w) = gbm.scale_pos_weight {
            if !(w > 0.0 && w.is_finite()) {
                return Err(ReadmitError::Config(format!("gbm.scale_pos_weight must be positive, got {w}")));
            }
        }

        if self.linear.inverse_regularization <= 0.0 || self.linear.max_iter == 0 {
            return Err(ReadmitError::Config(
                "linear.inverse_regularization and linear.max_iter must be positive".into(),
            ));
        }
        if self.calibration.ece_bins == 0 {
            return Err(ReadmitError::Config("calibration.ece_bins must be > 0".into()));
        }
        if self.stacking.cv_folds < 2 {
            return Err(ReadmitError::Config("stacking.cv_folds must be at least 2".into()));
        }

        let bands = &self.bands;
        if !(0.0 < bands.low_upper && bands.low_upper < bands.high_lower && bands.high_lower < 1.0) {
            return Err(ReadmitError::Config(format!(
                "band thresholds must satisfy 0 < low_upper < high_lower < 1, got {} / {}",
                bands.low_upper, bands.high_lower
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.split.seed, 42);
        assert_eq!(config.gbm.iterations, 2000);
        assert_eq!(config.dataset.positive_labels, vec!["<30"]);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_src = r#"
            [gbm]
            iterations = 50
            max_depth = 3

            [bands]
            low_upper = 0.2
            high_lower = 0.5
        "#;
        let config: EngineConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.gbm.iterations, 50);
        assert_eq!(config.gbm.learning_rate, 0.03);
        assert_eq!(config.bands.low_upper, 0.2);
        assert_eq!(config.inference.mode, ScoringMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unordered_bands_rejected() {
        let mut config = EngineConfig::default();
        config.bands.low_upper = 0.7;
        config.bands.high_lower = 0.4;
        assert!(matches!(config.validate(), Err(ReadmitError::Config(_))));
    }

    #[test]
    fn test_overlapping_labels_rejected() {
        let mut config = EngineConfig::default();
        config.dataset.negative_labels.push("<30".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readmit.toml");
        let mut config = EngineConfig::default();
        config.inference.mode = ScoringMode::Tree;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = EngineConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.inference.mode, ScoringMode::Tree);
        assert_eq!(loaded.inference.max_contributions, 10);
    }

    #[test]
    fn test_unlimited_contributions_round_trip() {
        let mut config = EngineConfig::default();
        config.inference.max_contributions = 0;
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("max_contributions = 0"));

        let loaded: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(loaded.inference.max_contributions, 0);
        assert_eq!(loaded.inference.contribution_limit(), None);
        assert_eq!(EngineConfig::default().inference.contribution_limit(), Some(10));
    }
}
