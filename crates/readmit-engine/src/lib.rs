//! readmit-engine: Hospital readmission risk scoring and explanation.
//!
//! Offline, [`training::TrainingPipeline`] fits boosted trees and a sparse linear
//! baseline on one stratified split, calibrates the tree scores and optionally stacks
//! the two learners. Online, [`inference::ScoringService`] turns a raw patient record
//! into a probability, a risk band and per-feature TreeSHAP contributions.

pub mod artifacts;
pub mod attribution;
pub mod band;
pub mod calibrate;
pub mod dataset;
pub mod explain;
pub mod gbm;
pub mod inference;
pub mod linear;
pub mod logistic;
pub mod manifest;
pub mod metrics;
pub mod preprocess;
pub mod split;
pub mod stacking;
pub mod training;

pub use artifacts::{ArtifactKind, ArtifactStore, ModelBundle, RunIdentity};
pub use attribution::{AttributionEngine, Contribution, TreeShapExplainer};
pub use band::{BandPolicy, RiskBand};
pub use dataset::Dataset;
pub use explain::{Summarizer, TemplateSummarizer};
pub use gbm::GbmModel;
pub use inference::{
    Counterfactual, Evaluation, Explanation, FeatureImportance, Prediction, Scorer, ScoringService,
    ServiceHandle,
};
pub use linear::LinearModel;
pub use manifest::{FeatureKind, FeatureManifest, FeatureSpec};
pub use metrics::ScoreReport;
pub use preprocess::{FeaturePreprocessor, FeatureValue, FeatureVector, RawRecord, RawValue};
pub use training::{TrainingOutput, TrainingPipeline, TrainingReport};
