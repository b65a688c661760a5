//! readmit-common: Shared error taxonomy and engine configuration used across all Readmit crates.

pub mod error;
pub mod engine_config;

// Re-export commonly used types
pub use engine_config::{
    ArtifactConfig, BandConfig, CalibrationConfig, DatasetConfig, EarlyStoppingMetric,
    EngineConfig, GbmConfig, InferenceConfig, LinearConfig, ScoringMode, SplitConfig,
    StackingConfig,
};
pub use error::{ReadmitError, Result};
