use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadmitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Training error: {0}")]
    Training(String),

    /// Unreadable or structurally invalid artifact. Fatal at load time.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Artifact was produced against a different feature manifest.
    #[error("Schema drift in {artifact}: expected manifest {expected}, found {found}")]
    SchemaDrift {
        artifact: String,
        expected: String,
        found: String,
    },

    #[error("Attribution error: {0}")]
    Attribution(String),

    #[error("Summary error: {0}")]
    Summary(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReadmitError {
    /// True for the artifact-defect family: the serving process must refuse to start.
    pub fn is_artifact_defect(&self) -> bool {
        matches!(self, ReadmitError::Artifact(_) | ReadmitError::SchemaDrift { .. })
    }
}

impl From<toml::de::Error> for ReadmitError {
    fn from(e: toml::de::Error) -> Self {
        ReadmitError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for ReadmitError {
    fn from(e: toml::ser::Error) -> Self {
        ReadmitError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReadmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_drift_is_artifact_defect() {
        let err = ReadmitError::SchemaDrift {
            artifact: "gbm_model".to_string(),
            expected: "abc".to_string(),
            found: "def".to_string(),
        };
        assert!(err.is_artifact_defect());
        assert!(err.to_string().contains("gbm_model"));
        assert!(!ReadmitError::Dataset("bad".into()).is_artifact_defect());
    }
}
