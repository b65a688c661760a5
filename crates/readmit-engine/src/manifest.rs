//! Ordered feature schema shared by every trained artifact.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use readmit_common::{ReadmitError, Result};

/// How a feature slot is represented in a [`crate::preprocess::FeatureVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Categorical,
    Numeric,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Categorical => "categorical",
            FeatureKind::Numeric => "numeric",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub kind: FeatureKind,
}

/// Immutable, ordered list of features. Slot order here is the slot order of every
/// feature vector at training and at inference time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureManifest {
    features: Vec<FeatureSpec>,
}

impl FeatureManifest {
    /// Build a manifest, rejecting empty or duplicated feature names.
    pub fn new(features: Vec<FeatureSpec>) -> Result<Self> {
        if features.is_empty() {
            return Err(ReadmitError::Dataset("manifest has no features".into()));
        }
        let mut seen = HashMap::with_capacity(features.len());
        for (i, f) in features.iter().enumerate() {
            if f.name.trim().is_empty() {
                return Err(ReadmitError::Dataset(format!("feature {i} has an empty name")));
            }
            if let Some(prev) = seen.insert(f.name.as_str(), i) {
                return Err(ReadmitError::Dataset(format!(
                    "feature {:?} appears at slots {prev} and {i}",
                    f.name
                )));
            }
        }
        Ok(Self { features })
    }

    /// Convenience constructor from `(name, kind)` pairs.
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, FeatureKind)>) -> Result<Self> {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, kind)| FeatureSpec { name: name.into(), kind })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn get(&self, index: usize) -> Option<&FeatureSpec> {
        self.features.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.name.as_str())
    }

    pub fn categorical_indices(&self) -> Vec<usize> {
        self.indices_of_kind(FeatureKind::Categorical)
    }

    pub fn numeric_indices(&self) -> Vec<usize> {
        self.indices_of_kind(FeatureKind::Numeric)
    }

    fn indices_of_kind(&self, kind: FeatureKind) -> Vec<usize> {
        self.features
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind == kind)
            .map(|(i, _)| i)
            .collect()
    }

    /// SHA-256 over the ordered `name:kind` lines. Any rename, reorder or kind change
    /// produces a different fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}\n", self.features.len()).as_bytes());
        for f in &self.features {
            hasher.update(f.name.as_bytes());
            hasher.update(b":");
            hasher.update(f.kind.as_str().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}
