//! Historical training table loader.
//!
//! Reads a CSV with a header row, drops identifier and leakage columns, maps the outcome
//! column to a binary label (rows with any other label are excluded) and infers the
//! feature manifest.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use readmit_common::{DatasetConfig, ReadmitError, Result};

use crate::manifest::{FeatureKind, FeatureManifest, FeatureSpec};
use crate::preprocess::{parse_numeric_text, FeaturePreprocessor, FeatureVector, RawRecord, MISSING_CATEGORY};

/// Labelled rows ready for preprocessing.
#[derive(Debug, Clone)]
pub struct Dataset {
    manifest: Arc<FeatureManifest>,
    records: Vec<RawRecord>,
    labels: Vec<u8>,
    excluded_rows: usize,
}

impl Dataset {
    /// Assemble a dataset from already-labelled records.
    pub fn new(manifest: Arc<FeatureManifest>, records: Vec<RawRecord>, labels: Vec<u8>) -> Result<Self> {
        if records.len() != labels.len() {
            return Err(ReadmitError::Dataset(format!(
                "{} records but {} labels",
                records.len(),
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| l > 1) {
            return Err(ReadmitError::Dataset(format!("label {bad} is not binary")));
        }
        Ok(Self { manifest, records, labels, excluded_rows: 0 })
    }

    pub fn from_csv_path(path: impl AsRef<Path>, config: &DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| ReadmitError::Dataset(format!("cannot open {}: {e}", path.display())))?;
        info!("Loading training data from {}", path.display());
        Self::from_csv_reader(file, config)
    }

    pub fn from_csv_reader<R: Read>(reader: R, config: &DatasetConfig) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers: Vec<String> = csv_reader
            .headers()
            .map_err(|e| ReadmitError::Dataset(format!("cannot read header: {e}")))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let outcome_idx = headers
            .iter()
            .position(|h| h == &config.outcome_column)
            .ok_or_else(|| ReadmitError::Dataset(format!("outcome column {:?} not found", config.outcome_column)))?;

        let skipped: HashSet<&str> = config
            .id_columns
            .iter()
            .chain(config.drop_columns.iter())
            .map(String::as_str)
            .collect();
        let feature_cols: Vec<usize> = (0..headers.len())
            .filter(|&i| i != outcome_idx && !skipped.contains(headers[i].as_str()))
            .collect();
        if feature_cols.is_empty() {
            return Err(ReadmitError::Dataset("no feature columns left after exclusions".into()));
        }

        let mut records = Vec::new();
        let mut labels = Vec::new();
        let mut excluded_rows = 0usize;
        for (row_no, row) in csv_reader.records().enumerate() {
            let row = row.map_err(|e| ReadmitError::Dataset(format!("row {}: {e}", row_no + 1)))?;
            let outcome = row.get(outcome_idx).unwrap_or("").trim();
            let label = if config.positive_labels.iter().any(|l| l == outcome) {
                1
            } else if config.negative_labels.iter().any(|l| l == outcome) {
                0
            } else {
                excluded_rows += 1;
                continue;
            };
            let record: RawRecord = feature_cols
                .iter()
                .map(|&i| (headers[i].clone(), row.get(i).unwrap_or("").to_string()))
                .collect();
            records.push(record);
            labels.push(label);
        }

        let manifest = infer_manifest(&headers, &feature_cols, &records, config)?;
        info!(
            "Loaded {} rows ({} excluded by outcome label), {} features",
            records.len(),
            excluded_rows,
            manifest.len()
        );

        let dataset = Self { manifest: Arc::new(manifest), records, labels, excluded_rows };
        dataset.ensure_both_classes()?;
        Ok(dataset)
    }

    pub fn manifest(&self) -> &Arc<FeatureManifest> {
        &self.manifest
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn excluded_rows(&self) -> usize {
        self.excluded_rows
    }

    pub fn positive_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    pub fn ensure_both_classes(&self) -> Result<()> {
        let pos = self.positive_count();
        if pos == 0 || pos == self.len() {
            return Err(ReadmitError::InsufficientData(format!(
                "need both outcome classes, got {pos} positive of {} rows",
                self.len()
            )));
        }
        Ok(())
    }

    /// Preprocess every row with the shared preprocessor.
    pub fn feature_vectors(&self, preprocessor: &FeaturePreprocessor) -> Vec<FeatureVector> {
        self.records.iter().map(|r| preprocessor.transform(r)).collect()
    }
}

/// Numeric when every non-missing value parses (numbers or interval buckets),
/// categorical otherwise. Explicit overrides in the config win.
fn infer_manifest(
    headers: &[String],
    feature_cols: &[usize],
    records: &[RawRecord],
    config: &DatasetConfig,
) -> Result<FeatureManifest> {
    let is_missing = |s: &str| s == MISSING_CATEGORY || config.missing_tokens.iter().any(|t| t.trim() == s);

    let specs = feature_cols
        .iter()
        .map(|&i| {
            let name = headers[i].clone();
            let kind = if config.categorical_columns.contains(&name) {
                FeatureKind::Categorical
            } else if config.numeric_columns.contains(&name) {
                FeatureKind::Numeric
            } else {
                let mut seen_value = false;
                let all_numeric = records.iter().all(|r| match r.get(&name) {
                    Some(crate::preprocess::RawValue::Text(s)) => {
                        let s = s.trim();
                        if is_missing(s) {
                            true
                        } else {
                            seen_value = true;
                            parse_numeric_text(s).is_some()
                        }
                    }
                    _ => true,
                });
                if all_numeric && seen_value {
                    FeatureKind::Numeric
                } else {
                    FeatureKind::Categorical
                }
            };
            debug!("Feature {name}: {}", kind.as_str());
            FeatureSpec { name, kind }
        })
        .collect();
    FeatureManifest::new(specs)
}
