//! Versioned, fingerprinted artifact files.
//!
//! Every file is a JSON [`ArtifactEnvelope`] tagged with the training run id and the
//! manifest fingerprint. Writes go to a temp file in the target directory and are
//! renamed into place, so readers never observe a partial file. Required artifacts
//! that fail verification are fatal; optional ones (calibrator, stacker) degrade to
//! absent with a warning.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use readmit_common::{ReadmitError, Result};

use crate::calibrate::PlattCalibrator;
use crate::gbm::GbmModel;
use crate::linear::LinearModel;
use crate::manifest::FeatureManifest;
use crate::split::TrainValSplit;
use crate::stacking::StackingMetaLearner;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Manifest,
    GbmModel,
    LinearModel,
    Calibrator,
    Stacker,
    Split,
    TrainingReport,
}

impl ArtifactKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Manifest => "manifest.json",
            ArtifactKind::GbmModel => "gbm_model.json",
            ArtifactKind::LinearModel => "linear_model.json",
            ArtifactKind::Calibrator => "calibrator.json",
            ArtifactKind::Stacker => "stacker.json",
            ArtifactKind::Split => "split.json",
            ArtifactKind::TrainingReport => "training_report.json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Manifest => "manifest",
            ArtifactKind::GbmModel => "gbm_model",
            ArtifactKind::LinearModel => "linear_model",
            ArtifactKind::Calibrator => "calibrator",
            ArtifactKind::Stacker => "stacker",
            ArtifactKind::Split => "split",
            ArtifactKind::TrainingReport => "training_report",
        }
    }
}

/// Identity shared by every artifact of one training run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub manifest_fingerprint: String,
}

impl RunIdentity {
    pub fn new(manifest: &FeatureManifest) -> Self {
        Self { run_id: Uuid::new_v4(), created_at: Utc::now(), manifest_fingerprint: manifest.fingerprint() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEnvelope<T> {
    pub kind: ArtifactKind,
    pub format_version: u32,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub manifest_fingerprint: String,
    pub payload: T,
}

impl<T> ArtifactEnvelope<T> {
    pub fn new(kind: ArtifactKind, identity: &RunIdentity, payload: T) -> Self {
        Self {
            kind,
            format_version: FORMAT_VERSION,
            run_id: identity.run_id,
            created_at: identity.created_at,
            manifest_fingerprint: identity.manifest_fingerprint.clone(),
            payload,
        }
    }

    /// Check this envelope belongs to `identity`'s run and manifest.
    pub fn verify(&self, expected_kind: ArtifactKind, identity: &RunIdentity) -> Result<()> {
        if self.kind != expected_kind {
            return Err(ReadmitError::Artifact(format!(
                "{} holds a {} artifact",
                expected_kind.file_name(),
                self.kind.as_str()
            )));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(ReadmitError::Artifact(format!(
                "{} has format version {}, expected {FORMAT_VERSION}",
                expected_kind.file_name(),
                self.format_version
            )));
        }
        if self.manifest_fingerprint != identity.manifest_fingerprint {
            return Err(ReadmitError::SchemaDrift {
                artifact: expected_kind.as_str().into(),
                expected: identity.manifest_fingerprint.clone(),
                found: self.manifest_fingerprint.clone(),
            });
        }
        if self.run_id != identity.run_id {
            return Err(ReadmitError::Artifact(format!(
                "{} comes from run {}, manifest from run {}",
                expected_kind.file_name(),
                self.run_id,
                identity.run_id
            )));
        }
        Ok(())
    }
}

/// Manifest file payload: the schema plus the preprocessing state that must match it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestArtifact {
    pub manifest: FeatureManifest,
    pub missing_tokens: Vec<String>,
}

/// Everything the scoring service needs, verified to belong to one run.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub identity: RunIdentity,
    pub manifest: FeatureManifest,
    pub missing_tokens: Vec<String>,
    pub gbm: GbmModel,
    pub linear: LinearModel,
    pub calibrator: Option<PlattCalibrator>,
    pub stacker: Option<StackingMetaLearner>,
}

impl ModelBundle {
    /// Structural checks on every model against the manifest.
    pub fn validate(&self) -> Result<()> {
        if self.manifest.fingerprint() != self.identity.manifest_fingerprint {
            return Err(ReadmitError::SchemaDrift {
                artifact: "manifest".into(),
                expected: self.identity.manifest_fingerprint.clone(),
                found: self.manifest.fingerprint(),
            });
        }
        self.gbm.validate(&self.manifest)?;
        self.linear.validate(&self.manifest)?;
        if let Some(stacker) = &self.stacker {
            stacker.validate()?;
        }
        Ok(())
    }
}

/// Directory of artifacts for one model.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub fn exists(&self, kind: ArtifactKind) -> bool {
        self.path(kind).is_file()
    }

    /// Atomically write one envelope.
    pub fn write<T: Serialize>(&self, envelope: &ArtifactEnvelope<T>) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.path(envelope.kind);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, envelope)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| ReadmitError::Io(e.error))?;
        debug!(path = %target.display(), kind = envelope.kind.as_str(), "artifact written");
        Ok(target)
    }

    pub fn read<T: DeserializeOwned>(&self, kind: ArtifactKind) -> Result<ArtifactEnvelope<T>> {
        let path = self.path(kind);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ReadmitError::Artifact(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| ReadmitError::Artifact(format!("cannot parse {}: {e}", path.display())))
    }

    pub fn remove(&self, kind: ArtifactKind) -> Result<()> {
        match std::fs::remove_file(self.path(kind)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a bundle. Models go first and the manifest last, so a reader that sees
    /// the new manifest also sees the models it vouches for. Optional artifacts that
    /// this run did not produce are removed only after the manifest is in place.
    pub fn save_bundle(&self, bundle: &ModelBundle) -> Result<()> {
        self.write_bundle(bundle)?;
        if bundle.calibrator.is_none() {
            self.remove(ArtifactKind::Calibrator)?;
        }
        if bundle.stacker.is_none() {
            self.remove(ArtifactKind::Stacker)?;
        }
        info!(dir = %self.dir.display(), run_id = %bundle.identity.run_id, "model bundle saved");
        Ok(())
    }

    /// Write every artifact the bundle carries without touching leftovers from earlier
    /// runs. Leftovers carry another run id and are skipped on load.
    pub fn write_bundle(&self, bundle: &ModelBundle) -> Result<()> {
        let id = &bundle.identity;
        self.write(&ArtifactEnvelope::new(ArtifactKind::GbmModel, id, &bundle.gbm))?;
        self.write(&ArtifactEnvelope::new(ArtifactKind::LinearModel, id, &bundle.linear))?;
        if let Some(c) = &bundle.calibrator {
            self.write(&ArtifactEnvelope::new(ArtifactKind::Calibrator, id, c))?;
        }
        if let Some(s) = &bundle.stacker {
            self.write(&ArtifactEnvelope::new(ArtifactKind::Stacker, id, s))?;
        }
        let manifest = ManifestArtifact { manifest: bundle.manifest.clone(), missing_tokens: bundle.missing_tokens.clone() };
        self.write(&ArtifactEnvelope::new(ArtifactKind::Manifest, id, manifest))?;
        Ok(())
    }

    pub fn save_split(&self, identity: &RunIdentity, split: &TrainValSplit) -> Result<PathBuf> {
        self.write(&ArtifactEnvelope::new(ArtifactKind::Split, identity, split))
    }

    /// Read the persisted split of the current run.
    pub fn load_split(&self) -> Result<TrainValSplit> {
        let identity = self.load_identity()?.0;
        let envelope: ArtifactEnvelope<TrainValSplit> = self.read(ArtifactKind::Split)?;
        envelope.verify(ArtifactKind::Split, &identity)?;
        Ok(envelope.payload)
    }

    fn load_identity(&self) -> Result<(RunIdentity, ManifestArtifact)> {
        let envelope: ArtifactEnvelope<ManifestArtifact> = self.read(ArtifactKind::Manifest)?;
        let identity = RunIdentity {
            run_id: envelope.run_id,
            created_at: envelope.created_at,
            manifest_fingerprint: envelope.manifest_fingerprint.clone(),
        };
        // Kind and format version; the run checks are trivially true here
        envelope.verify(ArtifactKind::Manifest, &identity)?;
        Ok((identity, envelope.payload))
    }

    /// Load and verify a full bundle.
    pub fn load_bundle(&self) -> Result<ModelBundle> {
        let (identity, manifest_artifact) = self.load_identity()?;

        let gbm: ArtifactEnvelope<GbmModel> = self.read(ArtifactKind::GbmModel)?;
        gbm.verify(ArtifactKind::GbmModel, &identity)?;
        let linear: ArtifactEnvelope<LinearModel> = self.read(ArtifactKind::LinearModel)?;
        linear.verify(ArtifactKind::LinearModel, &identity)?;

        let calibrator = self
            .read_optional::<PlattCalibrator>(ArtifactKind::Calibrator, &identity)
            .and_then(|c| {
                if c.is_monotone() {
                    Some(c)
                } else {
                    warn!("calibrator slope {} is not positive; ignoring it", c.slope);
                    None
                }
            });
        let stacker = self.read_optional::<StackingMetaLearner>(ArtifactKind::Stacker, &identity);

        let bundle = ModelBundle {
            identity,
            manifest: manifest_artifact.manifest,
            missing_tokens: manifest_artifact.missing_tokens,
            gbm: gbm.payload,
            linear: linear.payload,
            calibrator,
            stacker,
        };
        bundle.validate()?;
        info!(
            dir = %self.dir.display(),
            run_id = %bundle.identity.run_id,
            trees = bundle.gbm.n_trees(),
            calibrated = bundle.calibrator.is_some(),
            stacked = bundle.stacker.is_some(),
            "model bundle loaded"
        );
        Ok(bundle)
    }

    /// Missing, unreadable or mismatched optional artifacts are logged and skipped.
    fn read_optional<T: DeserializeOwned>(&self, kind: ArtifactKind, identity: &RunIdentity) -> Option<T> {
        if !self.exists(kind) {
            info!("no {} artifact; continuing without it", kind.as_str());
            return None;
        }
        let result = self.read::<T>(kind).and_then(|envelope| {
            envelope.verify(kind, identity)?;
            Ok(envelope.payload)
        });
        match result {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("ignoring {} artifact: {e}", kind.as_str());
                None
            }
        }
    }
}
