//! readmit-test-utils: Synthetic encounter cohorts and small engine configs for tests.
//!
//! The generator writes CSV in the layout of the diabetic encounter extract: age
//! brackets such as `[70-80)`, `?` for missing values, ICD-9 codes mixed with V-codes,
//! and a three-valued `readmitted` outcome. Readmission depends on prior inpatient
//! visits, length of stay, age, A1C and insulin changes, so a working model must beat
//! chance by a clear margin.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use readmit_common::{EngineConfig, EarlyStoppingMetric};

pub const HEADER: &str = "encounter_id,patient_nbr,race,gender,age,weight,admission_type_id,\
discharge_disposition_id,time_in_hospital,num_lab_procedures,num_medications,number_outpatient,\
number_emergency,number_inpatient,diag_1,A1Cresult,insulin,readmitted";

const RACES: [&str; 5] = ["Caucasian", "AfricanAmerican", "Hispanic", "Asian", "Other"];
const AGES: [&str; 7] = ["[30-40)", "[40-50)", "[50-60)", "[60-70)", "[70-80)", "[80-90)", "[90-100)"];
const DIAGNOSES: [&str; 8] = ["428", "250.83", "414", "V57", "786", "410", "V58", "486"];
const A1C: [&str; 4] = ["None", "Norm", ">7", ">8"];
const INSULIN: [&str; 4] = ["No", "Steady", "Up", "Down"];

/// Seeded generator of synthetic encounters.
#[derive(Debug, Clone)]
pub struct SyntheticCohort {
    rows: usize,
    seed: u64,
    ambiguous_rate: f64,
}

impl SyntheticCohort {
    pub fn new(rows: usize, seed: u64) -> Self {
        Self { rows, seed, ambiguous_rate: 0.1 }
    }

    /// Share of negative encounters labelled `>30`, which the loader excludes.
    pub fn with_ambiguous_rate(mut self, rate: f64) -> Self {
        self.ambiguous_rate = rate;
        self
    }

    pub fn to_csv(&self) -> String {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut out = String::with_capacity(self.rows * 96);
        out.push_str(HEADER);
        out.push('\n');

        for i in 0..self.rows {
            let age_idx = rng.gen_range(0..AGES.len());
            let inpatient: u32 = match rng.gen_range(0..10) {
                0..=5 => 0,
                6 | 7 => 1,
                8 => rng.gen_range(2..4),
                _ => rng.gen_range(4..9),
            };
            let emergency: u32 = if rng.gen_bool(0.15) { rng.gen_range(1..4) } else { 0 };
            let outpatient: u32 = if rng.gen_bool(0.2) { rng.gen_range(1..5) } else { 0 };
            let stay: u32 = rng.gen_range(1..15);
            let labs: u32 = rng.gen_range(10..80);
            let meds: u32 = rng.gen_range(3..35);
            let a1c = A1C[rng.gen_range(0..A1C.len())];
            let insulin = INSULIN[rng.gen_range(0..INSULIN.len())];
            let diag = DIAGNOSES[rng.gen_range(0..DIAGNOSES.len())];

            let logit = -2.6
                + 0.55 * f64::from(inpatient.min(5))
                + 0.25 * f64::from(emergency)
                + 0.06 * f64::from(stay)
                + 0.18 * age_idx as f64
                + if a1c == ">8" { 0.6 } else { 0.0 }
                + if insulin == "Up" || insulin == "Down" { 0.35 } else { 0.0 }
                + if diag == "428" { 0.3 } else { 0.0 };
            let p = 1.0 / (1.0 + (-logit).exp());
            let outcome = if rng.gen_bool(p) {
                "<30"
            } else if rng.gen_bool(self.ambiguous_rate) {
                ">30"
            } else {
                "NO"
            };

            let race = if rng.gen_bool(0.03) { "?" } else { RACES[rng.gen_range(0..RACES.len())] };
            let gender = if rng.gen_bool(0.5) { "Female" } else { "Male" };
            let weight = if rng.gen_bool(0.9) { "?" } else { "[75-100)" };
            let admission_type = rng.gen_range(1..4);
            let disposition = if rng.gen_bool(0.8) { 1 } else { rng.gen_range(2..7) };
            let labs = if rng.gen_bool(0.05) { "?".to_string() } else { labs.to_string() };

            let _ = writeln!(
                out,
                "{},{},{race},{gender},{},{weight},{admission_type},{disposition},{stay},{labs},{meds},{outpatient},{emergency},{inpatient},{diag},{a1c},{insulin},{outcome}",
                100_000 + i,
                500_000 + i,
                AGES[age_idx],
            );
        }
        out
    }

    /// Write the cohort to `dir/name` and return the path.
    pub fn write_to(&self, dir: &Path, name: &str) -> anyhow::Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, self.to_csv())?;
        Ok(path)
    }
}

/// Engine configuration sized for tests: a few dozen shallow trees.
pub fn small_config(artifact_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.gbm.iterations = 60;
    config.gbm.learning_rate = 0.1;
    config.gbm.max_depth = 4;
    config.gbm.max_bins = 32;
    config.gbm.early_stopping_rounds = 20;
    config.gbm.early_stopping_metric = EarlyStoppingMetric::Auc;
    config.gbm.log_every = 0;
    config.linear.max_iter = 300;
    config.stacking.cv_folds = 3;
    config.artifacts.dir = artifact_dir.to_string_lossy().into_owned();
    config
}

/// Fresh temporary directory for artifacts.
pub fn artifact_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}
