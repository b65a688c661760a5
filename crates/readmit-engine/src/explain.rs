//! Narrative summaries of a prediction.
//!
//! Free-text generation lives outside the engine behind [`Summarizer`]. The built-in
//! [`TemplateSummarizer`] is deterministic and is also what the scoring service falls
//! back to when another summarizer fails.

use readmit_common::Result;

use crate::attribution::Contribution;
use crate::band::RiskBand;

/// Turns a scored prediction into clinician-facing text.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, probability: f64, band: RiskBand, ranked: &[Contribution]) -> Result<String>;
}

/// Clinical phrasing for a driver, keyed on the feature name.
pub fn clinical_phrase(feature: &str, observed: &str) -> String {
    match feature {
        "num_medications" => format!("high medication burden ({observed} active meds)"),
        "A1Cresult" => format!("poor glycemic control (A1C {observed})"),
        "time_in_hospital" => format!("prolonged hospitalization ({observed} days)"),
        "number_inpatient" => format!("multiple prior inpatient admissions ({observed})"),
        "number_emergency" => format!("frequent ER visits ({observed})"),
        "number_outpatient" => format!("high outpatient utilization ({observed})"),
        "age" => format!("age {observed} (risk increases with age)"),
        "weight" => format!("weight category {observed}"),
        f if f.starts_with("diag") => format!("diagnosis: {observed}"),
        f => format!("{f} = {observed}"),
    }
}

#[derive(Debug, Clone)]
pub struct TemplateSummarizer {
    drivers: usize,
}

impl TemplateSummarizer {
    pub fn new(drivers: usize) -> Self {
        Self { drivers }
    }

    /// Bullet list of the top drivers, or a placeholder line when there are none.
    pub fn driver_block(&self, ranked: &[Contribution]) -> String {
        let lines: Vec<String> = ranked
            .iter()
            .take(self.drivers)
            .map(|c| {
                let observed = c.observed.as_deref().unwrap_or("?");
                let direction = if c.value > 0.0 { "raises risk" } else { "lowers risk" };
                format!(
                    "- {} ({direction}, impact {:.3})",
                    clinical_phrase(&c.feature, observed),
                    c.value
                )
            })
            .collect();
        if lines.is_empty() {
            "- Insufficient feature data available".to_string()
        } else {
            lines.join("\n")
        }
    }
}

impl Default for TemplateSummarizer {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Summarizer for TemplateSummarizer {
    fn summarize(&self, probability: f64, band: RiskBand, ranked: &[Contribution]) -> Result<String> {
        Ok(format!(
            "Readmission risk is {band} (score {probability:.2}).\nTop factors:\n{}",
            self.driver_block(ranked)
        ))
    }
}
