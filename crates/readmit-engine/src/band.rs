//! Probability → ordinal risk band.

use serde::{Deserialize, Serialize};

use readmit_common::{BandConfig, ReadmitError, Result};

/// Ordinal risk band. Ordering follows severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl RiskBand {
    pub const ALL: [RiskBand; 3] = [RiskBand::Low, RiskBand::Medium, RiskBand::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "low",
            RiskBand::Medium => "medium",
            RiskBand::High => "high",
        }
    }
}

impl std::fmt::Display for RiskBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one threshold policy shared by training-time evaluation and serving.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPolicy {
    low_upper: f64,
    high_lower: f64,
}

impl BandPolicy {
    pub fn new(low_upper: f64, high_lower: f64) -> Result<Self> {
        if !(0.0 < low_upper && low_upper < high_lower && high_lower < 1.0) {
            return Err(ReadmitError::Config(format!(
                "band thresholds must satisfy 0 < {low_upper} < {high_lower} < 1"
            )));
        }
        Ok(Self { low_upper, high_lower })
    }

    pub fn from_config(config: &BandConfig) -> Result<Self> {
        Self::new(config.low_upper, config.high_lower)
    }

    pub fn low_upper(&self) -> f64 {
        self.low_upper
    }

    pub fn high_lower(&self) -> f64 {
        self.high_lower
    }

    /// Monotone in `probability`. NaN maps to `High` so a broken score is never hidden.
    pub fn classify(&self, probability: f64) -> RiskBand {
        if probability < self.low_upper {
            RiskBand::Low
        } else if probability < self.high_lower {
            RiskBand::Medium
        } else {
            RiskBand::High
        }
    }
}

impl Default for BandPolicy {
    fn default() -> Self {
        let config = BandConfig::default();
        Self { low_upper: config.low_upper, high_lower: config.high_lower }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        let policy = BandPolicy::default();
        assert_eq!(policy.classify(0.0), RiskBand::Low);
        assert_eq!(policy.classify(0.3299), RiskBand::Low);
        assert_eq!(policy.classify(0.33), RiskBand::Medium);
        assert_eq!(policy.classify(0.6599), RiskBand::Medium);
        assert_eq!(policy.classify(0.66), RiskBand::High);
        assert_eq!(policy.classify(1.0), RiskBand::High);
    }

    #[test]
    fn test_monotonic() {
        let policy = BandPolicy::default();
        let mut previous = RiskBand::Low;
        for i in 0..=1000 {
            let band = policy.classify(i as f64 / 1000.0);
            assert!(band >= previous);
            previous = band;
        }
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        assert!(BandPolicy::new(0.7, 0.3).is_err());
        assert!(BandPolicy::new(0.0, 0.5).is_err());
        assert!(BandPolicy::new(0.3, 0.6).is_ok());
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RiskBand::Medium).unwrap(), "\"medium\"");
    }
}
