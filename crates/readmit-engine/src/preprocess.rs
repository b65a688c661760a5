//! Raw record normalisation.
//!
//! The single boundary where loosely-typed clinical input becomes a manifest-aligned
//! [`FeatureVector`]. Nothing here returns an error: absent or malformed values degrade
//! to the categorical `"missing"` category or the numeric NaN sentinel.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::manifest::{FeatureKind, FeatureManifest};

/// Canonical category substituted for absent categorical values.
pub const MISSING_CATEGORY: &str = "missing";

/// A single loosely-typed input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// Arrays and objects; never a usable feature value.
    Other(serde_json::Value),
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Number(v)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Number(v as f64)
    }
}

/// Field name → value mapping as received from a caller or a dataset row.
/// Extra keys are carried but ignored by the preprocessor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(BTreeMap<String, RawValue>);

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<RawValue>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&RawValue> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<RawValue> {
        self.0.remove(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RawValue)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<RawValue>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One normalised slot. Categorical slots never hold numbers and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Category(String),
    Numeric(f64),
}

// NaN is the missing sentinel, so two missing numerics are the same value
impl PartialEq for FeatureValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FeatureValue::Category(a), FeatureValue::Category(b)) => a == b,
            (FeatureValue::Numeric(a), FeatureValue::Numeric(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => false,
        }
    }
}

impl FeatureValue {
    pub fn is_missing(&self) -> bool {
        match self {
            FeatureValue::Category(c) => c == MISSING_CATEGORY,
            FeatureValue::Numeric(v) => v.is_nan(),
        }
    }
}

/// Fixed-length, manifest-ordered feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: Vec<FeatureValue>,
}

impl FeatureVector {
    pub fn from_values(values: Vec<FeatureValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[FeatureValue] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&FeatureValue> {
        self.values.get(index)
    }

    /// Numeric value of a slot; NaN for categorical or out-of-range slots.
    pub fn numeric(&self, index: usize) -> f64 {
        match self.values.get(index) {
            Some(FeatureValue::Numeric(v)) => *v,
            _ => f64::NAN,
        }
    }

    /// Category of a slot; `None` for numeric or out-of-range slots.
    pub fn category(&self, index: usize) -> Option<&str> {
        match self.values.get(index) {
            Some(FeatureValue::Category(c)) => Some(c.as_str()),
            _ => None,
        }
    }

    /// A slot is present when the caller supplied a usable value for it.
    pub fn is_present(&self, index: usize) -> bool {
        self.values.get(index).is_some_and(|v| !v.is_missing())
    }

    pub fn present_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_missing()).count()
    }
}

fn interval_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*[\[(]?\s*(-?\d+)\s*-\s*(-?\d+)\s*[\])]?\s*$").expect("static interval regex")
    })
}

/// Convert a bucket like `"[70-80)"` to its integer midpoint `(lo + hi) // 2`.
pub fn interval_midpoint(raw: &str) -> Option<f64> {
    let caps = interval_pattern().captures(raw)?;
    let lo: i64 = caps.get(1)?.as_str().parse().ok()?;
    let hi: i64 = caps.get(2)?.as_str().parse().ok()?;
    Some((i128::from(lo) + i128::from(hi)).div_euclid(2) as f64)
}

/// Parse free text into a finite number, accepting interval buckets.
pub fn parse_numeric_text(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        Ok(_) => None,
        Err(_) => interval_midpoint(trimmed),
    }
}

/// Manifest-driven record normaliser. Pure: output depends only on the record.
#[derive(Debug, Clone)]
pub struct FeaturePreprocessor {
    manifest: Arc<FeatureManifest>,
    missing_tokens: Vec<String>,
}

impl FeaturePreprocessor {
    pub fn new(manifest: Arc<FeatureManifest>) -> Self {
        Self::with_missing_tokens(manifest, readmit_common::engine_config::default_missing_tokens())
    }

    pub fn with_missing_tokens(manifest: Arc<FeatureManifest>, missing_tokens: Vec<String>) -> Self {
        let missing_tokens = missing_tokens.into_iter().map(|t| t.trim().to_string()).collect();
        Self { manifest, missing_tokens }
    }

    pub fn manifest(&self) -> &Arc<FeatureManifest> {
        &self.manifest
    }

    pub fn missing_tokens(&self) -> &[String] {
        &self.missing_tokens
    }

    pub fn transform(&self, record: &RawRecord) -> FeatureVector {
        let values = self
            .manifest
            .features()
            .iter()
            .map(|spec| {
                let raw = record.get(&spec.name);
                match spec.kind {
                    FeatureKind::Categorical => FeatureValue::Category(self.canonical_category(raw)),
                    FeatureKind::Numeric => FeatureValue::Numeric(self.numeric_value(raw)),
                }
            })
            .collect();
        FeatureVector { values }
    }

    fn is_missing_token(&self, text: &str) -> bool {
        text == MISSING_CATEGORY || self.missing_tokens.iter().any(|t| t == text)
    }

    /// Canonical string form used for every categorical comparison.
    pub fn canonical_category(&self, raw: Option<&RawValue>) -> String {
        match raw {
            None | Some(RawValue::Null) | Some(RawValue::Other(_)) => MISSING_CATEGORY.to_string(),
            Some(RawValue::Bool(b)) => b.to_string(),
            Some(RawValue::Number(v)) => canonical_number(*v),
            Some(RawValue::Text(s)) => {
                let trimmed = s.trim();
                if self.is_missing_token(trimmed) {
                    MISSING_CATEGORY.to_string()
                } else {
                    trimmed.to_string()
                }
            }
        }
    }

    /// Numeric value or NaN when absent or unparseable. Never zero-imputed here.
    pub fn numeric_value(&self, raw: Option<&RawValue>) -> f64 {
        match raw {
            None | Some(RawValue::Null) | Some(RawValue::Other(_)) => f64::NAN,
            Some(RawValue::Bool(b)) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Some(RawValue::Number(v)) if v.is_finite() => *v,
            Some(RawValue::Number(_)) => f64::NAN,
            Some(RawValue::Text(s)) => {
                let trimmed = s.trim();
                if self.is_missing_token(trimmed) {
                    f64::NAN
                } else {
                    parse_numeric_text(trimmed).unwrap_or(f64::NAN)
                }
            }
        }
    }
}

/// Integers render without a fractional part so `3` and `"3"` hit the same category.
fn canonical_number(v: f64) -> String {
    if !v.is_finite() {
        MISSING_CATEGORY.to_string()
    } else if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FeatureManifest;

    fn preprocessor() -> FeaturePreprocessor {
        let manifest = FeatureManifest::from_pairs([
            ("race", FeatureKind::Categorical),
            ("age", FeatureKind::Numeric),
            ("num_medications", FeatureKind::Numeric),
            ("admission_type_id", FeatureKind::Categorical),
        ])
        .unwrap();
        FeaturePreprocessor::new(Arc::new(manifest))
    }

    #[test]
    fn test_interval_midpoint() {
        assert_eq!(interval_midpoint("[70-80)"), Some(75.0));
        assert_eq!(interval_midpoint("[0-10)"), Some(5.0));
        assert_eq!(interval_midpoint("[75-80)"), Some(77.0));
        assert_eq!(interval_midpoint("70-80"), Some(75.0));
        assert_eq!(interval_midpoint("seventy"), None);
        assert_eq!(interval_midpoint("[70-)"), None);
    }

    #[test]
    fn test_extreme_interval_bounds_never_overflow() {
        let max = i64::MAX.to_string();
        assert_eq!(interval_midpoint(&format!("[{max}-{max})")), Some(i64::MAX as f64));
        assert_eq!(interval_midpoint("[99999999999999999999-1)"), None);

        let pre = preprocessor();
        let v = pre.transform(&RawRecord::new().with("age", format!("[{max}-{max})")));
        assert!(v.numeric(1).is_finite());
    }

    #[test]
    fn test_same_record_gives_equal_vectors() {
        let pre = preprocessor();
        let record = RawRecord::new().with("race", "Asian").with("num_medications", "n/a");
        let first = pre.transform(&record);
        let second = pre.transform(&record);
        assert!(first.numeric(2).is_nan());
        assert_eq!(first, second);
        assert_ne!(first, pre.transform(&RawRecord::new().with("race", "Asian").with("num_medications", 3_i64)));
    }

    #[test]
    fn test_age_only_record() {
        let pre = preprocessor();
        let record = RawRecord::new().with("age", "[70-80)");
        let v = pre.transform(&record);

        assert_eq!(v.len(), 4);
        assert_eq!(v.numeric(1), 75.0);
        assert_eq!(v.category(0), Some(MISSING_CATEGORY));
        assert!(v.numeric(2).is_nan());
        assert_eq!(v.category(3), Some(MISSING_CATEGORY));
        assert_eq!(v.present_count(), 1);
        assert!(v.is_present(1));
    }

    #[test]
    fn test_invalid_numeric_becomes_nan_not_zero() {
        let pre = preprocessor();
        let record = RawRecord::new()
            .with("num_medications", "lots")
            .with("age", RawValue::Number(f64::INFINITY));
        let v = pre.transform(&record);
        assert!(v.numeric(2).is_nan());
        assert!(v.numeric(1).is_nan());
    }

    #[test]
    fn test_missing_category_idempotence() {
        let pre = preprocessor();
        let omitted = pre.transform(&RawRecord::new().with("age", 60_i64));
        let explicit = pre.transform(
            &RawRecord::new()
                .with("age", 60_i64)
                .with("race", MISSING_CATEGORY)
                .with("admission_type_id", "?"),
        );
        let null = pre.transform(&RawRecord::new().with("age", 60_i64).with("race", RawValue::Null));
        assert_eq!(omitted, explicit);
        assert_eq!(omitted, null);
    }

    #[test]
    fn test_numbers_and_text_share_categories() {
        let pre = preprocessor();
        let from_number = pre.transform(&RawRecord::new().with("admission_type_id", 3_i64));
        let from_text = pre.transform(&RawRecord::new().with("admission_type_id", " 3 "));
        assert_eq!(from_number.category(3), Some("3"));
        assert_eq!(from_number, from_text);
    }

    #[test]
    fn test_extra_keys_ignored() {
        let pre = preprocessor();
        let with_extra = pre.transform(&RawRecord::new().with("race", "Caucasian").with("favourite_colour", "blue"));
        let without = pre.transform(&RawRecord::new().with("race", "Caucasian"));
        assert_eq!(with_extra, without);
    }

    #[test]
    fn test_record_deserializes_loose_json() {
        let record: RawRecord =
            serde_json::from_str(r#"{"age": "[50-60)", "num_medications": 14, "race": null, "insulin": "Up", "flag": true}"#)
                .unwrap();
        assert_eq!(record.get("num_medications"), Some(&RawValue::Number(14.0)));
        assert_eq!(record.get("race"), Some(&RawValue::Null));
        assert_eq!(record.get("flag"), Some(&RawValue::Bool(true)));
        let v = preprocessor().transform(&record);
        assert_eq!(v.numeric(1), 55.0);
        assert_eq!(v.numeric(2), 14.0);
    }

    #[test]
    fn test_nested_values_deserialize_and_read_as_missing() {
        let record: RawRecord = serde_json::from_str(
            r#"{"race": ["Asian", "Other"], "num_medications": {"count": 3}, "notes": {"free": "text"}, "age": 40}"#,
        )
        .unwrap();
        assert!(matches!(record.get("notes"), Some(RawValue::Other(_))));
        let v = preprocessor().transform(&record);
        assert_eq!(v.category(0), Some(MISSING_CATEGORY));
        assert!(v.numeric(2).is_nan());
        assert_eq!(v.numeric(1), 40.0);
    }
}
