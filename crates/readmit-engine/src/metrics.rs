//! Discrimination and calibration metrics used by training-time evaluation.

use serde::{Deserialize, Serialize};

use crate::band::{BandPolicy, RiskBand};

/// Average ranks (1-based, ascending). Tied scores share the mean of their ranks.
pub fn average_ranks(scores: &[f64]) -> Vec<f64> {
    let n = scores.len();
    let mut indexed: Vec<(usize, f64)> = scores.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut ranks = vec![0.0f64; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && indexed[j + 1].1 == indexed[i].1 {
            j += 1;
        }
        let avg_rank = (i + 1 + j + 1) as f64 / 2.0;
        for item in &indexed[i..=j] {
            ranks[item.0] = avg_rank;
        }
        i = j + 1;
    }
    ranks
}

/// Area under the ROC curve via the Mann-Whitney U statistic.
/// Returns 0.5 when only one class is present.
pub fn roc_auc(labels: &[u8], scores: &[f64]) -> f64 {
    debug_assert_eq!(labels.len(), scores.len());
    let n_pos = labels.iter().filter(|&&l| l == 1).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }
    let ranks = average_ranks(scores);
    let pos_rank_sum: f64 = labels
        .iter()
        .zip(ranks.iter())
        .filter(|(&l, _)| l == 1)
        .map(|(_, &r)| r)
        .sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    u / (n_pos as f64 * n_neg as f64)
}

/// Mean squared error between probabilities and outcomes.
pub fn brier_score(labels: &[u8], probs: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    labels
        .iter()
        .zip(probs)
        .map(|(&y, &p)| (p - f64::from(y)).powi(2))
        .sum::<f64>()
        / labels.len() as f64
}

/// Mean negative log-likelihood, probabilities clipped away from 0 and 1.
pub fn log_loss(labels: &[u8], probs: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    const EPS: f64 = 1e-15;
    labels
        .iter()
        .zip(probs)
        .map(|(&y, &p)| {
            let p = p.clamp(EPS, 1.0 - EPS);
            if y == 1 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum::<f64>()
        / labels.len() as f64
}

/// Expected calibration error over `bins` equal-width probability bins.
pub fn expected_calibration_error(labels: &[u8], probs: &[f64], bins: usize) -> f64 {
    if labels.is_empty() || bins == 0 {
        return 0.0;
    }
    let mut count = vec![0usize; bins];
    let mut prob_sum = vec![0.0f64; bins];
    let mut pos_sum = vec![0.0f64; bins];
    for (&y, &p) in labels.iter().zip(probs) {
        let b = ((p.clamp(0.0, 1.0) * bins as f64) as usize).min(bins - 1);
        count[b] += 1;
        prob_sum[b] += p;
        pos_sum[b] += f64::from(y);
    }
    let n = labels.len() as f64;
    (0..bins)
        .filter(|&b| count[b] > 0)
        .map(|b| {
            let c = count[b] as f64;
            (c / n) * (prob_sum[b] / c - pos_sum[b] / c).abs()
        })
        .sum()
}

/// Summary of one scorer on a labelled set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    pub auc: f64,
    pub brier: f64,
    pub log_loss: f64,
    pub ece: f64,
    pub positive_rate: f64,
    pub mean_probability: f64,
}

impl ScoreReport {
    pub fn compute(labels: &[u8], probs: &[f64], ece_bins: usize) -> Self {
        let n = labels.len().max(1) as f64;
        Self {
            auc: roc_auc(labels, probs),
            brier: brier_score(labels, probs),
            log_loss: log_loss(labels, probs),
            ece: expected_calibration_error(labels, probs, ece_bins),
            positive_rate: labels.iter().map(|&y| f64::from(y)).sum::<f64>() / n,
            mean_probability: probs.iter().sum::<f64>() / n,
        }
    }
}

/// Observed outcome rate per risk band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandOutcome {
    pub band: RiskBand,
    pub count: usize,
    pub positives: usize,
    pub observed_rate: f64,
}

pub fn band_outcomes(labels: &[u8], probs: &[f64], policy: &BandPolicy) -> Vec<BandOutcome> {
    RiskBand::ALL
        .iter()
        .map(|&band| {
            let (count, positives) = labels
                .iter()
                .zip(probs)
                .filter(|(_, &p)| policy.classify(p) == band)
                .fold((0usize, 0usize), |(c, pos), (&y, _)| (c + 1, pos + usize::from(y)));
            BandOutcome {
                band,
                count,
                positives,
                observed_rate: if count > 0 { positives as f64 / count as f64 } else { 0.0 },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_ranks_ties() {
        let ranks = average_ranks(&[10.0, 20.0, 20.0, 5.0]);
        assert_eq!(ranks, vec![2.0, 3.5, 3.5, 1.0]);
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [0, 0, 1, 1];
        assert!((roc_auc(&labels, &[0.1, 0.2, 0.8, 0.9]) - 1.0).abs() < 1e-12);
        assert!(roc_auc(&labels, &[0.9, 0.8, 0.2, 0.1]).abs() < 1e-12);
    }

    #[test]
    fn test_auc_ties_count_half() {
        let labels = [0, 1];
        assert!((roc_auc(&labels, &[0.5, 0.5]) - 0.5).abs() < 1e-12);
        // One of four pairs mis-ordered
        let labels = [0, 0, 1, 1];
        assert!((roc_auc(&labels, &[0.1, 0.6, 0.5, 0.9]) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_auc_single_class() {
        assert_eq!(roc_auc(&[1, 1], &[0.2, 0.3]), 0.5);
    }

    #[test]
    fn test_brier_and_log_loss() {
        let labels = [1, 0];
        assert!((brier_score(&labels, &[1.0, 0.0])).abs() < 1e-12);
        assert!((brier_score(&labels, &[0.5, 0.5]) - 0.25).abs() < 1e-12);
        assert!((log_loss(&labels, &[0.5, 0.5]) - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn test_ece_perfectly_calibrated_bin() {
        // Four predictions at 0.25, one positive: calibrated
        let labels = [1, 0, 0, 0];
        let probs = [0.25; 4];
        assert!(expected_calibration_error(&labels, &probs, 10) < 1e-12);
        // Overconfident
        let probs = [0.95; 4];
        assert!((expected_calibration_error(&labels, &probs, 10) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_band_outcomes_cover_all_rows() {
        let policy = BandPolicy::default();
        let labels = [0, 1, 1, 0, 1];
        let probs = [0.1, 0.4, 0.7, 0.2, 0.9];
        let outcomes = band_outcomes(&labels, &probs, &policy);
        assert_eq!(outcomes.iter().map(|o| o.count).sum::<usize>(), 5);
        let high = outcomes.iter().find(|o| o.band == RiskBand::High).unwrap();
        assert_eq!(high.count, 2);
        assert_eq!(high.positives, 2);
    }
}
