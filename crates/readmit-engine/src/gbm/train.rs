//! Histogram-based boosting loop.

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use readmit_common::{EarlyStoppingMetric, GbmConfig, ReadmitError, Result};

use super::tree::{SplitRule, Tree, TreeNode};
use super::GbmModel;
use crate::logistic::sigmoid;
use crate::manifest::{FeatureKind, FeatureManifest};
use crate::metrics::{log_loss, roc_auc};
use crate::preprocess::{FeatureVector, MISSING_CATEGORY};

/// Result of one boosting run.
#[derive(Debug, Clone)]
pub struct GbmTrainingOutcome {
    pub model: GbmModel,
    /// Zero-based iteration the model was truncated to.
    pub best_iteration: usize,
    pub best_score: f64,
    pub iterations_run: usize,
    pub scale_pos_weight: f64,
    pub stopped_early: bool,
}

/// One quantised training column.
#[derive(Debug)]
struct BinnedFeature {
    kind: FeatureKind,
    bins: Vec<u32>,
    /// Numeric: cut values; bin `b` holds `thresholds[b-1] < x <= thresholds[b]`.
    thresholds: Vec<f64>,
    /// Categorical: bin id → category.
    categories: Vec<String>,
    /// Numeric: the NaN bin (always the last one).
    missing_bin: Option<u32>,
    n_bins: usize,
}

impl BinnedFeature {
    fn numeric(values: &[f64], max_bins: usize) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.sort_by(f64::total_cmp);

        let mut thresholds: Vec<f64> = if sorted.is_empty() {
            Vec::new()
        } else {
            let mut unique = sorted.clone();
            unique.dedup();
            if unique.len() <= max_bins {
                unique
            } else {
                let n = sorted.len();
                let mut cuts: Vec<f64> = (1..max_bins).map(|q| sorted[(q * n / max_bins).min(n - 1)]).collect();
                cuts.dedup();
                cuts
            }
        };
        // Cutting at the maximum leaves an empty right side
        if let (Some(&last), Some(&max)) = (thresholds.last(), sorted.last()) {
            if last >= max {
                thresholds.pop();
            }
        }

        let missing_bin = (thresholds.len() + 1) as u32;
        let bins = values
            .iter()
            .map(|&v| {
                if v.is_nan() {
                    missing_bin
                } else {
                    thresholds.partition_point(|&t| t < v) as u32
                }
            })
            .collect();
        Self {
            kind: FeatureKind::Numeric,
            bins,
            thresholds,
            categories: Vec::new(),
            missing_bin: Some(missing_bin),
            n_bins: missing_bin as usize + 1,
        }
    }

    fn categorical(values: &[&str]) -> Self {
        let distinct: BTreeSet<&str> = values.iter().copied().collect();
        let categories: Vec<String> = distinct.into_iter().map(str::to_string).collect();
        let lookup: HashMap<&str, u32> = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i as u32))
            .collect();
        let bins = values.iter().map(|v| lookup[v]).collect();
        let n_bins = categories.len();
        Self { kind: FeatureKind::Categorical, bins, thresholds: Vec::new(), categories, missing_bin: None, n_bins }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BinStats {
    grad: f64,
    hess: f64,
    count: usize,
}

impl BinStats {
    fn add(&mut self, other: &BinStats) {
        self.grad += other.grad;
        self.hess += other.hess;
        self.count += other.count;
    }

    fn minus(&self, other: &BinStats) -> BinStats {
        BinStats { grad: self.grad - other.grad, hess: self.hess - other.hess, count: self.count - other.count }
    }
}

#[derive(Debug, Clone)]
enum Partition {
    /// Bins `0..=bin` go left.
    Numeric { bin: u32, missing_left: bool },
    Categorical { left: BTreeSet<u32>, right: BTreeSet<u32>, default_left: bool },
}

#[derive(Debug, Clone)]
struct Candidate {
    feature: usize,
    gain: f64,
    partition: Partition,
}

/// Second-order boosting on weighted log-loss.
#[derive(Debug, Clone)]
pub struct GbmTrainer {
    config: GbmConfig,
}

impl GbmTrainer {
    pub fn new(config: GbmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GbmConfig {
        &self.config
    }

    /// Fit on `train`, early-stopping against `valid`. Both sets must be preprocessed
    /// with the same manifest.
    pub fn train(
        &self,
        manifest: &FeatureManifest,
        train: &[FeatureVector],
        train_labels: &[u8],
        valid: &[FeatureVector],
        valid_labels: &[u8],
    ) -> Result<GbmTrainingOutcome> {
        let cfg = &self.config;
        if train.len() != train_labels.len() || valid.len() != valid_labels.len() {
            return Err(ReadmitError::Training("feature/label length mismatch".into()));
        }
        if valid.is_empty() {
            return Err(ReadmitError::InsufficientData("early stopping needs validation rows".into()));
        }
        let n_pos = train_labels.iter().filter(|&&y| y == 1).count();
        let n_neg = train_labels.len() - n_pos;
        if n_pos == 0 || n_neg == 0 {
            return Err(ReadmitError::InsufficientData(format!(
                "training partition needs both classes ({n_pos} positive, {n_neg} negative)"
            )));
        }

        let scale_pos_weight = cfg.scale_pos_weight.unwrap_or(n_neg as f64 / n_pos as f64);
        let weights: Vec<f64> = train_labels
            .iter()
            .map(|&y| if y == 1 { scale_pos_weight } else { 1.0 })
            .collect();
        let base_score = (scale_pos_weight * n_pos as f64 / n_neg as f64).ln();
        info!(
            "Boosting on {} rows ({} positive), scale_pos_weight={:.4}, base_score={:.4}",
            train.len(),
            n_pos,
            scale_pos_weight,
            base_score
        );

        let binned = bin_features(manifest, train, cfg.max_bins);
        let n_features = manifest.len();
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let mut train_raw = vec![base_score; train.len()];
        let mut valid_raw = vec![base_score; valid.len()];
        let mut trees: Vec<Tree> = Vec::new();
        let mut best_score = f64::NEG_INFINITY;
        let mut best_iteration = 0usize;
        let mut stopped_early = false;

        let n_sample = ((train.len() as f64) * cfg.subsample).round().max(1.0) as usize;
        let n_level_features = ((n_features as f64) * cfg.colsample_bylevel).round().clamp(1.0, n_features as f64) as usize;

        for iteration in 0..cfg.iterations {
            let (grad, hess): (Vec<f64>, Vec<f64>) = train_raw
                .iter()
                .zip(train_labels)
                .zip(&weights)
                .map(|((&f, &y), &w)| {
                    let p = sigmoid(f);
                    (w * (p - f64::from(y)), (w * p * (1.0 - p)).max(1e-16))
                })
                .unzip();

            let mut rows: Vec<u32> = if n_sample < train.len() {
                index::sample(&mut rng, train.len(), n_sample).into_iter().map(|i| i as u32).collect()
            } else {
                (0..train.len() as u32).collect()
            };
            rows.sort_unstable();

            let level_features: Vec<Vec<usize>> = (0..cfg.max_depth)
                .map(|_| {
                    let mut all: Vec<usize> = (0..n_features).collect();
                    all.shuffle(&mut rng);
                    all.truncate(n_level_features);
                    all.sort_unstable();
                    all
                })
                .collect();

            let builder = TreeBuilder {
                config: cfg,
                binned: &binned,
                grad: &grad,
                hess: &hess,
                level_features: &level_features,
                nodes: Vec::new(),
            };
            let tree = builder.build(rows);

            for (raw, x) in train_raw.iter_mut().zip(train) {
                *raw += tree.predict(x);
            }
            for (raw, x) in valid_raw.iter_mut().zip(valid) {
                *raw += tree.predict(x);
            }
            trees.push(tree);

            let score = match cfg.early_stopping_metric {
                EarlyStoppingMetric::Auc => roc_auc(valid_labels, &valid_raw),
                EarlyStoppingMetric::LogLoss => {
                    let probs: Vec<f64> = valid_raw.iter().map(|&f| sigmoid(f)).collect();
                    -log_loss(valid_labels, &probs)
                }
            };
            if score > best_score {
                best_score = score;
                best_iteration = iteration;
            }
            if cfg.log_every > 0 && iteration % cfg.log_every == 0 {
                info!("iteration {iteration}: validation {:?}={:.5} (best {:.5} at {best_iteration})", cfg.early_stopping_metric, score.abs(), best_score.abs());
            }
            if cfg.early_stopping_rounds > 0 && iteration - best_iteration >= cfg.early_stopping_rounds {
                info!(
                    "Early stopping at iteration {iteration}; best iteration {best_iteration} with {:.5}",
                    best_score.abs()
                );
                stopped_early = true;
                break;
            }
        }

        let iterations_run = trees.len();
        trees.truncate(best_iteration + 1);
        debug!("Keeping {} of {} trees", trees.len(), iterations_run);

        let model = GbmModel::new(n_features, base_score, cfg.learning_rate, scale_pos_weight, trees);
        Ok(GbmTrainingOutcome {
            model,
            best_iteration,
            best_score: best_score.abs(),
            iterations_run,
            scale_pos_weight,
            stopped_early,
        })
    }
}

fn bin_features(manifest: &FeatureManifest, train: &[FeatureVector], max_bins: usize) -> Vec<BinnedFeature> {
    manifest
        .features()
        .par_iter()
        .enumerate()
        .map(|(j, spec)| match spec.kind {
            FeatureKind::Numeric => {
                let values: Vec<f64> = train.iter().map(|x| x.numeric(j)).collect();
                BinnedFeature::numeric(&values, max_bins)
            }
            FeatureKind::Categorical => {
                let values: Vec<&str> = train.iter().map(|x| x.category(j).unwrap_or(MISSING_CATEGORY)).collect();
                BinnedFeature::categorical(&values)
            }
        })
        .collect()
}

struct TreeBuilder<'a> {
    config: &'a GbmConfig,
    binned: &'a [BinnedFeature],
    grad: &'a [f64],
    hess: &'a [f64],
    level_features: &'a [Vec<usize>],
    nodes: Vec<TreeNode>,
}

impl TreeBuilder<'_> {
    fn build(mut self, rows: Vec<u32>) -> Tree {
        self.grow(rows, 0);
        Tree::from_nodes(self.nodes)
    }

    fn totals(&self, rows: &[u32]) -> BinStats {
        rows.iter().fold(BinStats::default(), |mut acc, &r| {
            acc.grad += self.grad[r as usize];
            acc.hess += self.hess[r as usize];
            acc.count += 1;
            acc
        })
    }

    fn leaf_value(&self, stats: &BinStats) -> f64 {
        -stats.grad / (stats.hess + self.config.l2_leaf_reg) * self.config.learning_rate
    }

    fn grow(&mut self, rows: Vec<u32>, depth: usize) -> usize {
        let idx = self.nodes.len();
        let totals = self.totals(&rows);
        self.nodes.push(TreeNode::Leaf { value: self.leaf_value(&totals), cover: totals.hess });

        if depth >= self.config.max_depth || rows.len() < 2 {
            return idx;
        }
        let Some(best) = self.best_split(&rows, &totals, depth) else {
            return idx;
        };

        let feature = &self.binned[best.feature];
        let (left_rows, right_rows): (Vec<u32>, Vec<u32>) = rows.iter().partition(|&&r| {
            let bin = feature.bins[r as usize];
            match &best.partition {
                Partition::Numeric { bin: cut, missing_left } => {
                    if Some(bin) == feature.missing_bin {
                        *missing_left
                    } else {
                        bin <= *cut
                    }
                }
                Partition::Categorical { left, .. } => left.contains(&bin),
            }
        });
        drop(rows);

        let rule = match &best.partition {
            Partition::Numeric { bin, missing_left } => SplitRule::Numeric {
                threshold: feature.thresholds[*bin as usize],
                missing_left: *missing_left,
            },
            Partition::Categorical { left, right, default_left } => SplitRule::Categorical {
                left: left.iter().map(|&b| feature.categories[b as usize].clone()).collect(),
                right: right.iter().map(|&b| feature.categories[b as usize].clone()).collect(),
                default_left: *default_left,
            },
        };

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[idx] = TreeNode::Split {
            feature: best.feature,
            rule,
            left,
            right,
            cover: totals.hess,
            gain: best.gain,
        };
        idx
    }

    fn best_split(&self, rows: &[u32], totals: &BinStats, depth: usize) -> Option<Candidate> {
        let features = &self.level_features[depth.min(self.level_features.len() - 1)];
        let candidates: Vec<Option<Candidate>> = features
            .par_iter()
            .map(|&f| {
                let feature = &self.binned[f];
                let mut hist = vec![BinStats::default(); feature.n_bins];
                for &r in rows {
                    let s = &mut hist[feature.bins[r as usize] as usize];
                    s.grad += self.grad[r as usize];
                    s.hess += self.hess[r as usize];
                    s.count += 1;
                }
                match feature.kind {
                    FeatureKind::Numeric => self.scan_numeric(f, feature, &hist, totals),
                    FeatureKind::Categorical => self.scan_categorical(f, feature, &hist, totals),
                }
            })
            .collect();

        // Highest gain wins; ties go to the lower slot so results do not depend on scheduling
        candidates.into_iter().flatten().fold(None, |best: Option<Candidate>, c| match best {
            Some(b) if b.gain >= c.gain => Some(b),
            _ => Some(c),
        })
    }

    fn gain(&self, left: &BinStats, right: &BinStats, total: &BinStats) -> f64 {
        let lambda = self.config.l2_leaf_reg;
        let score = |s: &BinStats| s.grad * s.grad / (s.hess + lambda);
        0.5 * (score(left) + score(right) - score(total))
    }

    fn admissible(&self, left: &BinStats, right: &BinStats, gain: f64) -> bool {
        left.count > 0
            && right.count > 0
            && left.hess >= self.config.min_child_weight
            && right.hess >= self.config.min_child_weight
            && gain > self.config.min_split_gain
            && gain > 1e-12
    }

    fn scan_numeric(&self, f: usize, feature: &BinnedFeature, hist: &[BinStats], totals: &BinStats) -> Option<Candidate> {
        let missing = feature.missing_bin.map(|b| hist[b as usize]).unwrap_or_default();
        let mut best: Option<Candidate> = None;
        let mut cum = BinStats::default();
        for b in 0..feature.thresholds.len() {
            cum.add(&hist[b]);
            let directions: &[bool] = if missing.count > 0 { &[true, false] } else { &[false] };
            for &missing_left in directions {
                let mut left = cum;
                if missing_left {
                    left.add(&missing);
                }
                let right = totals.minus(&left);
                let gain = self.gain(&left, &right, totals);
                if !self.admissible(&left, &right, gain) {
                    continue;
                }
                if best.as_ref().map_or(true, |c| gain > c.gain) {
                    // With no missing rows here, NaN at inference follows the heavier side
                    let missing_left = if missing.count > 0 { missing_left } else { left.hess >= right.hess };
                    best = Some(Candidate {
                        feature: f,
                        gain,
                        partition: Partition::Numeric { bin: b as u32, missing_left },
                    });
                }
            }
        }
        best
    }

    fn scan_categorical(
        &self,
        f: usize,
        feature: &BinnedFeature,
        hist: &[BinStats],
        totals: &BinStats,
    ) -> Option<Candidate> {
        let lambda = self.config.l2_leaf_reg;
        let mut present: Vec<u32> = (0..hist.len() as u32).filter(|&b| hist[b as usize].count > 0).collect();
        if present.len() < 2 {
            return None;
        }
        present.sort_by(|&a, &b| {
            let ra = hist[a as usize].grad / (hist[a as usize].hess + lambda);
            let rb = hist[b as usize].grad / (hist[b as usize].hess + lambda);
            ra.total_cmp(&rb).then(a.cmp(&b))
        });

        let mut best: Option<(f64, usize, BinStats)> = None;
        let mut cum = BinStats::default();
        for (i, &b) in present.iter().enumerate().take(present.len() - 1) {
            cum.add(&hist[b as usize]);
            let right = totals.minus(&cum);
            let gain = self.gain(&cum, &right, totals);
            if self.admissible(&cum, &right, gain) && best.as_ref().map_or(true, |(g, _, _)| gain > *g) {
                best = Some((gain, i + 1, cum));
            }
        }

        let (gain, cut, left_stats) = best?;
        let left: BTreeSet<u32> = present[..cut].iter().copied().collect();
        let right: BTreeSet<u32> = present[cut..].iter().copied().collect();
        let missing_id = feature.categories.iter().position(|c| c == MISSING_CATEGORY).map(|i| i as u32);
        let default_left = match missing_id {
            Some(id) if left.contains(&id) => true,
            Some(id) if right.contains(&id) => false,
            _ => left_stats.hess >= totals.hess - left_stats.hess,
        };
        Some(Candidate { feature: f, gain, partition: Partition::Categorical { left, right, default_left } })
    }
}
