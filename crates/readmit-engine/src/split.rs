//! Deterministic stratified train/validation partitioning.
//!
//! One [`TrainValSplit`] is derived per training run and handed to every learner,
//! the calibrator and the meta-learner so their validation numbers are comparable.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use readmit_common::{ReadmitError, Result};

/// Row indices of a stratified partition. Both index lists are sorted ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainValSplit {
    pub seed: u64,
    pub n_rows: usize,
    pub validation_fraction: f64,
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

impl TrainValSplit {
    /// Labels of the training rows, in index order.
    pub fn train_labels(&self, labels: &[u8]) -> Vec<u8> {
        self.train.iter().map(|&i| labels[i]).collect()
    }

    pub fn validation_labels(&self, labels: &[u8]) -> Vec<u8> {
        self.validation.iter().map(|&i| labels[i]).collect()
    }

    /// Pick the rows of `items` belonging to the training partition.
    pub fn select_train<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.train.iter().map(|&i| items[i].clone()).collect()
    }

    pub fn select_validation<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.validation.iter().map(|&i| items[i].clone()).collect()
    }
}

/// Seeded stratified splitter.
#[derive(Debug, Clone, Copy)]
pub struct SplitProvider {
    seed: u64,
    validation_fraction: f64,
}

impl SplitProvider {
    pub fn new(seed: u64, validation_fraction: f64) -> Result<Self> {
        if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
            return Err(ReadmitError::Config(format!(
                "validation fraction must be in (0, 1), got {validation_fraction}"
            )));
        }
        Ok(Self { seed, validation_fraction })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Partition rows so each class keeps its proportion in both subsets.
    /// The same seed and labels always yield the same indices.
    pub fn split(&self, labels: &[u8]) -> Result<TrainValSplit> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut train = Vec::with_capacity(labels.len());
        let mut validation = Vec::new();

        for class in [0u8, 1u8] {
            let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
            if members.len() < 2 {
                return Err(ReadmitError::InsufficientData(format!(
                    "class {class} has {} rows; a stratified split needs at least 2",
                    members.len()
                )));
            }
            members.shuffle(&mut rng);
            let n_val = ((members.len() as f64) * self.validation_fraction).round() as usize;
            let n_val = n_val.clamp(1, members.len() - 1);
            validation.extend_from_slice(&members[..n_val]);
            train.extend_from_slice(&members[n_val..]);
        }

        train.sort_unstable();
        validation.sort_unstable();
        Ok(TrainValSplit {
            seed: self.seed,
            n_rows: labels.len(),
            validation_fraction: self.validation_fraction,
            train,
            validation,
        })
    }

    /// Stratified k-fold assignment over `labels`; returns the fold id of each position.
    pub fn stratified_folds(&self, labels: &[u8], k: usize) -> Result<Vec<usize>> {
        if k < 2 {
            return Err(ReadmitError::Config(format!("need at least 2 folds, got {k}")));
        }
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
        let mut folds = vec![0usize; labels.len()];
        for class in [0u8, 1u8] {
            let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
            if members.len() < k {
                return Err(ReadmitError::InsufficientData(format!(
                    "class {class} has {} rows, fewer than {k} folds",
                    members.len()
                )));
            }
            members.shuffle(&mut rng);
            for (pos, &row) in members.iter().enumerate() {
                folds[row] = pos % k;
            }
        }
        Ok(folds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<u8> {
        (0..500).map(|i| u8::from(i % 9 == 0)).collect()
    }

    #[test]
    fn test_split_is_reproducible() {
        let provider = SplitProvider::new(42, 0.2).unwrap();
        let a = provider.split(&labels()).unwrap();
        let b = provider.split(&labels()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap(),
        );
    }

    #[test]
    fn test_split_partitions_all_rows() {
        let l = labels();
        let s = SplitProvider::new(7, 0.2).unwrap().split(&l).unwrap();
        let mut all: Vec<usize> = s.train.iter().chain(s.validation.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..l.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_preserves_class_ratio() {
        let l = labels();
        let s = SplitProvider::new(42, 0.2).unwrap().split(&l).unwrap();
        let rate = |idx: &[usize]| idx.iter().filter(|&&i| l[i] == 1).count() as f64 / idx.len() as f64;
        let overall = l.iter().filter(|&&x| x == 1).count() as f64 / l.len() as f64;
        assert!((rate(&s.train) - overall).abs() < 0.01);
        assert!((rate(&s.validation) - overall).abs() < 0.01);
        assert_eq!(s.validation.len(), 100);
    }

    #[test]
    fn test_different_seed_changes_split() {
        let l = labels();
        let a = SplitProvider::new(1, 0.2).unwrap().split(&l).unwrap();
        let b = SplitProvider::new(2, 0.2).unwrap().split(&l).unwrap();
        assert_ne!(a.validation, b.validation);
    }

    #[test]
    fn test_tiny_class_rejected() {
        let l = vec![0, 0, 0, 1];
        assert!(SplitProvider::new(42, 0.2).unwrap().split(&l).is_err());
    }

    #[test]
    fn test_folds_balanced() {
        let l = labels();
        let folds = SplitProvider::new(42, 0.2).unwrap().stratified_folds(&l, 5).unwrap();
        for k in 0..5 {
            let positives = (0..l.len()).filter(|&i| folds[i] == k && l[i] == 1).count();
            assert!((11..=12).contains(&positives));
        }
    }
}
