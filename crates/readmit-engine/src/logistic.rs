//! Small dense logistic regression shared by the Platt calibrator and the meta-learner.
//!
//! Minimises `Σ logloss + ½·l2·‖w‖²` with Newton steps; the intercept is not penalised.

use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt, Solve as FaerSolve};
use faer::Mat as FaerMat;
use faer::Side;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use readmit_common::{ReadmitError, Result};

const MAX_NEWTON_STEPS: usize = 100;
const NEWTON_TOLERANCE: f64 = 1e-10;

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Log-odds of a probability, clipped so 0 and 1 stay finite.
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-12, 1.0 - 1e-12);
    (p / (1.0 - p)).ln()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    pub fn decision(&self, x: &[f64]) -> f64 {
        self.intercept + self.weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>()
    }

    pub fn predict_proba(&self, x: &[f64]) -> f64 {
        sigmoid(self.decision(x))
    }

    /// Fit on dense rows. Every row must have the same width.
    pub fn fit(rows: &[Vec<f64>], labels: &[u8], l2: f64) -> Result<Self> {
        if rows.is_empty() || rows.len() != labels.len() {
            return Err(ReadmitError::Training(format!(
                "logistic fit needs matching non-empty inputs ({} rows, {} labels)",
                rows.len(),
                labels.len()
            )));
        }
        let d = rows[0].len();
        if rows.iter().any(|r| r.len() != d) {
            return Err(ReadmitError::Training("logistic fit rows have uneven width".into()));
        }
        if rows.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ReadmitError::Training("logistic fit input is not finite".into()));
        }
        let positives = labels.iter().filter(|&&y| y == 1).count();
        if positives == 0 || positives == labels.len() {
            return Err(ReadmitError::InsufficientData("logistic fit needs both classes".into()));
        }

        // Design columns: [x_0 .. x_{d-1}, 1]
        let n = rows.len();
        let p = d + 1;
        let x = Array2::from_shape_fn((n, p), |(i, j)| if j == d { 1.0 } else { rows[i][j] });
        let y = Array1::from_iter(labels.iter().map(|&v| f64::from(v)));
        let mut ridge = Array1::from_elem(p, l2);
        ridge[d] = 1e-9;

        let prior = positives as f64 / n as f64;
        let mut beta = Array1::<f64>::zeros(p);
        beta[d] = logit(prior);

        for _ in 0..MAX_NEWTON_STEPS {
            let mu = x.dot(&beta).mapv(sigmoid);
            let weights = mu.mapv(|m| (m * (1.0 - m)).max(1e-12));
            let mut grad = x.t().dot(&(&mu - &y));
            grad.slice_mut(s![..d]).scaled_add(l2, &beta.slice(s![..d]));
            let weighted = &x * &weights.view().insert_axis(Axis(1));
            let mut hess = x.t().dot(&weighted);
            hess.diag_mut().zip_mut_with(&ridge, |h, r| *h += r);

            let step = solve(&hess, &grad)?;
            let max_step = step.fold(0.0f64, |m, s| m.max(s.abs()));

            // Step halving keeps the objective non-increasing on badly scaled inputs
            let current = objective(&x, &y, beta.view(), l2);
            let mut scale = 1.0;
            let mut candidate = beta.clone();
            for _ in 0..30 {
                candidate = &beta - &(&step * scale);
                if objective(&x, &y, candidate.view(), l2) <= current + 1e-12 {
                    break;
                }
                scale *= 0.5;
            }
            beta = candidate;
            if max_step * scale < NEWTON_TOLERANCE {
                break;
            }
        }

        if beta.iter().any(|b| !b.is_finite()) {
            return Err(ReadmitError::Training("logistic fit diverged".into()));
        }
        Ok(Self { weights: beta.slice(s![..d]).to_vec(), intercept: beta[d] })
    }
}

fn objective(x: &Array2<f64>, y: &Array1<f64>, beta: ArrayView1<'_, f64>, l2: f64) -> f64 {
    let d = beta.len() - 1;
    let z = x.dot(&beta);
    // log(1 + e^z) - y·z, computed stably
    let loss: f64 = z
        .iter()
        .zip(y)
        .map(|(&z, &y)| {
            let softplus = if z > 0.0 { z + (-z).exp().ln_1p() } else { z.exp().ln_1p() };
            softplus - y * z
        })
        .sum();
    let w = beta.slice(s![..d]);
    loss + 0.5 * l2 * w.dot(&w)
}

/// Solve the symmetric Newton system; Cholesky first, LDLᵀ when it is not positive definite.
fn solve(hess: &Array2<f64>, grad: &Array1<f64>) -> Result<Array1<f64>> {
    let p = grad.len();
    let h = FaerMat::<f64>::from_fn(p, p, |i, j| hess[[i, j]]);
    let rhs = FaerMat::<f64>::from_fn(p, 1, |i, _| grad[i]);
    let sol = match FaerLlt::new(h.as_ref(), Side::Lower) {
        Ok(llt) => llt.solve(rhs.as_ref()),
        Err(_) => FaerLdlt::new(h.as_ref(), Side::Lower)
            .map_err(|_| ReadmitError::Training("singular system in logistic fit".into()))?
            .solve(rhs.as_ref()),
    };
    let step = Array1::from_shape_fn(p, |i| sol[(i, 0)]);
    if step.iter().any(|v| !v.is_finite()) {
        return Err(ReadmitError::Training("singular system in logistic fit".into()));
    }
    Ok(step)
}
