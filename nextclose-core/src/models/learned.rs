//! Learned-sequence family: autoregressive ridge regression.
//!
//! For each as-of point the model is fit on the trailing `train_window` closes
//! of the prefix only. Closes are min–max scaled with bounds taken from that
//! same training slice, every `lookback` window predicts the observation that
//! follows it, and the fitted weights are applied to the final `lookback`
//! closes. Nothing after the as-of point participates in scaling or fitting.

use super::{insufficient, ForecastModel, ModelFamily};
use crate::error::ModelError;
use ndarray::{s, Array1, Array2, ArrayView1};

/// Scaler ranges narrower than this are treated as a flat series.
const FLAT_RANGE: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct LearnedSequence {
    name: String,
    lookback: usize,
    train_window: usize,
    ridge: f64,
    min_history: usize,
}

impl LearnedSequence {
    pub fn new(
        name: impl Into<String>,
        lookback: usize,
        train_window: usize,
        ridge: f64,
        min_history: usize,
    ) -> Self {
        let lookback = lookback.max(1);
        Self {
            name: name.into(),
            lookback,
            train_window: train_window.max(lookback + 2),
            ridge,
            min_history: min_history.max(lookback + 2),
        }
    }

    fn numeric(&self, reason: impl Into<String>) -> ModelError {
        ModelError::Numeric {
            model: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl ForecastModel for LearnedSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::LearnedSequence
    }

    fn min_history(&self) -> usize {
        self.min_history
    }

    fn predict_next(&self, history: &[f64]) -> Result<f64, ModelError> {
        let n = history.len();
        let needed = self.lookback + 2;
        if n < needed {
            return Err(insufficient(&self.name, needed, n));
        }

        let slice = &history[n - self.train_window.min(n)..];
        let (lo, hi) = slice
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !(lo.is_finite() && hi.is_finite()) {
            return Err(self.numeric("non-finite close in training slice"));
        }
        let last = slice[slice.len() - 1];
        let range = hi - lo;
        if range < FLAT_RANGE {
            return Ok(last);
        }
        let scaled: Vec<f64> = slice.iter().map(|v| (v - lo) / range).collect();

        // Design matrix: one row per lookback window, trailing intercept column.
        let k = self.lookback + 1;
        let rows = scaled.len() - self.lookback;
        let mut x = Array2::<f64>::ones((rows, k));
        for (r, mut row) in x.rows_mut().into_iter().enumerate() {
            row.slice_mut(s![..self.lookback])
                .assign(&ArrayView1::from(&scaled[r..r + self.lookback]));
        }
        let y = ArrayView1::from(&scaled[self.lookback..]);

        let mut xtx = x.t().dot(&x);
        for a in 0..self.lookback {
            xtx[[a, a]] += self.ridge;
        }
        let xty = x.t().dot(&y);

        let weights = solve(xtx, xty).ok_or_else(|| self.numeric("singular normal equations"))?;

        let mut features = Array1::<f64>::ones(k);
        features
            .slice_mut(s![..self.lookback])
            .assign(&ArrayView1::from(&scaled[scaled.len() - self.lookback..]));
        let prediction = features.dot(&weights) * range + lo;

        if !prediction.is_finite() {
            return Err(self.numeric(format!("non-finite prediction {prediction}")));
        }
        Ok(prediction)
    }
}

/// Gaussian elimination with partial pivoting. `None` when singular.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for c in 0..n {
                a.swap([col, c], [pivot, c]);
            }
            b.swap(col, pivot);
        }

        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for c in col..n {
                a[[row, c]] -= factor * a[[col, c]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|c| a[[row, c]] * x[c]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}
