//! Simple exponential smoothing.
//!
//! `level[0] = close[0]`, `level[i] = alpha * close[i] + (1 - alpha) * level[i-1]`.
//! The forecast for session `i+1` is `level[i]`. Forecasts start once
//! `min_history` observations exist (warm-up, default 5).

use super::{insufficient, ForecastModel, ModelFamily};
use crate::error::ModelError;

#[derive(Debug, Clone)]
pub struct ExponentialSmoothing {
    name: String,
    alpha: f64,
    min_history: usize,
}

impl ExponentialSmoothing {
    pub fn new(name: impl Into<String>, alpha: f64, min_history: usize) -> Self {
        Self {
            name: name.into(),
            alpha,
            min_history: min_history.max(1),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

/// Smoothed level after each close.
fn levels(alpha: f64, closes: &[f64]) -> impl Iterator<Item = f64> + '_ {
    closes.iter().scan(None, move |level: &mut Option<f64>, &c| {
        let next = match *level {
            None => c,
            Some(prev) => alpha * c + (1.0 - alpha) * prev,
        };
        *level = Some(next);
        Some(next)
    })
}

impl ForecastModel for ExponentialSmoothing {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::ExponentialSmoothing
    }

    fn min_history(&self) -> usize {
        self.min_history
    }

    fn predict_next(&self, history: &[f64]) -> Result<f64, ModelError> {
        levels(self.alpha, history)
            .last()
            .ok_or_else(|| insufficient(&self.name, 1, 0))
    }

    fn predict_range(&self, closes: &[f64], from: usize) -> Result<Vec<f64>, ModelError> {
        if from >= closes.len() {
            return Ok(Vec::new());
        }
        Ok(levels(self.alpha, closes).skip(from).collect())
    }
}
