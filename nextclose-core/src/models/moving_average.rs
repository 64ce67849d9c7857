//! Moving-average family: next close = mean of the last `window` closes.

use super::{insufficient, ForecastModel, ModelFamily};
use crate::error::ModelError;

#[derive(Debug, Clone)]
pub struct MovingAverage {
    name: String,
    window: usize,
    min_history: usize,
}

impl MovingAverage {
    pub fn new(name: impl Into<String>, window: usize, min_history: usize) -> Self {
        Self {
            name: name.into(),
            window: window.max(1),
            min_history: min_history.max(window),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl ForecastModel for MovingAverage {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::MovingAverage
    }

    fn min_history(&self) -> usize {
        self.min_history
    }

    fn predict_next(&self, history: &[f64]) -> Result<f64, ModelError> {
        if history.len() < self.window {
            return Err(insufficient(&self.name, self.window, history.len()));
        }
        let tail = &history[history.len() - self.window..];
        Ok(tail.iter().sum::<f64>() / self.window as f64)
    }

    /// Each window is summed on its own, in the same order as `predict_next`,
    /// so the value at an as-of index never depends on where the range starts.
    fn predict_range(&self, closes: &[f64], from: usize) -> Result<Vec<f64>, ModelError> {
        let w = self.window;
        if from + 1 < w {
            return Err(insufficient(&self.name, w, from + 1));
        }
        if from >= closes.len() {
            return Ok(Vec::new());
        }
        Ok(closes[from + 1 - w..]
            .windows(w)
            .map(|tail| tail.iter().sum::<f64>() / w as f64)
            .collect())
    }
}
