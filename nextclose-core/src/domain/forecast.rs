//! Forecast rows — base model output and ensemble aggregates share one shape.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Sessions ahead being predicted. Only next-session forecasts are produced.
pub const HORIZON: u32 = 1;

/// A single prediction of the close `horizon` sessions after `as_of`.
///
/// Natural key: `(as_of, entity_id, model_name, horizon)`. The value must be
/// derivable from prices with `trade_date <= as_of` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    /// Last session whose close was known when the prediction was made.
    pub as_of: NaiveDate,
    pub entity_id: String,
    pub model_name: String,
    pub horizon: u32,
    pub predicted_value: f64,
}

/// Ensemble rows are plain forecasts whose `model_name` is an aggregator name.
pub type EnsembleForecast = Forecast;

impl Forecast {
    pub fn new(
        as_of: NaiveDate,
        entity_id: impl Into<String>,
        model_name: impl Into<String>,
        predicted_value: f64,
    ) -> Self {
        Self {
            as_of,
            entity_id: entity_id.into(),
            model_name: model_name.into(),
            horizon: HORIZON,
            predicted_value,
        }
    }
}
