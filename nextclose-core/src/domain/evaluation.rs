//! EvaluationRecord — one forecast scored against its realized close.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Score of a forecast once the next session's close exists.
///
/// Shares the forecast's natural key; recomputation overwrites the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub as_of: NaiveDate,
    pub entity_id: String,
    pub model_name: String,
    pub horizon: u32,
    pub predicted_value: f64,
    pub realized_value: f64,
    pub absolute_error: f64,
    pub direction_correct: bool,
}
