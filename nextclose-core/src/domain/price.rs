//! PricePoint — one trading session of one entity.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily OHLCV row for a single entity on a single trading session.
///
/// Natural key: `(entity_id, trade_date)`. Within one entity, rows are stored
/// and returned in strictly increasing `trade_date` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub entity_id: String,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjusted_close: Option<f64>,
    /// Shares traded. `None` when the upstream feed has no volume for the day.
    pub volume: Option<i64>,
    /// Fractional change of `close` against the previous stored session.
    pub change: Option<f64>,
}

impl PricePoint {
    /// Convenience constructor for a bar with only a close known.
    ///
    /// OHL are set to the close; volume and adjustments are left empty.
    pub fn from_close(entity_id: impl Into<String>, trade_date: NaiveDate, close: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            trade_date,
            open: close,
            high: close,
            low: close,
            close,
            adjusted_close: None,
            volume: None,
            change: None,
        }
    }

    /// True when every OHLC field is finite and strictly positive.
    pub fn has_valid_prices(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }

    /// High/low bracket the open and close.
    pub fn is_consistent(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

/// Extract the close sequence from rows already sorted by date.
pub fn closes(rows: &[PricePoint]) -> Vec<f64> {
    rows.iter().map(|p| p.close).collect()
}
