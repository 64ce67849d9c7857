//! Deterministic synthetic source for development and tests.
//!
//! A weekday random walk from 100.0 seeded by the BLAKE3 hash of the entity
//! id. The walk always starts at a fixed anchor date, so the row for a given
//! (entity, date) is identical no matter which window requested it. This keeps
//! incremental ingestion consistent with a full backfill.

use super::provider::{FetchError, PriceSource};
use crate::domain::PricePoint;
use chrono::{Datelike, NaiveDate, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// First session of every synthetic walk.
pub fn anchor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticSource;

impl SyntheticSource {
    pub fn new() -> Self {
        Self
    }
}

/// Generate the walk for `entity_id` and keep rows within `[start, end]`.
pub fn synthetic_rows(entity_id: &str, start: NaiveDate, end: NaiveDate) -> Vec<PricePoint> {
    let seed: [u8; 32] = *blake3::hash(entity_id.as_bytes()).as_bytes();
    let mut rng = StdRng::from_seed(seed);

    let mut rows = Vec::new();
    let mut price = 100.0_f64;
    let mut current = anchor();

    while current <= end {
        if matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
            current += chrono::Duration::days(1);
            continue;
        }

        let daily_return: f64 = rng.gen_range(-0.03..0.03);
        let open = price;
        let close = price * (1.0 + daily_return);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
        let volume = rng.gen_range(500_000..5_000_000_i64);

        if current >= start {
            rows.push(PricePoint {
                entity_id: entity_id.to_string(),
                trade_date: current,
                open,
                high,
                low,
                close,
                adjusted_close: Some(close),
                volume: Some(volume),
                change: None,
            });
        }

        price = close;
        current += chrono::Duration::days(1);
    }

    rows
}

impl PriceSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError> {
        Ok(synthetic_rows(entity_id, start, end))
    }
}
