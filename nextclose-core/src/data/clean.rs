//! Cleaning of raw upstream rows before they reach the store.
//!
//! Order of operations:
//! 1. rows for another entity are rejected
//! 2. stable sort by trade date; the first arrival of a duplicated date wins
//! 3. quality checks (volume, prices, high/low range)
//! 4. `change` against the previous close, continuing from the last stored close

use crate::domain::PricePoint;
use crate::error::DataQualityError;

/// Output of [`clean_batch`]: accepted rows in date order plus one error per
/// dropped row.
#[derive(Debug, Clone, Default)]
pub struct CleanBatch {
    pub rows: Vec<PricePoint>,
    pub rejected: Vec<DataQualityError>,
}

pub fn clean_batch(entity_id: &str, raw: Vec<PricePoint>, prev_close: Option<f64>) -> CleanBatch {
    let mut rejected = Vec::new();

    let mut rows: Vec<PricePoint> = raw
        .into_iter()
        .filter(|r| {
            if r.entity_id == entity_id {
                return true;
            }
            rejected.push(DataQualityError::EntityMismatch {
                expected: entity_id.to_string(),
                found: r.entity_id.clone(),
            });
            false
        })
        .collect();
    rows.sort_by_key(|r| r.trade_date);

    let mut kept: Vec<PricePoint> = Vec::with_capacity(rows.len());
    for row in rows {
        if kept.last().is_some_and(|k| k.trade_date == row.trade_date) {
            rejected.push(DataQualityError::DuplicateKey {
                entity_id: row.entity_id,
                date: row.trade_date,
            });
            continue;
        }
        kept.push(row);
    }

    let mut out = Vec::with_capacity(kept.len());
    let mut prev = prev_close.filter(|p| p.is_finite() && *p != 0.0);
    for mut row in kept {
        if let Err(e) = check_row(&row) {
            rejected.push(e);
            continue;
        }
        row.adjusted_close = row.adjusted_close.filter(|v| v.is_finite());
        row.change = prev.map(|p| (row.close - p) / p);
        prev = Some(row.close);
        out.push(row);
    }

    CleanBatch {
        rows: out,
        rejected,
    }
}

fn check_row(row: &PricePoint) -> Result<(), DataQualityError> {
    if let Some(volume) = row.volume.filter(|v| *v < 0) {
        return Err(DataQualityError::NegativeVolume {
            entity_id: row.entity_id.clone(),
            date: row.trade_date,
            volume,
        });
    }
    if !row.has_valid_prices() {
        return Err(DataQualityError::InvalidPrice {
            entity_id: row.entity_id.clone(),
            date: row.trade_date,
        });
    }
    if !row.is_consistent() {
        return Err(DataQualityError::InconsistentRange {
            entity_id: row.entity_id.clone(),
            date: row.trade_date,
        });
    }
    Ok(())
}
