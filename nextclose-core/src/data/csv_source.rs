//! CSV drop-folder source: one `{dir}/{entity_id}.csv` file per entity.
//!
//! Header: `date,open,high,low,close[,adj_close][,volume]`, ISO dates. Empty
//! optional cells are read as missing.

use super::provider::{FetchError, PriceSource};
use crate::domain::PricePoint;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct CsvRow {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    adj_close: Option<f64>,
    #[serde(default)]
    volume: Option<i64>,
}

pub struct CsvSource {
    dir: PathBuf,
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, entity_id: &str) -> PathBuf {
        self.dir.join(format!("{entity_id}.csv"))
    }
}

impl PriceSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError> {
        let path = self.path_for(entity_id);
        if !path.exists() {
            return Err(FetchError::EntityNotFound {
                entity_id: entity_id.to_string(),
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| FetchError::Io(format!("{}: {e}", path.display())))?;

        let mut rows = Vec::new();
        for (line, record) in reader.deserialize::<CsvRow>().enumerate() {
            let r = record.map_err(|e| {
                FetchError::ResponseFormatChanged(format!(
                    "{} row {}: {e}",
                    path.display(),
                    line + 1
                ))
            })?;
            if r.date < start || r.date > end {
                continue;
            }
            rows.push(PricePoint {
                entity_id: entity_id.to_string(),
                trade_date: r.date,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                adjusted_close: r.adj_close,
                volume: r.volume,
                change: None,
            });
        }
        Ok(rows)
    }
}
