//! Upstream price sources.
//!
//! `PriceSource` abstracts over where raw daily rows come from (Yahoo, CSV
//! drops, a synthetic walk) so sources can be chained and mocked in tests.
//! Sources return rows as delivered; cleaning happens afterwards in
//! [`clean_batch`](super::clean::clean_batch).

use crate::domain::PricePoint;
use chrono::NaiveDate;
use thiserror::Error;

/// Failure fetching one entity from an upstream source. Never fatal to a batch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by upstream (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("entity not found upstream: {entity_id}")]
    EntityNotFound { entity_id: String },

    #[error("upstream has blocked requests (circuit breaker open)")]
    CircuitBreakerTripped,

    #[error("source I/O error: {0}")]
    Io(String),

    #[error("every source failed for {entity_id}: {}", .errors.join("; "))]
    AllSourcesFailed {
        entity_id: String,
        errors: Vec<String>,
    },

    #[error("fetch error: {0}")]
    Other(String),
}

pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    /// Raw rows for `entity_id` with `start <= trade_date <= end`.
    ///
    /// An empty vector means the source has nothing in the range (holidays,
    /// weekend-only window) and is not an error.
    fn fetch(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError>;

    /// False while the source refuses requests (rate limited, blocked).
    fn is_available(&self) -> bool {
        true
    }
}

/// Ordered fallback over several sources.
///
/// The first source returning a non-empty batch wins. If some source answered
/// with an empty batch and none returned data, the result is empty. The chain
/// fails only when every source errored or was unavailable.
pub struct SourceChain {
    sources: Vec<Box<dyn PriceSource>>,
}

impl SourceChain {
    pub fn new(sources: Vec<Box<dyn PriceSource>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

impl PriceSource for SourceChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn fetch(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError> {
        let mut errors = Vec::new();
        let mut answered_empty = false;

        for source in &self.sources {
            if !source.is_available() {
                errors.push(format!("{}: unavailable", source.name()));
                continue;
            }
            match source.fetch(entity_id, start, end) {
                Ok(rows) if !rows.is_empty() => {
                    log::debug!(
                        "{entity_id}: {} rows from {} ({start}..={end})",
                        rows.len(),
                        source.name()
                    );
                    return Ok(rows);
                }
                Ok(_) => answered_empty = true,
                Err(e) => {
                    log::debug!("{entity_id}: {} failed: {e}", source.name());
                    errors.push(format!("{}: {e}", source.name()));
                }
            }
        }

        if answered_empty || errors.is_empty() {
            return Ok(Vec::new());
        }
        Err(FetchError::AllSourcesFailed {
            entity_id: entity_id.to_string(),
            errors,
        })
    }

    fn is_available(&self) -> bool {
        self.sources.iter().any(|s| s.is_available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        result: fn(&str) -> Result<Vec<PricePoint>, FetchError>,
        available: bool,
    }

    impl PriceSource for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn fetch(
            &self,
            entity_id: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<PricePoint>, FetchError> {
            (self.result)(entity_id)
        }

        fn is_available(&self) -> bool {
            self.available
        }
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn one_row(entity: &str) -> Result<Vec<PricePoint>, FetchError> {
        Ok(vec![PricePoint::from_close(entity, d(3), 10.0)])
    }

    fn empty(_: &str) -> Result<Vec<PricePoint>, FetchError> {
        Ok(Vec::new())
    }

    fn failing(_: &str) -> Result<Vec<PricePoint>, FetchError> {
        Err(FetchError::NetworkUnreachable("down".into()))
    }

    fn src(
        name: &'static str,
        result: fn(&str) -> Result<Vec<PricePoint>, FetchError>,
    ) -> Box<dyn PriceSource> {
        Box::new(Fixed {
            name,
            result,
            available: true,
        })
    }

    #[test]
    fn falls_through_to_first_non_empty() {
        let chain = SourceChain::new(vec![src("a", failing), src("b", empty), src("c", one_row)]);
        let rows = chain.fetch("X", d(1), d(5)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "X");
    }

    #[test]
    fn empty_answer_is_not_failure() {
        let chain = SourceChain::new(vec![src("a", failing), src("b", empty)]);
        assert!(chain.fetch("X", d(1), d(5)).unwrap().is_empty());
    }

    #[test]
    fn all_failed_reports_every_source() {
        let unavailable = Box::new(Fixed {
            name: "b",
            result: one_row,
            available: false,
        });
        let chain = SourceChain::new(vec![src("a", failing), unavailable]);
        match chain.fetch("X", d(1), d(5)) {
            Err(FetchError::AllSourcesFailed { entity_id, errors }) => {
                assert_eq!(entity_id, "X");
                assert_eq!(errors.len(), 2);
            }
            other => panic!("expected AllSourcesFailed, got {other:?}"),
        }
    }
}
