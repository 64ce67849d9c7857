//! Yahoo Finance source.
//!
//! Fetches daily OHLCV rows from the v8 chart API with retry, exponential
//! backoff and a shared circuit breaker. Non-US listings need an exchange
//! suffix on the ticker (`005930` + `.KS`), which is applied to the request
//! only; returned rows carry the bare entity id.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{FetchError, PriceSource};
use crate::domain::PricePoint;
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<i64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

pub struct YahooSource {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    suffix: String,
    max_retries: u32,
    base_delay: Duration,
}

impl YahooSource {
    pub fn new(
        circuit_breaker: Arc<CircuitBreaker>,
        suffix: impl Into<String>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| FetchError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            suffix: suffix.into(),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    fn symbol(&self, entity_id: &str) -> String {
        format!("{entity_id}{}", self.suffix)
    }

    fn chart_url(symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start.and_time(NaiveTime::MIN).and_utc().timestamp();
        let end_ts = end.and_time(NaiveTime::MIN).and_utc().timestamp() + 86_399;
        format!(
            "https://query2.finance.yahoo.com/v8/finance/chart/{symbol}\
             ?period1={start_ts}&period2={end_ts}&interval=1d\
             &includeAdjustedClose=true"
        )
    }

    /// Missing fields become NaN so cleaning rejects the row with a reason.
    fn parse_response(
        entity_id: &str,
        resp: ChartResponse,
    ) -> Result<Vec<PricePoint>, FetchError> {
        let result = match (resp.chart.result, resp.chart.error) {
            (Some(result), _) => result,
            (None, Some(err)) if err.code == "Not Found" => {
                return Err(FetchError::EntityNotFound {
                    entity_id: entity_id.to_string(),
                })
            }
            (None, Some(err)) => {
                return Err(FetchError::ResponseFormatChanged(format!(
                    "{}: {}",
                    err.code, err.description
                )))
            }
            (None, None) => {
                return Err(FetchError::ResponseFormatChanged(
                    "empty result with no error".into(),
                ))
            }
        };

        let data = result
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::ResponseFormatChanged("result array is empty".into()))?;

        // A window with no sessions comes back without timestamps.
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::ResponseFormatChanged("no quote data".into()))?;

        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let mut rows = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let trade_date = chrono::DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.naive_utc().date())
                .ok_or_else(|| {
                    FetchError::ResponseFormatChanged(format!("invalid timestamp: {ts}"))
                })?;

            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();

            if open.is_none() && high.is_none() && low.is_none() && close.is_none() {
                continue;
            }

            rows.push(PricePoint {
                entity_id: entity_id.to_string(),
                trade_date,
                open: open.unwrap_or(f64::NAN),
                high: high.unwrap_or(f64::NAN),
                low: low.unwrap_or(f64::NAN),
                close: close.unwrap_or(f64::NAN),
                adjusted_close: adj_closes
                    .as_ref()
                    .and_then(|v| v.get(i).copied().flatten()),
                volume,
                change: None,
            });
        }

        Ok(rows)
    }

    fn fetch_with_retry(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }

        let symbol = self.symbol(entity_id);
        let url = Self::chart_url(&symbol, start, end);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.base_delay * 2u32.pow(attempt - 1));
            }
            if !self.circuit_breaker.is_allowed() {
                return Err(FetchError::CircuitBreakerTripped);
            }

            let resp = match self.client.get(&url).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = Some(FetchError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(FetchError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(FetchError::CircuitBreakerTripped);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(FetchError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(FetchError::EntityNotFound {
                    entity_id: entity_id.to_string(),
                });
            }
            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(FetchError::Other(format!("HTTP {status} for {symbol}")));
                continue;
            }

            let chart: ChartResponse = resp.json().map_err(|e| {
                FetchError::ResponseFormatChanged(format!("failed to parse response for {symbol}: {e}"))
            })?;
            let rows = Self::parse_response(entity_id, chart)?;
            self.circuit_breaker.record_success();
            return Ok(rows);
        }

        Err(last_error.unwrap_or_else(|| FetchError::Other("max retries exceeded".into())))
    }
}

impl PriceSource for YahooSource {
    fn name(&self) -> &str {
        "yahoo"
    }

    fn fetch(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError> {
        self.fetch_with_retry(entity_id, start, end)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
