//! Domain types: price rows, forecasts, evaluation records.

pub mod evaluation;
pub mod forecast;
pub mod price;

pub use evaluation::EvaluationRecord;
pub use forecast::{EnsembleForecast, Forecast, HORIZON};
pub use price::{closes, PricePoint};
