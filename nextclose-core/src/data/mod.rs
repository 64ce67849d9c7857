//! Upstream price sources, cleaning and incremental fetch planning.

pub mod circuit_breaker;
pub mod clean;
pub mod csv_source;
pub mod planner;
pub mod provider;
pub mod synthetic;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use clean::{clean_batch, CleanBatch};
pub use csv_source::CsvSource;
pub use planner::{BackfillPolicy, FetchPlan, FetchPlanner, FetchTask};
pub use provider::{FetchError, PriceSource, SourceChain};
pub use synthetic::SyntheticSource;
pub use yahoo::YahooSource;
