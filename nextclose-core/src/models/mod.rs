//! Forecasting models and the registry that builds them from configuration.
//!
//! Every model answers one question: given closes up to and including the
//! as-of point, what is the next session's close? The walk-forward driver in
//! [`walk_forward`] only ever hands a model the prefix ending at the as-of
//! index, so a model cannot see the future through its inputs.

pub mod moving_average;
pub mod smoothing;
pub mod walk_forward;

#[cfg(feature = "learned")]
pub mod learned;

pub use moving_average::MovingAverage;
pub use smoothing::ExponentialSmoothing;
pub use walk_forward::{forecast_entity, walk_forward, EntityForecast, ModelSkip};

#[cfg(feature = "learned")]
pub use learned::LearnedSequence;

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ── Model trait ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    MovingAverage,
    ExponentialSmoothing,
    LearnedSequence,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MovingAverage => "moving_average",
            Self::ExponentialSmoothing => "exponential_smoothing",
            Self::LearnedSequence => "learned_sequence",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A next-close forecasting function.
pub trait ForecastModel: Send + Sync {
    /// Registered name, e.g. `safe_ma_w5`.
    fn name(&self) -> &str;

    fn family(&self) -> ModelFamily;

    /// Observations required before the first forecast. The first as-of
    /// index is `min_history - 1`.
    fn min_history(&self) -> usize;

    /// Predict the close after `history.last()`.
    fn predict_next(&self, history: &[f64]) -> Result<f64, ModelError>;

    /// Predictions for as-of indices `from..closes.len()`.
    ///
    /// Element `k` must equal `predict_next(&closes[..=from + k])`. Families
    /// with a cheap running form override this.
    fn predict_range(&self, closes: &[f64], from: usize) -> Result<Vec<f64>, ModelError> {
        (from..closes.len())
            .map(|i| self.predict_next(&closes[..=i]))
            .collect()
    }
}

pub(crate) fn insufficient(model: &str, required: usize, available: usize) -> ModelError {
    ModelError::InsufficientHistory {
        model: model.to_string(),
        required,
        available,
    }
}

// ── Specs ────────────────────────────────────────────────────────────

/// Family plus hyperparameters. Serialised with a `family` tag:
///
/// ```toml
/// model = { family = "moving_average", window = 5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ModelKind {
    MovingAverage {
        window: usize,
    },
    ExponentialSmoothing {
        alpha: f64,
        #[serde(default = "default_warmup")]
        warmup: usize,
    },
    LearnedSequence {
        #[serde(default = "default_lookback")]
        lookback: usize,
        #[serde(default = "default_train_window")]
        train_window: usize,
        #[serde(default = "default_ridge")]
        ridge: f64,
    },
}

fn default_warmup() -> usize {
    5
}

fn default_lookback() -> usize {
    20
}

fn default_train_window() -> usize {
    250
}

fn default_ridge() -> f64 {
    1e-3
}

/// Learned-family history floor when a spec does not set one.
pub const LEARNED_MIN_HISTORY: usize = 120;

impl ModelKind {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::MovingAverage { .. } => ModelFamily::MovingAverage,
            Self::ExponentialSmoothing { .. } => ModelFamily::ExponentialSmoothing,
            Self::LearnedSequence { .. } => ModelFamily::LearnedSequence,
        }
    }

    /// History the family needs by construction.
    fn intrinsic_min_history(&self) -> usize {
        match self {
            Self::MovingAverage { window } => *window,
            Self::ExponentialSmoothing { .. } => 1,
            Self::LearnedSequence { lookback, .. } => lookback + 2,
        }
    }

    fn default_min_history(&self) -> usize {
        match self {
            Self::MovingAverage { window } => *window,
            Self::ExponentialSmoothing { warmup, .. } => (*warmup).max(1),
            Self::LearnedSequence { .. } => LEARNED_MIN_HISTORY.max(self.intrinsic_min_history()),
        }
    }
}

/// One registry entry: `{ name, model = { family, ... }, min_history? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub model: ModelKind,
    #[serde(default)]
    pub min_history: Option<usize>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, model: ModelKind) -> Self {
        Self {
            name: name.into(),
            model,
            min_history: None,
        }
    }

    pub fn effective_min_history(&self) -> usize {
        self.min_history
            .unwrap_or_else(|| self.model.default_min_history())
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |reason: String| ModelError::InvalidSpec {
            model: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".into()));
        }
        match &self.model {
            ModelKind::MovingAverage { window } if *window == 0 => {
                return Err(invalid("window must be >= 1".into()))
            }
            ModelKind::ExponentialSmoothing { alpha, .. } if !(*alpha > 0.0 && *alpha <= 1.0) => {
                return Err(invalid(format!("alpha {alpha} outside (0, 1]")))
            }
            ModelKind::LearnedSequence {
                lookback,
                train_window,
                ridge,
            } => {
                if *lookback == 0 {
                    return Err(invalid("lookback must be >= 1".into()));
                }
                if *train_window < lookback + 2 {
                    return Err(invalid(format!(
                        "train_window {train_window} leaves no samples for lookback {lookback}"
                    )));
                }
                if !(ridge.is_finite() && *ridge >= 0.0) {
                    return Err(invalid(format!("ridge {ridge} must be finite and >= 0")));
                }
            }
            _ => {}
        }
        let intrinsic = self.model.intrinsic_min_history();
        if self.effective_min_history() < intrinsic {
            return Err(invalid(format!(
                "min_history {} below the {} observations the family needs",
                self.effective_min_history(),
                intrinsic
            )));
        }
        Ok(())
    }
}

/// The production registry: three moving averages, two smoothers and one
/// learned model.
pub fn default_specs() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("safe_ma_w5", ModelKind::MovingAverage { window: 5 }),
        ModelSpec::new("safe_ma_w10", ModelKind::MovingAverage { window: 10 }),
        ModelSpec::new("safe_ma_w20", ModelKind::MovingAverage { window: 20 }),
        ModelSpec::new(
            "safe_ses_a0.3",
            ModelKind::ExponentialSmoothing {
                alpha: 0.3,
                warmup: default_warmup(),
            },
        ),
        ModelSpec::new(
            "safe_ses_a0.5",
            ModelKind::ExponentialSmoothing {
                alpha: 0.5,
                warmup: default_warmup(),
            },
        ),
        ModelSpec::new(
            "safe_dl_lb20",
            ModelKind::LearnedSequence {
                lookback: default_lookback(),
                train_window: default_train_window(),
                ridge: default_ridge(),
            },
        ),
    ]
}

// ── Factory ──────────────────────────────────────────────────────────

/// Build a runtime model from a validated spec.
pub fn create_model(spec: &ModelSpec) -> Result<Box<dyn ForecastModel>, ModelError> {
    spec.validate()?;
    let min_history = spec.effective_min_history();
    match &spec.model {
        ModelKind::MovingAverage { window } => Ok(Box::new(MovingAverage::new(
            &spec.name,
            *window,
            min_history,
        ))),
        ModelKind::ExponentialSmoothing { alpha, .. } => Ok(Box::new(
            ExponentialSmoothing::new(&spec.name, *alpha, min_history),
        )),
        ModelKind::LearnedSequence {
            lookback,
            train_window,
            ridge,
        } => create_learned(&spec.name, *lookback, *train_window, *ridge, min_history),
    }
}

#[cfg(feature = "learned")]
fn create_learned(
    name: &str,
    lookback: usize,
    train_window: usize,
    ridge: f64,
    min_history: usize,
) -> Result<Box<dyn ForecastModel>, ModelError> {
    Ok(Box::new(LearnedSequence::new(
        name,
        lookback,
        train_window,
        ridge,
        min_history,
    )))
}

#[cfg(not(feature = "learned"))]
fn create_learned(
    _name: &str,
    _lookback: usize,
    _train_window: usize,
    _ridge: f64,
    _min_history: usize,
) -> Result<Box<dyn ForecastModel>, ModelError> {
    Err(ModelError::Unavailable {
        family: ModelFamily::LearnedSequence.to_string(),
        reason: "built without the `learned` feature".into(),
    })
}

// ── Registry ─────────────────────────────────────────────────────────

/// The set of models a run forecasts with.
///
/// Families whose implementation is missing from the build are recorded in
/// `unavailable` and skipped for every entity; the rest still run.
pub struct ModelRegistry {
    models: Vec<Box<dyn ForecastModel>>,
    unavailable: Vec<ModelError>,
}

impl ModelRegistry {
    /// An invalid spec or a duplicated name is a configuration bug and fails
    /// the whole registry. An unavailable family does not.
    pub fn from_specs(specs: &[ModelSpec]) -> Result<Self, ModelError> {
        let mut seen = BTreeSet::new();
        let mut models = Vec::with_capacity(specs.len());
        let mut unavailable = Vec::new();

        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(ModelError::InvalidSpec {
                    model: spec.name.clone(),
                    reason: "name registered twice".into(),
                });
            }
            match create_model(spec) {
                Ok(model) => models.push(model),
                Err(e @ ModelError::Unavailable { .. }) => {
                    log::warn!("skipping model '{}': {e}", spec.name);
                    unavailable.push(e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            models,
            unavailable,
        })
    }

    pub fn with_defaults() -> Result<Self, ModelError> {
        Self::from_specs(&default_specs())
    }

    pub fn models(&self) -> &[Box<dyn ForecastModel>] {
        &self.models
    }

    pub fn lookup(&self, name: &str) -> Option<&dyn ForecastModel> {
        self.models
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name()).collect()
    }

    pub fn unavailable(&self) -> &[ModelError] {
        &self.unavailable
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
