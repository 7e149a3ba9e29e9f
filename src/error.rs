//! # Errors
//!
//! $$
//! \text{run} = \text{Ok}(\text{NAV}) \ \lor\ \text{Err}(t^\*, \text{reason})
//! $$
//!
//! Failure taxonomy shared by the solver, the drift simulator and the index builder.

use chrono::NaiveDate;
use thiserror::Error;

/// Reasons a rebalance (or a whole run) cannot proceed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BacktestError {
  /// The lookback window holds fewer observations than the solve needs,
  /// or it would start before the first price.
  #[error("insufficient history: need {required} observations, got {actual}")]
  InsufficientHistory { required: usize, actual: usize },

  /// Portfolio variance is not positive, so the Sharpe ratio is undefined.
  #[error("degenerate volatility: portfolio variance {variance:e} is not positive")]
  DegenerateVolatility { variance: f64 },

  /// The optimizer exhausted its iteration budget.
  #[error("optimizer did not converge after {iterations} iterations (residual {residual:e})")]
  OptimizationNonConvergence { iterations: u64, residual: f64 },

  /// Weights break the budget or box constraint.
  #[error("inconsistent weights: {reason}")]
  InconsistentWeights { reason: String },

  /// Malformed price matrix, plan or configuration.
  #[error("invalid input: {0}")]
  InvalidInput(String),
}

impl BacktestError {
  pub(crate) fn inconsistent(reason: impl Into<String>) -> Self {
    Self::InconsistentWeights {
      reason: reason.into(),
    }
  }

  pub(crate) fn invalid(reason: impl Into<String>) -> Self {
    Self::InvalidInput(reason.into())
  }
}

/// A [`BacktestError`] tagged with the rebalance date it occurred on.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("rebalance on {date} failed: {source}")]
pub struct RebalanceFailure {
  pub date: NaiveDate,
  #[source]
  pub source: BacktestError,
}

impl RebalanceFailure {
  pub fn new(date: NaiveDate, source: BacktestError) -> Self {
    Self { date, source }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn failure_message_names_date_and_reason() {
    let date = NaiveDate::from_ymd_opt(2021, 3, 31).unwrap();
    let failure = RebalanceFailure::new(
      date,
      BacktestError::InsufficientHistory {
        required: 3,
        actual: 1,
      },
    );

    let msg = failure.to_string();
    assert!(msg.contains("2021-03-31"));
    assert!(msg.contains("need 3 observations, got 1"));
  }
}
