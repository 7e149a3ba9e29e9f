//! # Portfolio Data Utilities
//!
//! $$
//! \hat\mu_i=\frac1T\sum_t r_{t,i},\qquad
//! \hat\Sigma_{ij}=\frac{1}{T-1}\sum_t (r_{t,i}-\hat\mu_i)(r_{t,j}-\hat\mu_j)
//! $$
//!
//! Moment estimates of a lookback window.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;

use crate::error::BacktestError;
use crate::prices::PriceSeries;

/// Mean simple return and sample covariance of one lookback window.
#[derive(Clone, Debug)]
pub struct ReturnMoments {
  pub mean: Array1<f64>,
  pub cov: Array2<f64>,
  pub observations: usize,
}

impl ReturnMoments {
  /// Estimate from the simple returns of `window`.
  ///
  /// Needs at least `max(asset_count, 2)` return observations.
  pub fn estimate(window: &PriceSeries) -> Result<Self, BacktestError> {
    let returns = window.simple_returns();
    let observations = returns.nrows();
    let required = window.asset_count().max(2);
    if observations < required {
      return Err(BacktestError::InsufficientHistory {
        required,
        actual: observations,
      });
    }

    let mean = returns
      .mean_axis(Axis(0))
      .ok_or(BacktestError::InsufficientHistory {
        required,
        actual: 0,
      })?;
    let cov = returns
      .t()
      .cov(1.0)
      .map_err(|e| BacktestError::invalid(format!("covariance estimate failed: {e}")))?;

    Ok(Self {
      mean,
      cov,
      observations,
    })
  }

  pub fn asset_count(&self) -> usize {
    self.mean.len()
  }

  /// Largest single-asset variance.
  pub fn max_variance(&self) -> f64 {
    self
      .cov
      .diag()
      .iter()
      .copied()
      .fold(f64::NEG_INFINITY, f64::max)
  }

  pub fn portfolio_return(&self, w: &Array1<f64>) -> f64 {
    w.dot(&self.mean)
  }

  pub fn portfolio_variance(&self, w: &Array1<f64>) -> f64 {
    w.dot(&self.cov.dot(w))
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::NaiveDate;

  use super::*;

  fn window(rows: Vec<Vec<f64>>) -> PriceSeries {
    let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    let rows = rows
      .into_iter()
      .enumerate()
      .map(|(i, r)| (start + chrono::Days::new(i as u64), r))
      .collect();
    PriceSeries::from_rows(["A", "B"], rows).unwrap()
  }

  #[test]
  fn moments_match_hand_computed_values() {
    // returns: A = [0.1, -0.1, 0.1], B = [0.0, 0.1, 0.0]
    let w = window(vec![
      vec![100.0, 10.0],
      vec![110.0, 10.0],
      vec![99.0, 11.0],
      vec![108.9, 11.0],
    ]);
    let m = ReturnMoments::estimate(&w).unwrap();

    assert_eq!(m.observations, 3);
    assert_abs_diff_eq!(m.mean[0], 0.1 / 3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(m.mean[1], 0.1 / 3.0, epsilon = 1e-12);

    // var(A) = ((2/30)^2 * 2 + (4/30)^2) / 2
    let var_a = (2.0 * (0.2_f64 / 3.0).powi(2) + (0.4_f64 / 3.0).powi(2)) / 2.0;
    assert_abs_diff_eq!(m.cov[[0, 0]], var_a, epsilon = 1e-12);
    assert_abs_diff_eq!(m.cov[[0, 1]], m.cov[[1, 0]], epsilon = 1e-15);
    assert!(m.cov[[0, 1]] < 0.0);
  }

  #[test]
  fn too_few_observations_is_insufficient_history() {
    let w = window(vec![vec![100.0, 10.0], vec![101.0, 10.5]]);
    assert_eq!(
      ReturnMoments::estimate(&w).unwrap_err(),
      BacktestError::InsufficientHistory {
        required: 2,
        actual: 1
      }
    );
  }
}
