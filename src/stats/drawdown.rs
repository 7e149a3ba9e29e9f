//! # Drawdown
//!
//! $$
//! W_t = W_0\prod_{s\le t}(1+r_s),\qquad
//! \text{DD}_t=\frac{W_t-\max_{s\le t}W_s}{\max_{s\le t}W_s},\qquad
//! \text{MDD}=\min_t \text{DD}_t\le 0
//! $$
//!
//! Peak-to-trough loss of a compounded wealth index.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use ndarray::Array1;
use ndarray_stats::QuantileExt;

use crate::error::BacktestError;
use crate::portfolio::types::NavSeries;
use crate::prices::PriceSeries;

/// Starting level of every wealth index.
pub const WEALTH_BASE: f64 = 1000.0;

/// Wealth index compounding `returns` from [`WEALTH_BASE`].
pub fn wealth_index(returns: &[f64]) -> Vec<f64> {
  returns
    .iter()
    .scan(WEALTH_BASE, |wealth, r| {
      *wealth *= 1.0 + r;
      Some(*wealth)
    })
    .collect()
}

/// Relative distance of every value from its running peak.
pub fn drawdown_series(values: &[f64]) -> Vec<f64> {
  values
    .iter()
    .scan(f64::NEG_INFINITY, |peak, &v| {
      *peak = peak.max(v);
      Some((v - *peak) / *peak)
    })
    .collect()
}

/// Maximum drawdown of a return series; `0.0` when it is empty.
pub fn max_drawdown_of_returns(returns: &[f64]) -> f64 {
  let drawdowns = Array1::from(drawdown_series(&wealth_index(returns)));
  if drawdowns.is_empty() {
    return 0.0;
  }
  drawdowns.min_skipnan().min(0.0)
}

/// Maximum drawdown per asset over returns dated on or after `window_start`.
pub fn max_drawdown(
  prices: &PriceSeries,
  window_start: NaiveDate,
) -> Result<BTreeMap<String, f64>, BacktestError> {
  let from = start_row(prices.dates(), window_start)?;
  let returns = prices.simple_returns();

  Ok(
    prices
      .assets()
      .iter()
      .zip(returns.columns())
      .map(|(asset, column)| {
        // return row k is dated on price row k + 1
        let windowed: Vec<f64> = column.iter().skip(from.saturating_sub(1)).copied().collect();
        (asset.clone(), max_drawdown_of_returns(&windowed))
      })
      .collect(),
  )
}

/// Maximum drawdown of a NAV path over returns dated on or after `window_start`.
pub fn nav_max_drawdown(nav: &NavSeries, window_start: NaiveDate) -> Result<f64, BacktestError> {
  let from = start_row(nav.dates(), window_start)?;
  let returns = nav.returns();
  Ok(max_drawdown_of_returns(
    &returns[from.saturating_sub(1).min(returns.len())..],
  ))
}

/// First price row dated on or after `window_start`. Never row 0, which has no return.
fn start_row(dates: &[NaiveDate], window_start: NaiveDate) -> Result<usize, BacktestError> {
  match dates.last() {
    Some(last) if *last >= window_start => Ok(dates.partition_point(|d| *d < window_start).max(1)),
    Some(last) => Err(BacktestError::invalid(format!(
      "drawdown window starts on {window_start}, after the last date {last}"
    ))),
    None => Err(BacktestError::invalid("no dates to measure a drawdown over")),
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  fn prices() -> PriceSeries {
    PriceSeries::from_rows(
      ["UP", "DIP"],
      vec![
        (d(2023, 12, 29), vec![100.0, 100.0]),
        (d(2024, 1, 2), vec![101.0, 110.0]),
        (d(2024, 1, 3), vec![101.0, 99.0]),
        (d(2024, 1, 4), vec![105.0, 120.0]),
        (d(2024, 1, 5), vec![106.0, 108.0]),
      ],
    )
    .unwrap()
  }

  #[test]
  fn wealth_index_compounds_from_base() {
    let wealth = wealth_index(&[0.1, -0.5]);
    assert_abs_diff_eq!(wealth[0], 1100.0, epsilon = 1e-9);
    assert_abs_diff_eq!(wealth[1], 550.0, epsilon = 1e-9);
  }

  #[test]
  fn drawdown_is_measured_from_running_peak() {
    let dd = drawdown_series(&[100.0, 120.0, 90.0, 130.0]);
    assert_abs_diff_eq!(dd[0], 0.0);
    assert_abs_diff_eq!(dd[2], -0.25, epsilon = 1e-12);
    assert_abs_diff_eq!(dd[3], 0.0);
  }

  #[test]
  fn per_asset_max_drawdown() {
    let mdd = max_drawdown(&prices(), d(2024, 1, 1)).unwrap();

    assert_abs_diff_eq!(mdd["UP"], 0.0);
    // 120 -> 108 is the deepest fall after the new peak
    assert_abs_diff_eq!(mdd["DIP"], -0.1, epsilon = 1e-12);
    assert!(mdd.values().all(|&v| v <= 0.0));
  }

  #[test]
  fn window_start_drops_earlier_returns() {
    let mdd = max_drawdown(&prices(), d(2024, 1, 5)).unwrap();
    // the only return left is the fall itself, which is its own peak
    assert_abs_diff_eq!(mdd["DIP"], 0.0);
  }

  #[test]
  fn window_after_last_date_is_rejected() {
    assert!(matches!(
      max_drawdown(&prices(), d(2025, 1, 1)),
      Err(BacktestError::InvalidInput(_))
    ));
  }

  #[test]
  fn nav_drawdown_matches_price_drawdown() {
    let p = prices();
    let column = p.column("DIP").unwrap().to_vec();
    let nav = NavSeries::new(p.dates().to_vec(), column).unwrap();
    assert_abs_diff_eq!(
      nav_max_drawdown(&nav, d(2024, 1, 1)).unwrap(),
      max_drawdown(&p, d(2024, 1, 1)).unwrap()["DIP"],
      epsilon = 1e-12
    );
  }
}
