//! # Performance Summary
//!
//! $$
//! R_{ann}=\Big(\prod_t(1+r_t)\Big)^{m/T}-1,\qquad
//! \sigma_{ann}=s_r\sqrt m,\qquad
//! \text{SR}=\frac{R^{ex}_{ann}}{\sigma_{ann}},\qquad
//! z_{cf}=z+\tfrac{(z^2-1)S}{6}+\tfrac{(z^3-3z)(K-3)}{24}-\tfrac{(2z^3-5z)S^2}{36}
//! $$
//!
//! Annualized return, risk and tail statistics of a return series, plus the
//! trailing-return snapshot and comparison series shown next to a backtest.

use chrono::Datelike;
use chrono::NaiveDate;
use statrs::distribution::ContinuousCDF;
use statrs::distribution::Normal;
use statrs::statistics::Statistics;

use super::drawdown::max_drawdown_of_returns;
use super::drawdown::nav_max_drawdown;
use crate::error::BacktestError;
use crate::portfolio::types::NavSeries;
use crate::prices::PriceSeries;

/// Tail level of the VaR and CVaR estimates, in percent.
pub const TAIL_LEVEL_PCT: f64 = 5.0;

/// Trailing windows in periods: day, week, month, quarter, half year, year.
const TRAILING_PERIODS: [usize; 6] = [1, 5, 21, 63, 126, 252];

/// Annualized performance statistics of one return series.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SummaryStats {
  pub annualized_return: f64,
  pub annualized_vol: f64,
  pub skewness: f64,
  /// Raw (not excess) kurtosis.
  pub kurtosis: f64,
  /// Cornish-Fisher modified VaR, reported as a positive loss.
  pub cornish_fisher_var: f64,
  /// Mean loss beyond the historic VaR, reported as a positive loss.
  pub historic_cvar: f64,
  pub sharpe_ratio: f64,
  pub max_drawdown: f64,
}

impl SummaryStats {
  /// `rf_pct` is the annual risk-free rate in percent.
  pub fn from_returns(
    returns: &[f64],
    periods_per_year: f64,
    rf_pct: f64,
  ) -> Result<Self, BacktestError> {
    if returns.len() < 2 {
      return Err(BacktestError::InsufficientHistory {
        required: 2,
        actual: returns.len(),
      });
    }
    if !(periods_per_year > 0.0) {
      return Err(BacktestError::invalid("periods per year must be positive"));
    }

    let population_sd = returns.population_std_dev();
    if !(population_sd > 0.0) {
      return Err(BacktestError::DegenerateVolatility {
        variance: population_sd * population_sd,
      });
    }

    let annualized_return = annualize_return(returns, periods_per_year);
    let annualized_vol = returns.std_dev() * periods_per_year.sqrt();
    let skewness = central_moment(returns, 3) / population_sd.powi(3);
    let kurtosis = central_moment(returns, 4) / population_sd.powi(4);

    let rf_per_period = (1.0 + rf_pct / 100.0).powf(1.0 / periods_per_year) - 1.0;
    let excess: Vec<f64> = returns.iter().map(|r| r - rf_per_period).collect();
    let sharpe_ratio = annualize_return(&excess, periods_per_year) / annualized_vol;

    Ok(Self {
      annualized_return,
      annualized_vol,
      skewness,
      kurtosis,
      cornish_fisher_var: cornish_fisher_var(returns, skewness, kurtosis, population_sd)?,
      historic_cvar: historic_cvar(returns),
      sharpe_ratio,
      max_drawdown: max_drawdown_of_returns(returns),
    })
  }
}

/// Compounded growth of `returns` scaled to one year.
pub fn annualize_return(returns: &[f64], periods_per_year: f64) -> f64 {
  let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
  growth.powf(periods_per_year / returns.len() as f64) - 1.0
}

fn central_moment(returns: &[f64], order: i32) -> f64 {
  let mean = returns.mean();
  returns.iter().map(|r| (r - mean).powi(order)).sum::<f64>() / returns.len() as f64
}

fn cornish_fisher_var(
  returns: &[f64],
  skewness: f64,
  kurtosis: f64,
  population_sd: f64,
) -> Result<f64, BacktestError> {
  let z = Normal::new(0.0, 1.0)
    .map_err(|e| BacktestError::invalid(format!("standard normal: {e}")))?
    .inverse_cdf(TAIL_LEVEL_PCT / 100.0);
  let z_cf = z + (z * z - 1.0) * skewness / 6.0 + (z.powi(3) - 3.0 * z) * (kurtosis - 3.0) / 24.0
    - (2.0 * z.powi(3) - 5.0 * z) * skewness * skewness / 36.0;
  Ok(-(returns.mean() + z_cf * population_sd))
}

/// Linear-interpolation percentile, `q` in `[0, 100]`.
fn percentile(values: &[f64], q: f64) -> f64 {
  let mut sorted = values.to_vec();
  sorted.sort_by(f64::total_cmp);
  let pos = q / 100.0 * (sorted.len() - 1) as f64;
  let lo = pos.floor() as usize;
  let hi = pos.ceil() as usize;
  sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

fn historic_cvar(returns: &[f64]) -> f64 {
  let var = -percentile(returns, TAIL_LEVEL_PCT);
  let tail: Vec<f64> = returns.iter().copied().filter(|&r| r <= -var).collect();
  -tail.mean()
}

/// Equal-weighted comparison path: the mean price across assets per date.
pub fn equal_weight_benchmark(prices: &PriceSeries) -> Result<NavSeries, BacktestError> {
  NavSeries::new(prices.dates().to_vec(), prices.row_means())
}

/// Cumulative return `prod(1 + r) - 1` over `[start, end]`, dated from the
/// second observation in the range.
pub fn cumulative_returns(nav: &NavSeries, start: NaiveDate, end: NaiveDate) -> NavSeries {
  let window = nav.between(start, end);
  let Some((&base, rest)) = window.values().split_first() else {
    return NavSeries::default();
  };
  let dates = window.dates()[1..].to_vec();
  let values = rest.iter().map(|v| v / base - 1.0).collect();
  NavSeries::new(dates, values).unwrap_or_default()
}

/// Point-in-time returns over standard trailing windows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrailingReturns {
  pub as_of: NaiveDate,
  pub last: f64,
  pub one_day: Option<f64>,
  pub one_week: Option<f64>,
  pub one_month: Option<f64>,
  pub three_months: Option<f64>,
  pub six_months: Option<f64>,
  pub one_year: Option<f64>,
  /// Return since the last observation of the previous calendar year.
  pub year_to_date: Option<f64>,
  /// Return between the first and last observation in the custom range.
  pub custom: Option<f64>,
  /// Max drawdown over returns dated in the current calendar year.
  pub ytd_max_drawdown: f64,
}

impl TrailingReturns {
  pub fn compute(
    nav: &NavSeries,
    custom_start: NaiveDate,
    custom_end: NaiveDate,
  ) -> Result<Self, BacktestError> {
    let (as_of, last) = nav
      .last()
      .ok_or_else(|| BacktestError::invalid("empty NAV series"))?;
    let values = nav.values();
    let back = |periods: usize| {
      let i = values.len().checked_sub(periods + 1)?;
      Some(last / values[i] - 1.0)
    };
    let [one_day, one_week, one_month, three_months, six_months, one_year] =
      TRAILING_PERIODS.map(back);

    let year_start = NaiveDate::from_ymd_opt(as_of.year(), 1, 1)
      .ok_or_else(|| BacktestError::invalid(format!("no January 1st in {}", as_of.year())))?;
    let prior = nav.dates().partition_point(|d| *d < year_start);
    let year_to_date = prior.checked_sub(1).map(|i| last / values[i] - 1.0);

    let range = nav.between(custom_start, custom_end);
    let custom = match (range.first(), range.last()) {
      (Some((d0, v0)), Some((d1, v1))) if d1 > d0 => Some(v1 / v0 - 1.0),
      _ => None,
    };

    Ok(Self {
      as_of,
      last,
      one_day,
      one_week,
      one_month,
      three_months,
      six_months,
      one_year,
      year_to_date,
      custom,
      ytd_max_drawdown: nav_max_drawdown(nav, year_start)?,
    })
  }
}
