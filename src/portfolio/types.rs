//! # Portfolio Types
//!
//! $$
//! \text{NAV}_t=\sum_i q_i P_{t,i},\qquad \sum_i w_i = 1,\ 0\le w_i\le 1
//! $$
//!
//! Weights, holdings and NAV containers shared by the solver, the drift
//! simulator and the fixed-weight index builder.

use chrono::Datelike;
use chrono::NaiveDate;
use ndarray::Array1;
use ndarray::ArrayView1;
use serde::Deserialize;

use crate::error::BacktestError;

/// Default tolerance for the budget and box checks.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Calendar period used to place rebalance dates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frequency {
  Weekly,
  Monthly,
  #[default]
  Quarterly,
  Yearly,
}

impl Frequency {
  /// Year-qualified period key of `date`.
  pub fn period_key(self, date: NaiveDate) -> (i32, u32) {
    match self {
      Self::Weekly => {
        let week = date.iso_week();
        (week.year(), week.week())
      }
      Self::Monthly => (date.year(), date.month()),
      Self::Quarterly => (date.year(), date.month0() / 3 + 1),
      Self::Yearly => (date.year(), 0),
    }
  }
}

impl std::str::FromStr for Frequency {
  type Err = BacktestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "w" | "week" | "weekly" => Ok(Self::Weekly),
      "m" | "month" | "monthly" => Ok(Self::Monthly),
      "q" | "quarter" | "quarterly" => Ok(Self::Quarterly),
      "y" | "a" | "year" | "yearly" | "annual" => Ok(Self::Yearly),
      other => Err(BacktestError::invalid(format!(
        "unknown rebalancing frequency `{other}`"
      ))),
    }
  }
}

/// Long-only, fully invested weight vector in asset-column order.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightVector(Array1<f64>);

impl WeightVector {
  /// Validate `values` against the budget and box constraints.
  pub fn new(values: impl Into<Array1<f64>>, tolerance: f64) -> Result<Self, BacktestError> {
    let values = values.into();
    if values.is_empty() {
      return Err(BacktestError::inconsistent("weight vector is empty"));
    }

    if let Some((i, w)) = values
      .iter()
      .enumerate()
      .find(|(_, w)| !w.is_finite() || **w < -tolerance || **w > 1.0 + tolerance)
    {
      return Err(BacktestError::inconsistent(format!(
        "weight {i} is {w}, outside [0, 1]"
      )));
    }

    let total = values.sum();
    if (total - 1.0).abs() > tolerance {
      return Err(BacktestError::inconsistent(format!(
        "weights sum to {total}, expected 1"
      )));
    }

    Ok(Self(values))
  }

  /// `1/n` for each of `n` assets.
  pub fn equal(n: usize) -> Self {
    Self(Array1::from_elem(n, 1.0 / n.max(1) as f64))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn as_array(&self) -> &Array1<f64> {
    &self.0
  }

  pub fn to_vec(&self) -> Vec<f64> {
    self.0.to_vec()
  }

  pub fn get(&self, asset: usize) -> Option<f64> {
    self.0.get(asset).copied()
  }
}

/// Units held per asset; replaced wholesale at each rebalance.
#[derive(Clone, Debug, PartialEq)]
pub struct HoldingsState {
  units: Array1<f64>,
}

impl HoldingsState {
  /// Units that put `nav * w_i` into asset `i` at `prices`.
  pub fn rebase(nav: f64, weights: &WeightVector, prices: ArrayView1<'_, f64>) -> Self {
    let units = weights.as_array() * nav / &prices;
    Self { units }
  }

  /// Marked-to-market value at `prices`.
  pub fn value(&self, prices: ArrayView1<'_, f64>) -> f64 {
    self.units.dot(&prices)
  }

  /// Value share of each asset at `prices`.
  pub fn value_weights(&self, prices: ArrayView1<'_, f64>) -> Vec<f64> {
    let values = &self.units * &prices;
    let total = values.sum();
    if total > 0.0 {
      (values / total).to_vec()
    } else {
      vec![0.0; self.units.len()]
    }
  }

  pub fn units(&self) -> &Array1<f64> {
    &self.units
  }
}

/// Portfolio value per date.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NavSeries {
  dates: Vec<NaiveDate>,
  values: Vec<f64>,
}

impl NavSeries {
  pub fn new(dates: Vec<NaiveDate>, values: Vec<f64>) -> Result<Self, BacktestError> {
    if dates.len() != values.len() {
      return Err(BacktestError::invalid(format!(
        "{} dates for {} NAV values",
        dates.len(),
        values.len()
      )));
    }
    if dates.windows(2).any(|pair| pair[0] >= pair[1]) {
      return Err(BacktestError::invalid("NAV dates must be strictly increasing"));
    }
    Ok(Self { dates, values })
  }

  pub(crate) fn push(&mut self, date: NaiveDate, value: f64) {
    self.dates.push(date);
    self.values.push(value);
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn values(&self) -> &[f64] {
    &self.values
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn get(&self, date: NaiveDate) -> Option<f64> {
    let i = self.dates.binary_search(&date).ok()?;
    Some(self.values[i])
  }

  pub fn first(&self) -> Option<(NaiveDate, f64)> {
    Some((*self.dates.first()?, *self.values.first()?))
  }

  pub fn last(&self) -> Option<(NaiveDate, f64)> {
    Some((*self.dates.last()?, *self.values.last()?))
  }

  pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
    self.dates.iter().copied().zip(self.values.iter().copied())
  }

  /// Sub-series with `start <= date <= end`.
  pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Self {
    let lo = self.dates.partition_point(|d| *d < start);
    let hi = self.dates.partition_point(|d| *d <= end).max(lo);
    Self {
      dates: self.dates[lo..hi].to_vec(),
      values: self.values[lo..hi].to_vec(),
    }
  }

  /// Simple period returns; the first date has no return.
  pub fn returns(&self) -> Vec<f64> {
    self.values.windows(2).map(|v| v[1] / v[0] - 1.0).collect()
  }
}
