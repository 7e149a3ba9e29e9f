//! # Prices
//!
//! $$
//! r_{t,i} = \frac{P_{t,i}}{P_{t-1,i}} - 1
//! $$
//!
//! Date-indexed price matrix (rows = trading days, columns = assets) and the
//! lookback windows cut from it.

use std::collections::HashSet;
use std::io::Read;

use anyhow::Context;
use anyhow::bail;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use csv::Trim;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;
use ndarray::s;
use serde::Deserialize;

use crate::error::BacktestError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// How a lookback window that reaches past the first price is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookbackPolicy {
  /// Clip the window at the first available price.
  #[default]
  Truncate,
  /// Reject the window with [`BacktestError::InsufficientHistory`].
  Strict,
}

/// Immutable multi-asset price history.
///
/// Dates are strictly increasing and every price is finite and positive.
/// Non-trading days are simply absent.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
  assets: Vec<String>,
  dates: Vec<NaiveDate>,
  prices: Array2<f64>,
}

impl PriceSeries {
  /// Build a validated series. `prices` has one row per date and one column per asset.
  pub fn new(
    assets: Vec<String>,
    dates: Vec<NaiveDate>,
    prices: Array2<f64>,
  ) -> Result<Self, BacktestError> {
    if assets.is_empty() {
      return Err(BacktestError::invalid("price series has no assets"));
    }

    let mut seen = HashSet::with_capacity(assets.len());
    for asset in &assets {
      if !seen.insert(asset.as_str()) {
        return Err(BacktestError::invalid(format!("duplicate asset `{asset}`")));
      }
    }

    if prices.nrows() != dates.len() || prices.ncols() != assets.len() {
      return Err(BacktestError::invalid(format!(
        "price matrix is {}x{}, expected {}x{}",
        prices.nrows(),
        prices.ncols(),
        dates.len(),
        assets.len()
      )));
    }

    if let Some(pair) = dates.windows(2).find(|pair| pair[0] >= pair[1]) {
      return Err(BacktestError::invalid(format!(
        "dates must be strictly increasing ({} is followed by {})",
        pair[0], pair[1]
      )));
    }

    for ((row, col), &p) in prices.indexed_iter() {
      if !p.is_finite() || p <= 0.0 {
        return Err(BacktestError::invalid(format!(
          "price of `{}` on {} is {p}, expected a positive finite value",
          assets[col], dates[row]
        )));
      }
    }

    Ok(Self {
      assets,
      dates,
      prices,
    })
  }

  /// Convenience constructor from `(date, prices)` rows.
  pub fn from_rows<S: Into<String>>(
    assets: impl IntoIterator<Item = S>,
    rows: Vec<(NaiveDate, Vec<f64>)>,
  ) -> Result<Self, BacktestError> {
    let assets: Vec<String> = assets.into_iter().map(Into::into).collect();
    let n = assets.len();
    let mut dates = Vec::with_capacity(rows.len());
    let mut flat = Vec::with_capacity(rows.len() * n);

    for (date, values) in rows {
      if values.len() != n {
        return Err(BacktestError::invalid(format!(
          "row {date} has {} prices for {n} assets",
          values.len()
        )));
      }
      dates.push(date);
      flat.extend(values);
    }

    let prices = Array2::from_shape_vec((dates.len(), n), flat)
      .map_err(|e| BacktestError::invalid(e.to_string()))?;
    Self::new(assets, dates, prices)
  }

  /// Parse a CSV price matrix with header `date,<asset>,<asset>,...`.
  ///
  /// Asset names may be quoted. Rows with an empty or missing cell are dropped.
  pub fn from_csv_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
    let mut reader = ReaderBuilder::new()
      .has_headers(true)
      .flexible(true)
      .trim(Trim::All)
      .from_reader(reader);

    let header = reader.headers().context("failed to read CSV header")?;
    if header.is_empty() {
      bail!("price file is empty");
    }
    let assets: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
      let record = record.context("failed to read CSV record")?;
      let line = record.position().map_or(0, |p| p.line());
      if record.len() < assets.len() + 1 || record.iter().any(str::is_empty) {
        continue;
      }

      let date_cell = &record[0];
      let date = NaiveDate::parse_from_str(date_cell, DATE_FORMAT)
        .with_context(|| format!("line {line}: bad date `{date_cell}`"))?;
      let values = record
        .iter()
        .skip(1)
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("line {line}: bad price"))?;
      rows.push((date, values));
    }

    Ok(Self::from_rows(assets, rows)?)
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn prices(&self) -> &Array2<f64> {
    &self.prices
  }

  pub fn asset_count(&self) -> usize {
    self.assets.len()
  }

  pub fn len(&self) -> usize {
    self.dates.len()
  }

  pub fn is_empty(&self) -> bool {
    self.dates.is_empty()
  }

  /// Prices of every asset on row `index`.
  pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
    self.prices.row(index)
  }

  /// Price history of one asset.
  pub fn column(&self, asset: &str) -> Option<ArrayView1<'_, f64>> {
    let col = self.assets.iter().position(|a| a == asset)?;
    Some(self.prices.column(col))
  }

  pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
    self.dates.binary_search(&date).ok()
  }

  /// Rows `start..=end` as a new series.
  pub fn slice(&self, start: usize, end: usize) -> Result<Self, BacktestError> {
    if start > end || end >= self.len() {
      return Err(BacktestError::invalid(format!(
        "row range {start}..={end} is outside a series of {} rows",
        self.len()
      )));
    }

    Ok(Self {
      assets: self.assets.clone(),
      dates: self.dates[start..=end].to_vec(),
      prices: self.prices.slice(s![start..=end, ..]).to_owned(),
    })
  }

  /// Trailing window of `lookback` returns ending on row `index` (inclusive).
  pub fn window_ending_at(
    &self,
    index: usize,
    lookback: usize,
    policy: LookbackPolicy,
  ) -> Result<Self, BacktestError> {
    let start = match index.checked_sub(lookback) {
      Some(start) => start,
      None if policy == LookbackPolicy::Strict => {
        return Err(BacktestError::InsufficientHistory {
          required: lookback + 1,
          actual: index + 1,
        });
      }
      None => 0,
    };
    self.slice(start, index)
  }

  /// Simple returns, shape `(len - 1, asset_count)`.
  pub fn simple_returns(&self) -> Array2<f64> {
    if self.len() < 2 {
      return Array2::zeros((0, self.asset_count()));
    }
    let prev = self.prices.slice(s![..-1, ..]);
    let next = self.prices.slice(s![1.., ..]);
    &next / &prev - 1.0
  }

  /// Mean price across assets per row.
  pub fn row_means(&self) -> Vec<f64> {
    self
      .prices
      .mean_axis(Axis(1))
      .map(|m| m.to_vec())
      .unwrap_or_default()
  }
}
