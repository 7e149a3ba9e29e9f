use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Datelike;
use chrono::NaiveDate;
use clap::Parser;
use prettytable::Cell;
use prettytable::Table;
use prettytable::row;
use rebalance_rs::portfolio::BacktestConfig;
use rebalance_rs::portfolio::BacktestOutcome;
use rebalance_rs::portfolio::Backtester;
use rebalance_rs::portfolio::FallbackPolicy;
use rebalance_rs::portfolio::Frequency;
use rebalance_rs::portfolio::NavSeries;
use rebalance_rs::portfolio::SimulationOutput;
use rebalance_rs::prices::LookbackPolicy;
use rebalance_rs::prices::PriceSeries;
use rebalance_rs::stats::SummaryStats;
use rebalance_rs::stats::TrailingReturns;
use rebalance_rs::stats::equal_weight_benchmark;
use rebalance_rs::stats::max_drawdown;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "rebalance-rs")]
#[command(about = "Periodic maximum-Sharpe rebalancing backtest", long_about = None)]
#[command(version)]
struct Cli {
  /// CSV price matrix with header `date,<asset>,...`
  #[arg(long)]
  prices: PathBuf,

  /// TOML file with backtest settings; flags below override it
  #[arg(long)]
  config: Option<PathBuf>,

  /// weekly, monthly, quarterly or yearly
  #[arg(long)]
  frequency: Option<Frequency>,

  /// Return observations per lookback window
  #[arg(long)]
  lookback: Option<usize>,

  /// Annual risk-free rate in percent
  #[arg(long)]
  risk_free: Option<f64>,

  #[arg(long)]
  seed_nav: Option<f64>,

  /// fail, equal-weight or carry-forward
  #[arg(long)]
  fallback: Option<FallbackPolicy>,

  /// Reject lookback windows that start before the first price
  #[arg(long)]
  strict_lookback: bool,

  /// Start of the drawdown window (default: January 1st of the last year)
  #[arg(long)]
  drawdown_from: Option<NaiveDate>,

  /// 252 for daily prices, 12 for monthly
  #[arg(long, default_value_t = 252.0)]
  periods_per_year: f64,

  /// Write NAV, units and allocations to this CSV file
  #[arg(long)]
  output: Option<PathBuf>,

  /// Log level when RUST_LOG is unset
  #[arg(long, default_value = "info")]
  log_level: String,
}

impl Cli {
  fn backtest_config(&self) -> anyhow::Result<BacktestConfig> {
    let mut config = match &self.config {
      Some(path) => {
        let text = fs::read_to_string(path)
          .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?
      }
      None => BacktestConfig::default(),
    };

    if let Some(frequency) = self.frequency {
      config.frequency = frequency;
    }
    if let Some(lookback) = self.lookback {
      config.lookback_days = lookback;
    }
    if let Some(rf) = self.risk_free {
      config.risk_free_rate = rf;
    }
    if let Some(seed_nav) = self.seed_nav {
      config.seed_nav = seed_nav;
    }
    if let Some(fallback) = self.fallback {
      config.fallback = fallback;
    }
    if self.strict_lookback {
      config.lookback_policy = LookbackPolicy::Strict;
    }
    Ok(config)
  }
}

fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::registry()
    .with(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rebalance_rs={}", cli.log_level).into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let config = cli.backtest_config()?;
  let file = File::open(&cli.prices)
    .with_context(|| format!("failed to open {}", cli.prices.display()))?;
  let prices = PriceSeries::from_csv_reader(file)
    .with_context(|| format!("failed to load prices from {}", cli.prices.display()))?;
  info!(
    assets = prices.asset_count(),
    days = prices.len(),
    "prices loaded"
  );

  let outcome = Backtester::new(config.clone()).run(&prices)?;
  let output = &outcome.report.output;

  print_weights(&prices, &outcome);
  if !output.is_empty() {
    print_summary(&prices, output, cli.periods_per_year, config.risk_free_rate)?;
    print_trailing(output.nav(), cli.drawdown_from)?;
  }
  print_drawdowns(&prices, cli.drawdown_from)?;

  if let Some(path) = &cli.output {
    let file =
      File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_output(output, BufWriter::new(file))?;
    info!(path = %path.display(), rows = output.len(), "series written");
  }

  match outcome.report.failure {
    Some(failure) => {
      warn!(%failure, "backtest stopped early");
      Err(failure.into())
    }
    None => Ok(()),
  }
}

fn pct(x: f64) -> String {
  format!("{:.2}%", x * 100.0)
}

fn opt_pct(x: Option<f64>) -> String {
  x.map(pct).unwrap_or_else(|| "-".to_string())
}

fn print_weights(prices: &PriceSeries, outcome: &BacktestOutcome) {
  let mut table = Table::new();
  let mut titles = row!["Rebalance"];
  for asset in prices.assets() {
    titles.add_cell(Cell::new(asset));
  }
  table.set_titles(titles);

  for (date, entry) in outcome.plan.iter() {
    let mut line = row![date];
    match entry {
      Ok(weights) => {
        for w in weights.as_array() {
          line.add_cell(Cell::new(&pct(*w)));
        }
      }
      Err(err) => line.add_cell(Cell::new(&err.to_string())),
    }
    table.add_row(line);
  }
  table.printstd();
}

fn print_summary(
  prices: &PriceSeries,
  output: &SimulationOutput,
  periods_per_year: f64,
  rf_pct: f64,
) -> anyhow::Result<()> {
  let (Some((start, _)), Some((end, _))) = (output.nav().first(), output.nav().last()) else {
    return Ok(());
  };

  let mut series = vec![
    ("Max Sharpe".to_string(), output.nav().clone()),
    (
      "Equal Weight".to_string(),
      equal_weight_benchmark(prices)?.between(start, end),
    ),
  ];
  for asset in prices.assets() {
    if let Some(column) = prices.column(asset) {
      let nav = NavSeries::new(prices.dates().to_vec(), column.to_vec())?;
      series.push((asset.clone(), nav.between(start, end)));
    }
  }

  let mut table = Table::new();
  table.set_titles(row![
    "Portfolio",
    "Ann. Return",
    "Ann. Vol",
    "Skew",
    "Kurtosis",
    "CF VaR 5%",
    "CVaR 5%",
    "Sharpe",
    "Max DD"
  ]);
  for (name, nav) in &series {
    match SummaryStats::from_returns(&nav.returns(), periods_per_year, rf_pct) {
      Ok(s) => table.add_row(row![
        name,
        pct(s.annualized_return),
        pct(s.annualized_vol),
        format!("{:.2}", s.skewness),
        format!("{:.2}", s.kurtosis),
        pct(s.cornish_fisher_var),
        pct(s.historic_cvar),
        format!("{:.2}", s.sharpe_ratio),
        pct(s.max_drawdown)
      ]),
      Err(err) => table.add_row(row![name, err]),
    };
  }
  table.printstd();
  Ok(())
}

fn print_trailing(nav: &NavSeries, custom_start: Option<NaiveDate>) -> anyhow::Result<()> {
  let Some((first, _)) = nav.first() else {
    return Ok(());
  };
  let Some((last, _)) = nav.last() else {
    return Ok(());
  };
  let t = TrailingReturns::compute(nav, custom_start.unwrap_or(first), last)?;

  let mut table = Table::new();
  table.set_titles(row![
    "As of", "NAV", "1D", "1W", "1M", "3M", "6M", "YTD", "1Y", "Custom", "YTD Max DD"
  ]);
  table.add_row(row![
    t.as_of,
    format!("{:.2}", t.last),
    opt_pct(t.one_day),
    opt_pct(t.one_week),
    opt_pct(t.one_month),
    opt_pct(t.three_months),
    opt_pct(t.six_months),
    opt_pct(t.year_to_date),
    opt_pct(t.one_year),
    opt_pct(t.custom),
    pct(t.ytd_max_drawdown)
  ]);
  table.printstd();
  Ok(())
}

fn print_drawdowns(prices: &PriceSeries, from: Option<NaiveDate>) -> anyhow::Result<()> {
  let Some(last) = prices.dates().last() else {
    return Ok(());
  };
  let from = match from {
    Some(date) => date,
    None => NaiveDate::from_ymd_opt(last.year(), 1, 1).unwrap_or(*last),
  };

  let mut table = Table::new();
  table.set_titles(row![format!("Max DD since {from}"), ""]);
  for (asset, dd) in max_drawdown(prices, from)? {
    table.add_row(row![asset, pct(dd)]);
  }
  table.printstd();
  Ok(())
}

/// One row per simulated date: NAV, units, target and drifted allocations.
fn write_output<W: Write>(output: &SimulationOutput, writer: W) -> anyhow::Result<()> {
  let mut wtr = csv::Writer::from_writer(writer);

  let mut header = vec!["date".to_string(), "nav".to_string()];
  for prefix in ["units", "target_pct", "drift_pct"] {
    header.extend(output.assets().iter().map(|a| format!("{prefix}_{a}")));
  }
  wtr
    .write_record(&header)
    .context("failed to write CSV header")?;

  for (i, (date, nav)) in output.nav().iter().enumerate() {
    let mut cells = vec![date.to_string(), nav.to_string()];
    cells.extend(output.holdings()[i].units().iter().map(|u| u.to_string()));
    cells.extend(
      output.allocations()[i]
        .as_array()
        .iter()
        .map(|w| (w * 100.0).to_string()),
    );
    cells.extend(output.drifted_allocations()[i].iter().map(|w| (w * 100.0).to_string()));
    wtr
      .write_record(&cells)
      .with_context(|| format!("failed to write row for {date}"))?;
  }
  wtr.flush().context("failed to flush CSV writer")?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use rebalance_rs::portfolio::FixedWeightIndexBuilder;
  use rebalance_rs::portfolio::WeightVector;

  use super::*;

  #[test]
  fn exported_rows_align_with_simulated_dates() {
    let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
    let prices = PriceSeries::from_rows(
      ["A", "B"],
      vec![(d(2), vec![100.0, 50.0]), (d(3), vec![110.0, 45.0])],
    )
    .unwrap();
    let output = FixedWeightIndexBuilder::new(WeightVector::equal(2))
      .build(&prices)
      .unwrap();

    let mut buf = Vec::new();
    write_output(&output, &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(
      lines[0],
      "date,nav,units_A,units_B,target_pct_A,target_pct_B,drift_pct_A,drift_pct_B"
    );
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("2024-01-02,10000,50,100,50,50,50,50"));
  }

  #[test]
  fn exported_header_quotes_asset_names() {
    let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
    let prices = PriceSeries::from_rows(
      ["S&P, 500", "TLT"],
      vec![(d(2), vec![4700.0, 100.0]), (d(3), vec![4690.0, 101.0])],
    )
    .unwrap();
    let output = FixedWeightIndexBuilder::new(WeightVector::equal(2))
      .build(&prices)
      .unwrap();

    let mut buf = Vec::new();
    write_output(&output, &mut buf).unwrap();

    let mut reader = csv::Reader::from_reader(buf.as_slice());
    let header = reader.headers().unwrap().clone();
    assert_eq!(header.len(), 8);
    assert_eq!(&header[2], "units_S&P, 500");
    assert_eq!(&header[7], "drift_pct_TLT");
    assert_eq!(reader.records().count(), 2);
  }

  #[test]
  fn flags_override_defaults() {
    let cli = Cli::parse_from([
      "rebalance-rs",
      "--prices",
      "p.csv",
      "--frequency",
      "monthly",
      "--lookback",
      "60",
      "--fallback",
      "carry-forward",
      "--strict-lookback",
    ]);
    let config = cli.backtest_config().unwrap();

    assert_eq!(config.frequency, Frequency::Monthly);
    assert_eq!(config.lookback_days, 60);
    assert_eq!(config.fallback, FallbackPolicy::CarryForward);
    assert_eq!(config.lookback_policy, LookbackPolicy::Strict);
    assert_eq!(config.seed_nav, 10_000.0);
  }
}
