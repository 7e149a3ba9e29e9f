//! # Stats
//!
//! $$
//! \text{MDD}=\min_t\frac{W_t-\max_{s\le t}W_s}{\max_{s\le t}W_s}
//! $$
//!
//! Drawdown and performance analytics over price and NAV paths.

pub mod drawdown;
pub mod summary;

pub use drawdown::drawdown_series;
pub use drawdown::max_drawdown;
pub use drawdown::nav_max_drawdown;
pub use drawdown::wealth_index;
pub use summary::SummaryStats;
pub use summary::TrailingReturns;
pub use summary::cumulative_returns;
pub use summary::equal_weight_benchmark;
