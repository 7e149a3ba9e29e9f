//! # rebalance-rs
//!
//! $$
//! \mathbf w^\*(d)=\arg\max_{\mathbf w\in\Delta}\frac{\mathbf w^\top\hat\mu_d-r_f}{\sqrt{\mathbf w^\top\hat\Sigma_d\mathbf w}},\qquad
//! \text{NAV}_t=\sum_i q_i P_{t,i}
//! $$
//!
//! Periodic maximum-Sharpe rebalancing backtests, fixed-weight benchmark
//! indices and drawdown analytics over a date-indexed price matrix.

pub mod error;
pub mod portfolio;
pub mod prices;
pub mod stats;

pub use error::BacktestError;
pub use error::RebalanceFailure;
pub use prices::LookbackPolicy;
pub use prices::PriceSeries;
