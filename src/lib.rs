//! Deterministic trade-outcome simulation and portfolio accounting for
//! backtesting trading signals.

pub mod config;
pub mod data;
pub mod database;
pub mod engine;
pub mod error;
pub mod risk;
pub mod sink;
pub mod types;

pub use error::{BacktestError, Result};
