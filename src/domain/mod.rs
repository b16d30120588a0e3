//! Core domain types and logic: history access, strategies, the simulation
//! engine, metrics and parameter search. No I/O happens here.

pub mod error;
pub mod history;
pub mod indicator;
pub mod parameter;
pub mod signal;
pub mod strategy;
pub mod registry;
pub mod operator;
pub mod portfolio;
pub mod execution;
pub mod backtest;
pub mod metrics;
pub mod optimizer;
pub mod config_validation;
