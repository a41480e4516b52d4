//! Core domain types and logic.

pub mod ohlcv;
pub mod series;
pub mod indicator;
pub mod sandbox;
pub mod condition;
pub mod condition_parser;
pub mod condition_eval;
pub mod strategy;
pub mod config_validation;
pub mod stage;
pub mod position;
pub mod portfolio;
pub mod execution;
pub mod backtest;
pub mod metrics;
pub mod universe;
pub mod error;
