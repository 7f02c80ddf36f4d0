pub mod bandit;
pub mod config;
pub mod engine;
pub mod execution;
pub mod ladder;
pub mod marketdata;
pub mod pricing;
pub mod risk;
pub mod signals;
pub mod telemetry;
pub mod util;
