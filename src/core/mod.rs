//! Shared primitives: errors, configuration, storage access and output.

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod output;
pub mod pool;
pub mod schemas;
pub mod time;
