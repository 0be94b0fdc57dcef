pub mod config;
pub mod stats;
pub mod types;
pub mod units;
