pub mod config;
pub mod pool;
pub mod service;
pub mod sink;
pub mod telemetry;
