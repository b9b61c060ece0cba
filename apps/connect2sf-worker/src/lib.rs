pub mod app;
pub mod config;
pub mod contracts;
pub mod messaging;
pub mod metrics;
pub mod services;
pub mod telemetry;
