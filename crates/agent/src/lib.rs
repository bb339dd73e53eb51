//! Node daemon glue: configuration loading and the health/metrics API

pub mod api;
pub mod config;
