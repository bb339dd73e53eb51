//! Adaptive CPU quota controller for Kubernetes nodes
//!
//! This crate provides the core functionality for:
//! - Sampling node CPU utilization from /proc/stat
//! - Tracking per-container CFS quota, throttling and usage history
//! - Raising or lowering container quota each tick with a feedback policy
//! - Persisting quota through the cgroup hierarchy with rollback
//! - Running the controller as a periodic service with health and metrics

pub mod cgroup;
pub mod client;
pub mod config;
pub mod cpuquota;
pub mod driver;
pub mod error;
pub mod health;
pub mod math;
pub mod models;
pub mod observability;
pub mod procstat;
pub mod recovery;
pub mod service;
pub mod status_store;

#[cfg(test)]
mod testing;

pub use cgroup::{CgroupAccessor, CpuStat, FsCgroupAccessor, Hierarchy};
pub use client::{Client, ClientBuilder, TickReport};
pub use config::{Config, TurboOption};
pub use driver::{Driver, EventDriver};
pub use error::{ErrorKind, KeyedError, MultiError, Result, TurboError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, TurboMetrics};
pub use recovery::recover_pod_quota;
pub use service::{PodSource, QuotaTurboService, ServiceConfig, StaticPodSource};
