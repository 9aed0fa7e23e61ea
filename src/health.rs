//! External collaborator interface for periodic health reporting (§1, §4.6).
//! The core only ever calls `register_periodic_check`; installing an actual
//! `/healthz` endpoint or supervisor hook is the embedder's job.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Outcome of one health check evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Fail(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Ok)
    }
}

pub type HealthCheckFn = dyn Fn() -> BoxFuture<'static, HealthStatus> + Send + Sync;

/// Implemented by the embedder. The core registers exactly two checks
/// (§4.3 "read queue health", §4.4.4 "write queue health"), each evaluating
/// queue occupancy against the 95% threshold described in those sections.
#[async_trait]
pub trait HealthManager: Send + Sync {
    fn register_periodic_check(&self, name: &str, interval: Duration, check: std::sync::Arc<HealthCheckFn>);
}

/// No-op implementation for embedders (and tests) that don't need health
/// reporting wired up.
#[derive(Default)]
pub struct NoopHealthManager;

impl HealthManager for NoopHealthManager {
    fn register_periodic_check(&self, _name: &str, _interval: Duration, _check: std::sync::Arc<HealthCheckFn>) {}
}

/// Queue occupancy threshold above which a queue-depth health check reports
/// `Fail` (§4.3, §4.4.4).
pub const QUEUE_HEALTH_THRESHOLD: f64 = 0.95;

pub fn queue_health(used: usize, capacity: usize) -> HealthStatus {
    if capacity == 0 {
        return HealthStatus::Ok;
    }
    let occupancy = used as f64 / capacity as f64;
    if occupancy > QUEUE_HEALTH_THRESHOLD {
        HealthStatus::Fail(format!(
            "queue occupancy {occupancy:.2} exceeds threshold {QUEUE_HEALTH_THRESHOLD:.2}"
        ))
    } else {
        HealthStatus::Ok
    }
}
