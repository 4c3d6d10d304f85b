//! Backend health probing.
//!
//! Each declared service is probed on a fixed interval; two consecutive
//! failures mark it down, a single success brings it back. Forwarding
//! consults the flags but never blocks on a probe.

use crate::config::ServiceEndpoint;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, Default)]
struct ServiceHealth {
    down: AtomicBool,
    consecutive_failures: AtomicU32,
}

/// Health flags for every service in the route table. The service set is
/// fixed at startup; lookups never take a lock.
#[derive(Debug)]
pub struct HealthRegistry {
    services: HashMap<String, ServiceHealth>,
}

impl HealthRegistry {
    pub fn new<I: IntoIterator<Item = String>>(names: I) -> Self {
        let services = names
            .into_iter()
            .map(|name| (name, ServiceHealth::default()))
            .collect();
        Self { services }
    }

    /// Services not in the table are treated as healthy; the route lookup
    /// already rejected anything truly unknown.
    pub fn is_healthy(&self, service: &str) -> bool {
        self.services
            .get(service)
            .map_or(true, |h| !h.down.load(Ordering::Relaxed))
    }

    pub fn record_success(&self, service: &str) {
        if let Some(h) = self.services.get(service) {
            h.consecutive_failures.store(0, Ordering::Relaxed);
            if h.down.swap(false, Ordering::Relaxed) {
                debug!(service, "backend recovered");
            }
        }
    }

    pub fn record_failure(&self, service: &str) {
        if let Some(h) = self.services.get(service) {
            let failures = h.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= FAILURE_THRESHOLD && !h.down.swap(true, Ordering::Relaxed) {
                warn!(service, failures, "backend marked down");
            }
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .services
            .iter()
            .map(|(name, h)| {
                let status = if h.down.load(Ordering::Relaxed) {
                    "down"
                } else {
                    "up"
                };
                (name.clone(), serde_json::Value::String(status.into()))
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Probe loop. Runs until the owning task is aborted at shutdown.
pub async fn run_health_checker(
    registry: Arc<HealthRegistry>,
    endpoints: HashMap<String, ServiceEndpoint>,
    client: reqwest::Client,
) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for (name, endpoint) in &endpoints {
            let url = format!("{}{}", endpoint.base_url(), endpoint.health_path);
            let result = client
                .get(&url)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => registry.record_success(name),
                Ok(resp) => {
                    debug!(service = %name, status = %resp.status(), "health probe failed");
                    registry.record_failure(name);
                }
                Err(e) => {
                    debug!(service = %name, error = %e, "health probe failed");
                    registry.record_failure(name);
                }
            }
        }
    }
}
