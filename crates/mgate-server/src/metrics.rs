//! Process-local counters.
//!
//! Plain atomics, no exporter; the health endpoint surfaces a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub sessions_accepted: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub auth_failures: AtomicU64,
    pub backend_errors: AtomicU64,
    pub backend_timeouts: AtomicU64,
    pub pushes_delivered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "sessions_accepted": get(&self.sessions_accepted),
            "sessions_closed": get(&self.sessions_closed),
            "frames_in": get(&self.frames_in),
            "frames_out": get(&self.frames_out),
            "frames_dropped": get(&self.frames_dropped),
            "auth_failures": get(&self.auth_failures),
            "backend_errors": get(&self.backend_errors),
            "backend_timeouts": get(&self.backend_timeouts),
            "pushes_delivered": get(&self.pushes_delivered),
        })
    }
}
