//! Server-initiated push fan-out.
//!
//! Pushes ride the drop-oldest path: a slow device sheds its own backlog
//! without stalling delivery to other devices. All fan-out works over
//! owned registry snapshots, so no registry lock is held while encoding
//! or enqueueing.

use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;
use mgate_proto::Envelope;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a fan-out call: how many sessions took the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushReceipt {
    pub delivered: usize,
    pub missed: usize,
}

pub struct PushDispatcher {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
}

impl PushDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    /// Deliver a notification to every online device of a user.
    pub fn push_to_user(&self, user_id: &str, notice: &Envelope) -> PushReceipt {
        let Ok(frame) = notice.into_frame() else {
            return PushReceipt {
                delivered: 0,
                missed: 0,
            };
        };
        let mut delivered = 0;
        let mut missed = 0;
        for (device_id, platform, session) in self.registry.sessions_of(user_id) {
            if session.push_frame(frame.clone()) {
                delivered += 1;
            } else {
                debug!(
                    session_id = %session.id(),
                    user_id,
                    device_id = %device_id,
                    platform = %platform,
                    "push skipped, session closing"
                );
                missed += 1;
            }
        }
        Metrics::add(&self.metrics.pushes_delivered, delivered as u64);
        PushReceipt { delivered, missed }
    }

    /// Deliver a notification to one specific device.
    pub fn push_to_device(
        &self,
        user_id: &str,
        device_id: &str,
        platform: &str,
        notice: &Envelope,
    ) -> PushReceipt {
        let Some(session) = self.registry.session_of(user_id, device_id, platform) else {
            return PushReceipt {
                delivered: 0,
                missed: 1,
            };
        };
        let Ok(frame) = notice.into_frame() else {
            return PushReceipt {
                delivered: 0,
                missed: 0,
            };
        };
        if session.push_frame(frame) {
            Metrics::incr(&self.metrics.pushes_delivered);
            PushReceipt {
                delivered: 1,
                missed: 0,
            }
        } else {
            PushReceipt {
                delivered: 0,
                missed: 1,
            }
        }
    }

    /// Deliver a notification to every authenticated session.
    pub fn broadcast(&self, notice: &Envelope) -> PushReceipt {
        let Ok(frame) = notice.into_frame() else {
            return PushReceipt {
                delivered: 0,
                missed: 0,
            };
        };
        let mut delivered = 0;
        let mut missed = 0;
        for session in self.registry.all_sessions() {
            if session.push_frame(frame.clone()) {
                delivered += 1;
            } else {
                missed += 1;
            }
        }
        Metrics::add(&self.metrics.pushes_delivered, delivered as u64);
        PushReceipt { delivered, missed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::policy::PlatformPolicies;
    use crate::session::SessionHandle;
    use mgate_proto::cmd;

    fn setup() -> (Arc<ConnectionRegistry>, PushDispatcher) {
        let registry = Arc::new(ConnectionRegistry::new(PlatformPolicies::default()));
        let push = PushDispatcher::new(registry.clone(), Arc::new(Metrics::new()));
        (registry, push)
    }

    fn session() -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new("127.0.0.1:1".parse().unwrap(), 16))
    }

    fn notice(to: &str) -> Envelope {
        Envelope::notification_for(cmd::NOTIFY_SHUTDOWN, to, serde_json::json!({"n": 1}))
    }

    #[test]
    fn fan_out_reaches_all_devices() {
        let (registry, push) = setup();
        let s1 = session();
        let s2 = session();
        registry.bind("alice", "d1", "android", &s1);
        registry.bind("alice", "d2", "android", &s2);
        let receipt = push.push_to_user("alice", &notice("alice"));
        assert_eq!(receipt.delivered, 2);
        assert_eq!(s1.outbox.len(), 1);
        assert_eq!(s2.outbox.len(), 1);
    }

    #[test]
    fn offline_user_misses_nothing() {
        let (_registry, push) = setup();
        let receipt = push.push_to_user("nobody", &notice("nobody"));
        assert_eq!(receipt, PushReceipt { delivered: 0, missed: 0 });
    }

    #[test]
    fn directed_push_hits_one_device() {
        let (registry, push) = setup();
        let s1 = session();
        let s2 = session();
        registry.bind("alice", "d1", "android", &s1);
        registry.bind("alice", "d2", "android", &s2);
        let receipt = push.push_to_device("alice", "d2", "android", &notice("alice"));
        assert_eq!(receipt.delivered, 1);
        assert_eq!(s1.outbox.len(), 0);
        assert_eq!(s2.outbox.len(), 1);
    }

    #[test]
    fn directed_push_to_absent_device_misses() {
        let (registry, push) = setup();
        let s1 = session();
        registry.bind("alice", "d1", "android", &s1);
        let receipt = push.push_to_device("alice", "d9", "android", &notice("alice"));
        assert_eq!(receipt, PushReceipt { delivered: 0, missed: 1 });
    }

    #[test]
    fn broadcast_spans_users() {
        let (registry, push) = setup();
        let s1 = session();
        let s2 = session();
        registry.bind("alice", "d1", "android", &s1);
        registry.bind("bob", "d1", "android", &s2);
        let receipt = push.broadcast(&notice(""));
        assert_eq!(receipt.delivered, 2);
    }

    #[test]
    fn closing_session_counts_as_missed() {
        let (registry, push) = setup();
        let s1 = session();
        registry.bind("alice", "d1", "android", &s1);
        s1.close("test");
        let receipt = push.push_to_user("alice", &notice("alice"));
        assert_eq!(receipt.delivered, 0);
        // Entry may still be present until the close handler runs.
        assert!(receipt.missed <= 1);
    }
}
