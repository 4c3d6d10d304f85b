//! Multi-device connection registry.
//!
//! Authoritative `(user, device, platform) → session` index plus a
//! per-user secondary index. All mutations run under one mutex with O(1)
//! map operations; snapshots handed to callers own their data. Displaced
//! sessions are notified and closed outside the critical section.

use crate::auth::policy::PlatformPolicies;
use crate::session::{Binding, SessionHandle};
use mgate_proto::{cmd, Envelope};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Outcome of a bind attempt.
#[derive(Debug)]
pub enum BindOutcome {
    Accepted,
    /// One or more existing sessions were displaced by this binding.
    Replaced(usize),
    Rejected(&'static str),
}

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<Binding, Arc<SessionHandle>>,
    by_user: HashMap<String, HashSet<(String, String)>>,
}

pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    policies: PlatformPolicies,
}

impl ConnectionRegistry {
    pub fn new(policies: PlatformPolicies) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            policies,
        }
    }

    /// Bind `session` to the triple, applying the platform policy.
    ///
    /// Single-device platforms evict every other binding of the user;
    /// multi-device platforms replace only the exact `(device, platform)`
    /// entry. The entry swap and the session's `OpenUnauth → OpenAuth`
    /// transition happen in the same critical section, so concurrent
    /// snapshots observe either the old session or the new one, never
    /// both and never neither.
    pub fn bind(
        &self,
        user_id: &str,
        device_id: &str,
        platform: &str,
        session: &Arc<SessionHandle>,
    ) -> BindOutcome {
        let binding = Binding {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            platform: platform.to_string(),
        };
        let multi_device = self.policies.policy(platform).multi_device;

        let displaced: Vec<Arc<SessionHandle>>;
        {
            let mut inner = self.inner.lock().unwrap();

            if !session.try_bind(binding.clone()) {
                return BindOutcome::Rejected("session is not awaiting authentication");
            }

            let devices = inner.by_user.entry(user_id.to_string()).or_default();
            let victims: Vec<Binding> = if multi_device {
                devices
                    .iter()
                    .filter(|(d, p)| d == device_id && p == platform)
                    .map(|(d, p)| Binding {
                        user_id: user_id.to_string(),
                        device_id: d.clone(),
                        platform: p.clone(),
                    })
                    .collect()
            } else {
                devices
                    .iter()
                    .map(|(d, p)| Binding {
                        user_id: user_id.to_string(),
                        device_id: d.clone(),
                        platform: p.clone(),
                    })
                    .collect()
            };

            let mut old = Vec::with_capacity(victims.len());
            for key in &victims {
                if let Some(s) = inner.by_key.remove(key) {
                    old.push(s);
                }
            }
            let devices = inner.by_user.entry(user_id.to_string()).or_default();
            for key in &victims {
                devices.remove(&(key.device_id.clone(), key.platform.clone()));
            }
            devices.insert((device_id.to_string(), platform.to_string()));
            inner.by_key.insert(binding, session.clone());
            displaced = old;
        }

        for old in &displaced {
            debug!(
                session_id = %old.id(),
                user_id,
                "session displaced by new binding"
            );
            let notice = Envelope::notification_for(
                cmd::NOTIFY_KICKED,
                user_id,
                serde_json::json!({
                    "reason": "kicked",
                    "message": "signed in from another device",
                }),
            );
            if let Ok(frame) = notice.into_frame() {
                old.push_frame(frame);
            }
            old.close("kicked");
        }

        info!(
            session_id = %session.id(),
            user_id,
            device_id,
            platform,
            displaced = displaced.len(),
            "session bound"
        );
        if displaced.is_empty() {
            BindOutcome::Accepted
        } else {
            BindOutcome::Replaced(displaced.len())
        }
    }

    /// Drop the entry for a session being torn down. Idempotent, and a
    /// no-op when the entry already points at a replacement session.
    pub fn unbind(&self, session: &SessionHandle) {
        let Some(binding) = session.binding() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let matches_session = inner
            .by_key
            .get(&binding)
            .is_some_and(|s| s.id() == session.id());
        if !matches_session {
            return;
        }
        inner.by_key.remove(&binding);
        if let Some(devices) = inner.by_user.get_mut(&binding.user_id) {
            devices.remove(&(binding.device_id.clone(), binding.platform.clone()));
            if devices.is_empty() {
                inner.by_user.remove(&binding.user_id);
            }
        }
        debug!(session_id = %session.id(), user_id = %binding.user_id, "session unbound");
    }

    /// Snapshot of every live session of a user, for push fan-out.
    pub fn sessions_of(&self, user_id: &str) -> Vec<(String, String, Arc<SessionHandle>)> {
        let inner = self.inner.lock().unwrap();
        let Some(devices) = inner.by_user.get(user_id) else {
            return Vec::new();
        };
        devices
            .iter()
            .filter_map(|(device_id, platform)| {
                let key = Binding {
                    user_id: user_id.to_string(),
                    device_id: device_id.clone(),
                    platform: platform.clone(),
                };
                inner
                    .by_key
                    .get(&key)
                    .map(|s| (device_id.clone(), platform.clone(), s.clone()))
            })
            .collect()
    }

    /// Exact lookup for a directed push.
    pub fn session_of(
        &self,
        user_id: &str,
        device_id: &str,
        platform: &str,
    ) -> Option<Arc<SessionHandle>> {
        let key = Binding {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            platform: platform.to_string(),
        };
        self.inner.lock().unwrap().by_key.get(&key).cloned()
    }

    /// Number of distinct users with at least one bound session.
    pub fn online_count(&self) -> usize {
        self.inner.lock().unwrap().by_user.len()
    }

    /// Snapshot of every bound session, for broadcast.
    pub fn all_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.lock().unwrap().by_key.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::policy::PlatformPolicy;
    use crate::session::SessionState;
    use std::collections::HashMap as StdHashMap;

    fn policies() -> PlatformPolicies {
        let mut map = StdHashMap::new();
        map.insert(
            "ios".to_string(),
            PlatformPolicy {
                multi_device: false,
                ..PlatformPolicy::default()
            },
        );
        map.insert(
            "android".to_string(),
            PlatformPolicy {
                multi_device: true,
                ..PlatformPolicy::default()
            },
        );
        PlatformPolicies::new(map)
    }

    fn session() -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new("127.0.0.1:1".parse().unwrap(), 16))
    }

    #[test]
    fn bind_and_lookup() {
        let registry = ConnectionRegistry::new(policies());
        let s = session();
        assert!(matches!(
            registry.bind("alice", "d1", "android", &s),
            BindOutcome::Accepted
        ));
        assert_eq!(s.state(), SessionState::OpenAuth);
        assert_eq!(registry.online_count(), 1);
        let found = registry.session_of("alice", "d1", "android").unwrap();
        assert_eq!(found.id(), s.id());
    }

    #[test]
    fn multi_device_platform_keeps_other_devices() {
        let registry = ConnectionRegistry::new(policies());
        let s1 = session();
        let s2 = session();
        registry.bind("alice", "d1", "android", &s1);
        assert!(matches!(
            registry.bind("alice", "d2", "android", &s2),
            BindOutcome::Accepted
        ));
        assert_eq!(registry.sessions_of("alice").len(), 2);
        assert_eq!(s1.state(), SessionState::OpenAuth);
    }

    #[test]
    fn single_device_platform_kicks_old_session() {
        let registry = ConnectionRegistry::new(policies());
        let s1 = session();
        let s2 = session();
        registry.bind("alice", "d1", "ios", &s1);
        assert!(matches!(
            registry.bind("alice", "d2", "ios", &s2),
            BindOutcome::Replaced(1)
        ));
        // The displaced session got a kicked notification before closing.
        assert_eq!(s1.state(), SessionState::Closing);
        assert_eq!(s1.close_reason(), Some("kicked"));
        assert_eq!(s1.outbox.len(), 1);
        // Exactly one binding remains.
        let sessions = registry.sessions_of("alice");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].2.id(), s2.id());
    }

    #[test]
    fn rebind_same_triple_replaces() {
        let registry = ConnectionRegistry::new(policies());
        let s1 = session();
        let s2 = session();
        registry.bind("alice", "d1", "android", &s1);
        assert!(matches!(
            registry.bind("alice", "d1", "android", &s2),
            BindOutcome::Replaced(1)
        ));
        let found = registry.session_of("alice", "d1", "android").unwrap();
        assert_eq!(found.id(), s2.id());
        assert_eq!(s1.close_reason(), Some("kicked"));
    }

    #[test]
    fn bind_rejected_unless_unauthenticated() {
        let registry = ConnectionRegistry::new(policies());
        let s = session();
        registry.bind("alice", "d1", "android", &s);
        // Session is already OpenAuth; a second bind is rejected.
        assert!(matches!(
            registry.bind("alice", "d2", "android", &s),
            BindOutcome::Rejected(_)
        ));
    }

    #[test]
    fn stale_unbind_does_not_remove_replacement() {
        let registry = ConnectionRegistry::new(policies());
        let s1 = session();
        let s2 = session();
        registry.bind("alice", "d1", "android", &s1);
        registry.bind("alice", "d1", "android", &s2);
        // s1's close handler fires late; it must not evict s2.
        registry.unbind(&s1);
        assert!(registry.session_of("alice", "d1", "android").is_some());
        registry.unbind(&s2);
        assert!(registry.session_of("alice", "d1", "android").is_none());
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn unbind_is_idempotent() {
        let registry = ConnectionRegistry::new(policies());
        let s = session();
        registry.bind("alice", "d1", "android", &s);
        registry.unbind(&s);
        registry.unbind(&s);
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn snapshot_is_owned() {
        let registry = ConnectionRegistry::new(policies());
        let s = session();
        registry.bind("alice", "d1", "android", &s);
        let snapshot = registry.sessions_of("alice");
        registry.unbind(&s);
        // The snapshot remains usable after the entry is gone.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].2.id(), s.id());
    }
}
