//! Authentication manager: token issuance, verification, refresh, and
//! revocation.
//!
//! Two token families share one store: short-lived access tokens presented
//! per request and long-lived refresh tokens used to mint new pairs. The
//! primary map is `token → record` with a `user → tokens` secondary index,
//! both under a single mutex. Signature validity proves the gateway minted
//! a token; the store decides whether it is still live, so sliding renewal
//! can extend a token past the expiry minted into it.

pub mod policy;
pub mod rate_limit;

use crate::error::{GatewayError, GatewayResult};
use mgate_proto::token;
use policy::PlatformPolicies;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Identity resolved from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: String,
    pub device_id: String,
    pub platform: String,
}

/// Freshly minted token pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone)]
struct TokenRecord {
    user_id: String,
    device_id: String,
    platform: String,
    kind: TokenKind,
    issue_seq: u64,
    expires_at: u64,
    last_used: u64,
    /// The other half of the pair this token was issued with.
    pair: String,
}

#[derive(Default)]
struct AuthInner {
    tokens: HashMap<String, TokenRecord>,
    by_user: HashMap<String, HashSet<String>>,
    /// Monotonic issuance order, used for oldest-first eviction.
    issue_seq: u64,
}

pub struct AuthManager {
    inner: Mutex<AuthInner>,
    policies: PlatformPolicies,
    secret: Vec<u8>,
    auto_refresh: bool,
}

/// Tokens removed per lock acquisition during a sweep, so verification is
/// never starved behind a long-held lock.
const SWEEP_BATCH: usize = 256;

impl AuthManager {
    pub fn new(policies: PlatformPolicies, secret: Vec<u8>, auto_refresh: bool) -> Self {
        Self {
            inner: Mutex::new(AuthInner::default()),
            policies,
            secret,
            auto_refresh,
        }
    }

    /// Issue a new access/refresh pair, evicting the user's oldest tokens
    /// when the per-user cap is exceeded.
    pub fn issue(&self, user_id: &str, device_id: &str, platform: &str) -> TokenPair {
        let policy = self.policies.policy(platform);
        if policy.algorithm != "hmac-sha256" {
            warn!(
                platform,
                algorithm = %policy.algorithm,
                "unsupported signing algorithm, falling back to hmac-sha256"
            );
        }
        let now = now_secs();
        let access = token::mint(&self.secret, user_id, policy.access_ttl_secs);
        let refresh = token::mint(&self.secret, user_id, policy.refresh_ttl_secs);
        let access_expires_at = now + policy.access_ttl_secs;

        let mut inner = self.inner.lock().unwrap();
        let record = |inner: &mut AuthInner, tok: &str, kind, expires_at, pair: &str| {
            inner.issue_seq += 1;
            let rec = TokenRecord {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                platform: platform.to_string(),
                kind,
                issue_seq: inner.issue_seq,
                expires_at,
                last_used: now,
                pair: pair.to_string(),
            };
            inner.tokens.insert(tok.to_string(), rec);
            inner
                .by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(tok.to_string());
        };
        record(&mut inner, &access, TokenKind::Access, access_expires_at, &refresh);
        record(
            &mut inner,
            &refresh,
            TokenKind::Refresh,
            now + policy.refresh_ttl_secs,
            &access,
        );

        let evicted = enforce_cap(&mut inner, user_id, policy.max_tokens_per_user);
        if evicted > 0 {
            debug!(user_id, evicted, "token cap eviction");
        }

        info!(user_id, device_id, platform, "token pair issued");
        TokenPair {
            access_token: access,
            refresh_token: refresh,
            access_expires_at,
        }
    }

    /// Verify an access token: present in the store, of the right kind,
    /// unexpired, and carrying a valid signature. Stamps last-use and, when
    /// auto-refresh is on and less than half the TTL remains, extends the
    /// expiry in place without changing the token string.
    pub fn verify_access(&self, presented: &str) -> GatewayResult<UserInfo> {
        if presented.is_empty() {
            return Err(GatewayError::AuthFailed("missing token".into()));
        }
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.tokens.get(presented).cloned() else {
            return Err(GatewayError::AuthFailed("unknown or revoked token".into()));
        };
        if record.kind != TokenKind::Access {
            return Err(GatewayError::AuthFailed("not an access token".into()));
        }
        if now >= record.expires_at {
            remove_token(&mut inner, presented);
            return Err(GatewayError::AuthFailed("token expired".into()));
        }
        token::verify_signature(&self.secret, &record.user_id, presented)
            .map_err(|e| GatewayError::AuthFailed(e.to_string()))?;

        let ttl = self.policies.policy(&record.platform).access_ttl_secs;
        if let Some(rec) = inner.tokens.get_mut(presented) {
            rec.last_used = now;
            let remaining = rec.expires_at.saturating_sub(now);
            if self.auto_refresh && remaining < ttl / 2 {
                rec.expires_at = now + ttl;
            }
        }

        Ok(UserInfo {
            user_id: record.user_id,
            device_id: record.device_id,
            platform: record.platform,
        })
    }

    /// Exchange a refresh token for a new pair, atomically invalidating the
    /// old pair.
    pub fn refresh(&self, presented: &str) -> GatewayResult<TokenPair> {
        let now = now_secs();
        let identity = {
            let mut inner = self.inner.lock().unwrap();
            let Some(record) = inner.tokens.get(presented).cloned() else {
                return Err(GatewayError::AuthFailed("unknown or revoked token".into()));
            };
            if record.kind != TokenKind::Refresh {
                return Err(GatewayError::AuthFailed("not a refresh token".into()));
            }
            if now >= record.expires_at {
                remove_token(&mut inner, presented);
                return Err(GatewayError::AuthFailed("refresh token expired".into()));
            }
            token::verify_signature(&self.secret, &record.user_id, presented)
                .map_err(|e| GatewayError::AuthFailed(e.to_string()))?;
            // Old pair dies before the new one exists.
            remove_token(&mut inner, &record.pair);
            remove_token(&mut inner, presented);
            record
        };
        Ok(self.issue(&identity.user_id, &identity.device_id, &identity.platform))
    }

    /// Revoke a token and the other half of its pair.
    pub fn revoke(&self, presented: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pair) = inner.tokens.get(presented).map(|rec| rec.pair.clone()) {
            remove_token(&mut inner, &pair);
        }
        remove_token(&mut inner, presented);
    }

    /// Revoke every token bound to a user.
    pub fn revoke_user(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tokens) = inner.by_user.remove(user_id) {
            let count = tokens.len();
            for tok in tokens {
                inner.tokens.remove(&tok);
            }
            info!(user_id, count, "user tokens revoked");
        }
    }

    /// Remove expired tokens, releasing the lock between batches.
    pub fn sweep_expired(&self) -> usize {
        let keys: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.tokens.keys().cloned().collect()
        };
        let now = now_secs();
        let mut removed = 0;
        for chunk in keys.chunks(SWEEP_BATCH) {
            let mut inner = self.inner.lock().unwrap();
            for key in chunk {
                let expired = inner
                    .tokens
                    .get(key)
                    .is_some_and(|rec| now >= rec.expires_at);
                if expired {
                    remove_token(&mut inner, key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "expired tokens swept");
        }
        removed
    }

    /// Number of live tokens for a user.
    #[cfg(test)]
    pub fn token_count(&self, user_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .by_user
            .get(user_id)
            .map_or(0, |set| set.len())
    }
}

fn remove_token(inner: &mut AuthInner, presented: &str) {
    if let Some(record) = inner.tokens.remove(presented) {
        if let Some(set) = inner.by_user.get_mut(&record.user_id) {
            set.remove(presented);
            if set.is_empty() {
                inner.by_user.remove(&record.user_id);
            }
        }
    }
}

/// Evict the user's oldest tokens (by issuance order) down to `cap`.
fn enforce_cap(inner: &mut AuthInner, user_id: &str, cap: usize) -> usize {
    let mut evicted = 0;
    loop {
        let over = inner
            .by_user
            .get(user_id)
            .map_or(0, |set| set.len().saturating_sub(cap));
        if over == 0 {
            return evicted;
        }
        let oldest = inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .min_by_key(|tok| inner.tokens.get(*tok).map_or(0, |r| r.issue_seq))
            .cloned();
        match oldest {
            Some(tok) => {
                remove_token(inner, &tok);
                evicted += 1;
            }
            None => return evicted,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
