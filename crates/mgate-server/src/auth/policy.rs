//! Per-platform session and token policy.

use serde::Deserialize;
use std::collections::HashMap;

/// Policy applied when issuing tokens and binding sessions for a platform.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformPolicy {
    /// Whether the same user may stay online on several devices of this
    /// platform at once. When false, a new binding evicts all others.
    #[serde(default = "default_multi_device")]
    pub multi_device: bool,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_user: usize,
    /// Signing algorithm identifier; only hmac-sha256 is implemented.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl Default for PlatformPolicy {
    fn default() -> Self {
        Self {
            multi_device: default_multi_device(),
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
            max_tokens_per_user: default_max_tokens(),
            algorithm: default_algorithm(),
        }
    }
}

fn default_multi_device() -> bool {
    true
}
fn default_access_ttl() -> u64 {
    3600
}
fn default_refresh_ttl() -> u64 {
    30 * 24 * 3600
}
fn default_max_tokens() -> usize {
    16
}
fn default_algorithm() -> String {
    "hmac-sha256".to_string()
}

/// Platform policy table with a fallback for unknown platforms.
#[derive(Debug, Clone, Default)]
pub struct PlatformPolicies {
    platforms: HashMap<String, PlatformPolicy>,
    fallback: PlatformPolicy,
}

impl PlatformPolicies {
    pub fn new(platforms: HashMap<String, PlatformPolicy>) -> Self {
        Self {
            platforms,
            fallback: PlatformPolicy::default(),
        }
    }

    pub fn policy(&self, platform: &str) -> &PlatformPolicy {
        self.platforms.get(platform).unwrap_or(&self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_platform_gets_fallback() {
        let mut map = HashMap::new();
        map.insert(
            "ios".to_string(),
            PlatformPolicy {
                multi_device: false,
                ..PlatformPolicy::default()
            },
        );
        let policies = PlatformPolicies::new(map);
        assert!(!policies.policy("ios").multi_device);
        assert!(policies.policy("fridge").multi_device);
    }
}
