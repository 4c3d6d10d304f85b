//! Gateway configuration: two TOML files plus CLI overrides.
//!
//! The route table file declares backend services, per-route patterns and
//! command-id ranges, and route-cache bounds. The platform file declares
//! per-platform multi-device and token policy. Server timing knobs carry
//! protocol defaults and can be overridden from the CLI.

use crate::auth::policy::{PlatformPolicies, PlatformPolicy};
use crate::error::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Route table file: `routes.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutesFile {
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub services: HashMap<String, ServiceEndpoint>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteSpec>,
}

/// `[server]` section: listener addresses and connection-core knobs.
/// CLI flags override these.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_read_idle_secs")]
    pub read_idle_secs: u64,
    #[serde(default = "default_auth_grace_secs")]
    pub auth_grace_secs: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    /// Token signing secret, hex-encoded. Generated per run when absent.
    #[serde(default)]
    pub secret: Option<String>,
    /// Whether verification extends a token nearing expiry in place.
    #[serde(default = "default_auto_refresh")]
    pub auto_refresh: bool,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_bind: default_http_bind(),
            heartbeat_secs: default_heartbeat_secs(),
            read_idle_secs: default_read_idle_secs(),
            auth_grace_secs: default_auth_grace_secs(),
            send_queue_capacity: default_send_queue_capacity(),
            secret: None,
            auto_refresh: default_auto_refresh(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

/// `[services.<name>]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl ServiceEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One `[[route]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
    /// Command id synthesized for control-plane requests matching this route.
    #[serde(default)]
    pub cmd_id: Option<u32>,
    /// Inclusive `[lo, hi]` command-id range served by this route's service.
    #[serde(default)]
    pub cmd_range: Option<[u32; 2]>,
    pub service: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

/// Platform strategy file: `platforms.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformsFile {
    #[serde(default)]
    pub platforms: HashMap<String, PlatformPolicy>,
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}
fn default_bind() -> String {
    "0.0.0.0:9100".to_string()
}
fn default_http_bind() -> String {
    "0.0.0.0:9101".to_string()
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_read_idle_secs() -> u64 {
    120
}
fn default_auth_grace_secs() -> u64 {
    30
}
fn default_send_queue_capacity() -> usize {
    1024
}
fn default_auto_refresh() -> bool {
    true
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_cache_ttl() -> u64 {
    600
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_backend_timeout_ms() -> u64 {
    5000
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_priority() -> u32 {
    100
}

/// Timing and capacity knobs for the connection core.
#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub heartbeat: Duration,
    pub read_idle: Duration,
    pub auth_grace: Duration,
    pub send_queue_capacity: usize,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            read_idle: Duration::from_secs(120),
            auth_grace: Duration::from_secs(30),
            send_queue_capacity: 1024,
        }
    }
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Binary (framed) transport listener address.
    pub bind: String,
    /// Control-plane (HTTP) listener address.
    pub http_bind: String,
    pub timings: SessionTimings,
    pub routes: RoutesFile,
    pub platforms: PlatformPolicies,
    /// HMAC secret for token signing.
    pub secret: Vec<u8>,
    /// Whether verify extends a token nearing expiry in place.
    pub auto_refresh: bool,
    /// Grace period for session loops to drain on shutdown.
    pub shutdown_grace: Duration,
}

/// CLI-provided overrides applied on top of the files.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub http_bind: Option<String>,
    pub secret_hex: Option<String>,
    pub auth_grace_secs: Option<u64>,
    pub heartbeat_secs: Option<u64>,
}

impl GatewayConfig {
    pub fn load(
        routes_path: &Path,
        platforms_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> GatewayResult<Self> {
        let routes_raw = std::fs::read_to_string(routes_path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", routes_path.display()))
        })?;
        let routes: RoutesFile = toml::from_str(&routes_raw)
            .map_err(|e| GatewayError::Config(format!("route table parse error: {e}")))?;
        info!(
            path = %routes_path.display(),
            routes = routes.routes.len(),
            services = routes.services.len(),
            "loaded route table"
        );
        validate_routes(&routes)?;

        let platforms = match platforms_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    GatewayError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                let file: PlatformsFile = toml::from_str(&raw)
                    .map_err(|e| GatewayError::Config(format!("platform table parse error: {e}")))?;
                info!(path = %path.display(), platforms = file.platforms.len(), "loaded platform table");
                PlatformPolicies::new(file.platforms)
            }
            Some(path) => {
                warn!(path = %path.display(), "platform table not found, using defaults");
                PlatformPolicies::default()
            }
            None => PlatformPolicies::default(),
        };

        let server = routes.server.clone();
        let secret = match overrides.secret_hex.as_deref().or(server.secret.as_deref()) {
            Some(hexstr) => hex::decode(hexstr)
                .map_err(|e| GatewayError::Config(format!("bad secret hex: {e}")))?,
            None => {
                warn!("no token secret configured, generating one; tokens will not survive restart");
                mgate_proto::token::generate_secret()
            }
        };

        let mut timings = SessionTimings {
            heartbeat: Duration::from_secs(server.heartbeat_secs),
            read_idle: Duration::from_secs(server.read_idle_secs),
            auth_grace: Duration::from_secs(server.auth_grace_secs),
            send_queue_capacity: server.send_queue_capacity,
        };
        if let Some(secs) = overrides.auth_grace_secs {
            timings.auth_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.heartbeat_secs {
            timings.heartbeat = Duration::from_secs(secs);
        }

        Ok(Self {
            bind: overrides.bind.unwrap_or(server.bind),
            http_bind: overrides.http_bind.unwrap_or(server.http_bind),
            timings,
            routes,
            platforms,
            secret,
            auto_refresh: server.auto_refresh,
            shutdown_grace: Duration::from_secs(server.shutdown_grace_secs),
        })
    }
}

/// Reject tables that violate the route invariants before startup.
fn validate_routes(routes: &RoutesFile) -> GatewayResult<()> {
    for spec in &routes.routes {
        if !routes.services.contains_key(&spec.service) {
            return Err(GatewayError::Config(format!(
                "route {} references unknown service {}",
                spec.pattern, spec.service
            )));
        }
        if let Some([lo, hi]) = spec.cmd_range {
            if lo > hi {
                return Err(GatewayError::Config(format!(
                    "route {} has inverted cmd_range [{lo}, {hi}]",
                    spec.pattern
                )));
            }
        }
    }

    // No two entries with equal priority may claim the same (method, pattern)
    // or overlapping cmd ranges.
    for (i, a) in routes.routes.iter().enumerate() {
        for b in routes.routes.iter().skip(i + 1) {
            if a.priority != b.priority {
                continue;
            }
            if a.pattern == b.pattern && a.methods.iter().any(|m| b.methods.contains(m)) {
                return Err(GatewayError::Config(format!(
                    "duplicate route {} at priority {}",
                    a.pattern, a.priority
                )));
            }
            if let (Some([alo, ahi]), Some([blo, bhi])) = (a.cmd_range, b.cmd_range) {
                if alo <= bhi && blo <= ahi {
                    return Err(GatewayError::Config(format!(
                        "overlapping cmd ranges [{alo}, {ahi}] and [{blo}, {bhi}] at priority {}",
                        a.priority
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        api_prefix = "/api/v1"

        [cache]
        ttl_secs = 600
        capacity = 1000

        [services.user]
        host = "127.0.0.1"
        port = 8101

        [services.message]
        host = "127.0.0.1"
        port = 8102
        timeout_ms = 500

        [[route]]
        pattern = "/auth/login"
        methods = ["POST"]
        cmd_id = 1001
        cmd_range = [1000, 1999]
        service = "user"
        priority = 10

        [[route]]
        pattern = "/message/send"
        methods = ["POST"]
        cmd_id = 2001
        cmd_range = [2000, 2999]
        service = "message"
        priority = 10
    "#;

    #[test]
    fn parses_route_table() {
        let file: RoutesFile = toml::from_str(SAMPLE).unwrap();
        assert_eq!(file.routes.len(), 2);
        assert_eq!(file.services["message"].timeout_ms, 500);
        assert_eq!(file.services["user"].timeout_ms, 5000);
        validate_routes(&file).unwrap();
    }

    #[test]
    fn rejects_overlapping_ranges_at_same_priority() {
        let mut file: RoutesFile = toml::from_str(SAMPLE).unwrap();
        file.routes[1].cmd_range = Some([1500, 2500]);
        assert!(validate_routes(&file).is_err());
    }

    #[test]
    fn rejects_unknown_service() {
        let mut file: RoutesFile = toml::from_str(SAMPLE).unwrap();
        file.routes[0].service = "ghost".into();
        assert!(validate_routes(&file).is_err());
    }

    #[test]
    fn server_section_parses_with_partial_fields() {
        let file: RoutesFile = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:4000"
            heartbeat_secs = 10
            send_queue_capacity = 64
            "#,
        )
        .unwrap();
        assert_eq!(file.server.bind, "127.0.0.1:4000");
        assert_eq!(file.server.heartbeat_secs, 10);
        assert_eq!(file.server.send_queue_capacity, 64);
        // Unset fields fall back.
        assert_eq!(file.server.http_bind, "0.0.0.0:9101");
        assert_eq!(file.server.read_idle_secs, 120);
        assert!(file.server.auto_refresh);
        assert!(file.server.secret.is_none());
    }

    #[test]
    fn default_timings_match_protocol() {
        let t = SessionTimings::default();
        assert_eq!(t.heartbeat, Duration::from_secs(30));
        assert_eq!(t.read_idle, Duration::from_secs(120));
        assert_eq!(t.auth_grace, Duration::from_secs(30));
        assert_eq!(t.send_queue_capacity, 1024);
    }
}
