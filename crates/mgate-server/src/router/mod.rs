//! Command classification and backend dispatch.
//!
//! The route table maps HTTP path templates and command-id ranges onto
//! backend services. Lookups go through a TTL/LRU cache; forwarding goes
//! over one-shot HTTP with a per-service deadline, and every failure maps
//! to a response envelope so callers always get an answer to correlate.

pub mod cache;
pub mod health;

use crate::config::{RoutesFile, ServiceEndpoint};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::Metrics;
use cache::RouteCache;
use health::HealthRegistry;
use mgate_proto::{Envelope, ErrorCode};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One route entry with its pattern compiled to an anchored regex.
#[derive(Debug)]
pub struct CompiledRoute {
    pub pattern: String,
    regex: Regex,
    /// Uppercased; empty means any method.
    methods: Vec<String>,
    pub cmd_id: Option<u32>,
    pub cmd_range: Option<[u32; 2]>,
    pub service: String,
    pub priority: u32,
}

/// Result of a path lookup: the winning route plus captured parameters.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a CompiledRoute,
    pub params: HashMap<String, String>,
}

/// Immutable, validated route table.
#[derive(Debug)]
pub struct RouteTable {
    /// Sorted by ascending priority; declaration order breaks ties.
    routes: Vec<CompiledRoute>,
    services: HashMap<String, ServiceEndpoint>,
    api_prefix: String,
}

impl RouteTable {
    pub fn new(file: &RoutesFile) -> GatewayResult<Self> {
        let mut routes = Vec::with_capacity(file.routes.len());
        for spec in &file.routes {
            routes.push(CompiledRoute {
                regex: compile_pattern(&spec.pattern)?,
                pattern: spec.pattern.clone(),
                methods: spec.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
                cmd_id: spec.cmd_id,
                cmd_range: spec.cmd_range,
                service: spec.service.clone(),
                priority: spec.priority,
            });
        }
        routes.sort_by_key(|r| r.priority);
        Ok(Self {
            routes,
            services: file.services.clone(),
            api_prefix: file.api_prefix.clone(),
        })
    }

    /// Match a control-plane request against the table. The path must
    /// carry the API prefix; the first route (lowest priority value) whose
    /// method set and pattern both match wins.
    pub fn lookup(&self, method: &str, path: &str) -> Option<RouteMatch<'_>> {
        let relative = path.strip_prefix(self.api_prefix.as_str())?;
        let method = method.to_ascii_uppercase();
        for route in &self.routes {
            if !route.methods.is_empty() && !route.methods.iter().any(|m| *m == method) {
                continue;
            }
            if let Some(caps) = route.regex.captures(relative) {
                let params = route
                    .regex
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        caps.name(name)
                            .map(|m| (name.to_string(), m.as_str().to_string()))
                    })
                    .collect();
                return Some(RouteMatch { route, params });
            }
        }
        None
    }

    /// Map a command id to its owning service via the declared ranges.
    pub fn classify(&self, cmd_id: u32) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| {
                r.cmd_range
                    .is_some_and(|[lo, hi]| (lo..=hi).contains(&cmd_id))
            })
            .map(|r| r.service.as_str())
    }

    pub fn endpoint(&self, service: &str) -> Option<&ServiceEndpoint> {
        self.services.get(service)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

/// Translate a `{name}` path template into an anchored regex with named
/// captures. Parameters match one path segment.
fn compile_pattern(pattern: &str) -> GatewayResult<Regex> {
    let mut out = String::from("^");
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&regex::escape(&rest[..open]));
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            GatewayError::Config(format!("unclosed parameter in pattern {pattern}"))
        })?;
        let name = &after[..close];
        let valid = !name.is_empty()
            && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(GatewayError::Config(format!(
                "bad parameter name {name:?} in pattern {pattern}"
            )));
        }
        out.push_str("(?P<");
        out.push_str(name);
        out.push_str(">[^/]+)");
        rest = &after[close + 1..];
    }
    out.push_str(&regex::escape(rest));
    out.push('$');
    Regex::new(&out)
        .map_err(|e| GatewayError::Config(format!("pattern {pattern} compiles to bad regex: {e}")))
}

/// What a backend answers to a forwarded envelope.
#[derive(Debug, Deserialize)]
struct BackendReply {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Classifies, caches, and forwards envelopes to backend services.
pub struct Router {
    table: RouteTable,
    cache: RouteCache<Option<String>>,
    pub health: Arc<HealthRegistry>,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl Router {
    pub fn new(file: &RoutesFile, metrics: Arc<Metrics>) -> GatewayResult<Self> {
        let table = RouteTable::new(file)?;
        let health = Arc::new(HealthRegistry::new(
            table.service_names().map(str::to_string).collect::<Vec<_>>(),
        ));
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {e}")))?;
        Ok(Self {
            table,
            cache: RouteCache::new(Duration::from_secs(file.cache.ttl_secs), file.cache.capacity),
            health,
            client,
            metrics,
        })
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// `(hits, misses)` of the classification cache, for the health view.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Cached command classification; negative answers are cached too.
    pub fn service_for(&self, cmd_id: u32) -> Option<String> {
        let key = format!("cmd:{cmd_id}");
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }
        let resolved = self.table.classify(cmd_id).map(str::to_string);
        self.cache.put(key, resolved.clone());
        resolved
    }

    /// Forward a request envelope and always produce a response envelope.
    pub async fn forward(&self, request: &Envelope) -> Envelope {
        let Some(service) = self.service_for(request.cmd_id) else {
            debug!(cmd_id = request.cmd_id, "no route for command");
            return Envelope::response_to(
                request,
                ErrorCode::RoutingFailed,
                format!("no route for command {}", request.cmd_id),
                serde_json::Value::Null,
            );
        };
        let Some(endpoint) = self.table.endpoint(&service) else {
            // Unreachable after table validation.
            return Envelope::response_to(
                request,
                ErrorCode::ServerError,
                format!("service {service} is not configured"),
                serde_json::Value::Null,
            );
        };
        if !self.health.is_healthy(&service) {
            Metrics::incr(&self.metrics.backend_errors);
            return Envelope::response_to(
                request,
                ErrorCode::ServerError,
                format!("service {service} is unavailable"),
                serde_json::Value::Null,
            );
        }

        match self.call_backend(endpoint, request).await {
            Ok(reply) => {
                self.health.record_success(&service);
                let code = ErrorCode::from_wire(reply.code).unwrap_or(ErrorCode::ServerError);
                Envelope::response_to(request, code, reply.message, reply.data)
            }
            Err(GatewayError::Timeout) => {
                Metrics::incr(&self.metrics.backend_timeouts);
                warn!(service = %service, cmd_id = request.cmd_id, "backend timeout");
                Envelope::response_to(
                    request,
                    ErrorCode::Timeout,
                    format!("service {service} timed out"),
                    serde_json::Value::Null,
                )
            }
            Err(e) => {
                Metrics::incr(&self.metrics.backend_errors);
                self.health.record_failure(&service);
                warn!(service = %service, cmd_id = request.cmd_id, error = %e, "backend error");
                Envelope::response_to(
                    request,
                    ErrorCode::ServerError,
                    format!("service {service} failed"),
                    serde_json::Value::Null,
                )
            }
        }
    }

    async fn call_backend(
        &self,
        endpoint: &ServiceEndpoint,
        request: &Envelope,
    ) -> GatewayResult<BackendReply> {
        let url = format!("{}/rpc/{}", endpoint.base_url(), request.cmd_id);
        let response = self
            .client
            .post(&url)
            .timeout(endpoint.timeout())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Backend(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Backend(format!("status {status}")));
        }
        response
            .json::<BackendReply>()
            .await
            .map_err(|e| GatewayError::Backend(format!("bad reply: {e}")))
    }
}
