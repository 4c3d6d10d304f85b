//! Protocol parsing: both transports funnel into one message shape.
//!
//! Binary clients send envelopes directly; HTTP clients send ordinary
//! requests that get translated through the route table into synthetic
//! envelopes. Past this point the dispatch pipeline does not care which
//! transport a message arrived on.

use crate::error::{GatewayError, GatewayResult};
use crate::router::RouteTable;
use mgate_proto::{now_millis, Envelope, PROTOCOL_VERSION};
use std::collections::HashMap;

/// Which transport produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    Binary,
    Http,
}

/// Transport-independent request.
#[derive(Debug)]
pub struct UnifiedMessage {
    pub envelope: Envelope,
    pub origin: MessageOrigin,
    /// Path template captures; empty for binary messages.
    pub path_params: HashMap<String, String>,
}

/// The pieces of an HTTP request the translation needs.
#[derive(Debug, Default)]
pub struct HttpRequestMeta<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// `Authorization` header value, if present.
    pub authorization: Option<&'a str>,
    /// `token` query parameter, used when no Authorization header is set.
    pub query_token: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub platform: Option<&'a str>,
}

/// Device identity assumed for HTTP clients that do not say otherwise.
const HTTP_DEVICE_ID: &str = "http";
const HTTP_PLATFORM: &str = "web";

/// Wrap a decoded binary envelope, rejecting malformed headers.
pub fn from_envelope(envelope: Envelope) -> GatewayResult<UnifiedMessage> {
    envelope.validate()?;
    Ok(UnifiedMessage {
        envelope,
        origin: MessageOrigin::Binary,
        path_params: HashMap::new(),
    })
}

/// Translate an HTTP request into a synthetic envelope via the route
/// table. The matched route must declare a `cmd_id`; path parameters are
/// merged into the body so backends see one canonical shape.
pub fn from_http(
    table: &RouteTable,
    meta: &HttpRequestMeta<'_>,
    body: serde_json::Value,
) -> GatewayResult<UnifiedMessage> {
    let matched = table.lookup(meta.method, meta.path).ok_or_else(|| {
        GatewayError::Routing(format!("{} {} has no route", meta.method, meta.path))
    })?;
    let cmd_id = matched.route.cmd_id.ok_or_else(|| {
        GatewayError::Routing(format!(
            "route {} does not accept direct requests",
            matched.route.pattern
        ))
    })?;

    let token = bearer_token(meta.authorization)
        .or(meta.query_token)
        .unwrap_or_default();

    let mut body = body;
    if !matched.params.is_empty() {
        if body.is_null() {
            body = serde_json::Value::Object(serde_json::Map::new());
        }
        let Some(obj) = body.as_object_mut() else {
            return Err(GatewayError::Routing(
                "parameterized routes require an object body".to_string(),
            ));
        };
        for (name, value) in &matched.params {
            obj.entry(name.clone())
                .or_insert_with(|| serde_json::Value::String(value.clone()));
        }
    }

    let envelope = Envelope {
        version: PROTOCOL_VERSION.to_string(),
        seq: 1,
        cmd_id,
        from_uid: String::new(),
        to_uid: String::new(),
        token: token.to_string(),
        device_id: meta.device_id.unwrap_or(HTTP_DEVICE_ID).to_string(),
        platform: meta.platform.unwrap_or(HTTP_PLATFORM).to_string(),
        timestamp: now_millis(),
        body,
    };
    Ok(UnifiedMessage {
        envelope,
        origin: MessageOrigin::Http,
        path_params: matched.params,
    })
}

/// Pull the token out of an `Authorization: Bearer <token>` value.
pub fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?;
    let rest = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
