//! HTTP control plane.
//!
//! One explicit endpoint (`GET /health`) plus a fallback that runs every
//! other request through the route table: translate to an envelope,
//! handle gateway commands locally, forward the rest, and map the reply
//! code back onto an HTTP status. HTTP clients get the same semantics as
//! binary clients without holding a connection open.

use crate::auth::rate_limit::GatewayRateLimits;
use crate::auth::AuthManager;
use crate::dispatch::EnvelopeDispatcher;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::parser::{self, HttpRequestMeta};
use crate::push::PushDispatcher;
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use mgate_proto::{cmd, Envelope, ErrorCode};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct ControlState {
    pub auth: Arc<AuthManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<Router>,
    pub dispatcher: Arc<EnvelopeDispatcher>,
    pub push: Arc<PushDispatcher>,
    pub metrics: Arc<Metrics>,
    pub rate_limits: Arc<Mutex<GatewayRateLimits>>,
}

pub fn control_router(state: Arc<ControlState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(handle_health))
        .route("/internal/push", post(handle_push))
        .fallback(handle_api)
        .with_state(state)
}

async fn handle_health(State(state): State<Arc<ControlState>>) -> Response {
    let (cache_hits, cache_misses) = state.router.cache_stats();
    let body = serde_json::json!({
        "status": "ok",
        "online_users": state.registry.online_count(),
        "services": state.router.health.snapshot(),
        "route_cache": {
            "size": state.router.cache_len(),
            "hits": cache_hits,
            "misses": cache_misses,
        },
        "metrics": state.metrics.snapshot(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// What a backend posts to deliver a notification to online devices.
#[derive(Debug, Deserialize)]
struct PushRequest {
    to_uid: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    cmd_id: u32,
    #[serde(default)]
    body: serde_json::Value,
}

/// Backend-facing fan-out. Listens on the internal bind only; this is
/// how services reach clients the gateway holds connections for.
async fn handle_push(
    State(state): State<Arc<ControlState>>,
    Json(request): Json<PushRequest>,
) -> Response {
    if request.to_uid.is_empty() || request.cmd_id == 0 {
        return error_response(
            ErrorCode::InvalidRequest,
            "to_uid and cmd_id are required".to_string(),
        );
    }
    let notice = Envelope::notification_for(request.cmd_id, &request.to_uid, request.body);
    let receipt = match (&request.device_id, &request.platform) {
        (Some(device_id), Some(platform)) => {
            state
                .push
                .push_to_device(&request.to_uid, device_id, platform, &notice)
        }
        _ => state.push.push_to_user(&request.to_uid, &notice),
    };
    let body = serde_json::json!({
        "status_code": ErrorCode::Ok.wire(),
        "message": "ok",
        "data": { "delivered": receipt.delivered, "missed": receipt.missed },
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// Everything under the API prefix funnels through here.
async fn handle_api(
    State(state): State<Arc<ControlState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body_json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return error_response(ErrorCode::DecodeFailed, format!("bad json body: {e}"))
            }
        }
    };

    let authorization = header_str(&headers, "authorization");
    let query_token = query_param(uri.query(), "token");
    let meta = HttpRequestMeta {
        method: method.as_str(),
        path: uri.path(),
        authorization,
        query_token,
        device_id: header_str(&headers, "x-device-id"),
        platform: header_str(&headers, "x-platform"),
    };

    let message = match parser::from_http(state.router.table(), &meta, body_json) {
        Ok(message) => message,
        Err(GatewayError::Routing(msg)) => {
            debug!(method = %method, path = %uri.path(), "no route");
            return error_response(ErrorCode::RoutingFailed, msg);
        }
        Err(e) => return error_response(e.code(), e.to_string()),
    };
    debug!(
        origin = ?message.origin,
        cmd_id = message.envelope.cmd_id,
        params = message.path_params.len(),
        "request translated"
    );
    let mut envelope = message.envelope;

    let reply = match envelope.cmd_id {
        cmd::LOGIN => {
            let allowed = state
                .rate_limits
                .lock()
                .map(|mut limits| limits.check_login(&addr.ip()))
                .unwrap_or(true);
            if !allowed {
                Metrics::incr(&state.metrics.auth_failures);
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "status_code": ErrorCode::AuthFailed.wire(),
                        "message": "too many login attempts",
                        "data": null,
                    })),
                )
                    .into_response();
            }
            state.dispatcher.login(&envelope).await
        }
        cmd::REFRESH_TOKEN => handle_refresh(&state, &envelope),
        cmd::LOGOUT => handle_logout(&state, &envelope),
        cmd::AUTH => {
            return error_response(
                ErrorCode::InvalidRequest,
                "connection binding requires the binary transport".to_string(),
            )
        }
        _ => {
            // Regular API call: the token must resolve before anything
            // is forwarded.
            match state.auth.verify_access(&envelope.token) {
                Ok(info) => {
                    envelope.from_uid = info.user_id;
                    state.router.forward(&envelope).await
                }
                Err(e) => {
                    Metrics::incr(&state.metrics.auth_failures);
                    return error_response(ErrorCode::AuthFailed, e.to_string());
                }
            }
        }
    };

    envelope_response(&reply)
}

fn handle_refresh(state: &ControlState, envelope: &Envelope) -> Envelope {
    // The refresh token may ride the Authorization header or the body.
    let presented = if envelope.token.is_empty() {
        envelope.body["refresh_token"].as_str().unwrap_or_default()
    } else {
        envelope.token.as_str()
    };
    match state.auth.refresh(presented) {
        Ok(pair) => Envelope::response_to(
            envelope,
            ErrorCode::Ok,
            "ok",
            serde_json::json!({
                "access_token": pair.access_token,
                "refresh_token": pair.refresh_token,
                "expires_at": pair.access_expires_at,
            }),
        ),
        Err(e) => {
            Metrics::incr(&state.metrics.auth_failures);
            Envelope::response_to(envelope, ErrorCode::AuthFailed, e.to_string(), serde_json::Value::Null)
        }
    }
}

fn handle_logout(state: &ControlState, envelope: &Envelope) -> Envelope {
    match state.auth.verify_access(&envelope.token) {
        Ok(info) => {
            if envelope.body["all_devices"].as_bool().unwrap_or(false) {
                state.auth.revoke_user(&info.user_id);
            } else {
                state.auth.revoke(&envelope.token);
            }
            Envelope::response_to(envelope, ErrorCode::Ok, "ok", serde_json::Value::Null)
        }
        Err(e) => {
            Metrics::incr(&state.metrics.auth_failures);
            Envelope::response_to(envelope, ErrorCode::AuthFailed, e.to_string(), serde_json::Value::Null)
        }
    }
}

/// Map a response envelope onto an HTTP reply: status from the embedded
/// code, body reshaped to the control-plane `{status_code, message, data}`
/// convention.
fn envelope_response(reply: &Envelope) -> Response {
    let code = reply.body["code"]
        .as_u64()
        .and_then(|c| ErrorCode::from_wire(c as u32))
        .unwrap_or(ErrorCode::ServerError);
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "status_code": code.wire(),
        "message": reply.body["message"].as_str().unwrap_or(""),
        "data": reply.body["data"],
    });
    (status, Json(body)).into_response()
}

fn error_response(code: ErrorCode, message: String) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "status_code": code.wire(),
        "message": message,
        "data": null,
    });
    (status, Json(body)).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Minimal query-string scan; the control plane only ever reads `token`.
fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name && !v.is_empty() {
            Some(v)
        } else {
            None
        }
    })
}
