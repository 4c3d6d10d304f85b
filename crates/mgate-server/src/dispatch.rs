//! Envelope dispatch pipeline for the binary transport.
//!
//! Every inbound request envelope ends in exactly one of: a response sent
//! back on the same session, a dropped response under backpressure, or a
//! session close. Gateway-owned commands (auth lifecycle) are handled
//! here; everything else goes through the router.

use crate::auth::AuthManager;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::parser;
use crate::registry::{BindOutcome, ConnectionRegistry};
use crate::router::Router;
use crate::session::SessionHandle;
use mgate_proto::{cmd, Envelope, ErrorCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before closing a session we just sent a terminal response to,
/// so the write loop gets a chance to flush it.
const CLOSE_FLUSH_DELAY: Duration = Duration::from_millis(100);

pub struct EnvelopeDispatcher {
    auth: Arc<AuthManager>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
}

impl EnvelopeDispatcher {
    pub fn new(
        auth: Arc<AuthManager>,
        registry: Arc<ConnectionRegistry>,
        router: Arc<Router>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            auth,
            registry,
            router,
            metrics,
        }
    }

    /// Handle one decoded envelope from a session's read loop.
    pub async fn dispatch(&self, session: Arc<SessionHandle>, envelope: Envelope) {
        if envelope.is_notification() {
            // seq 0 belongs to the server; a client using it gets an
            // uncorrelatable answer, which is the point.
            self.respond(
                &session,
                Envelope::response_to(
                    &envelope,
                    ErrorCode::InvalidRequest,
                    "seq 0 is reserved for server notifications",
                    serde_json::Value::Null,
                ),
            );
            return;
        }

        let message = match parser::from_envelope(envelope.clone()) {
            Ok(message) => message,
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "invalid envelope");
                self.respond(
                    &session,
                    Envelope::response_to(
                        &envelope,
                        e.code(),
                        e.to_string(),
                        serde_json::Value::Null,
                    ),
                );
                return;
            }
        };
        let request = message.envelope;

        let reply = match request.cmd_id {
            cmd::AUTH => self.handle_auth(&session, &request),
            cmd::LOGIN => self.login(&request).await,
            cmd::LOGOUT => self.handle_logout(&session, &request),
            cmd::REFRESH_TOKEN => self.handle_refresh(&request),
            _ => {
                if !session.is_authenticated() {
                    Metrics::incr(&self.metrics.auth_failures);
                    let reply = Envelope::response_to(
                        &request,
                        ErrorCode::AuthFailed,
                        "authenticate first",
                        serde_json::Value::Null,
                    );
                    self.respond(&session, reply);
                    self.close_after_flush(&session, "unauthenticated");
                    return;
                }
                self.router.forward(&request).await
            }
        };
        self.respond(&session, reply);
    }

    /// Bind the connection with an access token.
    fn handle_auth(&self, session: &Arc<SessionHandle>, request: &Envelope) -> Envelope {
        let info = match self.auth.verify_access(&request.token) {
            Ok(info) => info,
            Err(e) => {
                Metrics::incr(&self.metrics.auth_failures);
                debug!(session_id = %session.id(), error = %e, "auth rejected");
                return Envelope::response_to(
                    request,
                    ErrorCode::AuthFailed,
                    e.to_string(),
                    serde_json::Value::Null,
                );
            }
        };
        // The envelope may name a more specific device than the token
        // (tokens issued over HTTP carry placeholder identity).
        let device_id = if request.device_id.is_empty() {
            info.device_id.as_str()
        } else {
            request.device_id.as_str()
        };
        let platform = if request.platform.is_empty() {
            info.platform.as_str()
        } else {
            request.platform.as_str()
        };

        match self
            .registry
            .bind(&info.user_id, device_id, platform, session)
        {
            BindOutcome::Accepted | BindOutcome::Replaced(_) => {
                info!(
                    session_id = %session.id(),
                    user_id = %info.user_id,
                    "session authenticated"
                );
                Envelope::response_to(
                    request,
                    ErrorCode::Ok,
                    "ok",
                    serde_json::json!({
                        "user_id": info.user_id,
                        "device_id": device_id,
                        "platform": platform,
                    }),
                )
            }
            BindOutcome::Rejected(reason) => Envelope::response_to(
                request,
                ErrorCode::InvalidRequest,
                reason,
                serde_json::Value::Null,
            ),
        }
    }

    /// Login: the user service checks credentials, the gateway mints the
    /// tokens. A binary connection stays unauthenticated until `AUTH`;
    /// the control plane reuses this path for `POST /auth/login`.
    pub(crate) async fn login(&self, request: &Envelope) -> Envelope {
        let reply = self.router.forward(request).await;
        let code = reply.body["code"].as_u64().unwrap_or(ErrorCode::ServerError.wire() as u64);
        if code != ErrorCode::Ok.wire() as u64 {
            if code == ErrorCode::AuthFailed.wire() as u64 {
                Metrics::incr(&self.metrics.auth_failures);
            }
            return reply;
        }
        let Some(user_id) = reply.body["data"]["user_id"].as_str().map(str::to_string) else {
            warn!(cmd_id = request.cmd_id, "login reply carried no user_id");
            return Envelope::response_to(
                request,
                ErrorCode::ServerError,
                "login reply malformed",
                serde_json::Value::Null,
            );
        };
        let pair = self
            .auth
            .issue(&user_id, &request.device_id, &request.platform);

        let mut data = reply.body["data"].clone();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("access_token".into(), pair.access_token.into());
            obj.insert("refresh_token".into(), pair.refresh_token.into());
            obj.insert("expires_at".into(), pair.access_expires_at.into());
            obj.insert("device_id".into(), request.device_id.clone().into());
            obj.insert("platform".into(), request.platform.clone().into());
        }
        Envelope::response_to(request, ErrorCode::Ok, "ok", data)
    }

    /// Logout: revoke the pair (or, with `all_devices`, every token of
    /// the user), then tear the connection down once the response has had
    /// a chance to flush.
    fn handle_logout(&self, session: &Arc<SessionHandle>, request: &Envelope) -> Envelope {
        match self.auth.verify_access(&request.token) {
            Ok(info) => {
                if request.body["all_devices"].as_bool().unwrap_or(false) {
                    self.auth.revoke_user(&info.user_id);
                } else {
                    self.auth.revoke(&request.token);
                }
                info!(session_id = %session.id(), user_id = %info.user_id, "logout");
                if session.is_authenticated() {
                    self.close_after_flush(session, "logout");
                }
                Envelope::response_to(request, ErrorCode::Ok, "ok", serde_json::Value::Null)
            }
            Err(e) => {
                Metrics::incr(&self.metrics.auth_failures);
                Envelope::response_to(
                    request,
                    ErrorCode::AuthFailed,
                    e.to_string(),
                    serde_json::Value::Null,
                )
            }
        }
    }

    fn handle_refresh(&self, request: &Envelope) -> Envelope {
        match self.auth.refresh(&request.token) {
            Ok(pair) => Envelope::response_to(
                request,
                ErrorCode::Ok,
                "ok",
                serde_json::json!({
                    "access_token": pair.access_token,
                    "refresh_token": pair.refresh_token,
                    "expires_at": pair.access_expires_at,
                }),
            ),
            Err(e) => {
                Metrics::incr(&self.metrics.auth_failures);
                Envelope::response_to(
                    request,
                    ErrorCode::AuthFailed,
                    e.to_string(),
                    serde_json::Value::Null,
                )
            }
        }
    }

    /// Send a response, shedding it under backpressure. A full queue on
    /// the response path never kills the connection.
    fn respond(&self, session: &Arc<SessionHandle>, reply: Envelope) {
        match session.send(&reply) {
            Ok(()) => {}
            Err(GatewayError::Backpressure) => {
                Metrics::incr(&self.metrics.frames_dropped);
                debug!(
                    session_id = %session.id(),
                    seq = reply.seq,
                    "response dropped, send queue full"
                );
            }
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "response not sent");
            }
        }
    }

    fn close_after_flush(&self, session: &Arc<SessionHandle>, reason: &'static str) {
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_FLUSH_DELAY).await;
            session.close(reason);
        });
    }
}
