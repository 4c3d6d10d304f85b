//! Gateway server: listeners, background tasks, and shutdown.
//!
//! Owns every long-lived component and wires them together: the framed
//! TCP listener feeding session loops, the HTTP control plane, the
//! health prober, and the periodic token/rate-limit sweeps. Shutdown is
//! idempotent and drains sessions within a bounded grace period.

use crate::auth::rate_limit::GatewayRateLimits;
use crate::auth::AuthManager;
use crate::config::GatewayConfig;
use crate::control::{control_router, ControlState};
use crate::dispatch::EnvelopeDispatcher;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::Metrics;
use crate::push::PushDispatcher;
use crate::registry::ConnectionRegistry;
use crate::router::{health, Router};
use crate::session::{runner, SessionHandle};
use mgate_proto::{cmd, Envelope};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Interval for token expiry sweeps and rate-limiter GC.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

pub struct GatewayServer {
    config: GatewayConfig,
    metrics: Arc<Metrics>,
    auth: Arc<AuthManager>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    dispatcher: Arc<EnvelopeDispatcher>,
    push: Arc<PushDispatcher>,
    rate_limits: Arc<Mutex<GatewayRateLimits>>,
    /// Every live session by id, for shutdown fan-out.
    sessions: Arc<Mutex<HashMap<String, Arc<SessionHandle>>>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let metrics = Arc::new(Metrics::new());
        let auth = Arc::new(AuthManager::new(
            config.platforms.clone(),
            config.secret.clone(),
            config.auto_refresh,
        ));
        let registry = Arc::new(ConnectionRegistry::new(config.platforms.clone()));
        let router = Arc::new(Router::new(&config.routes, metrics.clone())?);
        let dispatcher = Arc::new(EnvelopeDispatcher::new(
            auth.clone(),
            registry.clone(),
            router.clone(),
            metrics.clone(),
        ));
        let push = Arc::new(PushDispatcher::new(registry.clone(), metrics.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            metrics,
            auth,
            registry,
            router,
            dispatcher,
            push,
            rate_limits: Arc::new(Mutex::new(GatewayRateLimits::default())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Run both listeners until shutdown.
    pub async fn run(self: Arc<Self>) -> GatewayResult<()> {
        let listener = TcpListener::bind(&self.config.bind).await.map_err(|e| {
            GatewayError::Config(format!("cannot bind {}: {e}", self.config.bind))
        })?;
        info!(addr = %self.config.bind, "binary transport listening");

        let http_listener = TcpListener::bind(&self.config.http_bind).await.map_err(|e| {
            GatewayError::Config(format!("cannot bind {}: {e}", self.config.http_bind))
        })?;
        info!(addr = %self.config.http_bind, "control plane listening");

        let health_task = tokio::spawn(health::run_health_checker(
            self.router.health.clone(),
            self.config.routes.services.clone(),
            self.router.client().clone(),
        ));
        let maintenance_task = tokio::spawn(Self::run_maintenance(
            self.auth.clone(),
            self.rate_limits.clone(),
        ));

        let control_state = Arc::new(ControlState {
            auth: self.auth.clone(),
            registry: self.registry.clone(),
            router: self.router.clone(),
            dispatcher: self.dispatcher.clone(),
            push: self.push.clone(),
            metrics: self.metrics.clone(),
            rate_limits: self.rate_limits.clone(),
        });
        let mut http_shutdown = self.shutdown_tx.subscribe();
        let http_task = tokio::spawn(async move {
            let app = control_router(control_state)
                .into_make_service_with_connect_info::<SocketAddr>();
            let serve = axum::serve(http_listener, app).with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "control plane exited");
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.accept_session(stream, remote),
                    Err(e) => {
                        // Transient accept errors (fd pressure) must not
                        // kill the listener.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        health_task.abort();
        maintenance_task.abort();
        let _ = http_task.await;
        info!("listeners stopped");
        Ok(())
    }

    fn accept_session(self: &Arc<Self>, stream: tokio::net::TcpStream, remote: SocketAddr) {
        if stream.set_nodelay(true).is_err() {
            debug!(remote = %remote, "set_nodelay failed");
        }
        Metrics::incr(&self.metrics.sessions_accepted);
        let session = Arc::new(SessionHandle::new(
            remote,
            self.config.timings.send_queue_capacity,
        ));
        debug!(session_id = %session.id(), remote = %remote, "connection accepted");

        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let session_id = session.id().to_string();
        session.set_close_handler(Box::new(move |handle| {
            registry.unbind(handle);
            if let Ok(mut map) = sessions.lock() {
                map.remove(&session_id);
            }
        }));
        if let Ok(mut map) = self.sessions.lock() {
            map.insert(session.id().to_string(), session.clone());
        }

        tokio::spawn(runner::run_session(
            session,
            stream,
            self.dispatcher.clone(),
            self.config.timings.clone(),
            self.metrics.clone(),
        ));
    }

    async fn run_maintenance(
        auth: Arc<AuthManager>,
        rate_limits: Arc<Mutex<GatewayRateLimits>>,
    ) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = auth.sweep_expired();
            if removed > 0 {
                debug!(removed, "maintenance sweep");
            }
            if let Ok(mut limits) = rate_limits.lock() {
                limits.gc();
            }
        }
    }

    /// Notify connected clients, close every session, and stop the
    /// listeners. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown started");

        let notice = Envelope::notification(
            cmd::NOTIFY_SHUTDOWN,
            serde_json::json!({ "message": "gateway shutting down" }),
        );
        let receipt = self.push.broadcast(&notice);
        debug!(notified = receipt.delivered, "shutdown notifications queued");

        let snapshot: Vec<Arc<SessionHandle>> = match self.sessions.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for session in &snapshot {
            session.close("shutdown");
        }
        let _ = self.shutdown_tx.send(());

        // Session loops drain their outboxes and deregister themselves;
        // give them a bounded window before giving up.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let remaining = self.sessions.lock().map(|m| m.len()).unwrap_or(0);
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "shutdown grace expired with sessions open");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::policy::{PlatformPolicies, PlatformPolicy};
    use crate::config::{RoutesFile, SessionTimings};
    use crate::session::runner;
    use mgate_proto::{Envelope, ErrorCode, Frame, FrameDecoder, FrameType, PROTOCOL_VERSION};
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Harness {
        auth: Arc<AuthManager>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<EnvelopeDispatcher>,
        push: Arc<PushDispatcher>,
        metrics: Arc<Metrics>,
    }

    fn harness() -> Harness {
        let routes: RoutesFile = toml::from_str(
            r#"
            [services.user]
            host = "127.0.0.1"
            port = 1

            [[route]]
            pattern = "/auth/login"
            cmd_range = [1000, 1999]
            service = "user"
            "#,
        )
        .unwrap();
        let mut platforms = HashMap::new();
        platforms.insert(
            "ios".to_string(),
            PlatformPolicy {
                multi_device: false,
                ..PlatformPolicy::default()
            },
        );
        let policies = PlatformPolicies::new(platforms);
        let metrics = Arc::new(Metrics::new());
        let auth = Arc::new(AuthManager::new(
            policies.clone(),
            mgate_proto::token::generate_secret(),
            true,
        ));
        let registry = Arc::new(ConnectionRegistry::new(policies));
        let router = Arc::new(Router::new(&routes, metrics.clone()).unwrap());
        let dispatcher = Arc::new(EnvelopeDispatcher::new(
            auth.clone(),
            registry.clone(),
            router,
            metrics.clone(),
        ));
        let push = Arc::new(PushDispatcher::new(registry.clone(), metrics.clone()));
        Harness {
            auth,
            registry,
            dispatcher,
            push,
            metrics,
        }
    }

    struct TestClient {
        stream: TcpStream,
        decoder: FrameDecoder,
        pending: VecDeque<Frame>,
    }

    impl TestClient {
        async fn send_envelope(&mut self, envelope: &Envelope) {
            let bytes = envelope.into_frame().unwrap().encode().unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        async fn next_frame(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.pending.pop_front() {
                    return frame;
                }
                let mut buf = [0u8; 4096];
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf))
                    .await
                    .expect("timed out waiting for frame")
                    .unwrap();
                assert!(n > 0, "peer closed before a frame arrived");
                for frame in self.decoder.feed(&buf[..n]).unwrap() {
                    self.pending.push_back(frame);
                }
            }
        }

        async fn next_envelope(&mut self) -> Envelope {
            let frame = self.next_frame().await;
            assert_eq!(frame.frame_type, FrameType::Normal);
            Envelope::decode(&frame.payload).unwrap()
        }

        async fn expect_eof(&mut self) {
            let mut buf = [0u8; 4096];
            loop {
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf))
                    .await
                    .expect("timed out waiting for close")
                    .unwrap();
                if n == 0 {
                    return;
                }
            }
        }
    }

    async fn connect(harness: &Harness, timings: SessionTimings) -> (TestClient, Arc<SessionHandle>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, remote) = listener.accept().await.unwrap();
        let session = Arc::new(SessionHandle::new(remote, timings.send_queue_capacity));
        let registry = harness.registry.clone();
        session.set_close_handler(Box::new(move |handle| registry.unbind(handle)));
        tokio::spawn(runner::run_session(
            session.clone(),
            server_stream,
            harness.dispatcher.clone(),
            timings,
            harness.metrics.clone(),
        ));
        (
            TestClient {
                stream: client,
                decoder: FrameDecoder::new(),
                pending: VecDeque::new(),
            },
            session,
        )
    }

    fn auth_request(seq: u32, token: &str, device_id: &str, platform: &str) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION.into(),
            seq,
            cmd_id: cmd::AUTH,
            from_uid: String::new(),
            to_uid: String::new(),
            token: token.into(),
            device_id: device_id.into(),
            platform: platform.into(),
            timestamp: 0,
            body: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn auth_then_push_reaches_the_socket() {
        let h = harness();
        let (mut client, _session) = connect(&h, SessionTimings::default()).await;
        let pair = h.auth.issue("alice", "d1", "android");
        client.send_envelope(&auth_request(1, &pair.access_token, "d1", "android")).await;
        let reply = client.next_envelope().await;
        assert_eq!(reply.seq, 1);
        assert_eq!(reply.body["code"], 0);

        let notice = Envelope::notification_for(
            cmd::NOTIFY_SHUTDOWN,
            "alice",
            serde_json::json!({"text": "hello"}),
        );
        let receipt = h.push.push_to_user("alice", &notice);
        assert_eq!(receipt.delivered, 1);
        let pushed = client.next_envelope().await;
        assert!(pushed.is_notification());
        assert_eq!(pushed.body["text"], "hello");
    }

    #[tokio::test]
    async fn grace_timeout_notifies_then_closes() {
        let h = harness();
        let timings = SessionTimings {
            auth_grace: Duration::from_millis(100),
            ..SessionTimings::default()
        };
        let (mut client, session) = connect(&h, timings).await;
        let notice = client.next_envelope().await;
        assert!(notice.is_notification());
        assert_eq!(notice.cmd_id, cmd::NOTIFY_AUTH_TIMEOUT);
        client.expect_eof().await;
        assert_eq!(session.close_reason(), Some("auth-timeout"));
    }

    #[tokio::test]
    async fn oversized_frame_kills_the_connection() {
        let h = harness();
        let (mut client, session) = connect(&h, SessionTimings::default()).await;
        let mut header = Vec::new();
        header.extend_from_slice(&(mgate_proto::MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        header.push(0);
        client.send_raw(&header).await;
        let notice = client.next_envelope().await;
        assert_eq!(notice.cmd_id, cmd::NOTIFY_PROTOCOL_ERROR);
        assert_eq!(
            notice.body["code"],
            ErrorCode::InvalidRequest.wire()
        );
        client.expect_eof().await;
        assert_eq!(session.close_reason(), Some("protocol-error"));
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let h = harness();
        let (mut client, _session) = connect(&h, SessionTimings::default()).await;
        client.send_raw(&Frame::ping().encode().unwrap()).await;
        let frame = client.next_frame().await;
        assert_eq!(frame.frame_type, FrameType::Pong);
    }

    #[tokio::test]
    async fn quiet_connection_receives_pings() {
        let h = harness();
        let timings = SessionTimings {
            heartbeat: Duration::from_millis(100),
            ..SessionTimings::default()
        };
        let (mut client, _session) = connect(&h, timings).await;
        // Nothing is written server-side, so the heartbeat fires.
        let frame = client.next_frame().await;
        assert_eq!(frame.frame_type, FrameType::Ping);
        let frame = client.next_frame().await;
        assert_eq!(frame.frame_type, FrameType::Ping);
    }

    #[tokio::test]
    async fn silent_connection_closes_at_read_idle() {
        let h = harness();
        let timings = SessionTimings {
            read_idle: Duration::from_millis(300),
            ..SessionTimings::default()
        };
        let (mut client, session) = connect(&h, timings).await;
        client.expect_eof().await;
        assert_eq!(session.close_reason(), Some("idle"));
    }

    #[tokio::test]
    async fn single_device_login_kicks_the_old_connection() {
        let h = harness();
        let (mut first, _s1) = connect(&h, SessionTimings::default()).await;
        let (mut second, _s2) = connect(&h, SessionTimings::default()).await;

        let p1 = h.auth.issue("alice", "d1", "ios");
        first.send_envelope(&auth_request(1, &p1.access_token, "d1", "ios")).await;
        assert_eq!(first.next_envelope().await.body["code"], 0);

        let p2 = h.auth.issue("alice", "d2", "ios");
        second.send_envelope(&auth_request(1, &p2.access_token, "d2", "ios")).await;
        assert_eq!(second.next_envelope().await.body["code"], 0);

        let kicked = first.next_envelope().await;
        assert!(kicked.is_notification());
        assert_eq!(kicked.cmd_id, cmd::NOTIFY_KICKED);
        first.expect_eof().await;
        // The new connection is the only binding left.
        assert_eq!(h.registry.sessions_of("alice").len(), 1);
    }
}

