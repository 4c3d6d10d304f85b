//! Per-connection session state.
//!
//! A session is created by the accept loop, bound to a user through the
//! registry, and torn down exactly once no matter how many subsystems ask
//! for its death. The handle holds no reference back into the registry;
//! the registry learns of disconnection only through the close handler.

pub mod outbox;
pub mod runner;

use crate::error::{GatewayError, GatewayResult};
use mgate_proto::{Envelope, Frame};
use outbox::Outbox;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// The `(user, device, platform)` triple a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub user_id: String,
    pub device_id: String,
    pub platform: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    OpenUnauth,
    OpenAuth,
    Closing,
    Closed,
}

pub type CloseHandler = Box<dyn FnOnce(&SessionHandle) + Send>;

#[derive(Debug)]
struct SessionCtx {
    state: SessionState,
    binding: Option<Binding>,
    close_reason: Option<&'static str>,
}

/// Shared handle to one connected client.
pub struct SessionHandle {
    id: String,
    remote: SocketAddr,
    last_activity: Mutex<Instant>,
    last_outbound: Mutex<Instant>,
    ctx: Mutex<SessionCtx>,
    pub outbox: Outbox,
    on_close: Mutex<Option<CloseHandler>>,
}

impl SessionHandle {
    pub fn new(remote: SocketAddr, send_queue_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            id: generate_session_id(),
            remote,
            last_activity: Mutex::new(now),
            last_outbound: Mutex::new(now),
            ctx: Mutex::new(SessionCtx {
                state: SessionState::OpenUnauth,
                binding: None,
                close_reason: None,
            }),
            outbox: Outbox::new(send_queue_capacity),
            on_close: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register the callback fired exactly once when the session closes.
    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.on_close.lock().unwrap() = Some(handler);
    }

    pub fn state(&self) -> SessionState {
        self.ctx.lock().unwrap().state
    }

    pub fn binding(&self) -> Option<Binding> {
        self.ctx.lock().unwrap().binding.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state(), SessionState::OpenAuth)
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        self.ctx.lock().unwrap().close_reason
    }

    /// Bind this session. Only the registry calls this, inside its own
    /// critical section; the binding is set exactly once.
    pub(crate) fn try_bind(&self, binding: Binding) -> bool {
        let mut ctx = self.ctx.lock().unwrap();
        if ctx.state != SessionState::OpenUnauth {
            return false;
        }
        ctx.state = SessionState::OpenAuth;
        ctx.binding = Some(binding);
        true
    }

    /// Enqueue one `Normal` frame for the write loop. Fails with
    /// `Backpressure` when the queue is full; the session stays open.
    pub fn send(&self, envelope: &Envelope) -> GatewayResult<()> {
        let frame = envelope.into_frame()?;
        if self.outbox.is_closed() {
            return Err(GatewayError::SessionClosed);
        }
        if !self.outbox.push(frame) {
            return Err(GatewayError::Backpressure);
        }
        Ok(())
    }

    /// Enqueue a frame on the non-blocking push path (drop-oldest).
    /// Returns false only if the session is already closing.
    pub fn push_frame(&self, frame: Frame) -> bool {
        self.outbox.push_or_drop_oldest(frame)
    }

    /// Record inbound activity (resets the idle clock).
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub(crate) fn mark_outbound(&self) {
        *self.last_outbound.lock().unwrap() = Instant::now();
    }

    pub(crate) fn outbound_idle_for(&self) -> Duration {
        self.last_outbound.lock().unwrap().elapsed()
    }

    /// Begin teardown. Idempotent: only the first caller flips the state,
    /// closes the send queue, and fires the close handler.
    pub fn close(&self, reason: &'static str) {
        {
            let mut ctx = self.ctx.lock().unwrap();
            if matches!(ctx.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            ctx.state = SessionState::Closing;
            ctx.close_reason = Some(reason);
        }
        debug!(session_id = %self.id, reason, "session closing");
        self.outbox.close();
        let handler = self.on_close.lock().unwrap().take();
        if let Some(handler) = handler {
            handler(self);
        }
    }

    /// Final transition after the I/O loops have exited.
    pub(crate) fn finalize(&self) {
        self.ctx.lock().unwrap().state = SessionState::Closed;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Random session ID (16 bytes, hex-encoded).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[test]
    fn bind_transitions_once() {
        let session = SessionHandle::new(addr(), 8);
        assert_eq!(session.state(), SessionState::OpenUnauth);
        let binding = Binding {
            user_id: "u1".into(),
            device_id: "d1".into(),
            platform: "android".into(),
        };
        assert!(session.try_bind(binding.clone()));
        assert_eq!(session.state(), SessionState::OpenAuth);
        assert_eq!(session.binding(), Some(binding));
        // A second bind attempt is rejected; the binding never mutates.
        assert!(!session.try_bind(Binding {
            user_id: "u2".into(),
            device_id: "d2".into(),
            platform: "ios".into(),
        }));
        assert_eq!(session.binding().unwrap().user_id, "u1");
    }

    #[test]
    fn close_is_idempotent_and_fires_handler_once() {
        let session = Arc::new(SessionHandle::new(addr(), 8));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        session.set_close_handler(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        session.close("idle");
        session.close("idle");
        session.close("shutdown");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.close_reason(), Some("idle"));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.outbox.is_closed());
    }

    #[test]
    fn send_after_close_reports_session_closed() {
        let session = SessionHandle::new(addr(), 8);
        session.close("test");
        let env = Envelope::notification(1, serde_json::Value::Null);
        assert!(matches!(
            session.send(&env),
            Err(GatewayError::SessionClosed)
        ));
    }

    #[test]
    fn send_backpressure_keeps_session_open() {
        let session = SessionHandle::new(addr(), 1);
        let env = Envelope::notification(1, serde_json::Value::Null);
        session.send(&env).unwrap();
        assert!(matches!(
            session.send(&env),
            Err(GatewayError::Backpressure)
        ));
        assert_eq!(session.state(), SessionState::OpenUnauth);
    }
}
