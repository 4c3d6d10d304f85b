//! Session I/O loops.
//!
//! Three cooperating loops share the session: a read loop driving the
//! frame decoder, a write loop draining the outbox with one write per
//! frame, and a heartbeat timer. The unauthenticated grace period and the
//! read-idle deadline also live here. Inbound envelopes are dispatched
//! without blocking further reads; responses may complete out of order
//! and clients correlate by `seq`.

use crate::config::SessionTimings;
use crate::dispatch::EnvelopeDispatcher;
use crate::metrics::Metrics;
use crate::session::SessionHandle;
use mgate_proto::{cmd, Envelope, Frame, FrameDecoder, FrameType};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const READ_BUF_LEN: usize = 16 * 1024;
/// How long to wait for the write loop to flush queued frames on exit.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Drive one accepted connection until it closes.
pub async fn run_session(
    session: Arc<SessionHandle>,
    stream: TcpStream,
    dispatcher: Arc<EnvelopeDispatcher>,
    timings: SessionTimings,
    metrics: Arc<Metrics>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Write loop: sole consumer of the outbox, one write per frame,
    // never interleaved.
    let writer_task = {
        let session = session.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            while let Some(frame) = session.outbox.pop().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(session_id = %session.id(), error = %e, "unencodable frame dropped");
                        continue;
                    }
                };
                if writer.write_all(&bytes).await.is_err() {
                    session.close("write-error");
                    break;
                }
                session.mark_outbound();
                Metrics::incr(&metrics.frames_out);
            }
            let _ = writer.shutdown().await;
        })
    };

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_LEN];

    let mut heartbeat = tokio::time::interval(timings.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // first tick fires immediately; skip it

    let idle = tokio::time::sleep(timings.read_idle);
    tokio::pin!(idle);
    let grace = tokio::time::sleep(timings.auth_grace);
    tokio::pin!(grace);

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    session.close("peer-closed");
                    break;
                }
                Ok(n) => {
                    session.touch();
                    idle.as_mut()
                        .reset(tokio::time::Instant::now() + timings.read_idle);
                    match decoder.feed(&buf[..n]) {
                        Ok(frames) => {
                            for frame in frames {
                                handle_frame(&session, &dispatcher, &metrics, frame);
                            }
                        }
                        Err(e) => {
                            // Framing is unrecoverable; notify best-effort and drop
                            // the connection before buffering anything oversized.
                            debug!(session_id = %session.id(), error = %e, "frame error");
                            let notice = Envelope::notification(
                                cmd::NOTIFY_PROTOCOL_ERROR,
                                serde_json::json!({
                                    "code": e.code().wire(),
                                    "message": e.to_string(),
                                }),
                            );
                            if let Ok(frame) = notice.into_frame() {
                                session.push_frame(frame);
                            }
                            session.close("protocol-error");
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "read error");
                    session.close("read-error");
                    break;
                }
            },

            _ = &mut idle => {
                debug!(
                    session_id = %session.id(),
                    idle_secs = session.idle_for().as_secs(),
                    "read idle limit reached"
                );
                session.close("idle");
                break;
            }

            _ = &mut grace, if !session.is_authenticated() => {
                let notice = Envelope::notification(
                    cmd::NOTIFY_AUTH_TIMEOUT,
                    serde_json::json!({ "message": "authentication grace period expired" }),
                );
                if let Ok(frame) = notice.into_frame() {
                    session.push_frame(frame);
                }
                session.close("auth-timeout");
                break;
            }

            _ = heartbeat.tick() => {
                if session.outbound_idle_for() >= timings.heartbeat {
                    session.push_frame(Frame::ping());
                }
            }

            // close() was called from outside (kick, shutdown, eviction).
            _ = session.outbox.closed() => {
                break;
            }
        }
    }

    // Give the write loop a bounded window to drain the queue (the kicked
    // notification rides this path), then account the teardown.
    let _ = tokio::time::timeout(DRAIN_WAIT, writer_task).await;
    session.close("connection-ended");
    session.finalize();
    Metrics::incr(&metrics.sessions_closed);
    debug!(
        session_id = %session.id(),
        reason = session.close_reason().unwrap_or("unknown"),
        dropped = session.outbox.dropped(),
        "session closed"
    );
}

/// React to one decoded frame on the read path.
fn handle_frame(
    session: &Arc<SessionHandle>,
    dispatcher: &Arc<EnvelopeDispatcher>,
    metrics: &Arc<Metrics>,
    frame: Frame,
) {
    match frame.frame_type {
        FrameType::Ping => {
            session.push_frame(Frame::pong());
        }
        // Inbound activity already reset the idle deadline.
        FrameType::Pong => {}
        FrameType::Normal => {
            Metrics::incr(&metrics.frames_in);
            match Envelope::decode(&frame.payload) {
                Ok(envelope) => {
                    // Hand off asynchronously so slow backends never stall
                    // the read loop.
                    let session = session.clone();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(session, envelope).await;
                    });
                }
                Err(e) => {
                    // No seq to correlate with; emit a notification and
                    // keep the connection.
                    debug!(session_id = %session.id(), error = %e, "envelope decode failed");
                    let notice = Envelope::notification(
                        cmd::NOTIFY_PROTOCOL_ERROR,
                        serde_json::json!({
                            "code": e.code().wire(),
                            "message": e.to_string(),
                        }),
                    );
                    if let Ok(frame) = notice.into_frame() {
                        session.push_frame(frame);
                    }
                }
            }
        }
    }
}
