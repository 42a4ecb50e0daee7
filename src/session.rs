//! WebSocket session handling
//!
//! One session per upgraded connection, bound to a single (user,
//! conversation) pair for its lifetime. The reader task owns the lifecycle
//! state machine and all transitions; the writer task drains the bounded
//! outbound queue and consults an atomic state snapshot when the session
//! drains. Slow consumers are closed rather than allowed to stall fan-out.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Message as WsMessage, MessageStream, Session};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::ChatError;
use crate::events::{ClientFrame, Event};
use crate::models::PresenceStatus;
use crate::server::AppState;
use crate::service::SendMessageRequest;

/// Bounded time spent flushing the outbound queue on drain.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    Authenticating = 1,
    Rejected = 2,
    Authorized = 3,
    Live = 4,
    HeartbeatLost = 5,
    Draining = 6,
    Closed = 7,
}

/// Atomic state snapshot shared between the reader and writer tasks. Only
/// the reader writes it.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::New as u8))
    }

    pub fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::New,
            1 => SessionState::Authenticating,
            2 => SessionState::Rejected,
            3 => SessionState::Authorized,
            4 => SessionState::Live,
            5 => SessionState::HeartbeatLost,
            6 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the reader loop ended; decides the close code sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    ClientClosed,
    HeartbeatLost,
    ServerShutdown,
    HubRequested,
    TransportError,
}

fn close_reason(exit: Exit) -> Option<CloseReason> {
    match exit {
        // The peer already closed; no reason to send one back.
        Exit::ClientClosed => None,
        Exit::HeartbeatLost => Some(CloseReason {
            code: CloseCode::Normal,
            description: Some("heartbeat lost".to_string()),
        }),
        Exit::ServerShutdown => Some(CloseReason {
            code: CloseCode::Away,
            description: Some("server shutting down".to_string()),
        }),
        Exit::HubRequested | Exit::TransportError => Some(CloseReason {
            code: CloseCode::Error,
            description: None,
        }),
    }
}

/// WebSocket upgrade handler for `/ws/chat/{conversation_id}`.
pub async fn ws_chat_handler(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let conversation_id = path.into_inner();

    // New upgrades are refused while draining.
    if *state.drain.borrow() {
        return Ok(HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({"error": "unavailable", "message": "server is draining"})));
    }

    // Token verification happens before the upgrade completes; the outcome
    // is applied right after so rejected clients get a proper close frame.
    let authenticated = state.verifier.verify_request(&req);

    let (mut response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // Advertised subprotocol for browser clients that pass the token there.
    if let Ok(value) = actix_web::http::header::HeaderValue::from_str("jwt") {
        response
            .headers_mut()
            .insert(actix_web::http::header::SEC_WEBSOCKET_PROTOCOL, value);
    }

    let state = state.into_inner();
    actix_web::rt::spawn(run_session(
        state,
        conversation_id,
        authenticated,
        session,
        msg_stream,
    ));

    Ok(response)
}

async fn run_session(
    state: Arc<AppState>,
    conversation_id: Uuid,
    authenticated: Result<AuthenticatedUser, crate::auth::AuthError>,
    mut session: Session,
    mut msg_stream: MessageStream,
) {
    let lifecycle = Arc::new(StateCell::new());
    lifecycle.set(SessionState::Authenticating);

    // Auth failures close silently with a policy code and never register.
    let user = match authenticated {
        Ok(user) => user,
        Err(err) => {
            lifecycle.set(SessionState::Rejected);
            debug!(conversation_id = %conversation_id, error = %err, "Upgrade rejected: bad credential");
            let _ = session
                .close(Some(CloseReason {
                    code: CloseCode::Policy,
                    description: None,
                }))
                .await;
            return;
        }
    };

    // Membership gate.
    if let Err(err) = state.chat.assert_member(conversation_id, user.user_id).await {
        lifecycle.set(SessionState::Rejected);
        debug!(
            conversation_id = %conversation_id,
            user_id = %user.user_id,
            error = %err,
            "Upgrade rejected: not a member"
        );
        let _ = session
            .close(Some(CloseReason {
                code: CloseCode::Policy,
                description: None,
            }))
            .await;
        return;
    }

    lifecycle.set(SessionState::Authorized);

    let connection_id = Uuid::new_v4();
    let registration = state
        .hub
        .register(conversation_id, connection_id, user.user_id);
    if registration.first_in_conversation {
        state.bus.ensure(conversation_id);
    }

    if let Err(err) = state
        .presence
        .set_presence(user.user_id, PresenceStatus::Online, Some(conversation_id))
        .await
    {
        warn!(user_id = %user.user_id, error = %err, "Presence update on connect failed");
    }

    // Synthetic confirmation frame, sent directly to this connection only.
    let connected = Event::Connected {
        conversation_id,
        user_id: user.user_id,
        timestamp: Utc::now(),
    };
    if let Ok(encoded) = connected.encode() {
        if session.text(encoded).await.is_err() {
            let outcome = state.hub.unregister(connection_id);
            finish_session(&state, outcome, conversation_id, user.user_id).await;
            return;
        }
    }

    lifecycle.set(SessionState::Live);
    info!(
        conversation_id = %conversation_id,
        connection_id = %connection_id,
        user_id = %user.user_id,
        "Session live"
    );

    let writer = tokio::spawn(writer_loop(
        session.clone(),
        registration.receiver,
        lifecycle.clone(),
    ));

    let exit = reader_loop(
        &state,
        conversation_id,
        &user,
        &mut session,
        &mut msg_stream,
        &registration.closer,
        &lifecycle,
    )
    .await;

    // DRAINING: reads have stopped; unregistering drops the hub's sender so
    // the writer flushes what is already queued, bounded by the timeout.
    lifecycle.set(SessionState::Draining);
    let outcome = state.hub.unregister(connection_id);

    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        warn!(connection_id = %connection_id, "Outbound flush timed out");
    }

    let _ = session.close(close_reason(exit)).await;

    finish_session(&state, outcome, conversation_id, user.user_id).await;
    lifecycle.set(SessionState::Closed);
    info!(
        conversation_id = %conversation_id,
        connection_id = %connection_id,
        exit = ?exit,
        "Session closed"
    );
}

/// Post-close bookkeeping shared by every exit path after registration.
async fn finish_session(
    state: &Arc<AppState>,
    outcome: Option<crate::hub::Unregistration>,
    conversation_id: Uuid,
    user_id: Uuid,
) {
    // The subscription reference follows the registration exactly once.
    if outcome.map(|o| o.last_in_conversation).unwrap_or(false) {
        state.bus.release(conversation_id);
    }

    state.presence.clear_typing(conversation_id, user_id).await;

    // Departure is announced on every disconnect; clients dedupe because
    // this instance cannot see connections held elsewhere.
    state
        .bus
        .publish(&Event::UserLeft {
            conversation_id,
            user_id,
            timestamp: Utc::now(),
        })
        .await;
}

async fn reader_loop(
    state: &Arc<AppState>,
    conversation_id: Uuid,
    user: &AuthenticatedUser,
    session: &mut Session,
    msg_stream: &mut MessageStream,
    closer: &Arc<tokio::sync::Notify>,
    lifecycle: &Arc<StateCell>,
) -> Exit {
    let idle_deadline = state.config.heartbeat.idle_deadline();
    let mut sweep = tokio::time::interval(state.config.heartbeat.interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut drain = state.drain.clone();
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            frame = msg_stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    last_activity = Instant::now();
                    handle_frame(state, conversation_id, user, session, &text).await;
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    last_activity = Instant::now();
                    if session.pong(&payload).await.is_err() {
                        return Exit::TransportError;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    last_activity = Instant::now();
                }
                Some(Ok(WsMessage::Close(reason))) => {
                    debug!(conversation_id = %conversation_id, reason = ?reason, "Client closed");
                    return Exit::ClientClosed;
                }
                Some(Ok(other)) => {
                    debug!(frame = ?other, "Ignoring non-text frame");
                }
                Some(Err(err)) => {
                    warn!(conversation_id = %conversation_id, error = %err, "WebSocket protocol error");
                    return Exit::TransportError;
                }
                None => return Exit::ClientClosed,
            },
            _ = sweep.tick() => {
                if last_activity.elapsed() > idle_deadline {
                    lifecycle.set(SessionState::HeartbeatLost);
                    warn!(
                        conversation_id = %conversation_id,
                        user_id = %user.user_id,
                        idle = ?last_activity.elapsed(),
                        "Heartbeat lost, closing session"
                    );
                    return Exit::HeartbeatLost;
                }
            }
            _ = closer.notified() => {
                return Exit::HubRequested;
            }
            changed = drain.changed() => {
                if changed.is_err() || *drain.borrow() {
                    return Exit::ServerShutdown;
                }
            }
        }
    }
}

/// Dispatch one inbound frame. Non-decodable frames are logged and ignored;
/// recoverable operation failures are reported on this connection without
/// ending the session.
async fn handle_frame(
    state: &Arc<AppState>,
    conversation_id: Uuid,
    user: &AuthenticatedUser,
    session: &mut Session,
    text: &str,
) {
    let frame = match ClientFrame::decode(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(
                conversation_id = %conversation_id,
                user_id = %user.user_id,
                error = %err,
                "Ignoring undecodable frame"
            );
            return;
        }
    };

    match frame {
        ClientFrame::Message { message } => {
            let result = state
                .chat
                .send_message(
                    conversation_id,
                    user.user_id,
                    SendMessageRequest {
                        content: message.content,
                        message_type: message.message_type,
                        parent_id: message.parent_id,
                    },
                )
                .await;
            // The echo returns through the fan-out path; only failures are
            // reported here.
            if let Err(err) = result {
                report_error(session, conversation_id, user.user_id, &err).await;
            }
        }
        ClientFrame::Typing => {
            if let Err(err) = state
                .presence
                .set_typing(conversation_id, user.user_id, true)
                .await
            {
                warn!(user_id = %user.user_id, error = %err, "Typing update failed");
            }
        }
        ClientFrame::StopTyping => {
            if let Err(err) = state
                .presence
                .set_typing(conversation_id, user.user_id, false)
                .await
            {
                warn!(user_id = %user.user_id, error = %err, "Typing update failed");
            }
        }
        ClientFrame::Heartbeat => {
            if let Err(err) = state.presence.touch(user.user_id, conversation_id).await {
                warn!(user_id = %user.user_id, error = %err, "Presence refresh failed");
            }
        }
        ClientFrame::ReadReceipt { message_ids } => {
            if let Err(err) = state
                .chat
                .mark_read(user.user_id, conversation_id, message_ids)
                .await
            {
                report_error(session, conversation_id, user.user_id, &err).await;
            }
        }
    }
}

async fn report_error(
    session: &mut Session,
    conversation_id: Uuid,
    user_id: Uuid,
    err: &ChatError,
) {
    if !err.is_recoverable() {
        warn!(conversation_id = %conversation_id, error = %err, "Unrecoverable session operation failure");
        return;
    }

    let frame = Event::Error {
        conversation_id,
        user_id,
        timestamp: Utc::now(),
        code: err.code().to_string(),
        message: err.to_string(),
    };
    if let Ok(encoded) = frame.encode() {
        let _ = session.text(encoded).await;
    }
}

/// Writer task: drains the bounded queue into the socket. When the hub
/// drops the sending side the remaining frames are flushed and the task
/// ends; an already-draining session stops eagerly once the queue empties.
async fn writer_loop(
    mut session: Session,
    mut outbound: mpsc::Receiver<String>,
    lifecycle: Arc<StateCell>,
) {
    while let Some(frame) = outbound.recv().await {
        if session.text(frame).await.is_err() {
            break;
        }
        if lifecycle.get() == SessionState::Closed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_round_trip() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::New);

        for state in [
            SessionState::Authenticating,
            SessionState::Rejected,
            SessionState::Authorized,
            SessionState::Live,
            SessionState::HeartbeatLost,
            SessionState::Draining,
            SessionState::Closed,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_close_reasons() {
        assert!(close_reason(Exit::ClientClosed).is_none());

        let shutdown = close_reason(Exit::ServerShutdown).unwrap();
        assert_eq!(shutdown.code, CloseCode::Away);

        let heartbeat = close_reason(Exit::HeartbeatLost).unwrap();
        assert_eq!(heartbeat.code, CloseCode::Normal);

        let internal = close_reason(Exit::TransportError).unwrap();
        assert_eq!(internal.code, CloseCode::Error);
        assert_eq!(close_reason(Exit::HubRequested).unwrap().code, CloseCode::Error);
    }
}
