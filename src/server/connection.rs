//! Per-connection state machine for viewer channels.
//!
//! Each accepted WebSocket gets a reader loop and a writer task sharing
//! one bounded mailbox. The reader drives the accepted/authenticated/
//! streaming state machine; the writer serializes envelopes, emits
//! heartbeat pings and performs the orderly close. The broker reaches the
//! client only through the mailbox, so everything a viewer sees is
//! totally ordered.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::DeviceCredential;
use crate::broker::{ClientEvent, ClientPort, CloseSignal, SubscribeOutcome};
use crate::config::{MAILBOX_CAPACITY, MAX_FRAME_BYTES};

use super::http::{bearer_key, AppState};
use super::protocol::{close_code, ClientMessage, ServerMessage};

/// Window for counting protocol offenses.
const VIOLATION_WINDOW: Duration = Duration::from_secs(10);

/// Offenses tolerated inside the window before the channel closes.
const VIOLATION_LIMIT: usize = 3;

/// GET /ws - upgrade to the viewer channel.
///
/// The credential key is accepted three ways: bearer header, `key` query
/// parameter, or a subsequent `authenticate` message.
pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let initial_key = bearer_key(&headers).or_else(|| params.get("key").cloned());
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, initial_key))
}

enum Flow {
    Continue,
    Close,
}

async fn handle_socket(socket: WebSocket, state: AppState, initial_key: Option<String>) {
    let client_id = Uuid::new_v4();
    let (events_tx, events_rx) = mpsc::channel::<ClientEvent>(MAILBOX_CAPACITY);
    let kill = CancellationToken::new();
    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, events_rx, state.config.ping_interval));

    tracing::debug!(client_id = %client_id, "Channel accepted");

    let mut revocations = state.auth.subscribe_revocations();
    let mut credential: Option<DeviceCredential> = None;
    let mut subscription: Option<String> = None;
    let mut violations: VecDeque<Instant> = VecDeque::new();

    let mut alive = queue(
        &events_tx,
        ServerMessage::Connected {
            client_id,
            server_time: Utc::now(),
        },
    )
    .await;

    // A key presented at upgrade time counts as an authenticate message.
    if alive {
        if let Some(key) = initial_key {
            alive = authenticate(&state, &events_tx, &kill, client_id, &key, &mut credential).await;
        }
    }

    let auth_deadline = tokio::time::sleep(state.config.auth_deadline);
    tokio::pin!(auth_deadline);
    let idle = tokio::time::sleep(state.config.idle_cutoff);
    tokio::pin!(idle);

    while alive {
        tokio::select! {
            () = kill.cancelled() => {
                // The mailbox itself is jammed; no orderly close possible.
                tracing::warn!(client_id = %client_id, "Dropping slow consumer");
                break;
            }
            () = state.cancel.cancelled() => {
                let _ = queue(&events_tx, ServerMessage::Disconnecting {
                    reason: "server shutdown".to_string(),
                }).await;
                close(&events_tx, close_code::NORMAL, "shutdown").await;
                break;
            }
            () = &mut auth_deadline, if credential.is_none() => {
                tracing::debug!(client_id = %client_id, "Authentication deadline passed");
                close(&events_tx, close_code::UNAUTHORIZED, "authentication deadline").await;
                break;
            }
            () = &mut idle => {
                tracing::debug!(client_id = %client_id, "Idle cutoff passed");
                let _ = queue(&events_tx, ServerMessage::Disconnecting {
                    reason: "timeout".to_string(),
                }).await;
                close(&events_tx, close_code::NORMAL, "timeout").await;
                break;
            }
            revoked = revocations.recv() => {
                match revoked {
                    Ok(key) => {
                        if credential.as_ref().is_some_and(|c| c.key == key) {
                            let _ = queue(&events_tx, ServerMessage::Disconnecting {
                                reason: "credential_revoked".to_string(),
                            }).await;
                            close(&events_tx, close_code::UNAUTHORIZED, "revoked").await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed announcements; re-check our own credential.
                        if let Some(c) = &credential {
                            if state.auth.validate(&c.key).is_err() {
                                close(&events_tx, close_code::UNAUTHORIZED, "revoked").await;
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = ws_rx.next() => {
                let Some(Ok(message)) = inbound else {
                    break;
                };
                idle.as_mut().reset(Instant::now() + state.config.idle_cutoff);

                match message {
                    Message::Text(text) => {
                        if text.len() > MAX_FRAME_BYTES {
                            close(&events_tx, close_code::NORMAL, "protocol_error").await;
                            break;
                        }
                        let flow = handle_text(
                            &text,
                            client_id,
                            &state,
                            &events_tx,
                            &kill,
                            &mut credential,
                            &mut subscription,
                            &mut violations,
                        )
                        .await;
                        if matches!(flow, Flow::Close) {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        let _ = queue(&events_tx, ServerMessage::Error {
                            code: "malformed_envelope".to_string(),
                            message: "Binary frames are not part of the protocol".to_string(),
                        }).await;
                        if record_violation(&mut violations) {
                            close(&events_tx, close_code::NORMAL, "protocol_error").await;
                            break;
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    // Idempotent teardown: release the subscription and deregister.
    if let Some(session_id) = &subscription {
        tracing::debug!(client_id = %client_id, session_id = %session_id, "Releasing subscription");
    }
    if credential.is_some() {
        state.broker.client_disconnected(client_id).await;
    }
    drop(events_tx);
    if tokio::time::timeout(Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        tracing::debug!(client_id = %client_id, "Writer did not drain in time");
        writer.abort();
    }
    tracing::debug!(client_id = %client_id, "Channel closed");
}

#[allow(clippy::too_many_arguments)]
async fn handle_text(
    text: &str,
    client_id: Uuid,
    state: &AppState,
    events: &mpsc::Sender<ClientEvent>,
    kill: &CancellationToken,
    credential: &mut Option<DeviceCredential>,
    subscription: &mut Option<String>,
    violations: &mut VecDeque<Instant>,
) -> Flow {
    let message = match ClientMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            let _ = queue(events, ServerMessage::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            })
            .await;
            if record_violation(violations) {
                close(events, close_code::NORMAL, "protocol_error").await;
                return Flow::Close;
            }
            return Flow::Continue;
        }
    };

    match message {
        ClientMessage::Authenticate { key, .. } => {
            if credential.is_some() {
                let _ = queue(events, ServerMessage::Error {
                    code: "already_authenticated".to_string(),
                    message: "This channel is already authenticated".to_string(),
                })
                .await;
                return Flow::Continue;
            }
            if authenticate(state, events, kill, client_id, &key, credential).await {
                Flow::Continue
            } else {
                Flow::Close
            }
        }
        ClientMessage::Subscribe { session_id, force } => {
            if credential.is_none() {
                let _ = queue(events, unauthorized_error()).await;
                return Flow::Continue;
            }
            match state.broker.subscribe(client_id, session_id.clone(), force).await {
                SubscribeOutcome::Subscribed => {
                    *subscription = Some(session_id);
                }
                // The broker already queued the wire response; occupied and
                // unknown-session leave the client authenticated.
                SubscribeOutcome::Occupied { .. }
                | SubscribeOutcome::NoSuchSession
                | SubscribeOutcome::Dropped => {}
            }
            Flow::Continue
        }
        ClientMessage::Unsubscribe { session_id } => {
            if credential.is_none() {
                let _ = queue(events, unauthorized_error()).await;
                return Flow::Continue;
            }
            state.broker.unsubscribe(client_id, session_id).await;
            *subscription = None;
            Flow::Continue
        }
        ClientMessage::Ping => {
            let _ = queue(events, ServerMessage::Pong {}).await;
            Flow::Continue
        }
    }
}

/// Validate a key and bring the client online with the broker.
async fn authenticate(
    state: &AppState,
    events: &mpsc::Sender<ClientEvent>,
    kill: &CancellationToken,
    client_id: Uuid,
    key: &str,
    credential: &mut Option<DeviceCredential>,
) -> bool {
    match state.auth.validate(key) {
        Ok(validated) => {
            let device_id = validated.device_id.clone();
            tracing::info!(
                client_id = %client_id,
                device_id = %device_id,
                "Client authenticated"
            );
            if !queue(events, ServerMessage::Authenticated {
                success: true,
                device_id: device_id.clone(),
            })
            .await
            {
                return false;
            }
            state
                .broker
                .client_connected(
                    client_id,
                    device_id,
                    ClientPort {
                        events: events.clone(),
                        kill: kill.clone(),
                    },
                )
                .await;
            *credential = Some(validated);
            true
        }
        Err(e) => {
            tracing::debug!(client_id = %client_id, reason = e.code(), "Authentication failed");
            let _ = queue(events, ServerMessage::AuthenticationFailed {
                reason: e.code().to_string(),
            })
            .await;
            close(events, close_code::UNAUTHORIZED, e.code()).await;
            false
        }
    }
}

fn unauthorized_error() -> ServerMessage {
    ServerMessage::Error {
        code: "unauthorized".to_string(),
        message: "Authenticate before subscribing".to_string(),
    }
}

async fn queue(events: &mpsc::Sender<ClientEvent>, message: ServerMessage) -> bool {
    events.send(ClientEvent::Message(message)).await.is_ok()
}

async fn close(events: &mpsc::Sender<ClientEvent>, code: u16, reason: &str) {
    let _ = events
        .send(ClientEvent::Close(CloseSignal {
            code,
            reason: reason.to_string(),
        }))
        .await;
}

/// Record one offense; true when the channel has exhausted its tolerance
/// (more than [`VIOLATION_LIMIT`] inside [`VIOLATION_WINDOW`]).
fn record_violation(violations: &mut VecDeque<Instant>) -> bool {
    let now = Instant::now();
    violations.push_back(now);
    while violations
        .front()
        .is_some_and(|&t| now.duration_since(t) > VIOLATION_WINDOW)
    {
        violations.pop_front();
    }
    violations.len() > VIOLATION_LIMIT
}

/// Writer half: drains the mailbox in order, pings on the heartbeat
/// interval, and owns the close frame.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<ClientEvent>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Message(message)) => match message.encode() {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode outbound message");
                    }
                },
                Some(ClientEvent::Close(signal)) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: signal.code,
                            reason: signal.reason.into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    // Reader ended without queuing a close.
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}
