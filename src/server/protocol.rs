//! Wire protocol for the viewer channel.
//!
//! Every frame is a JSON envelope `{ "type", "payload", "timestamp" }`.
//! The type sets are closed: unknown client types get an `error` reply with
//! code `unknown_type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::classifier::SessionState;
use crate::registry::SessionStatus;
use crate::watcher::Role;

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Missing, invalid, expired or revoked credential.
    pub const UNAUTHORIZED: u16 = 4401;
    /// Subscribe target does not exist.
    pub const UNKNOWN_SESSION: u16 = 4404;
    /// Session already has a viewer.
    pub const SESSION_OCCUPIED: u16 = 4409;
    /// This viewer was displaced by another device.
    pub const TAKEOVER: u16 = 4429;
    /// Internal failure.
    pub const SERVER_ERROR: u16 = 4500;
}

/// Messages the relay sends to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Channel accepted; authentication may proceed.
    Connected {
        /// Server-assigned connection id.
        client_id: Uuid,
        /// Server wall clock at accept time.
        server_time: DateTime<Utc>,
    },
    /// Credential accepted.
    Authenticated {
        /// Always true on this message.
        success: bool,
        /// Device the credential is bound to.
        device_id: String,
    },
    /// Credential rejected; the channel closes next.
    AuthenticationFailed {
        /// Stable failure code (`unknown`, `expired`, `revoked`).
        reason: String,
    },
    /// Subscription installed; the history prelude follows.
    Subscribed {
        /// Subscribed session.
        session_id: String,
    },
    /// Another device is already viewing the session.
    SessionOccupied {
        /// Requested session.
        session_id: String,
        /// Device currently viewing.
        existing_device: String,
        /// Whether `force: true` would displace it.
        can_take_over: bool,
    },
    /// This viewer was displaced by `force: true` from another device.
    SessionTakenOver {
        /// Session that changed hands.
        session_id: String,
        /// Device that took over.
        new_device: String,
    },
    /// Subscription released.
    Unsubscribed {
        /// Session unsubscribed from.
        session_id: String,
    },
    /// One session record.
    SessionMessage {
        /// Session the record belongs to.
        session_id: String,
        /// Record author.
        role: Role,
        /// Record text.
        content: String,
        /// Parent record id; empty when absent.
        parent_id: String,
        /// True for records replayed from before the subscription.
        historical: bool,
    },
    /// Derived activity state changed.
    SessionState {
        /// Session whose state changed.
        session_id: String,
        /// New state.
        state: SessionState,
        /// Timestamp of the latest record.
        last_activity: DateTime<Utc>,
    },
    /// Registry lifecycle status changed.
    SessionStatus {
        /// Affected session.
        session_id: String,
        /// New status.
        status: SessionStatus,
    },
    /// History prelude begins.
    SessionHistoryStart {
        /// Session being replayed.
        session_id: String,
    },
    /// History prelude complete; live records follow.
    SessionHistoryEnd {
        /// Session being replayed.
        session_id: String,
    },
    /// The session's log is gone; the subscription is destroyed.
    SessionTerminated {
        /// Terminated session.
        session_id: String,
        /// Why it terminated.
        reason: String,
    },
    /// Broadcast announcement to every connected viewer.
    SessionNotification {
        /// Notification kind (`discovered`).
        kind: String,
        /// Affected session.
        session_id: String,
        /// Project the session belongs to.
        project_label: String,
    },
    /// Reply to a client `ping`.
    Pong {},
    /// Request-level failure; the channel stays open.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// The server is about to close this channel.
    Disconnecting {
        /// Why the channel is closing.
        reason: String,
    },
}

impl ServerMessage {
    /// Serialize into a wire envelope, stamping the current time.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures (not expected for these types).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        self.encode_at(Utc::now())
    }

    /// Serialize with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures.
    pub fn encode_at(&self, timestamp: DateTime<Utc>) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(envelope) = value.as_object_mut() {
            envelope.entry("payload").or_insert_with(|| Value::Object(Default::default()));
            envelope.insert("timestamp".to_string(), serde_json::to_value(timestamp)?);
        }
        serde_json::to_string(&value)
    }
}

/// Messages viewers send to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Present a device credential.
    Authenticate {
        /// Credential key.
        key: String,
        /// Optional device id hint; the credential's binding wins.
        device_id: Option<String>,
    },
    /// Subscribe to a session's live tail.
    Subscribe {
        /// Target session.
        session_id: String,
        /// Displace an existing viewer.
        force: bool,
    },
    /// Release the current subscription.
    Unsubscribe {
        /// Session to release; `None` releases whatever is held.
        session_id: Option<String>,
    },
    /// Keepalive; answered with `pong`.
    Ping,
}

#[derive(Deserialize)]
struct AuthenticatePayload {
    key: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct SubscribePayload {
    session_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize, Default)]
struct UnsubscribePayload {
    #[serde(default)]
    session_id: Option<String>,
}

/// Why an inbound frame was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame was not a JSON envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Envelope type is not in the client set.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Envelope type was known but its payload did not fit.
    #[error("Invalid {kind} payload: {error}")]
    BadPayload {
        /// The envelope type.
        kind: String,
        /// What was wrong with the payload.
        error: String,
    },
}

impl ProtocolError {
    /// Stable machine-readable code for `error` replies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_envelope",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::BadPayload { .. } => "invalid_payload",
        }
    }
}

impl ClientMessage {
    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Malformed`] when the frame is not a JSON envelope,
    /// [`ProtocolError::UnknownType`] for a type outside the client set,
    /// [`ProtocolError::BadPayload`] when the payload does not deserialize.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let envelope = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("envelope is not an object".to_string()))?;
        let kind = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing type".to_string()))?;
        let payload = envelope
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let bad = |error: serde_json::Error| ProtocolError::BadPayload {
            kind: kind.to_string(),
            error: error.to_string(),
        };

        match kind {
            "authenticate" => {
                let p: AuthenticatePayload = serde_json::from_value(payload).map_err(bad)?;
                Ok(ClientMessage::Authenticate {
                    key: p.key,
                    device_id: p.device_id,
                })
            }
            "subscribe" => {
                let p: SubscribePayload = serde_json::from_value(payload).map_err(bad)?;
                Ok(ClientMessage::Subscribe {
                    session_id: p.session_id,
                    force: p.force,
                })
            }
            "unsubscribe" => {
                let p: UnsubscribePayload = serde_json::from_value(payload).map_err(bad)?;
                Ok(ClientMessage::Unsubscribe {
                    session_id: p.session_id,
                })
            }
            "ping" => Ok(ClientMessage::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}
