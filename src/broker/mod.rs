//! Subscription broker.
//!
//! Owns the viewer map (at most one viewer per session), the known-session
//! set and the per-session history rings. Every mutation and every publish
//! flows through one mailbox task, which makes exclusivity, takeover and
//! the history prelude atomic with respect to record delivery: no event can
//! reach both the outgoing and incoming viewer of a takeover, and no live
//! record can interleave with a prelude.
//!
//! Delivery never blocks the command loop. Events go to a client's mailbox
//! with `try_send`; when the mailbox is full they queue in a per-client
//! backlog that a periodic flush tick drains in order. The same tick evicts
//! a client whose backlog stays jammed past the slow-client cutoff, so one
//! defective consumer can never stall another session's traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classifier::SessionState;
use crate::config::{RelayConfig, MAILBOX_CAPACITY};
use crate::registry::SessionStatus;
use crate::server::protocol::{close_code, ServerMessage};
use crate::watcher::Record;

/// How often stalled client backlogs are retried and timed.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// An event publishable to a session's viewer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A record flowed from the session's log.
    Record {
        /// The record.
        record: Record,
        /// Catch-up tag from the tailer.
        historical: bool,
    },
    /// The derived activity state changed.
    State {
        /// New state.
        state: SessionState,
        /// Timestamp of the latest record.
        last_activity: DateTime<Utc>,
    },
}

/// Instruction for the connection to close its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSignal {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason string.
    pub reason: String,
}

/// What flows through a client's outbound mailbox, in order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A wire message to serialize and send.
    Message(ServerMessage),
    /// Close the channel after flushing everything queued before this.
    Close(CloseSignal),
}

/// The broker's way to reach one connected client.
#[derive(Debug, Clone)]
pub struct ClientPort {
    /// Ordered outbound mailbox, drained by the connection's writer.
    pub events: mpsc::Sender<ClientEvent>,
    /// Force-close escape hatch for when the mailbox itself is the problem.
    pub kill: CancellationToken,
}

/// Result of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Installed; the history prelude is already queued.
    Subscribed,
    /// Another device holds the session and `force` was not set.
    Occupied {
        /// Device id of the current viewer.
        existing_device: String,
    },
    /// The session is unknown or already terminated.
    NoSuchSession,
    /// The requesting client vanished before the broker processed it.
    Dropped,
}

/// Commands accepted by the broker mailbox.
#[derive(Debug)]
pub enum BrokerCommand {
    /// An authenticated client came online.
    ClientConnected {
        /// Connection id.
        client_id: Uuid,
        /// Device bound to the client's credential.
        device_id: String,
        /// Delivery port.
        port: ClientPort,
    },
    /// A client went away; release anything it held.
    ClientDisconnected {
        /// Connection id.
        client_id: Uuid,
    },
    /// Attach a client to a session.
    Subscribe {
        /// Requesting client.
        client_id: Uuid,
        /// Target session.
        session_id: String,
        /// Displace an existing viewer.
        force: bool,
        /// Outcome for the connection's state machine.
        reply: oneshot::Sender<SubscribeOutcome>,
    },
    /// Detach a client from a session (or whatever it holds).
    Unsubscribe {
        /// Requesting client.
        client_id: Uuid,
        /// Specific session, or `None` for any.
        session_id: Option<String>,
    },
    /// Fan a session event out to its viewer.
    Publish {
        /// Source session.
        session_id: String,
        /// The event.
        event: SessionEvent,
    },
    /// The registry announced a new session.
    SessionDiscovered {
        /// New session.
        session_id: String,
        /// Its project.
        project_label: String,
    },
    /// The registry announced a termination.
    SessionTerminated {
        /// Terminated session.
        session_id: String,
        /// Why.
        reason: String,
    },
}

/// Cloneable handle to the broker task.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    /// Raw command sender, for components wired at composition time.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<BrokerCommand> {
        self.tx.clone()
    }

    /// Register an authenticated client.
    pub async fn client_connected(&self, client_id: Uuid, device_id: String, port: ClientPort) {
        let _ = self
            .tx
            .send(BrokerCommand::ClientConnected {
                client_id,
                device_id,
                port,
            })
            .await;
    }

    /// Deregister a client and release its subscription.
    pub async fn client_disconnected(&self, client_id: Uuid) {
        let _ = self
            .tx
            .send(BrokerCommand::ClientDisconnected { client_id })
            .await;
    }

    /// Request a subscription; resolves once the broker has decided.
    pub async fn subscribe(
        &self,
        client_id: Uuid,
        session_id: String,
        force: bool,
    ) -> SubscribeOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(BrokerCommand::Subscribe {
                client_id,
                session_id,
                force,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return SubscribeOutcome::Dropped;
        }
        reply_rx.await.unwrap_or(SubscribeOutcome::Dropped)
    }

    /// Release a subscription.
    pub async fn unsubscribe(&self, client_id: Uuid, session_id: Option<String>) {
        let _ = self
            .tx
            .send(BrokerCommand::Unsubscribe {
                client_id,
                session_id,
            })
            .await;
    }

    /// Publish a session event.
    pub async fn publish(&self, session_id: String, event: SessionEvent) {
        let _ = self
            .tx
            .send(BrokerCommand::Publish { session_id, event })
            .await;
    }
}

struct ClientInfo {
    device_id: String,
    port: ClientPort,
    /// Events that did not fit in the mailbox, in delivery order.
    backlog: VecDeque<ClientEvent>,
    /// When the mailbox first jammed; cleared once the backlog drains.
    stalled_since: Option<Instant>,
}

struct SessionSlot {
    project_label: String,
    history: VecDeque<Record>,
}

/// The broker task.
pub struct Broker {
    rx: mpsc::Receiver<BrokerCommand>,
    config: Arc<RelayConfig>,
    cancel: CancellationToken,
    clients: HashMap<Uuid, ClientInfo>,
    viewers: HashMap<String, Uuid>,
    sessions: HashMap<String, SessionSlot>,
}

/// Create a broker task and its handle.
#[must_use]
pub fn channel(
    config: Arc<RelayConfig>,
    cancel: CancellationToken,
    capacity: usize,
) -> (BrokerHandle, Broker) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        BrokerHandle { tx },
        Broker {
            rx,
            config,
            cancel,
            clients: HashMap::new(),
            viewers: HashMap::new(),
            sessions: HashMap::new(),
        },
    )
}

impl Broker {
    /// Run the fan-out loop until shutdown.
    ///
    /// Command handling never awaits on a client, so one jammed consumer
    /// cannot delay any other client or session; the flush tick retries
    /// stalled backlogs and applies the slow-client cutoff off the command
    /// path.
    pub async fn run(mut self) {
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = flush.tick() => self.flush_backlogs(),
            }
        }
    }

    fn handle(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::ClientConnected {
                client_id,
                device_id,
                port,
            } => {
                tracing::debug!(client_id = %client_id, device_id = %device_id, "Client online");
                self.clients.insert(
                    client_id,
                    ClientInfo {
                        device_id,
                        port,
                        backlog: VecDeque::new(),
                        stalled_since: None,
                    },
                );
            }
            BrokerCommand::ClientDisconnected { client_id } => {
                tracing::debug!(client_id = %client_id, "Client offline");
                self.evict(client_id);
            }
            BrokerCommand::Subscribe {
                client_id,
                session_id,
                force,
                reply,
            } => {
                self.handle_subscribe(client_id, session_id, force, reply);
            }
            BrokerCommand::Unsubscribe {
                client_id,
                session_id,
            } => {
                self.handle_unsubscribe(client_id, session_id);
            }
            BrokerCommand::Publish { session_id, event } => {
                self.handle_publish(session_id, event);
            }
            BrokerCommand::SessionDiscovered {
                session_id,
                project_label,
            } => {
                // A rediscovered session starts a fresh epoch; old history
                // would replay records from a file that no longer exists.
                self.sessions.insert(
                    session_id.clone(),
                    SessionSlot {
                        project_label: project_label.clone(),
                        history: VecDeque::new(),
                    },
                );
                self.broadcast(ServerMessage::SessionNotification {
                    kind: "discovered".to_string(),
                    session_id,
                    project_label,
                });
            }
            BrokerCommand::SessionTerminated { session_id, reason } => {
                self.sessions.remove(&session_id);
                if let Some(viewer) = self.viewers.remove(&session_id) {
                    self.deliver(
                        viewer,
                        ServerMessage::SessionTerminated {
                            session_id: session_id.clone(),
                            reason,
                        },
                    );
                }
                self.broadcast(ServerMessage::SessionStatus {
                    session_id,
                    status: SessionStatus::Terminated,
                });
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        client_id: Uuid,
        session_id: String,
        force: bool,
        reply: oneshot::Sender<SubscribeOutcome>,
    ) {
        if !self.clients.contains_key(&client_id) {
            let _ = reply.send(SubscribeOutcome::Dropped);
            return;
        }

        if !self.sessions.contains_key(&session_id) {
            let _ = reply.send(SubscribeOutcome::NoSuchSession);
            self.deliver(
                client_id,
                ServerMessage::Error {
                    code: "unknown_session".to_string(),
                    message: format!("No such session: {session_id}"),
                },
            );
            return;
        }

        if let Some(&existing) = self.viewers.get(&session_id) {
            if existing != client_id {
                let existing_device = self
                    .clients
                    .get(&existing)
                    .map(|c| c.device_id.clone())
                    .unwrap_or_default();

                if !force {
                    let _ = reply.send(SubscribeOutcome::Occupied {
                        existing_device: existing_device.clone(),
                    });
                    self.deliver(
                        client_id,
                        ServerMessage::SessionOccupied {
                            session_id,
                            existing_device,
                            can_take_over: true,
                        },
                    );
                    return;
                }

                // Cooperative takeover: the old viewer learns who displaced
                // it, then its channel closes. It never sees another event
                // for this session.
                let new_device = self
                    .clients
                    .get(&client_id)
                    .map(|c| c.device_id.clone())
                    .unwrap_or_default();
                tracing::info!(
                    session_id = %session_id,
                    old_device = %existing_device,
                    new_device = %new_device,
                    "Session takeover"
                );
                self.deliver(
                    existing,
                    ServerMessage::SessionTakenOver {
                        session_id: session_id.clone(),
                        new_device,
                    },
                );
                self.close_client(existing, close_code::TAKEOVER, "takeover");
                self.viewers.remove(&session_id);
            }
        }

        // A client holds at most one subscription; moving to a new session
        // releases whatever it held.
        self.viewers.retain(|_, viewer| *viewer != client_id);
        self.viewers.insert(session_id.clone(), client_id);
        if reply.send(SubscribeOutcome::Subscribed).is_err() {
            // The requester was canceled mid-flight; leave nothing behind.
            self.viewers.remove(&session_id);
            return;
        }

        if !self.deliver(
            client_id,
            ServerMessage::Subscribed {
                session_id: session_id.clone(),
            },
        ) {
            return;
        }
        self.send_history_prelude(client_id, &session_id);
    }

    /// Queue `history_start`, the buffered tail, `history_end`. Runs inside
    /// one broker turn, so later publishes land strictly after it; records
    /// that do not fit the client's mailbox ride its backlog.
    fn send_history_prelude(&mut self, client_id: Uuid, session_id: &str) {
        let records: Vec<Record> = self
            .sessions
            .get(session_id)
            .map(|slot| slot.history.iter().cloned().collect())
            .unwrap_or_default();

        if !self.deliver(
            client_id,
            ServerMessage::SessionHistoryStart {
                session_id: session_id.to_string(),
            },
        ) {
            return;
        }
        for record in records {
            if !self.deliver(client_id, session_message(session_id, &record, true)) {
                return;
            }
        }
        self.deliver(
            client_id,
            ServerMessage::SessionHistoryEnd {
                session_id: session_id.to_string(),
            },
        );
    }

    fn handle_unsubscribe(&mut self, client_id: Uuid, session_id: Option<String>) {
        let held: Vec<String> = match session_id {
            Some(id) => vec![id],
            None => self
                .viewers
                .iter()
                .filter(|(_, &viewer)| viewer == client_id)
                .map(|(id, _)| id.clone())
                .collect(),
        };

        for id in held {
            if self.viewers.get(&id) == Some(&client_id) {
                self.viewers.remove(&id);
                self.deliver(client_id, ServerMessage::Unsubscribed { session_id: id });
            }
        }
    }

    fn handle_publish(&mut self, session_id: String, event: SessionEvent) {
        match event {
            SessionEvent::Record { record, historical } => {
                if historical || self.config.buffer_unwatched {
                    if let Some(slot) = self.sessions.get_mut(&session_id) {
                        if slot.history.len() >= self.config.history_limit {
                            slot.history.pop_front();
                        }
                        slot.history.push_back(record.clone());
                    }
                }

                if let Some(&viewer) = self.viewers.get(&session_id) {
                    self.deliver(viewer, session_message(&session_id, &record, historical));
                }
                // Without a viewer (and without the buffer flag) the record
                // is discarded, matching the source behavior.
            }
            SessionEvent::State {
                state,
                last_activity,
            } => {
                if let Some(&viewer) = self.viewers.get(&session_id) {
                    self.deliver(
                        viewer,
                        ServerMessage::SessionState {
                            session_id,
                            state,
                            last_activity,
                        },
                    );
                }
            }
        }
    }

    /// Queue one message to a client without ever blocking the command
    /// loop. Returns false when the client is gone.
    fn deliver(&mut self, client_id: Uuid, message: ServerMessage) -> bool {
        self.enqueue(client_id, ClientEvent::Message(message))
    }

    /// Non-blocking enqueue: straight into the mailbox when it has room,
    /// otherwise onto the client's ordered backlog for the flush tick. A
    /// backlog larger than a full mailbox means the client is hopeless and
    /// it is dropped on the spot.
    fn enqueue(&mut self, client_id: Uuid, event: ClientEvent) -> bool {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };

        let mut closed = false;
        if client.backlog.is_empty() {
            match client.port.events.try_send(event) {
                Ok(()) => {
                    client.stalled_since = None;
                    return true;
                }
                Err(TrySendError::Full(event)) => {
                    if client.stalled_since.is_none() {
                        client.stalled_since = Some(Instant::now());
                    }
                    client.backlog.push_back(event);
                }
                Err(TrySendError::Closed(_)) => closed = true,
            }
        } else {
            // Anything behind a backlog must join it to keep order.
            client.backlog.push_back(event);
        }
        let overflowed = client.backlog.len() > MAILBOX_CAPACITY;

        if closed {
            self.evict(client_id);
            return false;
        }
        if overflowed {
            tracing::warn!(client_id = %client_id, "Slow consumer, dropping client");
            if let Some(client) = self.clients.get(&client_id) {
                client.port.kill.cancel();
            }
            self.evict(client_id);
            return false;
        }
        true
    }

    /// Retry every stalled backlog in order and drop clients whose
    /// mailboxes have stayed jammed past the slow-client cutoff.
    fn flush_backlogs(&mut self) {
        let cutoff = self.config.slow_client_cutoff;
        let stalled: Vec<Uuid> = self
            .clients
            .iter()
            .filter(|(_, client)| !client.backlog.is_empty())
            .map(|(id, _)| *id)
            .collect();

        for client_id in stalled {
            let mut closed = false;
            let mut timed_out = false;
            if let Some(client) = self.clients.get_mut(&client_id) {
                while let Some(event) = client.backlog.pop_front() {
                    match client.port.events.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(event)) => {
                            client.backlog.push_front(event);
                            break;
                        }
                        Err(TrySendError::Closed(_)) => {
                            closed = true;
                            break;
                        }
                    }
                }
                if client.backlog.is_empty() {
                    client.stalled_since = None;
                } else {
                    timed_out = client
                        .stalled_since
                        .is_some_and(|since| since.elapsed() > cutoff);
                }
            }

            if closed {
                self.evict(client_id);
            } else if timed_out {
                tracing::warn!(client_id = %client_id, "Slow consumer, dropping client");
                if let Some(client) = self.clients.get(&client_id) {
                    client.port.kill.cancel();
                }
                self.evict(client_id);
            }
        }
    }

    /// Queue an ordered close behind everything already queued for the
    /// client; the flush tick delivers it if the mailbox is jammed. The
    /// viewer slot is released immediately.
    fn close_client(&mut self, client_id: Uuid, code: u16, reason: &str) {
        self.viewers.retain(|_, viewer| *viewer != client_id);
        self.enqueue(
            client_id,
            ClientEvent::Close(CloseSignal {
                code,
                reason: reason.to_string(),
            }),
        );
    }

    fn broadcast(&mut self, message: ServerMessage) {
        let ids: Vec<Uuid> = self.clients.keys().copied().collect();
        for client_id in ids {
            self.deliver(client_id, message.clone());
        }
    }

    fn evict(&mut self, client_id: Uuid) {
        self.clients.remove(&client_id);
        self.viewers.retain(|_, viewer| *viewer != client_id);
    }
}

fn session_message(session_id: &str, record: &Record, historical: bool) -> ServerMessage {
    ServerMessage::SessionMessage {
        session_id: session_id.to_string(),
        role: record.role,
        content: record.content.clone(),
        parent_id: record.parent_id.clone(),
        historical,
    }
}
