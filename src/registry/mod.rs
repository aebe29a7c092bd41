//! Session registry.
//!
//! The authoritative map of discovered sessions. All mutations flow through
//! a single-writer mailbox task; readers query over oneshot channels, so no
//! descriptor is ever shared across tasks.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerCommand;

/// Lifecycle status of a discovered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Log seen, no record flow yet.
    Discovered,
    /// Records are flowing.
    Active,
    /// No record inside the idle threshold.
    Idle,
    /// The log file is gone.
    Terminated,
}

/// Metadata for one discovered session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Session identifier (log file stem).
    pub session_id: String,
    /// First path segment beneath the watch root.
    pub project_label: String,
    /// Absolute path of the log file.
    pub log_path: PathBuf,
    /// When the log was first seen.
    pub first_seen: DateTime<Utc>,
    /// Timestamp of the most recent record.
    pub last_activity: DateTime<Utc>,
    /// Records observed so far.
    pub record_count: u64,
    /// Lifecycle status.
    pub status: SessionStatus,
}

impl SessionDescriptor {
    /// Create a freshly discovered descriptor.
    #[must_use]
    pub fn new(session_id: String, project_label: String, log_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            project_label,
            log_path,
            first_seen: now,
            last_activity: now,
            record_count: 0,
            status: SessionStatus::Discovered,
        }
    }
}

/// Mailbox commands for the registry task.
#[derive(Debug)]
enum RegistryCommand {
    Upsert(Box<SessionDescriptor>),
    MarkRecord {
        session_id: String,
        at: DateTime<Utc>,
    },
    MarkStatus {
        session_id: String,
        status: SessionStatus,
    },
    MarkTerminated {
        session_id: String,
    },
    List {
        reply: oneshot::Sender<Vec<SessionDescriptor>>,
    },
    Get {
        session_id: String,
        reply: oneshot::Sender<Option<SessionDescriptor>>,
    },
}

/// Cloneable handle to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Insert or replace a descriptor. A session seen for the first time
    /// (or seen again after termination) is announced as discovered.
    pub async fn upsert(&self, descriptor: SessionDescriptor) {
        let _ = self
            .tx
            .send(RegistryCommand::Upsert(Box::new(descriptor)))
            .await;
    }

    /// Account one record: bumps the count and the activity timestamp.
    pub async fn mark_record(&self, session_id: String, at: DateTime<Utc>) {
        let _ = self
            .tx
            .send(RegistryCommand::MarkRecord { session_id, at })
            .await;
    }

    /// Update the lifecycle status (active/idle edge from the classifier).
    pub async fn mark_status(&self, session_id: String, status: SessionStatus) {
        let _ = self
            .tx
            .send(RegistryCommand::MarkStatus { session_id, status })
            .await;
    }

    /// Mark a session terminated and broadcast the termination.
    pub async fn mark_terminated(&self, session_id: String) {
        let _ = self
            .tx
            .send(RegistryCommand::MarkTerminated { session_id })
            .await;
    }

    /// Snapshot of every known descriptor.
    pub async fn list(&self) -> Vec<SessionDescriptor> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::List { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Snapshot of one descriptor.
    pub async fn get(&self, session_id: String) -> Option<SessionDescriptor> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::Get {
                session_id,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }
}

/// The registry task: owns the session map.
pub struct Registry {
    rx: mpsc::Receiver<RegistryCommand>,
    broker: mpsc::Sender<BrokerCommand>,
    cancel: CancellationToken,
    sessions: HashMap<String, SessionDescriptor>,
}

/// Create a registry task and its handle.
///
/// Lifecycle notifications (discovered/terminated) are forwarded to the
/// broker mailbox.
#[must_use]
pub fn channel(
    broker: mpsc::Sender<BrokerCommand>,
    cancel: CancellationToken,
    capacity: usize,
) -> (RegistryHandle, Registry) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        RegistryHandle { tx },
        Registry {
            rx,
            broker,
            cancel,
            sessions: HashMap::new(),
        },
    )
}

impl Registry {
    /// Run the single-writer loop until shutdown.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
    }

    async fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Upsert(descriptor) => {
                let session_id = descriptor.session_id.clone();
                let announce = match self.sessions.get(&session_id) {
                    Some(existing) => existing.status == SessionStatus::Terminated,
                    None => true,
                };
                let project_label = descriptor.project_label.clone();
                self.sessions.insert(session_id.clone(), *descriptor);

                if announce {
                    let _ = self
                        .broker
                        .send(BrokerCommand::SessionDiscovered {
                            session_id,
                            project_label,
                        })
                        .await;
                }
            }
            RegistryCommand::MarkRecord { session_id, at } => {
                if let Some(descriptor) = self.sessions.get_mut(&session_id) {
                    descriptor.last_activity = at;
                    descriptor.record_count += 1;
                    if descriptor.status == SessionStatus::Discovered {
                        descriptor.status = SessionStatus::Active;
                    }
                }
            }
            RegistryCommand::MarkStatus { session_id, status } => {
                if let Some(descriptor) = self.sessions.get_mut(&session_id) {
                    // Terminated is final; only the watcher decides it.
                    if descriptor.status != SessionStatus::Terminated {
                        descriptor.status = status;
                    }
                }
            }
            RegistryCommand::MarkTerminated { session_id } => {
                let Some(descriptor) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                if descriptor.status == SessionStatus::Terminated {
                    return;
                }
                descriptor.status = SessionStatus::Terminated;
                tracing::info!(session_id = %session_id, "Session terminated");
                let _ = self
                    .broker
                    .send(BrokerCommand::SessionTerminated {
                        session_id,
                        reason: "log removed".to_string(),
                    })
                    .await;
            }
            RegistryCommand::List { reply } => {
                let mut sessions: Vec<SessionDescriptor> =
                    self.sessions.values().cloned().collect();
                sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
                let _ = reply.send(sessions);
            }
            RegistryCommand::Get { session_id, reply } => {
                let _ = reply.send(self.sessions.get(&session_id).cloned());
            }
        }
    }
}
