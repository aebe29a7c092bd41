//! Session activity classification.
//!
//! Derives a three-valued state per session from the suffix of its record
//! stream: a session with no record inside the idle threshold is `idle`;
//! otherwise the latest record's role decides between `working` (last word
//! was the user's, output is expected) and `waiting` (the agent yielded).
//!
//! The core is a pure state table driven by an explicit clock; the task
//! wrapper feeds it records and a periodic tick for the idle edge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerHandle, SessionEvent};
use crate::config::RelayConfig;
use crate::registry::{RegistryHandle, SessionStatus};
use crate::watcher::{Record, Role};

/// Interval between idle re-evaluations.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Derived activity state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// The agent is expected to be producing output.
    Working,
    /// The agent has yielded and waits for input.
    Waiting,
    /// No record within the idle threshold.
    Idle,
}

/// A state transition worth announcing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Affected session.
    pub session_id: String,
    /// New state.
    pub state: SessionState,
    /// Timestamp of the session's latest record.
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
struct Track {
    last_role: Role,
    last_activity: DateTime<Utc>,
    state: SessionState,
}

/// Pure classification core. Emits a change only on transitions.
#[derive(Debug)]
pub struct Classifier {
    idle_threshold: chrono::Duration,
    tracks: HashMap<String, Track>,
}

impl Classifier {
    /// Create a classifier with the given idle threshold.
    #[must_use]
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            idle_threshold: chrono::Duration::from_std(idle_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            tracks: HashMap::new(),
        }
    }

    /// Fold one record into the state table.
    pub fn observe(
        &mut self,
        session_id: &str,
        record: &Record,
        now: DateTime<Utc>,
    ) -> Option<StateChange> {
        let state = if now - record.created_at > self.idle_threshold {
            SessionState::Idle
        } else {
            match record.role {
                Role::User => SessionState::Working,
                Role::Assistant => SessionState::Waiting,
            }
        };

        let previous = self.tracks.insert(
            session_id.to_string(),
            Track {
                last_role: record.role,
                last_activity: record.created_at,
                state,
            },
        );

        if previous.map(|t| t.state) == Some(state) {
            return None;
        }
        Some(StateChange {
            session_id: session_id.to_string(),
            state,
            last_activity: record.created_at,
        })
    }

    /// Re-evaluate every session against the wall clock.
    ///
    /// Only the transition into `idle` can happen here; leaving `idle`
    /// always requires a record.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<StateChange> {
        let mut changes = Vec::new();
        for (session_id, track) in &mut self.tracks {
            if track.state != SessionState::Idle && now - track.last_activity > self.idle_threshold
            {
                track.state = SessionState::Idle;
                changes.push(StateChange {
                    session_id: session_id.clone(),
                    state: SessionState::Idle,
                    last_activity: track.last_activity,
                });
            }
        }
        changes
    }

    /// Forget a terminated session.
    pub fn remove(&mut self, session_id: &str) {
        self.tracks.remove(session_id);
    }

    /// Current state of a session, if tracked.
    #[must_use]
    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.tracks.get(session_id).map(|t| t.state)
    }

    /// Role of the latest record, if tracked.
    #[must_use]
    pub fn last_role(&self, session_id: &str) -> Option<Role> {
        self.tracks.get(session_id).map(|t| t.last_role)
    }
}

/// Input to the classifier task.
#[derive(Debug)]
pub enum ClassifierInput {
    /// A record arrived for a session.
    Record {
        /// Session the record belongs to (log file stem).
        session_id: String,
        /// The record itself.
        record: Record,
    },
    /// A session terminated; stop tracking it.
    Remove {
        /// Terminated session.
        session_id: String,
    },
}

/// Tick-driven classifier task.
///
/// Publishes `session_state` events through the broker and mirrors the
/// active/idle edge into the registry status.
pub struct ClassifierTask {
    classifier: Classifier,
    inputs: mpsc::Receiver<ClassifierInput>,
    broker: BrokerHandle,
    registry: RegistryHandle,
    cancel: CancellationToken,
}

impl ClassifierTask {
    /// Create the task.
    #[must_use]
    pub fn new(
        config: &Arc<RelayConfig>,
        inputs: mpsc::Receiver<ClassifierInput>,
        broker: BrokerHandle,
        registry: RegistryHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            classifier: Classifier::new(config.idle_threshold),
            inputs,
            broker,
            registry,
            cancel,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                input = self.inputs.recv() => match input {
                    Some(ClassifierInput::Record { session_id, record }) => {
                        let change = self.classifier.observe(&session_id, &record, Utc::now());
                        if let Some(change) = change {
                            self.announce(change).await;
                        }
                    }
                    Some(ClassifierInput::Remove { session_id }) => {
                        self.classifier.remove(&session_id);
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    for change in self.classifier.tick(Utc::now()) {
                        self.announce(change).await;
                    }
                }
            }
        }
    }

    async fn announce(&self, change: StateChange) {
        tracing::debug!(
            session_id = %change.session_id,
            state = ?change.state,
            "Session state changed"
        );

        let status = match change.state {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Working | SessionState::Waiting => SessionStatus::Active,
        };
        self.registry
            .mark_status(change.session_id.clone(), status)
            .await;

        self.broker
            .publish(
                change.session_id.clone(),
                SessionEvent::State {
                    state: change.state,
                    last_activity: change.last_activity,
                },
            )
            .await;
    }
}
