//! Composition root.
//!
//! Instantiates each component exactly once, wires their mailboxes and runs
//! the relay until shutdown. Nothing in the crate is a process-wide
//! singleton; everything a component needs is injected here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthService;
use crate::broker::{self, BrokerHandle, SessionEvent};
use crate::classifier::{ClassifierInput, ClassifierTask};
use crate::config::{RelayConfig, MAILBOX_CAPACITY};
use crate::registry::{self, RegistryHandle};
use crate::server::{build_router, AppState};
use crate::watcher::{DirectoryWatcher, TailEvent, TailEventKind};

/// Errors that stop the relay from starting.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    /// Could not bind or serve.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running relay, for tests and embedding.
pub struct RelayHandle {
    /// Address the HTTP server actually bound to.
    pub local_addr: SocketAddr,
    /// Cancel to shut everything down.
    pub cancel: CancellationToken,
}

impl RelayHandle {
    /// Base URL of the bound HTTP server.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// WebSocket URL of the viewer channel.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }
}

/// Start every component and the HTTP server; returns once bound.
///
/// # Errors
///
/// Fails when the HTTP listener cannot bind. A missing watch root is not
/// fatal: discovery retries and the health endpoint reports it.
pub async fn spawn(config: RelayConfig) -> Result<RelayHandle, RelayError> {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let auth = Arc::new(AuthService::new(&config));
    tokio::spawn(
        Arc::clone(&auth).run_sweeper(config.sweep_interval, cancel.clone()),
    );

    let (broker_handle, broker_task) =
        broker::channel(Arc::clone(&config), cancel.clone(), MAILBOX_CAPACITY);
    tokio::spawn(broker_task.run());

    let (registry_handle, registry_task) =
        registry::channel(broker_handle.sender(), cancel.clone(), MAILBOX_CAPACITY);
    tokio::spawn(registry_task.run());

    let (classifier_tx, classifier_rx) = mpsc::channel(MAILBOX_CAPACITY);
    tokio::spawn(
        ClassifierTask::new(
            &config,
            classifier_rx,
            broker_handle.clone(),
            registry_handle.clone(),
            cancel.clone(),
        )
        .run(),
    );

    let (tail_tx, tail_rx) = mpsc::channel(MAILBOX_CAPACITY);
    tokio::spawn(
        EventRouter {
            registry: registry_handle.clone(),
            classifier: classifier_tx,
            broker: broker_handle.clone(),
            cancel: cancel.clone(),
        }
        .run(tail_rx),
    );

    let watcher = DirectoryWatcher::new(
        Arc::clone(&config),
        registry_handle.clone(),
        tail_tx,
        cancel.clone(),
    );
    tokio::spawn(watcher.run());

    let state = AppState {
        auth,
        registry: registry_handle,
        broker: broker_handle,
        config: Arc::clone(&config),
        started_at: Utc::now(),
        cancel: cancel.clone(),
    };
    let router = build_router(state);
    let listener = TcpListener::bind(config.bind_address()).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, root = %config.watch_root.display(), "Relay listening");

    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let shutdown = async move { serve_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    Ok(RelayHandle { local_addr, cancel })
}

/// Run until Ctrl-C.
///
/// # Errors
///
/// Propagates startup failures; see [`spawn`].
pub async fn run(config: RelayConfig) -> Result<(), RelayError> {
    let handle = spawn(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.cancel.cancel();
    // Grace period for channels to flush close frames.
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(())
}

/// Fans tailer output to the registry, the classifier and the broker.
///
/// One shared channel keeps per-file FIFO: a tailer's records arrive here
/// in byte order and leave toward the broker in the same order.
struct EventRouter {
    registry: RegistryHandle,
    classifier: mpsc::Sender<ClassifierInput>,
    broker: BrokerHandle,
    cancel: CancellationToken,
}

impl EventRouter {
    async fn run(self, mut events: mpsc::Receiver<TailEvent>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.route(event).await,
                    None => break,
                },
            }
        }
    }

    async fn route(&self, event: TailEvent) {
        let TailEvent { session_id, kind } = event;
        match kind {
            TailEventKind::Record { record, historical } => {
                // The broker sees the record before the classifier does, so
                // a viewer always receives the message before the state
                // change it causes.
                self.broker
                    .publish(
                        session_id.clone(),
                        SessionEvent::Record {
                            record: record.clone(),
                            historical,
                        },
                    )
                    .await;
                self.registry
                    .mark_record(session_id.clone(), record.created_at)
                    .await;
                let _ = self
                    .classifier
                    .send(ClassifierInput::Record { session_id, record })
                    .await;
            }
            TailEventKind::Rotation => {
                tracing::debug!(session_id = %session_id, "Log rotated");
            }
            TailEventKind::IoError { message } => {
                tracing::warn!(session_id = %session_id, error = %message, "Tailer I/O error");
            }
            TailEventKind::Terminated => {
                self.registry.mark_terminated(session_id.clone()).await;
                let _ = self
                    .classifier
                    .send(ClassifierInput::Remove { session_id })
                    .await;
            }
        }
    }
}
