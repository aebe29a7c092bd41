//! Directory watcher for session log discovery.
//!
//! Recursively watches the projects root for `*.jsonl` files, spawning a
//! tailer per log and retiring it when the log is unlinked. Two backends
//! share one event loop: filesystem notifications (debounced) and a plain
//! rescan loop for filesystems where notifications are unreliable.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecursiveMode},
    DebounceEventResult, DebouncedEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::registry::{RegistryHandle, SessionDescriptor};

use super::error::WatcherError;
use super::tailer::{TailEvent, TailerTask};

/// Debounce window for filesystem notifications.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Per-tailer wake channel capacity; wakes coalesce, so small is fine.
const WAKE_CAPACITY: usize = 4;

/// Handle to a spawned tailer.
struct TailerEntry {
    session_id: String,
    wake: mpsc::Sender<()>,
    cancel: CancellationToken,
}

/// Watches the projects root and manages the tailer fleet.
pub struct DirectoryWatcher {
    root: PathBuf,
    config: Arc<RelayConfig>,
    registry: RegistryHandle,
    events: mpsc::Sender<TailEvent>,
    cancel: CancellationToken,
    tailers: HashMap<PathBuf, TailerEntry>,
}

impl DirectoryWatcher {
    /// Create a watcher over `config.watch_root`.
    #[must_use]
    pub fn new(
        config: Arc<RelayConfig>,
        registry: RegistryHandle,
        events: mpsc::Sender<TailEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root: config.watch_root.clone(),
            config,
            registry,
            events,
            cancel,
            tailers: HashMap::new(),
        }
    }

    /// Run discovery until shutdown.
    ///
    /// Scan failures and a vanished root are logged and retried, not
    /// fatal; existing tailers keep running while the root is unavailable
    /// and the health endpoint reports the degradation. A notification
    /// backend that cannot be installed degrades to polling.
    pub async fn run(mut self) {
        self.scan(true).await;

        if self.config.poll_watcher {
            self.run_polling().await;
        } else if let Err(e) = self.run_notify().await {
            tracing::error!(error = %e, "Notification backend failed, falling back to polling");
            self.run_polling().await;
        }

        for entry in self.tailers.values() {
            entry.cancel.cancel();
        }
    }

    /// Event-driven backend via notify, bridged onto a tokio channel.
    async fn run_notify(&mut self) -> Result<(), WatcherError> {
        let (fs_tx, mut fs_rx) = mpsc::channel::<DebounceEventResult>(64);
        let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, None, move |result| {
            // Runs on the notify worker thread.
            let _ = fs_tx.blocking_send(result);
        })?;
        debouncer.watch(&self.root, RecursiveMode::Recursive)?;

        tracing::info!(root = %self.root.display(), "Watching projects root");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                result = fs_rx.recv() => match result {
                    Some(Ok(batch)) => {
                        for event in &batch {
                            self.handle_fs_event(event).await;
                        }
                    }
                    Some(Err(errors)) => {
                        for error in errors {
                            tracing::warn!(error = %error, "Watch backend error");
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Polling backend: periodic rescan of the whole tree.
    async fn run_polling(&mut self) {
        tracing::info!(
            root = %self.root.display(),
            interval_s = self.config.poll_interval.as_secs(),
            "Polling projects root"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {
                    self.scan(false).await;
                    for entry in self.tailers.values() {
                        let _ = entry.wake.try_send(());
                    }
                }
            }
        }
    }

    /// Reconcile the tailer fleet against the tree on disk.
    async fn scan(&mut self, initial: bool) {
        let found = match scan_tree(&self.root) {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(
                    root = %self.root.display(),
                    error = %e,
                    "Cannot scan projects root"
                );
                return;
            }
        };

        for path in &found {
            match self.tailers.get(path) {
                None => self.add_log(path.clone()).await,
                // A tailer that stopped on its own (transient unlink) left a
                // dead entry; replace it so the file is tailed again.
                Some(entry) if entry.wake.is_closed() => {
                    self.tailers.remove(path);
                    self.add_log(path.clone()).await;
                }
                Some(_) => {}
            }
        }

        if !initial {
            let gone: Vec<PathBuf> = self
                .tailers
                .keys()
                .filter(|known| !found.contains(*known))
                .cloned()
                .collect();
            for path in gone {
                self.remove_log(&path).await;
            }
        }
    }

    /// React to one debounced notification.
    async fn handle_fs_event(&mut self, event: &DebouncedEvent) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }

        for path in &event.paths {
            if !is_log_path(&self.root, path) {
                continue;
            }
            // Renames surface as paths that may or may not still exist, so
            // existence decides between discovery and retirement.
            if path.is_file() {
                match self.tailers.get(path) {
                    Some(entry) if entry.wake.is_closed() => {
                        self.tailers.remove(path);
                        self.add_log(path.clone()).await;
                    }
                    Some(entry) => {
                        let _ = entry.wake.try_send(());
                    }
                    None => self.add_log(path.clone()).await,
                }
            } else if self.tailers.contains_key(path) {
                self.remove_log(path).await;
            }
        }
    }

    /// Register a newly discovered log and spawn its tailer.
    async fn add_log(&mut self, path: PathBuf) {
        let Some(session_id) = session_id_for(&path) else {
            return;
        };
        let project_label = project_label_for(&self.root, &path);

        tracing::info!(
            session_id = %session_id,
            project = %project_label,
            path = %path.display(),
            "Discovered session log"
        );

        self.registry
            .upsert(SessionDescriptor::new(
                session_id.clone(),
                project_label,
                path.clone(),
            ))
            .await;

        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CAPACITY);
        let child_cancel = self.cancel.child_token();
        let task = TailerTask::new(
            session_id.clone(),
            path.clone(),
            self.events.clone(),
            wake_rx,
            child_cancel.clone(),
            self.config.poll_interval,
        );
        tokio::spawn(task.run());

        self.tailers.insert(
            path,
            TailerEntry {
                session_id,
                wake: wake_tx,
                cancel: child_cancel,
            },
        );
    }

    /// Retire a log whose file is gone.
    async fn remove_log(&mut self, path: &Path) {
        let Some(entry) = self.tailers.remove(path) else {
            return;
        };
        tracing::info!(
            session_id = %entry.session_id,
            path = %path.display(),
            "Session log removed"
        );
        entry.cancel.cancel();
        self.registry.mark_terminated(entry.session_id).await;
    }
}

/// Collect every session log under `root`.
fn scan_tree(root: &Path) -> Result<HashSet<PathBuf>, WatcherError> {
    if !root.is_dir() {
        return Err(WatcherError::RootUnavailable(root.to_path_buf()));
    }
    let mut found = HashSet::new();
    collect_logs(root, root, &mut found)?;
    Ok(found)
}

fn collect_logs(
    root: &Path,
    dir: &Path,
    found: &mut HashSet<PathBuf>,
) -> Result<(), WatcherError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            // Subtrees that vanish mid-scan are simply skipped.
            if let Err(e) = collect_logs(root, &path, found) {
                tracing::debug!(path = %path.display(), error = %e, "Skipping subtree");
            }
        } else if is_log_path(root, &path) {
            found.insert(path);
        }
    }
    Ok(())
}

/// A watchable log: `.jsonl` extension, no hidden component under the root.
fn is_log_path(root: &Path, path: &Path) -> bool {
    if !path.extension().is_some_and(|ext| ext == "jsonl") {
        return false;
    }
    let relative = path.strip_prefix(root).unwrap_or(path);
    !relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
    })
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Session id is the log file's stem.
fn session_id_for(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(ToString::to_string)
}

/// Project label is the first path segment beneath the root; a log sitting
/// directly in the root falls back to its own stem.
fn project_label_for(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut components = relative.components();
    let first = components
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .unwrap_or_default()
        .to_string();
    if components.next().is_none() {
        // The first component was the file itself.
        return session_id_for(path).unwrap_or(first);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_log_path_filters_extensions_and_hidden() {
        let root = Path::new("/root");

        assert!(is_log_path(root, Path::new("/root/proj/s1.jsonl")));
        assert!(is_log_path(root, Path::new("/root/a/b/c/s1.jsonl")));
        assert!(!is_log_path(root, Path::new("/root/proj/s1.json")));
        assert!(!is_log_path(root, Path::new("/root/proj/notes.txt")));
        assert!(!is_log_path(root, Path::new("/root/proj/.hidden.jsonl")));
        assert!(!is_log_path(root, Path::new("/root/.trash/s1.jsonl")));
    }

    #[test]
    fn test_session_id_is_file_stem() {
        assert_eq!(
            session_id_for(Path::new("/root/proj/abc-123.jsonl")),
            Some("abc-123".to_string())
        );
    }

    #[test]
    fn test_project_label() {
        let root = Path::new("/root");

        assert_eq!(
            project_label_for(root, Path::new("/root/my-app/s1.jsonl")),
            "my-app"
        );
        assert_eq!(
            project_label_for(root, Path::new("/root/my-app/nested/s1.jsonl")),
            "my-app"
        );
        // Log directly in the root: label falls back to the stem.
        assert_eq!(project_label_for(root, Path::new("/root/s1.jsonl")), "s1");
    }

    #[test]
    fn test_scan_tree_finds_nested_logs() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("proj-a")).unwrap();
        std::fs::create_dir_all(root.join("proj-b/nested")).unwrap();
        std::fs::create_dir_all(root.join(".hidden")).unwrap();
        std::fs::write(root.join("proj-a/s1.jsonl"), "").unwrap();
        std::fs::write(root.join("proj-b/nested/s2.jsonl"), "").unwrap();
        std::fs::write(root.join("proj-b/readme.md"), "").unwrap();
        std::fs::write(root.join(".hidden/s3.jsonl"), "").unwrap();

        let found = scan_tree(root).unwrap();

        assert_eq!(found.len(), 2);
        assert!(found.contains(&root.join("proj-a/s1.jsonl")));
        assert!(found.contains(&root.join("proj-b/nested/s2.jsonl")));
    }

    #[test]
    fn test_scan_tree_missing_root() {
        assert!(matches!(
            scan_tree(Path::new("/definitely/not/here")),
            Err(WatcherError::RootUnavailable(_))
        ));
    }
}
