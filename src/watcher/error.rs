//! Watcher error types.

use std::path::PathBuf;

use notify_debouncer_full::notify;

/// Errors that can occur while watching or tailing log files.
#[derive(thiserror::Error, Debug)]
pub enum WatcherError {
    /// Watched file was deleted.
    #[error("Watched file deleted: {0}")]
    FileDeleted(PathBuf),

    /// Permission denied accessing a file.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// Watch root does not exist or cannot be read.
    #[error("Watch root unavailable: {0}")]
    RootUnavailable(PathBuf),

    /// Notify watcher error.
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
