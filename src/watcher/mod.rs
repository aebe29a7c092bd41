//! Session log watching: discovery, tailing and record parsing.

mod directory;
mod error;
pub mod record;
mod tailer;

pub use directory::DirectoryWatcher;
pub use error::WatcherError;
pub use record::{ParseError, Record, Role};
pub use tailer::{LogTailer, TailEvent, TailEventKind, TailStep, TailerTask};
