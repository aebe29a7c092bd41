//! Incremental session log tailer.
//!
//! Reads newly appended bytes from a log file, splits them into lines and
//! emits parsed records in file byte order. Partial trailing lines are
//! carried across reads so a record is never delivered truncated.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::WatcherError;
use super::record::{self, Record};

/// Read chunk size for catch-up and incremental reads.
const CHUNK_BYTES: usize = 64 * 1024;

/// First retry delay after a transient I/O error.
const BACKOFF_FLOOR: Duration = Duration::from_millis(100);

/// Retry delay ceiling.
const BACKOFF_CEIL: Duration = Duration::from_secs(5);

/// An event produced by a tailer, tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct TailEvent {
    /// Session identifier (the log file stem).
    pub session_id: String,
    /// What happened.
    pub kind: TailEventKind,
}

/// The kinds of tail events.
#[derive(Debug, Clone)]
pub enum TailEventKind {
    /// A record was read from the log.
    Record {
        /// The parsed record.
        record: Record,
        /// True for records read during the initial catch-up pass.
        historical: bool,
    },
    /// The file shrank; the read position was reset to 0.
    Rotation,
    /// A transient I/O failure; the tailer is backing off and retrying.
    IoError {
        /// Human-readable failure description.
        message: String,
    },
    /// The log file is gone; this tailer has stopped.
    Terminated,
}

/// One step produced by a single read pass.
#[derive(Debug)]
pub enum TailStep {
    /// A parsed record, in file byte order.
    Record {
        /// The parsed record.
        record: Record,
        /// Catch-up tag, per the read pass that produced it.
        historical: bool,
    },
    /// Truncation was detected before reading.
    Rotation,
}

/// Byte-offset tail state for one log file.
///
/// The offset only moves forward within an epoch; detected truncation
/// resets it to 0 and discards any carried partial line.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    carry: Vec<u8>,
    parse_errors: u64,
}

impl LogTailer {
    /// Create a tailer for the given path, starting at offset 0.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            carry: Vec::new(),
            parse_errors: 0,
        }
    }

    /// Current byte offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of lines dropped for parse failures so far.
    #[must_use]
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Path being tailed.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read everything appended since the last call.
    ///
    /// Records parsed from complete lines are returned in byte order; a
    /// trailing line without a newline stays buffered until a later read
    /// completes it. Malformed lines are logged, counted and skipped
    /// without disturbing ordering.
    ///
    /// # Errors
    ///
    /// [`WatcherError::FileDeleted`] when the file no longer exists, or an
    /// I/O error for other read failures. Failed reads never advance the
    /// offset past bytes that were not consumed.
    pub async fn read_new(&mut self, historical: bool) -> Result<Vec<TailStep>, WatcherError> {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WatcherError::FileDeleted(self.path.clone()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(WatcherError::PermissionDenied(self.path.clone()));
            }
            Err(e) => return Err(WatcherError::Io(e)),
        };

        let len = file.metadata().await?.len();
        let mut steps = Vec::new();

        if len < self.offset {
            tracing::debug!(
                path = %self.path.display(),
                old_offset = self.offset,
                new_len = len,
                "Log truncated, restarting from offset 0"
            );
            steps.push(TailStep::Rotation);
            self.offset = 0;
            self.carry.clear();
        }

        if len == self.offset {
            return Ok(steps);
        }

        file.seek(std::io::SeekFrom::Start(self.offset)).await?;

        // Read only the bytes that existed at stat time; anything appended
        // mid-read is picked up by the next pass.
        let mut remaining = len - self.offset;
        let mut chunk = vec![0u8; CHUNK_BYTES];
        while remaining > 0 {
            let want = chunk.len().min(usize::try_from(remaining).unwrap_or(CHUNK_BYTES));
            let n = file.read(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            self.offset += n as u64;
            remaining -= n as u64;
            self.carry.extend_from_slice(&chunk[..n]);
        }

        self.drain_lines(historical, &mut steps);
        Ok(steps)
    }

    /// Split complete lines out of the carry buffer and parse them.
    fn drain_lines(&mut self, historical: bool, steps: &mut Vec<TailStep>) {
        let mut start = 0;
        while let Some(nl) = self.carry[start..].iter().position(|&b| b == b'\n') {
            let end = start + nl;
            match std::str::from_utf8(&self.carry[start..end]) {
                Ok(line) => match record::parse(line) {
                    Ok(Some(record)) => steps.push(TailStep::Record { record, historical }),
                    Ok(None) => {}
                    Err(e) => {
                        self.parse_errors += 1;
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %e,
                            "Dropping malformed log line"
                        );
                    }
                },
                Err(_) => {
                    self.parse_errors += 1;
                    tracing::warn!(
                        path = %self.path.display(),
                        "Dropping non-UTF-8 log line"
                    );
                }
            }
            start = end + 1;
        }
        self.carry.drain(..start);
    }
}

/// Long-running tail task for one log file.
///
/// Wakes on change notifications from the directory watcher and on a poll
/// tick fallback, forwarding events to the shared bounded mailbox. When the
/// mailbox is full the task blocks rather than dropping, preserving record
/// order end to end.
pub struct TailerTask {
    session_id: String,
    tailer: LogTailer,
    events: mpsc::Sender<TailEvent>,
    wake: mpsc::Receiver<()>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl TailerTask {
    /// Create a tail task for `path`, reporting as `session_id`.
    #[must_use]
    pub fn new(
        session_id: String,
        path: PathBuf,
        events: mpsc::Sender<TailEvent>,
        wake: mpsc::Receiver<()>,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            session_id,
            tailer: LogTailer::new(path),
            events,
            wake,
            cancel,
            poll_interval,
        }
    }

    /// Run until the file disappears, the relay shuts down, or the session
    /// is retired by the directory watcher.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut historical = true;

        loop {
            match self.tailer.read_new(historical).await {
                Ok(steps) => {
                    attempt = 0;
                    historical = false;
                    for step in steps {
                        let kind = match step {
                            TailStep::Record { record, historical } => {
                                TailEventKind::Record { record, historical }
                            }
                            TailStep::Rotation => TailEventKind::Rotation,
                        };
                        if !self.emit(kind).await {
                            return;
                        }
                    }
                }
                Err(WatcherError::FileDeleted(_)) => {
                    let _ = self.emit(TailEventKind::Terminated).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Tailer read failed, backing off"
                    );
                    if !self
                        .emit(TailEventKind::IoError { message: e.to_string() })
                        .await
                    {
                        return;
                    }
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff_delay(attempt)) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.recv() => {
                    // Coalesce any burst of change notifications.
                    while self.wake.try_recv().is_ok() {}
                }
            }
        }
    }

    /// Send an event; returns false when the relay is shutting down.
    async fn emit(&self, kind: TailEventKind) -> bool {
        let event = TailEvent {
            session_id: self.session_id.clone(),
            kind,
        };
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

/// Jittered exponential backoff: 100 ms doubling up to 5 s, plus up to a
/// quarter of the base delay.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_FLOOR
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_CEIL);
    let jitter_cap = (base.as_millis() / 4) as u64;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn log_line(session: &str, role: &str, content: &str) -> String {
        format!(
            r#"{{"sessionId":"{session}","type":"{role}","message":{{"role":"{role}","content":"{content}"}},"timestamp":"2025-09-14T15:04:35.357Z","cwd":"/p"}}"#
        )
    }

    fn records(steps: &[TailStep]) -> Vec<&Record> {
        steps
            .iter()
            .filter_map(|s| match s {
                TailStep::Record { record, .. } => Some(record),
                TailStep::Rotation => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_catch_up_then_incremental() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(&path, format!("{}\n", log_line("s1", "user", "one"))).unwrap();

        let mut tailer = LogTailer::new(path.clone());
        let steps = tailer.read_new(true).await.unwrap();
        assert_eq!(records(&steps).len(), 1);
        assert!(matches!(
            steps[0],
            TailStep::Record { historical: true, .. }
        ));

        // Nothing new.
        assert!(tailer.read_new(false).await.unwrap().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", log_line("s1", "assistant", "two")).unwrap();

        let steps = tailer.read_new(false).await.unwrap();
        let recs = records(&steps);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].content, "two");
        assert!(matches!(
            steps[0],
            TailStep::Record { historical: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_partial_line_carried_across_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        let line = log_line("s1", "user", "split across writes");
        let (head, tail) = line.split_at(line.len() / 2);

        std::fs::write(&path, head).unwrap();
        let mut tailer = LogTailer::new(path.clone());
        assert!(records(&tailer.read_new(true).await.unwrap()).is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{tail}").unwrap();
        drop(file);

        let steps = tailer.read_new(false).await.unwrap();
        let recs = records(&steps);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].content, "split across writes");
    }

    #[tokio::test]
    async fn test_chunked_writes_match_single_write() {
        let dir = TempDir::new().unwrap();
        let whole = format!(
            "{}\n{}\n{}\n",
            log_line("s1", "user", "a"),
            log_line("s1", "assistant", "b"),
            log_line("s1", "user", "c")
        );

        // Single write.
        let single = dir.path().join("single.jsonl");
        std::fs::write(&single, &whole).unwrap();
        let mut tailer = LogTailer::new(single);
        let got_single: Vec<String> = records(&tailer.read_new(true).await.unwrap())
            .iter()
            .map(|r| r.content.clone())
            .collect();

        // Three-byte chunks, reading between each.
        let chunked = dir.path().join("chunked.jsonl");
        std::fs::write(&chunked, "").unwrap();
        let mut tailer = LogTailer::new(chunked.clone());
        let mut got_chunked = Vec::new();
        for chunk in whole.as_bytes().chunks(3) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&chunked).unwrap();
            file.write_all(chunk).unwrap();
            drop(file);
            for step in tailer.read_new(false).await.unwrap() {
                if let TailStep::Record { record, .. } = step {
                    got_chunked.push(record.content);
                }
            }
        }

        assert_eq!(got_single, vec!["a", "b", "c"]);
        assert_eq!(got_chunked, got_single);
    }

    #[tokio::test]
    async fn test_truncation_resets_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(
            &path,
            format!(
                "{}\n{}\n",
                log_line("s1", "user", "a"),
                log_line("s1", "assistant", "b")
            ),
        )
        .unwrap();

        let mut tailer = LogTailer::new(path.clone());
        assert_eq!(records(&tailer.read_new(true).await.unwrap()).len(), 2);

        // Truncate to zero: no duplicates, a rotation marker only.
        std::fs::write(&path, "").unwrap();
        let steps = tailer.read_new(false).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert!(matches!(steps[0], TailStep::Rotation));
        assert_eq!(tailer.offset(), 0);

        // One new line arrives after the truncation.
        std::fs::write(&path, format!("{}\n", log_line("s1", "user", "fresh"))).unwrap();
        let steps = tailer.read_new(false).await.unwrap();
        let recs = records(&steps);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].content, "fresh");
    }

    #[tokio::test]
    async fn test_truncation_mid_line_discards_carry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        let line = log_line("s1", "user", "never complete");

        // Write only half a line, then truncate before it completes.
        std::fs::write(&path, &line[..line.len() / 2]).unwrap();
        let mut tailer = LogTailer::new(path.clone());
        assert!(records(&tailer.read_new(true).await.unwrap()).is_empty());

        std::fs::write(&path, "").unwrap();
        let steps = tailer.read_new(false).await.unwrap();
        assert!(matches!(steps[0], TailStep::Rotation));

        // The half line must not surface after the reset.
        std::fs::write(&path, format!("{}\n", log_line("s1", "user", "after"))).unwrap();
        let steps = tailer.read_new(false).await.unwrap();
        let recs = records(&steps);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].content, "after");
    }

    #[tokio::test]
    async fn test_malformed_lines_counted_and_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(
            &path,
            format!(
                "{}\nnot json\n{}\n",
                log_line("s1", "user", "a"),
                log_line("s1", "assistant", "b")
            ),
        )
        .unwrap();

        let mut tailer = LogTailer::new(path);
        let steps = tailer.read_new(true).await.unwrap();
        assert_eq!(records(&steps).len(), 2);
        assert_eq!(tailer.parse_errors(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_reported() {
        let mut tailer = LogTailer::new(PathBuf::from("/nonexistent/s1.jsonl"));
        assert!(matches!(
            tailer.read_new(true).await,
            Err(WatcherError::FileDeleted(_))
        ));
    }

    #[tokio::test]
    async fn test_task_emits_terminated_on_unlink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(&path, format!("{}\n", log_line("s1", "user", "a"))).unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_wake_tx, wake_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = TailerTask::new(
            "s1".to_string(),
            path.clone(),
            events_tx,
            wake_rx,
            cancel.clone(),
            Duration::from_millis(20),
        );
        let handle = tokio::spawn(task.run());

        let first = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            first.kind,
            TailEventKind::Record { historical: true, .. }
        ));

        std::fs::remove_file(&path).unwrap();
        let last = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(last.kind, TailEventKind::Terminated));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_backoff_delay_bounds() {
        assert!(backoff_delay(1) >= BACKOFF_FLOOR);
        for attempt in 1..12 {
            let delay = backoff_delay(attempt);
            assert!(
                delay <= BACKOFF_CEIL + BACKOFF_CEIL / 4,
                "attempt {attempt}: {delay:?}"
            );
        }
    }
}
