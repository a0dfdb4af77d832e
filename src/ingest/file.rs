use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::AuditEvent;
use crate::ingest::{IngestError, Ingestor, Position};
use crate::metrics;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/* ============================= STATE ============================= */

#[derive(Debug, Default, Clone)]
struct TailState {
    /// File position of the next read.
    read_offset: u64,
    /// Bytes held back as an incomplete trailing line.
    partial: String,
    inode: u64,
}

impl TailState {
    /// The durable position: everything before the partial tail. Resuming
    /// here re-reads the tail instead of losing it.
    fn committed_offset(&self) -> u64 {
        self.read_offset - self.partial.len() as u64
    }
}

/* ============================= INGESTOR ============================= */

/// Tails a local audit log file, one JSON event per line.
///
/// Rotation is detected per read cycle by inode change or size regression;
/// either reopens from byte zero. A read ending mid-line keeps the tail
/// buffered until the next cycle completes it.
pub struct FileTailIngestor {
    path: PathBuf,
    poll_interval: Duration,
    source: String,
    state: Mutex<TailState>,
}

impl FileTailIngestor {
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval_ms: Option<u64>,
        resume: &Position,
        source: &str,
    ) -> Self {
        let mut state = TailState::default();
        if let Position::File { offset, inode } = resume {
            state.read_offset = *offset;
            state.inode = *inode;
        }
        FileTailIngestor {
            path: path.into(),
            poll_interval: Duration::from_millis(
                poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            source: source.to_string(),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TailState> {
        self.state.lock().expect("tail state lock poisoned")
    }

    async fn read_cycle(&self, tx: &mpsc::Sender<AuditEvent>, cancel: &CancellationToken) -> Result<(), IngestError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "audit_log_not_readable");
                return Ok(());
            }
        };
        let inode = inode_of(&metadata);

        {
            let mut state = self.state();
            if state.inode != 0 && rotation_occurred(state.inode, state.read_offset, inode, metadata.len()) {
                info!(path = %self.path.display(), "audit_log_rotated");
                state.read_offset = 0;
                state.partial.clear();
            } else if state.inode != inode {
                // Persisted position belongs to a different file: start over.
                state.read_offset = 0;
                state.partial.clear();
            }
            state.inode = inode;
        }

        let offset = self.state().read_offset;
        if metadata.len() <= offset {
            return Ok(());
        }

        let mut file = File::open(&self.path)
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;

        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;

        let lines = {
            let mut state = self.state();
            state.read_offset += chunk.len() as u64;
            state.partial.push_str(&String::from_utf8_lossy(&chunk));
            drain_complete_lines(&mut state.partial)
        };

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(IngestError::Shutdown),
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return Err(IngestError::Shutdown);
                            }
                        }
                    }
                }
                Err(e) => {
                    metrics::PARSE_ERRORS.with_label_values(&[&self.source]).inc();
                    warn!(source = %self.source, error = %e, "audit_line_unparseable");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Ingestor for FileTailIngestor {
    async fn run(
        &self,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> Result<(), IngestError> {
        info!(path = %self.path.display(), source = %self.source, "file_ingestor_started");
        loop {
            match self.read_cycle(&tx, &cancel).await {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => return Ok(()),
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn checkpoint(&self) -> Position {
        let state = self.state();
        Position::File {
            offset: state.committed_offset(),
            inode: state.inode,
        }
    }
}

/* ============================= HELPERS ============================= */

/// Rotation happened when the inode changed or the file shrank below the
/// cached offset (copy-truncate rotation keeps the inode).
fn rotation_occurred(cached_inode: u64, cached_offset: u64, inode: u64, size: u64) -> bool {
    inode != cached_inode || size < cached_offset
}

/// Split complete lines out of the buffer, leaving any trailing partial
/// line in place.
fn drain_complete_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        lines.push(line.trim_end_matches('\n').trim_end_matches('\r').to_string());
    }
    lines
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(_metadata: &std::fs::Metadata) -> u64 {
    1
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn event_line(id: &str, verb: &str) -> String {
        format!(r#"{{"auditID":"{id}","verb":"{verb}","stage":"ResponseComplete"}}"#)
    }

    async fn recv(rx: &mut mpsc::Receiver<AuditEvent>) -> AuditEvent {
        timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    // ── pure helpers ──

    #[test]
    fn test_drain_complete_lines_keeps_partial() {
        let mut buf = "one\ntwo\nthree-partial".to_string();
        let lines = drain_complete_lines(&mut buf);
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(buf, "three-partial");
    }

    #[test]
    fn test_drain_complete_lines_handles_crlf() {
        let mut buf = "one\r\ntwo\r\n".to_string();
        let lines = drain_complete_lines(&mut buf);
        assert_eq!(lines, vec!["one", "two"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rotation_on_inode_change() {
        assert!(rotation_occurred(10, 100, 11, 500));
        assert!(!rotation_occurred(10, 100, 10, 500));
    }

    #[test]
    fn test_rotation_on_size_regression() {
        assert!(rotation_occurred(10, 100, 10, 50));
        assert!(!rotation_occurred(10, 100, 10, 100));
    }

    #[test]
    fn test_committed_offset_excludes_partial() {
        let state = TailState {
            read_offset: 100,
            partial: "abcde".to_string(),
            inode: 1,
        };
        assert_eq!(state.committed_offset(), 95);
    }

    // ── tail loop ──

    #[tokio::test]
    async fn test_tail_reads_lines_and_completes_partials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let mut f = std::fs::File::create(&path).expect("create log");
        write!(f, "{}\n{}\n{}", event_line("a", "get"), event_line("b", "list"), r#"{"auditID":"c","#).expect("write");
        f.flush().expect("flush");

        let ingestor = std::sync::Arc::new(FileTailIngestor::new(
            &path,
            Some(10),
            &Position::None,
            "test",
        ));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        let task = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(cancel, tx).await })
        };

        assert_eq!(recv(&mut rx).await.audit_id, "a");
        assert_eq!(recv(&mut rx).await.audit_id, "b");

        // The partial line is retained, not emitted...
        let complete_lines_len = (event_line("a", "get").len() + event_line("b", "list").len() + 2) as u64;
        assert_eq!(
            ingestor.checkpoint(),
            Position::File {
                offset: complete_lines_len,
                inode: current_inode(&path),
            }
        );

        // ...and completing it on a later cycle emits the event.
        writeln!(f, r#""verb":"watch"}}"#).expect("write tail");
        f.flush().expect("flush");
        let c = recv(&mut rx).await;
        assert_eq!(c.audit_id, "c");
        assert_eq!(c.verb, "watch");

        cancel.cancel();
        let result = timeout(RECV_TIMEOUT, task).await.expect("join").expect("no panic");
        assert!(result.is_ok(), "clean shutdown is not an error");
    }

    #[tokio::test]
    async fn test_tail_survives_rotation_by_truncation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        // The pre-rotation content is deliberately longer than what
        // replaces it, so the size regression is unambiguous.
        std::fs::write(
            &path,
            format!(
                "{}\n{}\n",
                event_line("before-rotation-first", "get"),
                event_line("before-rotation-second", "list"),
            ),
        )
        .expect("write");

        let ingestor = std::sync::Arc::new(FileTailIngestor::new(
            &path,
            Some(10),
            &Position::None,
            "test",
        ));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let task = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(cancel, tx).await })
        };

        assert_eq!(recv(&mut rx).await.audit_id, "before-rotation-first");
        assert_eq!(recv(&mut rx).await.audit_id, "before-rotation-second");

        // Copy-truncate rotation: same inode, size below the cached offset.
        std::fs::write(&path, format!("{}\n", event_line("after", "list"))).expect("rewrite");
        assert_eq!(recv(&mut rx).await.audit_id, "after");

        cancel.cancel();
        let _ = timeout(RECV_TIMEOUT, task).await.expect("join");
    }

    #[tokio::test]
    async fn test_tail_resumes_from_persisted_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        let first = format!("{}\n", event_line("one", "get"));
        std::fs::write(&path, format!("{first}{}\n", event_line("two", "list"))).expect("write");

        let resume = Position::File {
            offset: first.len() as u64,
            inode: current_inode(&path),
        };
        let ingestor = std::sync::Arc::new(FileTailIngestor::new(&path, Some(10), &resume, "test"));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let task = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(cancel, tx).await })
        };

        // Only the second event arrives.
        assert_eq!(recv(&mut rx).await.audit_id, "two");

        cancel.cancel();
        let _ = timeout(RECV_TIMEOUT, task).await.expect("join");
    }

    #[tokio::test]
    async fn test_tail_restarts_at_zero_when_inode_differs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        std::fs::write(&path, format!("{}\n", event_line("one", "get"))).expect("write");

        // A stale inode means the persisted offset belongs to another file.
        let resume = Position::File { offset: 10_000, inode: current_inode(&path) + 1 };
        let ingestor = std::sync::Arc::new(FileTailIngestor::new(&path, Some(10), &resume, "test"));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let task = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(cancel, tx).await })
        };

        assert_eq!(recv(&mut rx).await.audit_id, "one");

        cancel.cancel();
        let _ = timeout(RECV_TIMEOUT, task).await.expect("join");
    }

    #[tokio::test]
    async fn test_tail_drops_unparseable_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.log");
        std::fs::write(
            &path,
            format!("not json at all\n{}\n", event_line("good", "get")),
        )
        .expect("write");

        let ingestor = std::sync::Arc::new(FileTailIngestor::new(
            &path,
            Some(10),
            &Position::None,
            "test",
        ));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let task = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(cancel, tx).await })
        };

        assert_eq!(recv(&mut rx).await.audit_id, "good");

        cancel.cancel();
        let _ = timeout(RECV_TIMEOUT, task).await.expect("join");
    }

    fn current_inode(path: &std::path::Path) -> u64 {
        inode_of(&std::fs::metadata(path).expect("metadata"))
    }
}
