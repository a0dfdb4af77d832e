use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::ingest::cloud::{CloudMessage, MessageSource};
use crate::ingest::{IngestError, Position};

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 15;

/* ============================= FETCHER ============================= */

/// One page of log records from a timestamp-addressed store.
#[derive(Debug, Default)]
pub struct LogBatch {
    pub records: Vec<RawLogRecord>,
    pub next_token: Option<String>,
}

#[derive(Debug)]
pub struct RawLogRecord {
    pub timestamp_ms: i64,
    pub body: Vec<u8>,
}

/// The provider-specific page fetch; everything else about the pull model
/// is shared.
#[async_trait]
pub trait LogFetcher: Send + Sync {
    async fn connect(&mut self) -> Result<(), IngestError> {
        Ok(())
    }

    /// Fetch one page of records at or after `start_time_ms`, continuing a
    /// paginated read when `next_token` is set.
    async fn fetch(
        &self,
        start_time_ms: i64,
        next_token: Option<String>,
    ) -> Result<LogBatch, IngestError>;
}

/* ============================= CURSOR ============================= */

/// The pull cursor. `start_ms` is the inclusive lower bound of the next
/// fetch; it advances past a batch's newest timestamp only once the
/// paginated response has completed and been acknowledged, so events that
/// share a timestamp with a page boundary are never skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampCursor {
    start_ms: i64,
    token: Option<String>,
    page_max_ms: i64,
    pagination_complete: bool,
}

impl TimestampCursor {
    pub fn new(start_ms: i64) -> Self {
        TimestampCursor {
            start_ms,
            token: None,
            page_max_ms: -1,
            pagination_complete: false,
        }
    }

    /// Re-seed from a persisted position: the lower bound restarts at the
    /// persisted timestamp plus one millisecond.
    pub fn from_position(position: &Position, default_start_ms: i64) -> Self {
        match position {
            Position::Cloud { last_timestamp: Some(ts), .. } => {
                TimestampCursor::new(ts.timestamp_millis() + 1)
            }
            _ => TimestampCursor::new(default_start_ms),
        }
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn token(&self) -> Option<String> {
        self.token.clone()
    }

    /// Fold one fetched page into the cursor.
    pub fn observe(&mut self, batch: &LogBatch) {
        for record in &batch.records {
            if record.timestamp_ms > self.page_max_ms {
                self.page_max_ms = record.timestamp_ms;
            }
        }
        self.token = batch.next_token.clone();
        if self.token.is_none() {
            self.pagination_complete = true;
        }
    }

    /// Advance the lower bound after downstream acceptance. Only a
    /// completed pagination moves `start_ms`.
    pub fn commit(&mut self) {
        if self.pagination_complete {
            if self.page_max_ms >= self.start_ms {
                self.start_ms = self.page_max_ms + 1;
            }
            self.page_max_ms = -1;
            self.pagination_complete = false;
        }
    }

    /// The durable position: the newest fully-consumed event time.
    pub fn position(&self) -> Position {
        if self.start_ms <= 0 {
            return Position::Cloud {
                partitions: Default::default(),
                last_timestamp: None,
            };
        }
        Position::Cloud {
            partitions: Default::default(),
            last_timestamp: Utc.timestamp_millis_opt(self.start_ms - 1).single(),
        }
    }
}

/* ============================= SOURCE ============================= */

/// MessageSource over a `LogFetcher`: the position is the acknowledgement,
/// there is no broker-side commit.
pub struct PullMessageSource<F: LogFetcher> {
    fetcher: F,
    cursor: TimestampCursor,
    partition_label: String,
    poll_interval: Duration,
}

impl<F: LogFetcher> PullMessageSource<F> {
    pub fn new(fetcher: F, cursor: TimestampCursor, partition_label: &str, poll_interval: Duration) -> Self {
        PullMessageSource {
            fetcher,
            cursor,
            partition_label: partition_label.to_string(),
            poll_interval,
        }
    }
}

#[async_trait]
impl<F: LogFetcher> MessageSource for PullMessageSource<F> {
    async fn connect(&mut self) -> Result<(), IngestError> {
        self.fetcher.connect().await
    }

    async fn receive(&mut self) -> Result<Vec<CloudMessage>, IngestError> {
        let batch = self
            .fetcher
            .fetch(self.cursor.start_ms(), self.cursor.token())
            .await?;
        self.cursor.observe(&batch);

        if batch.records.is_empty() && self.cursor.token().is_none() {
            // Caught up; wait out the poll interval before asking again.
            tokio::time::sleep(self.poll_interval).await;
            return Ok(Vec::new());
        }

        Ok(batch
            .records
            .into_iter()
            .map(|record| CloudMessage {
                partition: self.partition_label.clone(),
                sequence: None,
                enqueued: Utc.timestamp_millis_opt(record.timestamp_ms).single(),
                body: record.body,
            })
            .collect())
    }

    async fn acknowledge(&mut self, _batch: &[CloudMessage]) -> Result<(), IngestError> {
        self.cursor.commit();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IngestError> {
        Ok(())
    }

    fn position(&self) -> Option<Position> {
        Some(self.cursor.position())
    }
}

/* ============================= HELPERS ============================= */

pub fn datetime_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedFetcher {
        pages: Mutex<VecDeque<LogBatch>>,
        calls: Mutex<Vec<(i64, Option<String>)>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<LogBatch>) -> Self {
            ScriptedFetcher {
                pages: Mutex::new(pages.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LogFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            start_time_ms: i64,
            next_token: Option<String>,
        ) -> Result<LogBatch, IngestError> {
            self.calls.lock().unwrap().push((start_time_ms, next_token));
            Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn record(ts: i64, id: &str) -> RawLogRecord {
        RawLogRecord {
            timestamp_ms: ts,
            body: format!(r#"{{"auditID":"{id}","verb":"get"}}"#).into_bytes(),
        }
    }

    fn page(records: Vec<RawLogRecord>, token: Option<&str>) -> LogBatch {
        LogBatch {
            records,
            next_token: token.map(str::to_string),
        }
    }

    // ── cursor ──

    #[test]
    fn test_cursor_advances_only_after_complete_pagination() {
        let mut cursor = TimestampCursor::new(1000);

        cursor.observe(&page(vec![record(1500, "a")], Some("t1")));
        cursor.commit();
        assert_eq!(cursor.start_ms(), 1000, "mid-pagination: no advance");
        assert_eq!(cursor.token().as_deref(), Some("t1"));

        cursor.observe(&page(vec![record(1500, "b"), record(1700, "c")], None));
        cursor.commit();
        assert_eq!(cursor.start_ms(), 1701, "complete: past the newest timestamp");
        assert_eq!(cursor.token(), None);
    }

    #[test]
    fn test_cursor_is_non_decreasing() {
        let mut cursor = TimestampCursor::new(5000);
        let mut seen = vec![cursor.start_ms()];

        cursor.observe(&page(vec![record(4000, "late")], None));
        cursor.commit();
        seen.push(cursor.start_ms());

        cursor.observe(&page(vec![record(6000, "a")], None));
        cursor.commit();
        seen.push(cursor.start_ms());

        cursor.observe(&page(vec![], None));
        cursor.commit();
        seen.push(cursor.start_ms());

        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted, "start time never regresses: {seen:?}");
    }

    #[test]
    fn test_cursor_commit_requires_acknowledge() {
        let mut cursor = TimestampCursor::new(1000);
        cursor.observe(&page(vec![record(2000, "a")], None));
        assert_eq!(cursor.start_ms(), 1000, "observe alone must not advance");
        cursor.commit();
        assert_eq!(cursor.start_ms(), 2001);
    }

    #[test]
    fn test_cursor_position_roundtrip() {
        let mut cursor = TimestampCursor::new(1000);
        cursor.observe(&page(vec![record(2000, "a")], None));
        cursor.commit();

        let position = cursor.position();
        let restored = TimestampCursor::from_position(&position, 0);
        assert_eq!(restored.start_ms(), cursor.start_ms());
    }

    #[test]
    fn test_cursor_reseeds_from_last_timestamp_plus_one() {
        let position = Position::Cloud {
            partitions: Default::default(),
            last_timestamp: Some(Utc.timestamp_millis_opt(7000).single().unwrap()),
        };
        let cursor = TimestampCursor::from_position(&position, 0);
        assert_eq!(cursor.start_ms(), 7001);
    }

    #[test]
    fn test_cursor_defaults_without_position() {
        let cursor = TimestampCursor::from_position(&Position::None, 12345);
        assert_eq!(cursor.start_ms(), 12345);
    }

    // ── source ──

    #[tokio::test]
    async fn test_pull_source_pages_then_advances() {
        let fetcher = ScriptedFetcher::new(vec![
            page(vec![record(1500, "a")], Some("t1")),
            page(vec![record(1600, "b")], None),
        ]);
        let mut source = PullMessageSource::new(
            fetcher,
            TimestampCursor::new(1000),
            "group",
            Duration::from_millis(1),
        );
        source.connect().await.unwrap();

        let first = source.receive().await.unwrap();
        assert_eq!(first.len(), 1);
        source.acknowledge(&first).await.unwrap();

        let second = source.receive().await.unwrap();
        assert_eq!(second.len(), 1);
        source.acknowledge(&second).await.unwrap();

        // Both fetches within the pagination used the original lower bound.
        {
            let calls = source.fetcher.calls.lock().unwrap();
            assert_eq!(calls[0], (1000, None));
            assert_eq!(calls[1], (1000, Some("t1".to_string())));
        }

        // After completion the next fetch starts past the newest record.
        let _ = source.receive().await.unwrap();
        let calls = source.fetcher.calls.lock().unwrap();
        assert_eq!(calls[2].0, 1601);
    }

    #[tokio::test]
    async fn test_pull_source_checkpoint_restore_is_stable() {
        // Start from a saved position with no new events: no output, and
        // the reported checkpoint equals the input.
        let saved = Position::Cloud {
            partitions: Default::default(),
            last_timestamp: Some(Utc.timestamp_millis_opt(9000).single().unwrap()),
        };
        let fetcher = ScriptedFetcher::new(vec![page(vec![], None), page(vec![], None)]);
        let mut source = PullMessageSource::new(
            fetcher,
            TimestampCursor::from_position(&saved, 0),
            "group",
            Duration::from_millis(1),
        );

        let batch = source.receive().await.unwrap();
        assert!(batch.is_empty());
        source.acknowledge(&batch).await.unwrap();

        assert_eq!(source.position(), Some(saved));
    }

    #[tokio::test]
    async fn test_pull_source_messages_carry_enqueue_time() {
        let fetcher = ScriptedFetcher::new(vec![page(vec![record(1500, "a")], None)]);
        let mut source = PullMessageSource::new(
            fetcher,
            TimestampCursor::new(0),
            "group",
            Duration::from_millis(1),
        );
        let batch = source.receive().await.unwrap();
        assert_eq!(batch[0].partition, "group");
        assert_eq!(batch[0].enqueued.map(datetime_ms), Some(1500));
    }
}
