use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::Client;
use chrono::Utc;
use tracing::info;

use crate::crd::AwsLogGroupConfig;
use crate::ingest::cloud::pull::{
    DEFAULT_POLL_INTERVAL_SECONDS, LogBatch, LogFetcher, PullMessageSource, RawLogRecord,
    TimestampCursor,
};
use crate::ingest::{IngestError, Position};

const DEFAULT_LOOKBACK_MINUTES: i64 = 60;

/* ============================= FETCHER ============================= */

/// Pages a CloudWatch log group through `FilterLogEvents`.
pub struct CloudWatchFetcher {
    cfg: AwsLogGroupConfig,
    client: Option<Client>,
}

impl CloudWatchFetcher {
    pub fn new(cfg: AwsLogGroupConfig) -> Self {
        CloudWatchFetcher { cfg, client: None }
    }
}

#[async_trait]
impl LogFetcher for CloudWatchFetcher {
    async fn connect(&mut self) -> Result<(), IngestError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = self.cfg.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;
        self.client = Some(Client::new(&sdk_config));
        info!(log_group = %self.cfg.log_group, "cloudwatch_client_ready");
        Ok(())
    }

    async fn fetch(
        &self,
        start_time_ms: i64,
        next_token: Option<String>,
    ) -> Result<LogBatch, IngestError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| IngestError::Config("cloudwatch client not connected".to_string()))?;

        let output = client
            .filter_log_events()
            .log_group_name(&self.cfg.log_group)
            .start_time(start_time_ms)
            .set_next_token(next_token)
            .send()
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;

        let records = output
            .events()
            .iter()
            .map(|event| RawLogRecord {
                timestamp_ms: event.timestamp().unwrap_or_default(),
                body: event.message().unwrap_or_default().as_bytes().to_vec(),
            })
            .collect();

        Ok(LogBatch {
            records,
            next_token: output.next_token().map(str::to_string),
        })
    }
}

/* ============================= CONSTRUCTOR ============================= */

/// Build the pull source for a log group, resuming from the persisted
/// position or falling back to the configured lookback window.
pub fn log_group_source(
    cfg: AwsLogGroupConfig,
    resume: &Position,
) -> PullMessageSource<CloudWatchFetcher> {
    let lookback = cfg.lookback_minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES);
    let default_start_ms = (Utc::now() - chrono::Duration::minutes(lookback)).timestamp_millis();
    let cursor = TimestampCursor::from_position(resume, default_start_ms);
    let poll_interval = Duration::from_secs(
        cfg.poll_interval_seconds.unwrap_or(DEFAULT_POLL_INTERVAL_SECONDS),
    );
    let label = cfg.log_group.clone();
    PullMessageSource::new(CloudWatchFetcher::new(cfg), cursor, &label, poll_interval)
}
