pub mod cloud;
pub mod file;
pub mod webhook;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crd::PositionStatus;
use crate::event::AuditEvent;

/// Capacity of the per-pipeline event channel between the ingestor task and
/// the filter/normalize/aggregate consumer.
pub const CHANNEL_CAPACITY: usize = 1000;

/* ============================= ERRORS ============================= */

/// Failure kinds at the ingestor seam.
///
/// Shutdown is not an error condition; it exists so cancellation can travel
/// through `?` without being mistaken for a fault.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("transport: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("partition lease lost: {0}")]
    LeaseLost(String),

    #[error("shutdown")]
    Shutdown,
}

impl IngestError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, IngestError::Shutdown)
    }
}

/* ============================= POSITION ============================= */

/// Resumable cursor for an ingestor, carried as an immutable value at every
/// persistence point. Webhook sources have no position: the apiserver's
/// retry buffer replays anything lost across a restart.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Position {
    #[default]
    None,
    File {
        offset: u64,
        inode: u64,
    },
    Cloud {
        partitions: BTreeMap<String, i64>,
        last_timestamp: Option<DateTime<Utc>>,
    },
}

impl Position {
    pub fn to_status(&self) -> Option<PositionStatus> {
        match self {
            Position::None => None,
            Position::File { offset, inode } => Some(PositionStatus {
                offset: Some(*offset),
                inode: Some(*inode),
                partitions: None,
                last_timestamp: None,
            }),
            Position::Cloud { partitions, last_timestamp } => Some(PositionStatus {
                offset: None,
                inode: None,
                partitions: if partitions.is_empty() {
                    None
                } else {
                    Some(partitions.clone())
                },
                last_timestamp: last_timestamp.map(|t| t.to_rfc3339()),
            }),
        }
    }

    pub fn from_status(status: Option<&PositionStatus>) -> Position {
        let Some(status) = status else {
            return Position::None;
        };
        if let (Some(offset), Some(inode)) = (status.offset, status.inode) {
            return Position::File { offset, inode };
        }
        if status.partitions.is_some() || status.last_timestamp.is_some() {
            return Position::Cloud {
                partitions: status.partitions.clone().unwrap_or_default(),
                last_timestamp: status
                    .last_timestamp
                    .as_deref()
                    .and_then(|t| t.parse::<DateTime<Utc>>().ok()),
            };
        }
        Position::None
    }
}

/* ============================= INGESTOR ============================= */

/// One restartable audit-event stream.
///
/// `run` emits events on `tx` until cancelled or failed; every blocking
/// call inside must observe `cancel`. `checkpoint` returns the current
/// position by value — the ingestor keeps its own mutable cache behind a
/// lock and is the sole writer.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn run(
        &self,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> Result<(), IngestError>;

    fn checkpoint(&self) -> Position;
}

impl std::fmt::Debug for dyn Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Ingestor")
    }
}

/* ============================= TESTS ============================= */
