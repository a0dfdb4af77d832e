use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::subscriber::ReceivedMessage;
use google_cloud_pubsub::subscription::Subscription;
use tracing::info;

use crate::crd::GcpPubSubConfig;
use crate::ingest::IngestError;
use crate::ingest::cloud::{CloudMessage, MessageSource};

const PULL_BATCH: i32 = 100;

/* ============================= SOURCE ============================= */

/// Pub/Sub subscription with broker-managed acknowledgement: undelivered
/// messages redeliver after the ack deadline, so the position map is
/// informational only.
pub struct PubSubSource {
    cfg: GcpPubSubConfig,
    subscription: Option<Subscription>,
    pending: Vec<ReceivedMessage>,
}

impl PubSubSource {
    pub fn new(cfg: GcpPubSubConfig) -> Self {
        PubSubSource {
            cfg,
            subscription: None,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl MessageSource for PubSubSource {
    async fn connect(&mut self) -> Result<(), IngestError> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;
        let client = Client::new(config)
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;
        self.subscription = Some(client.subscription(&self.cfg.subscription));
        info!(
            project = %self.cfg.project_id,
            subscription = %self.cfg.subscription,
            "pubsub_subscription_ready"
        );
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<CloudMessage>, IngestError> {
        let subscription = self
            .subscription
            .as_ref()
            .ok_or_else(|| IngestError::Config("pubsub subscription not connected".to_string()))?;

        let messages = subscription
            .pull(PULL_BATCH, None)
            .await
            .map_err(|e| IngestError::Transport(e.into()))?;

        let batch = messages
            .iter()
            .map(|received| CloudMessage {
                partition: self.cfg.subscription.clone(),
                sequence: None,
                enqueued: received.message.publish_time.as_ref().and_then(|ts| {
                    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single()
                }),
                body: received.message.data.clone(),
            })
            .collect();

        self.pending = messages;
        Ok(batch)
    }

    async fn acknowledge(&mut self, _batch: &[CloudMessage]) -> Result<(), IngestError> {
        for message in self.pending.drain(..) {
            message
                .ack()
                .await
                .map_err(|e| IngestError::Transport(e.into()))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IngestError> {
        self.pending.clear();
        self.subscription = None;
        Ok(())
    }
}
