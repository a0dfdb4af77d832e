use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::info;

use crate::crd::AzureEventHubConfig;
use crate::ingest::IngestError;
use crate::ingest::cloud::{CloudMessage, MessageSource};

/* ============================= SOURCE ============================= */

/// Event Hub consumed through its Kafka-compatible endpoint.
///
/// Partition leases and checkpoints are broker-managed: the consumer group
/// assigns partitions, and acknowledged offsets are committed back. A
/// rebalance surfaces as a lost lease and the loop waits for the next
/// assignment.
pub struct EventHubSource {
    cfg: AzureEventHubConfig,
    consumer: Option<StreamConsumer>,
}

impl EventHubSource {
    pub fn new(cfg: AzureEventHubConfig) -> Self {
        EventHubSource { cfg, consumer: None }
    }
}

#[async_trait]
impl MessageSource for EventHubSource {
    async fn connect(&mut self) -> Result<(), IngestError> {
        let group = self
            .cfg
            .consumer_group
            .clone()
            .unwrap_or_else(|| "$Default".to_string());

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.cfg.bootstrap_servers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", "$ConnectionString");

        if let Some(env) = &self.cfg.connection_string_env {
            let connection_string = std::env::var(env).map_err(|_| {
                IngestError::Config(format!("environment variable {env} is not set"))
            })?;
            config.set("sasl.password", &connection_string);
        }

        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| IngestError::Transport(e.into()))?;
        consumer
            .subscribe(&[self.cfg.event_hub.as_str()])
            .map_err(|e| IngestError::Transport(e.into()))?;

        info!(event_hub = %self.cfg.event_hub, group = %group, "event_hub_consumer_subscribed");
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<CloudMessage>, IngestError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| IngestError::Config("event hub consumer not connected".to_string()))?;

        let message = consumer.recv().await.map_err(|e| {
            let text = e.to_string();
            if text.contains("rebalance") {
                IngestError::LeaseLost(text)
            } else {
                IngestError::Transport(e.into())
            }
        })?;

        Ok(vec![CloudMessage {
            partition: message.partition().to_string(),
            sequence: Some(message.offset()),
            enqueued: message
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            body: message.payload().unwrap_or_default().to_vec(),
        }])
    }

    async fn acknowledge(&mut self, batch: &[CloudMessage]) -> Result<(), IngestError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| IngestError::Config("event hub consumer not connected".to_string()))?;

        let mut offsets = TopicPartitionList::new();
        for message in batch {
            let partition: i32 = message.partition.parse().unwrap_or(0);
            if let Some(sequence) = message.sequence {
                offsets
                    .add_partition_offset(
                        &self.cfg.event_hub,
                        partition,
                        Offset::Offset(sequence + 1),
                    )
                    .map_err(|e| IngestError::Transport(e.into()))?;
            }
        }
        consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| IngestError::Transport(e.into()))
    }

    async fn close(&mut self) -> Result<(), IngestError> {
        self.consumer = None;
        Ok(())
    }
}
