use std::num::NonZeroU32;

use async_trait::async_trait;
use tracing::info;

use crate::sinks::{OutboundMessage, PublishSink, SinkError};

/// Logs messages instead of producing them, for local development.
pub struct PrintSink {
    topic: String,
    partitions: NonZeroU32,
}

impl PrintSink {
    pub fn new(topic: &str, partitions: NonZeroU32) -> Self {
        Self {
            topic: topic.to_owned(),
            partitions,
        }
    }
}

#[async_trait]
impl PublishSink for PrintSink {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn partition_count(&self) -> Result<NonZeroU32, SinkError> {
        Ok(self.partitions)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), SinkError> {
        if let Some(partition) = message.partition() {
            if partition >= self.partitions.get() {
                return Err(SinkError::InvalidPartition {
                    topic: self.topic.clone(),
                    partition,
                });
            }
        }

        info!(
            topic = %self.topic,
            partition = ?message.partition(),
            "message: {}",
            message.body()
        );
        Ok(())
    }
}
