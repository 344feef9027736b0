use std::num::NonZeroU32;

use async_trait::async_trait;
use thiserror::Error;

pub mod kafka;
pub mod print;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("topic {0} does not exist or has no partitions")]
    UnknownTopic(String),
    #[error("failed to fetch topic metadata: {0}")]
    MetadataError(String),
    #[error("partition {partition} is out of range for topic {topic}")]
    InvalidPartition { topic: String, partition: u32 },
    #[error("message rejected by the broker for its size")]
    MessageTooLarge,
    #[error("failed to produce message: {0}")]
    Produce(String),
    #[error("delivery was canceled before the broker acknowledged it")]
    DeliveryCanceled,
}

/// A relayed body, optionally pinned to a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    body: String,
    partition: Option<u32>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>, partition: Option<u32>) -> Self {
        Self {
            body: body.into(),
            partition,
        }
    }

    /// Leaves partition placement to the transport.
    pub fn unkeyed(body: impl Into<String>) -> Self {
        Self::new(body, None)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }
}

/// Destination of the relay, bound to a single topic.
///
/// Implementations are shared by every worker task and must accept
/// concurrent calls.
#[async_trait]
pub trait PublishSink: Send + Sync {
    fn topic(&self) -> &str;

    /// Current partition count of the topic, read from live cluster metadata.
    async fn partition_count(&self) -> Result<NonZeroU32, SinkError>;

    /// Returns once the transport acknowledged the message.
    async fn publish(&self, message: OutboundMessage) -> Result<(), SinkError>;
}
