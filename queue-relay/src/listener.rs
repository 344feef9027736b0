//! Per-message relay: inspect the payload, choose a partition, publish.
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::extractor;
use crate::sinks::{OutboundMessage, PublishSink, SinkError};
use crate::source::{InboundMessage, MessageBody, SourceError};
use crate::strategy::PartitionStrategy;

pub const MESSAGES_RECEIVED: &str = "relay_messages_received_total";
pub const MESSAGES_RELAYED: &str = "relay_messages_relayed_total";
pub const MESSAGES_DEGRADED: &str = "relay_messages_degraded_total";
pub const RELAY_DURATION: &str = "relay_message_duration_seconds";

/// Key used when a document does not carry the routing field.
pub const DEFAULT_ROUTING_KEY: i64 = 0;

/// Fatal for the message at hand: it must not be acknowledged.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("message {id} has a {kind} body, only text messages can be relayed")]
    NotTextual { id: String, kind: &'static str },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to publish message: {0}")]
    Publish(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Keyed { key: i64, partition: u32 },
    Unkeyed,
}

impl RelayOutcome {
    fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Keyed { .. } => "keyed",
            RelayOutcome::Unkeyed => "unkeyed",
        }
    }
}

/// Shared by every worker task; holds no per-message state.
#[derive(Clone)]
pub struct RelayListener {
    sink: Arc<dyn PublishSink>,
    strategy: Arc<dyn PartitionStrategy>,
    routing_field: String,
}

impl RelayListener {
    pub fn new(
        sink: Arc<dyn PublishSink>,
        strategy: Arc<dyn PartitionStrategy>,
        routing_field: &str,
    ) -> Self {
        Self {
            sink,
            strategy,
            routing_field: routing_field.to_owned(),
        }
    }

    /// Relays one message. Exactly one publish happens unless an error is returned.
    pub async fn on_message<M>(&self, message: &M) -> Result<RelayOutcome, RelayError>
    where
        M: InboundMessage + ?Sized,
    {
        let started = Instant::now();
        counter!(MESSAGES_RECEIVED).increment(1);

        let body = match message.body()? {
            MessageBody::Text(body) => body,
            other => {
                return Err(RelayError::NotTextual {
                    id: message.id(),
                    kind: other.kind(),
                })
            }
        };

        let outcome = match self.assign_partition(&message.id(), body).await {
            Some((key, partition)) => {
                self.sink
                    .publish(OutboundMessage::new(body, Some(partition)))
                    .await?;
                RelayOutcome::Keyed { key, partition }
            }
            None => {
                self.sink.publish(OutboundMessage::unkeyed(body)).await?;
                RelayOutcome::Unkeyed
            }
        };

        counter!(MESSAGES_RELAYED, "routing" => outcome.label()).increment(1);
        histogram!(RELAY_DURATION).record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Routing key and partition for `body`, `None` to leave placement to the transport.
    async fn assign_partition(&self, id: &str, body: &str) -> Option<(i64, u32)> {
        let document = match serde_json::from_str::<Value>(body) {
            Ok(document @ (Value::Object(_) | Value::Array(_))) => document,
            Ok(_) => {
                debug!(id, "payload is a bare JSON scalar, relaying unkeyed");
                return None;
            }
            Err(e) => {
                debug!(id, "payload is not JSON ({e}), relaying unkeyed");
                return None;
            }
        };

        let key = extractor::extract_i64(&document, &self.routing_field)
            .unwrap_or(DEFAULT_ROUTING_KEY);

        let partition_count = match self.sink.partition_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(id, topic = self.sink.topic(), "{e}, relaying unkeyed");
                counter!(MESSAGES_DEGRADED, "reason" => "partition_count").increment(1);
                return None;
            }
        };

        let partition = self.strategy.select(partition_count, key);
        if partition >= partition_count.get() {
            warn!(
                id,
                key,
                partition,
                partition_count = partition_count.get(),
                "strategy picked a partition outside of the topic, relaying unkeyed"
            );
            counter!(MESSAGES_DEGRADED, "reason" => "partition_out_of_range").increment(1);
            return None;
        }

        debug!(id, key, partition, "assigned partition");
        Some((key, partition))
    }
}
