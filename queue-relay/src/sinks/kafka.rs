use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, instrument};

use crate::config::KafkaConfig;
use crate::sinks::{OutboundMessage, PublishSink, SinkError};

pub const PRODUCE_ERRORS: &str = "relay_kafka_produce_errors_total";

struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The main rdkafka loop is alive if it calls us
        self.liveness.report_healthy_blocking();

        gauge!("relay_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("relay_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("relay_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("relay_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("relay_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let broker = stats.nodeid.to_string();
            if let Some(rtt) = stats.rtt {
                gauge!(
                    "relay_kafka_produce_rtt_latency_us",
                    "quantile" => "p50",
                    "broker" => broker.clone()
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "relay_kafka_produce_rtt_latency_us",
                    "quantile" => "p99",
                    "broker" => broker.clone()
                )
                .set(rtt.p99 as f64);
            }
            counter!(
                "relay_kafka_broker_tx_errors_total",
                "broker" => broker.clone()
            )
            .absolute(stats.txerrs);
            counter!(
                "relay_kafka_broker_request_timeouts",
                "broker" => broker
            )
            .absolute(stats.req_timeouts);
        }
    }
}

/// Publishes relayed messages to a single Kafka topic.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    metadata_timeout: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<KafkaSink, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("partitioner", "murmur2_random")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        // Credentials are handed to librdkafka untouched
        if let Some(protocol) = &config.kafka_security_protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &config.kafka_sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &config.kafka_sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &config.kafka_sasl_password {
            client_config.set("sasl.password", password);
        }

        debug!(
            topic = %config.kafka_topic,
            "creating rdkafka producer for {}", config.kafka_hosts
        );
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        let metadata_timeout = Duration::from_millis(config.kafka_metadata_timeout_ms);

        // Ping the cluster to make sure we can reach brokers
        drop(
            producer
                .client()
                .fetch_metadata(None, Timeout::After(metadata_timeout))?,
        );
        info!("connected to Kafka brokers");

        Ok(KafkaSink {
            producer,
            topic: config.kafka_topic.clone(),
            metadata_timeout,
        })
    }

    /// Waits for every queued message to be acknowledged.
    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    fn kafka_send(&self, message: &OutboundMessage) -> Result<DeliveryFuture, SinkError> {
        let mut record: FutureRecord<'_, str, str> =
            FutureRecord::to(&self.topic).payload(message.body());

        if let Some(partition) = message.partition() {
            let partition =
                i32::try_from(partition).map_err(|_| SinkError::InvalidPartition {
                    topic: self.topic.clone(),
                    partition,
                })?;
            record = record.partition(partition);
        }

        match self.producer.send_result(record) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => Err(SinkError::MessageTooLarge),
                _ => {
                    counter!(PRODUCE_ERRORS, "stage" => "enqueue").increment(1);
                    error!("failed to produce message: {}", e);
                    Err(SinkError::Produce(e.to_string()))
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), SinkError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!(PRODUCE_ERRORS, "stage" => "ack").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(SinkError::DeliveryCanceled)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                Err(SinkError::MessageTooLarge)
            }
            Ok(Err((err, _))) => {
                counter!(PRODUCE_ERRORS, "stage" => "ack").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(SinkError::Produce(err.to_string()))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl PublishSink for KafkaSink {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn partition_count(&self) -> Result<NonZeroU32, SinkError> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let timeout = self.metadata_timeout;

        // librdkafka metadata requests block the calling thread
        let lookup = tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(topic.as_str()), Timeout::After(timeout))
                .map_err(|e| SinkError::MetadataError(e.to_string()))?;

            let entry = metadata
                .topics()
                .iter()
                .find(|entry| entry.name() == topic)
                .ok_or_else(|| SinkError::UnknownTopic(topic.clone()))?;

            match entry.error() {
                None => {}
                Some(RDKafkaRespErr::RD_KAFKA_RESP_ERR_UNKNOWN_TOPIC_OR_PART) => {
                    return Err(SinkError::UnknownTopic(topic.clone()))
                }
                Some(code) => return Err(SinkError::MetadataError(format!("{code:?}"))),
            }

            u32::try_from(entry.partitions().len())
                .ok()
                .and_then(NonZeroU32::new)
                .ok_or_else(|| SinkError::UnknownTopic(topic.clone()))
        });

        lookup
            .await
            .map_err(|e| SinkError::MetadataError(e.to_string()))?
    }

    #[instrument(skip_all)]
    async fn publish(&self, message: OutboundMessage) -> Result<(), SinkError> {
        let ack = self.kafka_send(&message)?;
        Self::process_ack(ack).await
    }
}
