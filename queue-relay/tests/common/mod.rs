#![allow(dead_code)]

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use queue_relay::sinks::{OutboundMessage, PublishSink, SinkError};
use queue_relay::source::{Delivery, InboundMessage, MessageBody, MessageSource, SourceError};

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

#[derive(Debug, Clone)]
pub enum Body {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct MemoryMessage {
    pub id: String,
    pub body: Body,
    pub attempt: u32,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<MemoryMessage>,
    acked: Vec<String>,
    rejected: Vec<(String, String)>,
    dead_lettered: Vec<String>,
    next_id: u64,
}

/// In-process stand-in for the queue: rejected messages go back to the end of
/// the queue until they run out of attempts.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    max_attempts: u32,
    /// Time every receive takes before it looks at the queue.
    receive_delay: Duration,
    receives_started: Arc<AtomicUsize>,
}

impl MemoryQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self::with_receive_delay(max_attempts, Duration::ZERO)
    }

    pub fn with_receive_delay(max_attempts: u32, receive_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_attempts,
            receive_delay,
            receives_started: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn receives_started(&self) -> usize {
        self.receives_started.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().expect("poisoned").pending.len()
    }

    fn push(&self, body: Body) -> String {
        let mut state = self.state.lock().expect("poisoned");
        state.next_id += 1;
        let id = format!("msg-{}", state.next_id);
        state.pending.push_back(MemoryMessage {
            id: id.clone(),
            body,
            attempt: 0,
        });
        id
    }

    pub fn enqueue_text(&self, body: &str) -> String {
        self.push(Body::Text(body.to_string()))
    }

    pub fn enqueue_bytes(&self, body: &[u8]) -> String {
        self.push(Body::Binary(body.to_vec()))
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().expect("poisoned").acked.clone()
    }

    pub fn rejected(&self) -> Vec<(String, String)> {
        self.state.lock().expect("poisoned").rejected.clone()
    }

    pub fn dead_lettered(&self) -> Vec<String> {
        self.state.lock().expect("poisoned").dead_lettered.clone()
    }

    pub fn settled(&self) -> usize {
        let state = self.state.lock().expect("poisoned");
        state.acked.len() + state.dead_lettered.len()
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    type Delivery = MemoryDelivery;

    async fn receive(&self) -> Result<Option<MemoryDelivery>, SourceError> {
        self.receives_started.fetch_add(1, Ordering::SeqCst);
        if !self.receive_delay.is_zero() {
            tokio::time::sleep(self.receive_delay).await;
        }

        let mut state = self.state.lock().expect("poisoned");
        Ok(state.pending.pop_front().map(|mut message| {
            message.attempt += 1;
            MemoryDelivery {
                message,
                queue: self.clone(),
            }
        }))
    }
}

/// A source whose every receive fails, counting the attempts.
#[derive(Clone, Default)]
pub struct BrokenQueue {
    receives: Arc<AtomicUsize>,
}

impl BrokenQueue {
    pub fn receives(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for BrokenQueue {
    type Delivery = MemoryDelivery;

    async fn receive(&self) -> Result<Option<MemoryDelivery>, SourceError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::ConnectionError(sqlx::Error::PoolTimedOut))
    }
}

pub struct MemoryDelivery {
    pub message: MemoryMessage,
    queue: MemoryQueue,
}

impl MemoryDelivery {
    /// A delivery that is not tracked by any queue, for listener tests.
    pub fn detached(body: Body) -> Self {
        Self {
            message: MemoryMessage {
                id: "detached".to_string(),
                body,
                attempt: 1,
            },
            queue: MemoryQueue::new(1),
        }
    }
}

impl InboundMessage for MemoryDelivery {
    fn id(&self) -> String {
        self.message.id.clone()
    }

    fn body(&self) -> Result<MessageBody<'_>, SourceError> {
        Ok(match &self.message.body {
            Body::Text(text) => MessageBody::Text(text),
            Body::Binary(bytes) => MessageBody::Binary(bytes),
        })
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    async fn ack(self) -> Result<(), SourceError> {
        let mut state = self.queue.state.lock().expect("poisoned");
        state.acked.push(self.message.id);
        Ok(())
    }

    async fn reject(self, reason: &str) -> Result<(), SourceError> {
        let mut state = self.queue.state.lock().expect("poisoned");
        state
            .rejected
            .push((self.message.id.clone(), reason.to_string()));
        if self.message.attempt >= self.queue.max_attempts {
            state.dead_lettered.push(self.message.id);
        } else {
            state.pending.push_back(self.message);
        }
        Ok(())
    }
}

/// Keeps every published message, reports an adjustable partition count.
pub struct RecordingSink {
    partitions: Mutex<u32>,
    published: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSink {
    pub fn new(partitions: u32) -> Arc<Self> {
        Arc::new(Self {
            partitions: Mutex::new(partitions),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn set_partitions(&self, partitions: u32) {
        *self.partitions.lock().expect("poisoned") = partitions;
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl PublishSink for RecordingSink {
    fn topic(&self) -> &str {
        "recording"
    }

    async fn partition_count(&self) -> Result<NonZeroU32, SinkError> {
        NonZeroU32::new(*self.partitions.lock().expect("poisoned"))
            .ok_or_else(|| SinkError::UnknownTopic("recording".to_string()))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), SinkError> {
        self.published.lock().expect("poisoned").push(message);
        Ok(())
    }
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
