//! Point-to-point queue side of the relay.
//!
//! A [`MessageSource`] hands out one [`Delivery`] at a time. A delivery stays
//! invisible to other consumers until it is settled or the transport gives up
//! waiting. `ack` removes it for good. `reject` hands it back to the transport,
//! which redelivers it later or dead-letters it once it runs out of attempts.
//! A delivery that is never settled is redelivered as well.
use async_trait::async_trait;
use thiserror::Error;

pub mod pgqueue;
pub mod retry;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to connect to queue: {0}")]
    ConnectionError(#[source] sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("message {id} declares a text body that is not valid UTF-8")]
    InvalidText { id: String },
    #[error("message {id} has unsupported message type '{kind}'")]
    UnsupportedMessageType { id: String, kind: String },
    #[error("lease on attempt {attempt} of message {id} expired before it was settled")]
    LeaseExpired { id: String, attempt: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl MessageBody<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Text(_) => "text",
            MessageBody::Binary(_) => "binary",
        }
    }
}

/// Envelope as handed over by the source transport.
pub trait InboundMessage {
    /// Transport identifier, for diagnostics only.
    fn id(&self) -> String;

    /// Reading the body may fail at the transport level, which is fatal for
    /// the message.
    fn body(&self) -> Result<MessageBody<'_>, SourceError>;
}

#[async_trait]
pub trait Delivery: InboundMessage + Send + Sync + 'static {
    /// Marks the message as handled. Only called once it was relayed.
    async fn ack(self) -> Result<(), SourceError>;

    /// Returns the message to the transport's redelivery policy.
    async fn reject(self, reason: &str) -> Result<(), SourceError>;
}

#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Takes the next available message, `None` if the queue is empty.
    async fn receive(&self) -> Result<Option<Self::Delivery>, SourceError>;
}
