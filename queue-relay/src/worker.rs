use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use thiserror::Error;
use tokio::sync::{watch, AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::listener::{RelayError, RelayListener};
use crate::source::retry::RetryPolicy;
use crate::source::{Delivery, InboundMessage, MessageSource};

pub const RECEIVE_ERRORS: &str = "relay_source_receive_errors_total";
pub const MESSAGES_REJECTED: &str = "relay_messages_rejected_total";
pub const SETTLE_ERRORS: &str = "relay_settle_errors_total";
pub const WORKER_SATURATION: &str = "relay_worker_saturation_percent";

/// Upper bound on the pause between failed receives.
pub const MAX_RECEIVE_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker concurrency limiter was closed")]
    SemaphoreClosed(#[from] AcquireError),
}

/// Polls a [`MessageSource`] and relays every delivery on its own task.
pub struct RelayWorker<S: MessageSource> {
    /// Identifier used in logs.
    name: String,
    source: Arc<S>,
    listener: RelayListener,
    /// The interval for polling the source when it is empty.
    poll_interval: Duration,
    /// Pause after consecutive receive failures, starting at `poll_interval`.
    receive_backoff: RetryPolicy,
    /// Maximum number of messages being relayed at once.
    max_concurrent_messages: usize,
    /// Reported on every poll tick.
    liveness: HealthHandle,
}

impl<S: MessageSource> RelayWorker<S> {
    pub fn new(
        name: &str,
        source: Arc<S>,
        listener: RelayListener,
        poll_interval: Duration,
        max_concurrent_messages: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            source,
            listener,
            poll_interval,
            receive_backoff: RetryPolicy::new(2, poll_interval, Some(MAX_RECEIVE_BACKOFF)),
            max_concurrent_messages: max_concurrent_messages.max(1),
            liveness,
        }
    }

    /// Wait until a message becomes available in the source, or `None` once
    /// shutdown is requested. Only the pauses between polls are interrupted, a
    /// receive in flight always completes so its message is not stranded.
    async fn wait_for_message(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<S::Delivery> {
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.changed() => return None,
            }
            self.liveness.report_healthy().await;

            match self.source.receive().await {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let backoff = self.receive_backoff.time_until_next_retry(failures);
                    metrics::counter!(RECEIVE_ERRORS).increment(1);
                    error!(
                        worker = %self.name,
                        failures,
                        "failed to receive message, retrying in {backoff:?}: {e}"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {},
                        _ = shutdown.changed() => return None,
                    }
                    interval.reset();
                }
            }
        }
    }

    /// Relays messages until `shutdown` flips to true or its sender is dropped,
    /// then waits for in-flight messages to settle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_messages));
        let report_semaphore_utilization = || {
            metrics::gauge!(WORKER_SATURATION).set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_messages as f64,
            );
        };

        info!(worker = %self.name, "relay worker started");
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            report_semaphore_utilization();

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => permit?,
            };

            let Some(delivery) = self.wait_for_message(&mut shutdown).await else {
                break;
            };

            spawn_relay_task(self.listener.clone(), permit, delivery);
        }

        info!(
            worker = %self.name,
            "shutting down, waiting for in-flight messages"
        );
        let all_permits = u32::try_from(self.max_concurrent_messages).unwrap_or(u32::MAX);
        drop(semaphore.acquire_many(all_permits).await?);
        report_semaphore_utilization();
        info!(worker = %self.name, "relay worker stopped");

        Ok(())
    }
}

fn spawn_relay_task<D: Delivery>(
    listener: RelayListener,
    permit: OwnedSemaphorePermit,
    delivery: D,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        process_delivery(&listener, delivery).await;
        drop(permit);
    })
}

/// Relays one delivery and settles it: acknowledged once published, rejected
/// back to the source on any fatal error.
pub async fn process_delivery<D: Delivery>(listener: &RelayListener, delivery: D) {
    let id = delivery.id();

    match listener.on_message(&delivery).await {
        Ok(_) => {
            if let Err(e) = delivery.ack().await {
                // The message was published, a redelivery will duplicate it
                metrics::counter!(SETTLE_ERRORS, "action" => "ack").increment(1);
                error!(id = %id, "failed to acknowledge relayed message: {e}");
            }
        }
        Err(relay_error) => {
            let reason = match &relay_error {
                RelayError::NotTextual { .. } => "not_textual",
                RelayError::Source(_) => "source",
                RelayError::Publish(_) => "publish",
            };
            metrics::counter!(MESSAGES_REJECTED, "reason" => reason).increment(1);
            warn!(id = %id, "rejecting message: {relay_error}");

            if let Err(e) = delivery.reject(&relay_error.to_string()).await {
                metrics::counter!(SETTLE_ERRORS, "action" => "reject").increment(1);
                error!(id = %id, "failed to reject message: {e}");
            }
        }
    }
}
