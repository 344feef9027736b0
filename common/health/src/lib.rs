use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness tracking for the long-running loops of a relay process.
///
/// Every loop that must keep running for the process to be trusted (queue
/// workers, the Kafka producer's callback thread) registers itself as a
/// component with a reporting deadline. The registry is healthy when every
/// registered component has reported healthy within its deadline. A
/// component that misses its deadline is reported as `Stalled`.
///
/// An empty registry is unhealthy: nothing has proven it is running yet.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Healthy as long as it reports again before this instant
    HealthyUntil(time::OffsetDateTime),
    /// Explicitly reported as broken
    Unhealthy,
    /// Missed its reporting deadline
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > time::OffsetDateTime::now_utc())
    }
}

struct StatusUpdate {
    component: String,
    status: ComponentStatus,
}

/// Reporting side of a registered component. Cheap to clone, one per loop.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthHandle {
    /// Must be called more often than the deadline given at registration.
    pub async fn report_healthy(&self) {
        self.report_status(self.healthy_until()).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let update = StatusUpdate {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(update).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    /// Variant for callers outside of the async runtime, like librdkafka callbacks.
    pub fn report_healthy_blocking(&self) {
        let status = self.healthy_until();
        if let Ok(handle) = runtime::Handle::try_current() {
            let this = self.clone();
            handle.spawn(async move { this.report_status(status).await });
            return;
        }

        let update = StatusUpdate {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.blocking_send(update) {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    fn healthy_until(&self) -> ComponentStatus {
        ComponentStatus::HealthyUntil(time::OffsetDateTime::now_utc().add(self.deadline))
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime: status updates are applied
    /// by a background task.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<StatusUpdate>(64);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let shared = components.clone();
        tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                match shared.write() {
                    Ok(mut map) => {
                        _ = map.insert(update.component, update.status);
                    }
                    // Probes will keep failing and the process gets restarted
                    Err(_) => warn!("health registry lock is poisoned"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    /// Registers a component, initially `Starting`. The returned handle is
    /// moved into the component so it can report on its own schedule.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Current process status. Usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health registry lock is poisoned", self.name);
            return HealthStatus::default();
        };

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let reported = match component {
                ComponentStatus::HealthyUntil(_) if component.is_healthy() => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !reported.is_healthy() {
                status.healthy = false;
            }
            status.components.insert(name.clone(), reported);
        }

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
