//! Container lifecycle events and the worker that reacts to them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vessel_common::{ContainerId, VesselError, VesselResult};

use crate::context::Context;
use crate::exec::{ContainerRegistry, PowerState};

/// Lifecycle transitions reported by the infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Container powered on.
    PoweredOn,
    /// Container powered off.
    PoweredOff,
    /// Container removed.
    Removed,
}

/// A lifecycle event for one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// Container the event is about.
    pub id: ContainerId,
    /// What happened.
    pub kind: EventKind,
    /// Unix timestamp, seconds.
    pub timestamp: i64,
}

impl ContainerEvent {
    /// An event stamped with the current time.
    #[must_use]
    pub fn new(id: ContainerId, kind: EventKind) -> Self {
        Self {
            id,
            kind,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Event bus for container lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ContainerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: ContainerEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// React to one event. Failures are logged, never returned.
pub async fn handle_event(ctx: &Context, registry: &dyn ContainerRegistry, event: &ContainerEvent) {
    tracing::debug!(container = %event.id, kind = ?event.kind, "Handling container event");

    if event.kind != EventKind::PoweredOff {
        return;
    }

    let Some(mut handle) = registry.get_container(&event.id).await else {
        if let Err(e) = ctx.remove_id_from_scopes(&event.id).await {
            tracing::error!(container = %event.id, error = %e, "Failed to remove container from scopes");
        }
        return;
    };

    if handle.runtime.power_state != PowerState::PoweredOff {
        tracing::warn!(
            container = %event.id,
            state = ?handle.runtime.power_state,
            "Container is not powered off, skipping unbind"
        );
        return;
    }

    if let Err(e) = ctx.unbind_container(&mut handle).await {
        tracing::warn!(container = %event.id, error = %e, "Failed to unbind container");
        return;
    }

    if let Err(e) = registry.commit(handle).await {
        tracing::warn!(container = %event.id, error = %e, "Failed to commit handle after unbind");
    }
}

/// Background worker applying lifecycle events to a context.
#[derive(Debug)]
pub struct EventWorker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EventWorker {
    /// Replay existing containers into `ctx`, then follow `bus`.
    ///
    /// The subscription is taken before the replay so events raised
    /// meanwhile are buffered and applied afterwards.
    ///
    /// # Errors
    ///
    /// Fails when the context has no registry or the replay fails; the
    /// subscription is dropped in that case.
    pub async fn engage(ctx: Arc<Context>, bus: &EventBus) -> VesselResult<Self> {
        let registry = ctx
            .registry()
            .cloned()
            .ok_or_else(|| VesselError::invalid_config("event handling requires a container registry"))?;

        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();

        let mut handles = registry.containers().await;
        if let Err(e) = ctx.replay(&cancel, &mut handles).await {
            tracing::error!(error = %e, "Failed to replay existing containers");
            return Err(e);
        }
        tracing::info!(containers = handles.len(), "Replayed existing containers");

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = rx.recv() => event,
                };

                match event {
                    Ok(event) => handle_event(&ctx, registry.as_ref(), &event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event worker lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Event worker stopped");
        });

        Ok(Self { cancel, task })
    }

    /// Stop the worker and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Event worker task failed");
        }
    }
}
