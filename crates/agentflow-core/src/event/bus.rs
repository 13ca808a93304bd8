//! Broadcast bus for execution lifecycle events.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, so the executor never blocks on slow listeners. A lagging
//! subscriber loses the oldest events, never the newest.

use agentflow_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Multi-producer, multi-consumer bus. Clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Mirror every event into the `tracing` log at debug level until
    /// `cancel` fires.
    pub fn spawn_logger(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => log_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event logger lagged behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

fn log_event(event: &WorkflowEvent) {
    let execution_id = event.execution_id();
    match event {
        WorkflowEvent::StepStarted { step_id, step_type, .. } => {
            tracing::debug!(%execution_id, step_id = step_id.as_str(), step_type = step_type.as_str(), "event: step started");
        }
        WorkflowEvent::StepCompleted { step_id, duration_ms, .. } => {
            tracing::debug!(%execution_id, step_id = step_id.as_str(), duration_ms, "event: step completed");
        }
        WorkflowEvent::StepFailed { step_id, error, .. } => {
            tracing::debug!(%execution_id, step_id = step_id.as_str(), error = error.as_str(), "event: step failed");
        }
        WorkflowEvent::ApprovalRequested { approval_id, step_id, approvers, .. } => {
            tracing::debug!(%execution_id, %approval_id, step_id = step_id.as_str(), approvers = approvers.len(), "event: approval requested");
        }
        WorkflowEvent::ApprovalResolved { approval_id, status, .. } => {
            tracing::debug!(%execution_id, %approval_id, %status, "event: approval resolved");
        }
        other => {
            tracing::debug!(%execution_id, event = ?other, "event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn started() -> WorkflowEvent {
        WorkflowEvent::ExecutionStarted {
            execution_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();

        bus.publish(started());

        assert!(matches!(rx1.recv().await.unwrap(), WorkflowEvent::ExecutionStarted { .. }));
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.publish(started());
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_lagging_subscriber_keeps_newest() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        for _ in 0..10 {
            bus.publish(started());
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert_eq!(n, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        let mut remaining = 0;
        while rx.try_recv().is_ok() {
            remaining += 1;
        }
        assert_eq!(remaining, 4);
    }

    #[tokio::test]
    async fn test_logger_stops_on_cancel() {
        let bus = EventBus::new(16);
        let cancel = CancellationToken::new();
        let handle = bus.spawn_logger(cancel.clone());
        assert_eq!(bus.receiver_count(), 1);

        bus.publish(started());
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(bus.receiver_count(), 0);
    }
}
