//! Event bus: ingests worker events, applies lifecycle transitions, and fans
//! every accepted event out to connected observers.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use flowgate_types::event::lifecycle;
use flowgate_types::{Event, EventCategory};

use crate::registry::LifecycleRegistry;

/// Outcome of [`EventBus::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    Ignored,
}

#[derive(Clone)]
pub struct EventBus {
    registry: Arc<LifecycleRegistry>,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(registry: Arc<LifecycleRegistry>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { registry, tx }
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        &self.registry
    }

    /// Accept an event from a worker or from the supervisor itself.
    ///
    /// Lifecycle events drive the registry. The event is then broadcast
    /// verbatim; a completion that finishes the run is followed by a single
    /// `completed` event.
    pub fn ingest(&self, event: Event) -> Ingest {
        match event.category {
            EventCategory::Unknown => {
                tracing::debug!(run_id = event.run_id, kind = %event.kind, "Ignoring event with unknown category");
                return Ingest::Ignored;
            }
            EventCategory::Stream => {
                self.publish(event);
                return Ingest::Accepted;
            }
            EventCategory::Lifecycle => {}
        }

        let run_id = event.run_id;
        let mut completed = false;
        match event.kind.as_str() {
            lifecycle::SEGMENT_STARTED => {
                if self.registry.mark_running(run_id) {
                    tracing::info!(pipeline_id = run_id, "Pipeline running");
                }
            }
            lifecycle::SEGMENT_COMPLETED => {
                completed = self.registry.segment_completed(run_id);
            }
            lifecycle::FAILED => {
                let message = event.message();
                if self.registry.fail(run_id, message.clone()) {
                    tracing::error!(pipeline_id = run_id, segment = ?event.segment_index, %message, "Pipeline failed");
                }
            }
            lifecycle::ABORTED => {
                self.registry.abort(run_id);
            }
            other => {
                tracing::debug!(pipeline_id = run_id, kind = other, "Lifecycle event without transition");
            }
        }

        self.publish(event);
        if completed {
            tracing::info!(pipeline_id = run_id, "Pipeline completed");
            self.publish(Event::lifecycle(
                run_id,
                None,
                lifecycle::COMPLETED,
                json!({"message": "Pipeline completed"}),
            ));
        }
        Ingest::Accepted
    }

    /// Broadcast without touching the registry.
    pub fn publish(&self, event: Event) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Observer {
        Observer {
            rx: self.tx.subscribe(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One connected observer.
pub struct Observer {
    rx: broadcast::Receiver<Event>,
}

impl Observer {
    /// Next event, or `None` once the observer fell behind or the bus closed.
    ///
    /// An observer that lags is disconnected rather than skipped ahead, so it
    /// never sees a gap in what it was sent.
    pub async fn next(&mut self) -> Option<Event> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Observer lagged behind and was disconnected");
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_types::RunStatus;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(LifecycleRegistry::new()), 16)
    }

    fn lc(kind: &str, data: serde_json::Value) -> Event {
        Event::lifecycle(1, Some(0), kind, data)
    }

    #[tokio::test]
    async fn events_fan_out_in_order() {
        let bus = bus();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.ingest(Event::stream(1, 0, "input", "x", json!({"v": 1})));
        bus.ingest(Event::stream(1, 0, "output", "y", json!({"v": 2})));

        for observer in [&mut a, &mut b] {
            assert_eq!(observer.next().await.unwrap().kind, "input");
            assert_eq!(observer.next().await.unwrap().kind, "output");
        }
    }

    #[tokio::test]
    async fn unknown_category_is_ignored() {
        let bus = bus();
        let mut obs = bus.subscribe();
        let event: Event = serde_json::from_value(json!({
            "run_id": 1, "category": "telemetry", "type": "cpu", "data": 3
        }))
        .unwrap();
        assert_eq!(bus.ingest(event), Ingest::Ignored);

        bus.publish(lc("marker", json!(null)));
        assert_eq!(obs.next().await.unwrap().kind, "marker");
    }

    #[tokio::test]
    async fn lifecycle_events_drive_registry() {
        let bus = bus();
        bus.registry().init(1, 2);
        let mut obs = bus.subscribe();

        bus.ingest(lc(lifecycle::SEGMENT_STARTED, json!({})));
        assert_eq!(bus.registry().get(1).unwrap().status, RunStatus::Running);

        bus.ingest(lc(lifecycle::SEGMENT_COMPLETED, json!({})));
        bus.ingest(lc(lifecycle::SEGMENT_COMPLETED, json!({})));
        bus.ingest(lc(lifecycle::SEGMENT_COMPLETED, json!({})));

        let mut kinds = Vec::new();
        for _ in 0..5 {
            kinds.push(obs.next().await.unwrap().kind);
        }
        assert_eq!(
            kinds,
            vec![
                "segment_started",
                "segment_completed",
                "segment_completed",
                "completed",
                "segment_completed",
            ]
        );
        assert_eq!(bus.registry().get(1).unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn failed_event_records_message() {
        let bus = bus();
        bus.registry().init(1, 1);
        bus.ingest(lc(lifecycle::FAILED, json!({"message": "Worker crashed at segment #1: boom"})));
        bus.ingest(lc(lifecycle::SEGMENT_COMPLETED, json!({})));

        let state = bus.registry().get(1).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.message, "Worker crashed at segment #1: boom");
    }

    #[tokio::test]
    async fn lagging_observer_is_disconnected_alone() {
        let bus = EventBus::new(Arc::new(LifecycleRegistry::new()), 2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for n in 0..3 {
            bus.publish(lc("tick", json!(n)));
            assert_eq!(fast.next().await.unwrap().data, json!(n));
        }
        assert!(slow.next().await.is_none());

        bus.publish(lc("tick", json!(3)));
        assert_eq!(fast.next().await.unwrap().data, json!(3));
    }
}
