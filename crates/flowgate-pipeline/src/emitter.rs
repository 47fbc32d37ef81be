//! Worker-side event emitter.
//!
//! [`EventEmitter::emit`] never blocks and never fails: events go into a
//! bounded queue that a background task drains into an [`EventSink`]. When
//! the queue is full the oldest event is dropped. Delivery errors are logged
//! and forgotten.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use flowgate_types::{Event, FlowgateError, Result};

/// Default timeout for a single HTTP event delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(300);

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<()>;
}

/// Posts events as JSON to the supervisor's ingestion endpoint.
pub struct HttpEventSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEventSink {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| FlowgateError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn deliver(&self, event: &Event) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| FlowgateError::Other(format!("event delivery to {} failed: {e}", self.endpoint)))?;
        Ok(())
    }
}

struct Inner {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Inner {
    fn pop(&self) -> Option<Event> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Cheaply clonable handle to a bounded, drop-oldest event queue.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Option<Arc<Inner>>,
    drain: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventEmitter {
    /// Start an emitter whose drain task delivers into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let task = tokio::spawn(drain(inner.clone(), sink));
        Self {
            inner: Some(inner),
            drain: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// An emitter that discards every event.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            drain: Arc::new(Mutex::new(None)),
        }
    }

    pub fn emit(&self, event: Event) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= inner.capacity {
                queue.pop_front();
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        inner.notify.notify_one();
    }

    /// Number of events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.dropped.load(Ordering::Relaxed))
    }

    /// Stop accepting events and wait up to `timeout` for the queue to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.closed.store(true, Ordering::Release);
        inner.notify.notify_one();

        let task = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                tracing::debug!("Event queue not drained before shutdown timeout");
                task.abort();
            }
        }
    }
}

async fn drain(inner: Arc<Inner>, sink: Arc<dyn EventSink>) {
    loop {
        match inner.pop() {
            Some(event) => {
                if let Err(e) = sink.deliver(&event).await {
                    tracing::debug!(error = %e, kind = %event.kind, "Event dropped");
                }
            }
            None if inner.closed.load(Ordering::Acquire) => break,
            None => inner.notify.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_types::event::lifecycle;
    use serde_json::json;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventSink for Collect {
        async fn deliver(&self, event: &Event) -> Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSink for Failing {
        async fn deliver(&self, _event: &Event) -> Result<()> {
            Err(FlowgateError::Other("unreachable endpoint".into()))
        }
    }

    /// Blocks every delivery until released, so the queue fills up.
    struct Gate(Notify, Collect);

    #[async_trait]
    impl EventSink for Gate {
        async fn deliver(&self, event: &Event) -> Result<()> {
            self.0.notified().await;
            self.1.deliver(event).await
        }
    }

    fn event(n: usize) -> Event {
        Event::lifecycle(1, Some(n), lifecycle::SEGMENT_STARTED, json!(n))
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let sink = Arc::new(Collect::default());
        let emitter = EventEmitter::spawn(sink.clone(), 16);
        for n in 0..5 {
            emitter.emit(event(n));
        }
        emitter.shutdown(Duration::from_secs(2)).await;

        let got: Vec<_> = sink.0.lock().unwrap().iter().map(|e| e.segment_index).collect();
        assert_eq!(got, (0..5).map(Some).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let sink = Arc::new(Gate(Notify::new(), Collect::default()));
        let emitter = EventEmitter::spawn(sink.clone(), 2);
        emitter.emit(event(0));
        // Let the drain task take event 0 and block on the gate.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for n in 1..=4 {
            emitter.emit(event(n));
        }
        assert_eq!(emitter.dropped(), 2);

        for _ in 0..3 {
            sink.0.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        emitter.shutdown(Duration::from_secs(1)).await;

        let got: Vec<_> = sink.1 .0.lock().unwrap().iter().map(|e| e.segment_index).collect();
        assert_eq!(got, vec![Some(0), Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let emitter = EventEmitter::spawn(Arc::new(Failing), 4);
        emitter.emit(event(0));
        emitter.emit(event(1));
        emitter.shutdown(Duration::from_secs(1)).await;
        // Emitting after shutdown is a silent no-op.
        emitter.emit(event(2));
    }

    #[tokio::test]
    async fn disabled_emitter_discards() {
        let emitter = EventEmitter::disabled();
        emitter.emit(event(0));
        assert_eq!(emitter.dropped(), 0);
        emitter.shutdown(Duration::from_millis(10)).await;
    }
}
