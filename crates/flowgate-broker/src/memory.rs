//! In-process broker.
//!
//! Every topic keeps its full log, and each subscription reads it from the
//! beginning, which matches an `earliest` offset reset for a fresh consumer
//! group. Consumer groups are otherwise not modelled: two subscribers to the
//! same topic both see every record.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use flowgate_types::{FlowgateError, Result};

use crate::{BrokerClient, BrokerConnector, Record, Subscription};

// ---------------------------------------------------------------------------
// TopicLog
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TopicLog {
    records: Mutex<Vec<Record>>,
    notify: Notify,
}

impl TopicLog {
    fn get(&self, offset: usize) -> Option<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(offset)
            .cloned()
    }

    fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn append(&self, record: Record) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// One in-memory broker endpoint, holding named topics.
pub struct MemoryBroker {
    address: String,
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
}

impl MemoryBroker {
    fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Append a record directly, bypassing any client.
    pub fn produce(&self, topic: &str, record: Record) {
        self.topic(topic).append(record);
    }

    /// Snapshot of every record published to `topic` so far.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.topic(topic)
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until `topic` holds at least `count` records or `timeout` elapses,
    /// then return whatever it holds.
    pub async fn wait_for_records(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<Record> {
        let log = self.topic(topic);
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = log.notify.notified();
                if log.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.records(topic)
    }

    fn subscription(&self, topic: &str) -> Subscription {
        let log = self.topic(topic);
        let stream = futures::stream::unfold((log, 0usize), |(log, offset)| async move {
            loop {
                let notified = log.notify.notified();
                if let Some(record) = log.get(offset) {
                    drop(notified);
                    return Some((Ok(record), (log, offset + 1)));
                }
                notified.await;
            }
        });
        Box::pin(stream)
    }
}

// ---------------------------------------------------------------------------
// MemoryHub: connector over a set of in-memory brokers
// ---------------------------------------------------------------------------

/// Registry of in-memory brokers keyed by address. Cloning shares the brokers.
#[derive(Clone, Default)]
pub struct MemoryHub {
    brokers: Arc<Mutex<HashMap<String, Arc<MemoryBroker>>>>,
    down: Arc<Mutex<HashSet<String>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker at `address`, created on first use.
    pub fn broker(&self, address: &str) -> Arc<MemoryBroker> {
        self.brokers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MemoryBroker::new(address)))
            .clone()
    }

    /// Mark a broker unreachable: new connections and publishes to it fail.
    pub fn set_down(&self, address: &str, down: bool) {
        let mut set = self.down.lock().unwrap_or_else(PoisonError::into_inner);
        if down {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    fn is_down(&self, address: &str) -> bool {
        self.down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(address)
    }
}

#[async_trait]
impl BrokerConnector for MemoryHub {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerClient>> {
        if self.is_down(address) {
            return Err(FlowgateError::Transport {
                address: address.to_string(),
                message: "broker is down".into(),
            });
        }
        Ok(Arc::new(MemoryClient {
            hub: self.clone(),
            broker: self.broker(address),
        }))
    }
}

struct MemoryClient {
    hub: MemoryHub,
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl BrokerClient for MemoryClient {
    fn address(&self) -> &str {
        self.broker.address()
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription> {
        tracing::debug!(broker = %self.broker.address(), topic, group, "Memory subscription opened");
        Ok(self.broker.subscription(topic))
    }

    async fn publish(&self, topic: &str, record: Record) -> Result<()> {
        if self.hub.is_down(self.broker.address()) {
            return Err(FlowgateError::Transport {
                address: self.broker.address().to_string(),
                message: "broker is down".into(),
            });
        }
        self.broker.produce(topic, record);
        Ok(())
    }
}
