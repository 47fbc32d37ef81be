//! Opaque publish/subscribe topic abstraction used by cluster runners.
//!
//! The broker's own wire protocol is out of scope: a [`BrokerClient`] only
//! knows how to subscribe to a topic and publish a [`Record`] to one. Clients
//! are obtained through a [`BrokerConnector`], which lets the runner create
//! both its local client and the foreign clients used for cross-broker
//! bridging.
//!
//! - [`memory`]: in-process broker with retained topic logs
//! - `kafka`: Kafka backend, behind the `kafka` cargo feature
//! - [`codec`]: the JSON record codec shared by local and bridged publishing
//! - [`probe`]: bounded-timeout TCP reachability probe

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use flowgate_types::Result;

pub mod codec;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod probe;

pub use codec::{decode_record, encode_record};
pub use memory::{MemoryBroker, MemoryHub};
pub use probe::{BrokerProbe, TcpProbe};

/// One message on a topic: optional key plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { key: None, payload }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }
}

/// Stream of records delivered to one subscriber. Ends when the client stops.
pub type Subscription = BoxStream<'static, Result<Record>>;

/// A connected handle to one broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Address this client is bound to.
    fn address(&self) -> &str;

    /// Subscribe to `topic` as a member of consumer `group`, reading from the earliest offset.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription>;

    /// Publish one record to `topic`.
    async fn publish(&self, topic: &str, record: Record) -> Result<()>;

    /// Wait until all published records have been handed to the broker.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates [`BrokerClient`]s for broker addresses.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerClient>>;
}
