//! Kafka backend built on `rdkafka`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use flowgate_types::{FlowgateError, Result};

use crate::{BrokerClient, BrokerConnector, Record, Subscription};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

fn transport(address: &str, err: impl std::fmt::Display) -> FlowgateError {
    FlowgateError::Transport {
        address: address.to_string(),
        message: err.to_string(),
    }
}

/// Connects to Kafka clusters by bootstrap address.
#[derive(Debug, Clone, Default)]
pub struct KafkaConnector;

#[async_trait]
impl BrokerConnector for KafkaConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerClient>> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", address)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| transport(address, e))?;
        Ok(Arc::new(KafkaClient {
            address: address.to_string(),
            producer,
        }))
    }
}

pub struct KafkaClient {
    address: String,
    producer: FutureProducer,
}

#[async_trait]
impl BrokerClient for KafkaClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.address)
            .set("group.id", group)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| transport(&self.address, e))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| transport(&self.address, e))?;

        let address = self.address.clone();
        let stream = futures::stream::unfold(
            (Arc::new(consumer), address),
            |(consumer, address)| async move {
                let item = match consumer.recv().await {
                    Ok(msg) => Ok(Record {
                        key: msg.key().map(<[u8]>::to_vec),
                        payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    }),
                    Err(e) => Err(transport(&address, e)),
                };
                Some((item, (consumer, address)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn publish(&self, topic: &str, record: Record) -> Result<()> {
        let mut out = FutureRecord::<[u8], [u8]>::to(topic).payload(&record.payload);
        if let Some(key) = record.key.as_deref() {
            out = out.key(key);
        }
        self.producer
            .send(out, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| transport(&self.address, e))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(SEND_TIMEOUT))
            .map_err(|e| transport(&self.address, e))
    }
}
