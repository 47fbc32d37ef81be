//! Cluster runner: the live streaming topology of one broker partition.
//!
//! The runner subscribes to every input topic of its cluster and pushes each
//! record through the transformation chain described by the cluster's flows,
//! publishing to every output it reaches. Outputs on the cluster's own broker
//! use the local client; outputs elsewhere go through a cached foreign client
//! per target broker. Both paths encode with [`encode_record`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use flowgate_broker::{decode_record, encode_record, BrokerClient, BrokerConnector, Record};
use flowgate_types::event::stream as stream_event;
use flowgate_types::{Event, FlowgateError, NodeRef, PipelineId, Result};

use crate::compiler::Cluster;
use crate::emitter::EventEmitter;
use crate::loader::{ScriptedStep, TransformationLoader};

/// Where an output publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Local { topic: String },
    Bridge { broker: String, topic: String },
}

impl Sink {
    pub fn topic(&self) -> &str {
        match self {
            Sink::Local { topic } | Sink::Bridge { topic, .. } => topic,
        }
    }
}

/// Materialised routing for one cluster.
#[derive(Default)]
pub struct Topology {
    children: HashMap<NodeRef, Vec<NodeRef>>,
    steps: HashMap<i64, Arc<dyn ScriptedStep>>,
    sinks: HashMap<i64, Sink>,
}

impl Topology {
    /// Build from the cluster's flows. A flow is wired only once its start
    /// node is live, and never when it would close a loop.
    pub fn build(cluster: &Cluster, loader: &TransformationLoader) -> Self {
        let mut topology = Topology::default();
        let mut live: HashSet<NodeRef> = cluster.inputs.iter().map(|i| NodeRef::Input(i.id)).collect();

        for flow in &cluster.flows {
            let (start, end) = flow.key();
            if !live.contains(&start) {
                tracing::debug!(flow = %flow, "Skipping flow whose start is not wired");
                continue;
            }
            if topology.reaches(end, start) {
                tracing::warn!(flow = %flow, "Skipping flow that would create a loop");
                continue;
            }
            match end {
                NodeRef::Transformation(id) => {
                    let Some(node) = cluster.transformation(id) else {
                        tracing::warn!(flow = %flow, "Skipping flow to unknown transformation");
                        continue;
                    };
                    topology
                        .steps
                        .entry(id)
                        .or_insert_with(|| loader.load(&node.source_text));
                }
                NodeRef::Output(id) => {
                    let Some(node) = cluster.output(id) else {
                        tracing::warn!(flow = %flow, "Skipping flow to unknown output");
                        continue;
                    };
                    let sink = if node.broker_address == cluster.broker {
                        Sink::Local {
                            topic: node.topic.clone(),
                        }
                    } else {
                        Sink::Bridge {
                            broker: node.broker_address.clone(),
                            topic: node.topic.clone(),
                        }
                    };
                    topology.sinks.insert(id, sink);
                }
                NodeRef::Input(_) => {
                    tracing::warn!(flow = %flow, "Skipping flow into an input");
                    continue;
                }
            }
            topology.children.entry(start).or_default().push(end);
            live.insert(end);
        }
        topology
    }

    fn reaches(&self, from: NodeRef, to: NodeRef) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if seen.insert(node) {
                stack.extend(self.children.get(&node).into_iter().flatten().copied());
            }
        }
        false
    }

    pub fn sink(&self, output_id: i64) -> Option<&Sink> {
        self.sinks.get(&output_id)
    }

    pub fn children(&self, node: NodeRef) -> &[NodeRef] {
        self.children.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }
}

type Tagged = (NodeRef, String, Result<Record>);

/// Executes one [`Cluster`] until cancelled or its inputs are exhausted.
pub struct ClusterRunner {
    pipeline_id: PipelineId,
    cluster: Cluster,
    connector: Arc<dyn BrokerConnector>,
    loader: TransformationLoader,
    emitter: EventEmitter,
    emit_stream_events: bool,
}

impl ClusterRunner {
    pub fn new(
        pipeline_id: PipelineId,
        cluster: Cluster,
        connector: Arc<dyn BrokerConnector>,
        loader: TransformationLoader,
    ) -> Self {
        Self {
            pipeline_id,
            cluster,
            connector,
            loader,
            emitter: EventEmitter::disabled(),
            emit_stream_events: false,
        }
    }

    /// Publish per-record `stream` events through `emitter`.
    pub fn with_events(mut self, emitter: EventEmitter, emit_stream_events: bool) -> Self {
        self.emitter = emitter;
        self.emit_stream_events = emit_stream_events;
        self
    }

    fn fault(&self, message: impl Into<String>) -> FlowgateError {
        FlowgateError::RuntimeFault {
            segment: self.cluster.index,
            message: message.into(),
        }
    }

    fn emit_stream(&self, kind: &str, topic: &str, data: &serde_json::Value) {
        if self.emit_stream_events {
            self.emitter.emit(Event::stream(
                self.pipeline_id,
                self.cluster.index,
                kind,
                topic,
                data.clone(),
            ));
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let local = self.connector.connect(&self.cluster.broker).await?;
        let topology = Topology::build(&self.cluster, &self.loader);
        let mut bridges: HashMap<String, Arc<dyn BrokerClient>> = HashMap::new();

        let mut subscriptions: Vec<BoxStream<'static, Tagged>> = Vec::new();
        for input in &self.cluster.inputs {
            let sub = local
                .subscribe(&input.topic, &self.cluster.consumer_group)
                .await?;
            let node = NodeRef::Input(input.id);
            let topic = input.topic.clone();
            subscriptions.push(sub.map(move |item| (node, topic.clone(), item)).boxed());
        }
        let mut merged = stream::select_all(subscriptions);

        tracing::info!(
            pipeline_id = self.pipeline_id,
            segment = self.cluster.index,
            broker = %self.cluster.broker,
            inputs = self.cluster.inputs.len(),
            "Cluster runner started"
        );

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = merged.next() => match next {
                    None => break Ok(()),
                    Some((node, topic, Ok(record))) => {
                        if let Err(e) = self
                            .handle(&topology, local.as_ref(), &mut bridges, node, &topic, record)
                            .await
                        {
                            break Err(e);
                        }
                    }
                    Some((_, topic, Err(e))) => {
                        break Err(self.fault(format!("subscription to '{topic}' failed: {e}")));
                    }
                },
            }
        };

        if let Err(e) = local.flush().await {
            tracing::warn!(error = %e, "Local flush failed");
        }
        for client in bridges.values() {
            if let Err(e) = client.flush().await {
                tracing::warn!(broker = %client.address(), error = %e, "Bridge flush failed");
            }
        }
        tracing::info!(
            pipeline_id = self.pipeline_id,
            segment = self.cluster.index,
            ok = outcome.is_ok(),
            "Cluster runner stopped"
        );
        outcome
    }

    async fn handle(
        &self,
        topology: &Topology,
        local: &dyn BrokerClient,
        bridges: &mut HashMap<String, Arc<dyn BrokerClient>>,
        input: NodeRef,
        topic: &str,
        record: Record,
    ) -> Result<()> {
        let value = decode_record(&record.payload)
            .map_err(|e| self.fault(format!("undecodable record on '{topic}': {e}")))?;
        self.emit_stream(stream_event::INPUT, topic, &value);

        let mut pending = vec![(input, value)];
        while let Some((node, value)) = pending.pop() {
            // Reversed so siblings are visited in flow order.
            for &child in topology.children(node).iter().rev() {
                match child {
                    NodeRef::Transformation(id) => {
                        let Some(step) = topology.steps.get(&id) else {
                            continue;
                        };
                        match step.apply(value.clone()) {
                            Ok(Some(next)) => pending.push((child, next)),
                            Ok(None) => {}
                            Err(e) => return Err(self.fault(format!("{child} raised: {e}"))),
                        }
                    }
                    NodeRef::Output(id) => {
                        if let Some(sink) = topology.sink(id) {
                            self.publish(local, bridges, sink, &value).await?;
                        }
                    }
                    NodeRef::Input(_) => {}
                }
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        local: &dyn BrokerClient,
        bridges: &mut HashMap<String, Arc<dyn BrokerClient>>,
        sink: &Sink,
        value: &serde_json::Value,
    ) -> Result<()> {
        let record = Record::new(encode_record(value)?);
        let sent = match sink {
            Sink::Local { topic } => local.publish(topic, record).await,
            Sink::Bridge { broker, topic } => {
                let client = match bridges.get(broker) {
                    Some(client) => client.clone(),
                    None => {
                        let client = self.connector.connect(broker).await.map_err(|e| {
                            self.fault(format!("cannot open bridge to {broker}: {e}"))
                        })?;
                        tracing::info!(segment = self.cluster.index, %broker, "Bridge producer created");
                        bridges.insert(broker.clone(), client.clone());
                        client
                    }
                };
                client.publish(topic, record).await
            }
        };
        sent.map_err(|e| self.fault(format!("publish to '{}' failed: {e}", sink.topic())))?;
        self.emit_stream(stream_event::OUTPUT, sink.topic(), value);
        Ok(())
    }
}
