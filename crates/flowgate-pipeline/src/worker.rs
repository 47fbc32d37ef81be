//! Worker process entry point.
//!
//! The supervisor spawns one worker per cluster (and optionally one synthetic
//! producer per input). Each receives its job as JSON in the
//! [`WORKER_SPEC_ENV`] environment variable.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use flowgate_broker::{encode_record, BrokerConnector, Record};
use flowgate_types::event::lifecycle;
use flowgate_types::{duration_serde, Event, FlowgateError, PipelineId, Result};

use crate::compiler::Cluster;
use crate::emitter::{EventEmitter, HttpEventSink};
use crate::loader::{TransformationLoader, DEFAULT_STEP_BUDGET};
use crate::runner::ClusterRunner;

/// Environment variable carrying the serialized [`WorkerSpec`].
pub const WORKER_SPEC_ENV: &str = "FLOWGATE_WORKER_SPEC";

const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Highest synthetic producer rate.
pub const MAX_PRODUCER_HZ: f64 = 1000.0;

fn default_true() -> bool {
    true
}

fn default_budget() -> Duration {
    DEFAULT_STEP_BUDGET
}

fn default_queue() -> usize {
    1024
}

/// Settings of a synthetic producer feeding one input topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerSpec {
    pub broker: String,
    pub topic: String,
    pub n_channels: usize,
    pub frequency_hz: f64,
    /// Stop after this many records; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u64>,
}

/// Period of a producer ticking at `frequency_hz`. `None` for non-finite,
/// non-positive, or above [`MAX_PRODUCER_HZ`] rates.
pub fn producer_period(frequency_hz: f64) -> Option<Duration> {
    if !(frequency_hz > 0.0 && frequency_hz <= MAX_PRODUCER_HZ) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / frequency_hz)
        .ok()
        .filter(|d| !d.is_zero())
}

/// Reject producer settings that cannot drive a ticker; returns the period.
pub fn check_producer(n_channels: usize, frequency_hz: f64) -> Result<Duration> {
    if n_channels == 0 {
        return Err(FlowgateError::Validation(
            "Producer needs at least one channel".into(),
        ));
    }
    producer_period(frequency_hz).ok_or_else(|| {
        FlowgateError::Validation(format!(
            "Producer frequency must be in (0, {MAX_PRODUCER_HZ}] Hz, got {frequency_hz}"
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum WorkerRole {
    Cluster { cluster: Cluster },
    Producer { producer: ProducerSpec },
}

/// Everything a worker process needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub pipeline_id: PipelineId,
    pub segment_index: usize,
    #[serde(flatten)]
    pub role: WorkerRole,
    #[serde(default)]
    pub event_endpoint: Option<String>,
    #[serde(default = "default_true")]
    pub emit_stream_events: bool,
    #[serde(default = "default_budget", with = "duration_serde")]
    pub step_budget: Duration,
    #[serde(default = "default_queue")]
    pub event_queue_capacity: usize,
}

impl WorkerSpec {
    pub fn cluster(pipeline_id: PipelineId, cluster: Cluster) -> Self {
        Self {
            pipeline_id,
            segment_index: cluster.index,
            role: WorkerRole::Cluster { cluster },
            event_endpoint: None,
            emit_stream_events: true,
            step_budget: DEFAULT_STEP_BUDGET,
            event_queue_capacity: default_queue(),
        }
    }

    pub fn producer(pipeline_id: PipelineId, segment_index: usize, producer: ProducerSpec) -> Self {
        Self {
            role: WorkerRole::Producer { producer },
            segment_index,
            ..Self::cluster(pipeline_id, Cluster::placeholder())
        }
    }

    pub fn is_producer(&self) -> bool {
        matches!(self.role, WorkerRole::Producer { .. })
    }

    /// Short human-readable role for process names and logs.
    pub fn label(&self) -> String {
        match &self.role {
            WorkerRole::Cluster { cluster } => format!("worker[{}@{}]", cluster.index, cluster.broker),
            WorkerRole::Producer { producer } => format!("producer[{}@{}]", producer.topic, producer.broker),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(WORKER_SPEC_ENV)
            .map_err(|_| FlowgateError::Config(format!("{WORKER_SPEC_ENV} is not set")))?;
        Self::from_json(&raw)
    }
}

impl Cluster {
    fn placeholder() -> Self {
        Cluster {
            index: 0,
            broker: String::new(),
            consumer_group: String::new(),
            inputs: vec![],
            flows: vec![],
            transformations: vec![],
            outputs: vec![],
        }
    }
}

/// Synthetic record for producer tick `tick`: `channel_k = tick * k`.
pub fn synthetic_record(tick: u64, n_channels: usize) -> Value {
    let map: Map<String, Value> = (1..=n_channels)
        .map(|k| (format!("channel_{k}"), json!(tick * k as u64)))
        .collect();
    Value::Object(map)
}

async fn run_producer(
    spec: &ProducerSpec,
    connector: Arc<dyn BrokerConnector>,
    cancel: CancellationToken,
) -> Result<()> {
    let period = check_producer(spec.n_channels, spec.frequency_hz)?;
    let client = connector.connect(&spec.broker).await?;
    let mut ticker = tokio::time::interval(period);
    let mut tick: u64 = 0;

    tracing::info!(topic = %spec.topic, broker = %spec.broker, ?period, "Producer started");
    loop {
        if spec.max_records.is_some_and(|max| tick >= max) {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let payload = encode_record(&synthetic_record(tick, spec.n_channels))?;
                client.publish(&spec.topic, Record::new(payload)).await?;
                tick += 1;
            }
        }
    }
    client.flush().await?;
    tracing::info!(topic = %spec.topic, records = tick, "Producer stopped");
    Ok(())
}

/// Run a worker until `cancel` fires or its work ends.
///
/// Cluster workers report `segment_started` up front and, on a fatal fault,
/// a `failed` event before returning the error.
pub async fn run_worker(
    spec: WorkerSpec,
    connector: Arc<dyn BrokerConnector>,
    cancel: CancellationToken,
) -> Result<()> {
    let emitter = match &spec.event_endpoint {
        Some(endpoint) => EventEmitter::spawn(
            Arc::new(HttpEventSink::new(endpoint.clone())?),
            spec.event_queue_capacity,
        ),
        None => EventEmitter::disabled(),
    };
    run_worker_with(spec, connector, emitter, cancel).await
}

/// [`run_worker`] with a caller-supplied emitter.
pub async fn run_worker_with(
    spec: WorkerSpec,
    connector: Arc<dyn BrokerConnector>,
    emitter: EventEmitter,
    cancel: CancellationToken,
) -> Result<()> {
    let outcome = match &spec.role {
        WorkerRole::Producer { producer } => run_producer(producer, connector, cancel).await,
        WorkerRole::Cluster { cluster } => {
            emitter.emit(Event::lifecycle(
                spec.pipeline_id,
                Some(spec.segment_index),
                lifecycle::SEGMENT_STARTED,
                json!({
                    "broker": cluster.broker,
                    "inputs": cluster.inputs.iter().map(|i| i.topic.clone()).collect::<Vec<_>>(),
                    "outputs": cluster.outputs.iter().map(|o| o.topic.clone()).collect::<Vec<_>>(),
                }),
            ));
            let runner = ClusterRunner::new(
                spec.pipeline_id,
                cluster.clone(),
                connector,
                TransformationLoader::new(spec.step_budget),
            )
            .with_events(emitter.clone(), spec.emit_stream_events);
            runner.run(cancel).await
        }
    };

    if let Err(e) = &outcome {
        tracing::error!(worker = %spec.label(), error = %e, "Worker failed");
        emitter.emit(Event::lifecycle(
            spec.pipeline_id,
            Some(spec.segment_index),
            lifecycle::FAILED,
            json!({
                "message": format!("Worker crashed at segment #{}: {e}", spec.segment_index + 1),
                "segment": spec.segment_index,
            }),
        ));
    }
    emitter.shutdown(EVENT_FLUSH_TIMEOUT).await;
    outcome
}
