//! Execution supervisor.
//!
//! Owns at most one process generation per pipeline. `start` validates,
//! compiles, spawns one worker per cluster (plus optional synthetic
//! producers), hands the run to a background monitor and returns. Runtime
//! faults are reported through the registry and the event bus, never through
//! the `start` call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flowgate_pipeline::{check_producer, compile, ExecutionPlan, ProducerSpec, Validator, WorkerSpec};
use flowgate_types::event::lifecycle;
use flowgate_types::{
    duration_serde, ControlResponse, ControlStatus, Event, FlowgateError, PipelineGraph,
    PipelineId, ProcessStatus, Result, RunState, RunStatus, ValidationReport,
};

use crate::bus::EventBus;
use crate::config::SupervisorConfig;
use crate::launcher::WorkerLauncher;
use crate::process::SupervisedProcess;
use crate::registry::LifecycleRegistry;
use crate::store::GraphStore;

fn default_channels() -> usize {
    10
}

fn default_frequency() -> f64 {
    1.0
}

/// Synthetic producer settings, one producer per input node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerOptions {
    #[serde(default = "default_channels")]
    pub n_channels: usize,
    #[serde(default = "default_frequency")]
    pub frequency_hz: f64,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            n_channels: default_channels(),
            frequency_hz: default_frequency(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Complete the run after this long; runs until stopped when absent.
    #[serde(default, with = "duration_serde::option", skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<ProducerOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub pipeline_id: PipelineId,
    pub status: ControlStatus,
    pub message: String,
    pub segments: usize,
    pub producers: usize,
    pub pids: Vec<u32>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pipeline_id: PipelineId,
    pub status: ProcessStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunState>,
    pub pids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Worker,
    Producer,
}

#[derive(Debug)]
struct ManagedProcess {
    process: SupervisedProcess,
    segment: usize,
    role: Role,
}

type Processes = Arc<Mutex<Vec<ManagedProcess>>>;

struct ActiveRun {
    processes: Processes,
    started_at: Instant,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Stop producers before workers, each group in segment order.
async fn shutdown_in_order(procs: &mut [ManagedProcess], grace: Duration) {
    for role in [Role::Producer, Role::Worker] {
        for managed in procs.iter_mut().filter(|m| m.role == role) {
            managed.process.shutdown(grace).await;
        }
    }
}

/// Removes the id from the in-flight `start` set when dropped.
struct StartGuard<'a> {
    starting: &'a StdMutex<HashSet<PipelineId>>,
    id: PipelineId,
}

impl<'a> StartGuard<'a> {
    fn acquire(starting: &'a StdMutex<HashSet<PipelineId>>, id: PipelineId) -> Result<Self> {
        let inserted = starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        if !inserted {
            return Err(FlowgateError::AlreadyRunning(id));
        }
        Ok(Self { starting, id })
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct Supervisor {
    store: Arc<dyn GraphStore>,
    validator: Validator,
    launcher: Arc<dyn WorkerLauncher>,
    bus: EventBus,
    config: SupervisorConfig,
    active: Mutex<HashMap<PipelineId, ActiveRun>>,
    starting: StdMutex<HashSet<PipelineId>>,
    run_seq: AtomicU64,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        validator: Validator,
        launcher: Arc<dyn WorkerLauncher>,
        bus: EventBus,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            validator,
            launcher,
            bus,
            config,
            active: Mutex::new(HashMap::new()),
            starting: StdMutex::new(HashSet::new()),
            run_seq: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        self.bus.registry()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    async fn fetch(&self, id: PipelineId) -> Result<PipelineGraph> {
        self.store
            .fetch_graph(id)
            .await?
            .ok_or(FlowgateError::PipelineNotFound(id))
    }

    pub async fn validate(&self, id: PipelineId) -> Result<ValidationReport> {
        let graph = self.fetch(id).await?;
        Ok(self.validator.validate(&graph).await)
    }

    /// Fetch, validate and compile the pipeline without running it.
    pub async fn plan(&self, id: PipelineId) -> Result<ExecutionPlan> {
        let graph = self.fetch(id).await?;
        self.validator.validate_or_raise(&graph).await?;
        compile(&graph)
    }

    fn worker_spec(&self, mut spec: WorkerSpec) -> WorkerSpec {
        spec.event_endpoint = self.config.event_endpoint.clone();
        spec.emit_stream_events = self.config.emit_stream_events;
        spec.step_budget = self.config.step_budget;
        spec.event_queue_capacity = self.config.event_queue_capacity;
        spec
    }

    /// Unique per run so a restart never reuses a consumer group.
    fn run_tag(&self) -> String {
        let seq = self.run_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", chrono::Utc::now().format("%Y%m%d%H%M%S%6f"))
    }

    fn spawn(&self, spec: &WorkerSpec, role: Role) -> Result<ManagedProcess> {
        let command = self.launcher.command(spec)?;
        let process = SupervisedProcess::spawn(spec.label(), command)?;
        tracing::info!(
            pipeline_id = spec.pipeline_id,
            segment = spec.segment_index,
            pid = process.pid(),
            worker = %spec.label(),
            "Worker spawned"
        );
        Ok(ManagedProcess {
            process,
            segment: spec.segment_index,
            role,
        })
    }

    /// Start a run. Returns as soon as every process is spawned.
    pub async fn start(&self, id: PipelineId, options: StartOptions) -> Result<StartReport> {
        let _guard = StartGuard::acquire(&self.starting, id)?;
        if let Some(producer) = &options.producer {
            check_producer(producer.n_channels, producer.frequency_hz)?;
        }

        {
            let mut active = self.active.lock().await;
            if let Some(run) = active.get(&id) {
                let mut procs = run.processes.lock().await;
                if procs.iter_mut().any(|m| m.process.is_alive()) {
                    return Err(FlowgateError::AlreadyRunning(id));
                }
            }
            if let Some(stale) = active.remove(&id) {
                stale.cancel.cancel();
            }
        }

        let graph = self.fetch(id).await?;
        let report = self.validator.validate_or_raise(&graph).await?;
        let mut plan = compile(&graph)?;
        plan.assign_consumer_groups(&self.config.consumer_group_prefix, &self.run_tag());

        let registry = self.registry();
        registry.reset(id);
        registry.init(id, plan.clusters.len());

        let mut specs: Vec<(WorkerSpec, Role)> = plan
            .clusters
            .iter()
            .map(|cluster| (self.worker_spec(WorkerSpec::cluster(id, cluster.clone())), Role::Worker))
            .collect();
        if let Some(producer) = &options.producer {
            for input in &graph.inputs {
                let segment = plan
                    .clusters
                    .iter()
                    .position(|c| c.broker == input.broker_address)
                    .unwrap_or(0);
                let spec = WorkerSpec::producer(
                    id,
                    segment,
                    ProducerSpec {
                        broker: input.broker_address.clone(),
                        topic: input.topic.clone(),
                        n_channels: producer.n_channels,
                        frequency_hz: producer.frequency_hz,
                        max_records: None,
                    },
                );
                specs.push((self.worker_spec(spec), Role::Producer));
            }
        }

        let mut processes = Vec::with_capacity(specs.len());
        for (spec, role) in &specs {
            match self.spawn(spec, *role) {
                Ok(managed) => processes.push(managed),
                Err(e) => {
                    tracing::error!(pipeline_id = id, error = %e, "Spawn failed, tearing down partial run");
                    shutdown_in_order(&mut processes, self.config.grace_period).await;
                    registry.fail(id, format!("Failed to start pipeline: {e}"));
                    return Err(e);
                }
            }
        }

        let pids: Vec<u32> = processes.iter().map(|m| m.process.pid()).collect();
        let producers = processes.iter().filter(|m| m.role == Role::Producer).count();
        let processes: Processes = Arc::new(Mutex::new(processes));
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor(Monitor {
            pipeline_id: id,
            processes: processes.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            runtime: options.runtime,
            cancel: cancel.clone(),
        }));

        self.active.lock().await.insert(
            id,
            ActiveRun {
                processes,
                started_at: Instant::now(),
                cancel,
                monitor,
            },
        );

        let segments = plan.clusters.len();
        tracing::info!(pipeline_id = id, segments, producers, runtime = ?options.runtime, "Pipeline started");
        Ok(StartReport {
            pipeline_id: id,
            status: ControlStatus::Started,
            message: format!("Pipeline started with {segments} segment(s)"),
            segments,
            producers,
            pids,
            warnings: report.warnings,
        })
    }

    async fn teardown(&self, run: ActiveRun) {
        run.cancel.cancel();
        if let Err(e) = run.monitor.await {
            tracing::warn!(error = %e, "Monitor task ended abnormally");
        }
        let mut procs = run.processes.lock().await;
        shutdown_in_order(&mut procs, self.config.grace_period).await;
    }

    /// Terminate the run's process tree. Calling it on a pipeline with no
    /// active run is a no-op.
    pub async fn stop(&self, id: PipelineId) -> ControlResponse {
        let run = self.active.lock().await.remove(&id);
        let Some(run) = run else {
            return ControlResponse::new(id, ControlStatus::Stopped, "Pipeline is not running");
        };
        self.teardown(run).await;

        if self.registry().abort_with_message(id, "Pipeline stopped") {
            self.bus.publish(Event::lifecycle(
                id,
                None,
                lifecycle::STOPPED,
                json!({"message": "Pipeline stopped"}),
            ));
        }
        tracing::info!(pipeline_id = id, "Pipeline stopped");
        ControlResponse::new(id, ControlStatus::Stopped, "Pipeline stopped")
    }

    /// Move the run to `Aborted` and tear it down. A run that already
    /// finished keeps its terminal state.
    pub async fn abort(&self, id: PipelineId) -> ControlResponse {
        let transitioned = self.registry().abort(id);
        let run = self.active.lock().await.remove(&id);
        if run.is_none() && self.registry().get(id).is_none() {
            return ControlResponse::new(id, ControlStatus::NotFound, format!("No run found for pipeline {id}"));
        }
        if let Some(run) = run {
            self.teardown(run).await;
        }

        if transitioned {
            self.bus.publish(Event::lifecycle(
                id,
                None,
                lifecycle::ABORTED,
                json!({"message": "Pipeline aborted"}),
            ));
            tracing::info!(pipeline_id = id, "Pipeline aborted");
            return ControlResponse::new(id, ControlStatus::Aborted, "Pipeline aborted");
        }

        let (status, message) = match self.registry().get(id).map(|s| s.status) {
            Some(RunStatus::Failed) => (ControlStatus::Failed, "Pipeline already failed"),
            Some(RunStatus::Aborted) => (ControlStatus::Aborted, "Pipeline already aborted"),
            _ => (ControlStatus::Stopped, "Pipeline already finished"),
        };
        ControlResponse::new(id, status, message)
    }

    /// Liveness of the run's processes. Never fails: unknown pipelines
    /// report `Stopped`.
    pub async fn get_status(&self, id: PipelineId) -> StatusReport {
        let run_state = self.registry().get(id);
        let message = run_state
            .as_ref()
            .map(|s| s.message.clone())
            .unwrap_or_else(|| "Pipeline is not running".to_string());
        let registry_failed = run_state
            .as_ref()
            .is_some_and(|s| s.status == RunStatus::Failed);

        let active = self.active.lock().await;
        let Some(run) = active.get(&id) else {
            let in_flight = self
                .starting
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&id);
            // No process group exists until `start` has validated and spawned.
            if in_flight {
                return StatusReport {
                    pipeline_id: id,
                    status: ProcessStatus::Stopped,
                    message: "Pipeline is starting".to_string(),
                    run: run_state,
                    pids: vec![],
                    uptime_secs: None,
                };
            }
            return StatusReport {
                pipeline_id: id,
                status: if registry_failed { ProcessStatus::Failed } else { ProcessStatus::Stopped },
                message,
                run: run_state,
                pids: vec![],
                uptime_secs: None,
            };
        };

        let uptime_secs = Some(run.started_at.elapsed().as_secs_f64());
        let (status, pids) = match run.processes.try_lock() {
            Ok(mut procs) => {
                let pids: Vec<u32> = procs.iter().map(|m| m.process.pid()).collect();
                let status = if registry_failed || procs.iter_mut().any(|m| m.process.failed()) {
                    ProcessStatus::Failed
                } else if procs.iter_mut().any(|m| m.process.is_alive()) {
                    ProcessStatus::Running
                } else {
                    ProcessStatus::Stopped
                };
                (status, pids)
            }
            // The monitor is tearing the run down.
            Err(_) => {
                let status = match run_state.as_ref().map(|s| s.status) {
                    Some(RunStatus::Failed) => ProcessStatus::Failed,
                    Some(s) if s.is_terminal() => ProcessStatus::Stopped,
                    _ => ProcessStatus::Running,
                };
                (status, vec![])
            }
        };

        StatusReport {
            pipeline_id: id,
            status,
            message,
            run: run_state,
            pids,
            uptime_secs,
        }
    }

    /// Tear down every active run, for host shutdown.
    pub async fn shutdown_all(&self) {
        let runs: Vec<(PipelineId, ActiveRun)> = self.active.lock().await.drain().collect();
        for (id, run) in runs {
            tracing::info!(pipeline_id = id, "Stopping pipeline for shutdown");
            self.teardown(run).await;
            self.registry().abort_with_message(id, "Supervisor shut down");
        }
    }
}

struct Monitor {
    pipeline_id: PipelineId,
    processes: Processes,
    bus: EventBus,
    config: SupervisorConfig,
    runtime: Option<Duration>,
    cancel: CancellationToken,
}

/// Poll the run's processes until one dies, the runtime elapses, or the run
/// is cancelled.
async fn monitor(m: Monitor) {
    let interval = m.config.poll_interval(m.runtime);
    let deadline = m.runtime.map(|runtime| Instant::now() + runtime);
    tracing::debug!(pipeline_id = m.pipeline_id, ?interval, "Monitoring run");

    loop {
        let mut wake = Instant::now() + interval;
        if let Some(deadline) = deadline {
            wake = wake.min(deadline);
        }
        tokio::select! {
            _ = m.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(wake) => {}
        }

        if m.check_for_crash().await {
            return;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            m.complete().await;
            return;
        }
    }
}

impl Monitor {
    /// On an unexpected exit: fail the run, stop the siblings, emit `failed`.
    async fn check_for_crash(&self) -> bool {
        let mut procs = self.processes.lock().await;
        let crashed = procs.iter_mut().find_map(|m| {
            m.process
                .exited_unexpectedly()
                .map(|status| (m.segment, m.role, m.process.label().to_string(), status))
        });
        let Some((segment, role, label, status)) = crashed else {
            return false;
        };

        let message = match role {
            Role::Worker => format!("Worker crashed at segment #{}: {label} exited with {status}", segment + 1),
            Role::Producer => format!("Producer for segment #{} died: {label} exited with {status}", segment + 1),
        };
        tracing::error!(pipeline_id = self.pipeline_id, segment, %label, %status, "Process exited unexpectedly");
        self.bus.registry().fail(self.pipeline_id, message.clone());

        shutdown_in_order(&mut procs, self.config.grace_period).await;
        drop(procs);

        self.bus.ingest(Event::lifecycle(
            self.pipeline_id,
            Some(segment),
            lifecycle::FAILED,
            json!({"message": message, "segment": segment}),
        ));
        true
    }

    /// Runtime elapsed: producers first, a drain pause, then workers.
    async fn complete(&self) {
        let mut procs = self.processes.lock().await;
        for managed in procs.iter_mut().filter(|m| m.role == Role::Producer) {
            managed.process.shutdown(self.config.grace_period).await;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.drain_delay) => {}
        }
        let mut segments = Vec::new();
        for managed in procs.iter_mut().filter(|m| m.role == Role::Worker) {
            managed.process.shutdown(self.config.grace_period).await;
            segments.push(managed.segment);
        }
        drop(procs);

        tracing::info!(pipeline_id = self.pipeline_id, "Runtime elapsed, completing run");
        for segment in segments {
            self.bus.ingest(Event::lifecycle(
                self.pipeline_id,
                Some(segment),
                lifecycle::SEGMENT_COMPLETED,
                json!({"segment": segment}),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_options_accept_partial_json() {
        let opts: StartOptions = serde_json::from_str(r#"{"runtime": "30s", "producer": {}}"#).unwrap();
        assert_eq!(opts.runtime, Some(Duration::from_secs(30)));
        assert_eq!(opts.producer, Some(ProducerOptions::default()));

        let empty: StartOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, StartOptions::default());
    }

    #[test]
    fn run_tags_are_unique_within_a_second() {
        let supervisor = Supervisor::new(
            Arc::new(crate::store::MemoryGraphStore::new()),
            Validator::new(Arc::new(flowgate_broker::TcpProbe::new(Duration::from_millis(10)))),
            Arc::new(crate::launcher::ExecutableLauncher::new("true", vec![])),
            EventBus::new(Arc::new(LifecycleRegistry::new()), 4),
            SupervisorConfig::default(),
        );
        let (a, b) = (supervisor.run_tag(), supervisor.run_tag());
        assert_ne!(a, b);
        assert!(a.ends_with("-0") && b.ends_with("-1"), "{a} {b}");
    }

    #[test]
    fn start_guard_rejects_concurrent_start() {
        let starting = StdMutex::new(HashSet::new());
        let guard = StartGuard::acquire(&starting, 3).unwrap();
        assert!(matches!(
            StartGuard::acquire(&starting, 3),
            Err(FlowgateError::AlreadyRunning(3))
        ));
        drop(guard);
        assert!(StartGuard::acquire(&starting, 3).is_ok());
    }
}
