//! Supervisor lifecycle tests against real child processes.
//!
//! Workers are stood in for by `sleep`, so these tests exercise process
//! supervision and the run state machine without a broker.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Notify, Semaphore};

use flowgate_broker::BrokerProbe;
use flowgate_pipeline::{Validator, WorkerRole, WorkerSpec};
use flowgate_supervisor::{
    EventBus, LifecycleRegistry, MemoryGraphStore, ProducerOptions, StartOptions, Supervisor,
    SupervisorConfig, WorkerLauncher,
};
use flowgate_types::{
    ControlStatus, Flow, FlowgateError, InputNode, NodeRef, OutputNode, PipelineGraph,
    ProcessStatus, Result, RunStatus,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct AlwaysUp;

#[async_trait]
impl BrokerProbe for AlwaysUp {
    async fn is_reachable(&self, _address: &str) -> bool {
        true
    }
}

/// Holds validation open until released, signalling when a probe starts.
struct GatedProbe {
    entered: Notify,
    gate: Semaphore,
}

#[async_trait]
impl BrokerProbe for GatedProbe {
    async fn is_reachable(&self, _address: &str) -> bool {
        self.entered.notify_one();
        let _permit = self.gate.acquire().await;
        true
    }
}

/// Runs `sleep 30` for every worker, counting launches and recording
/// each cluster's consumer group.
#[derive(Default)]
struct SleepLauncher {
    launched: AtomicUsize,
    groups: Mutex<Vec<String>>,
}

impl WorkerLauncher for SleepLauncher {
    fn command(&self, spec: &WorkerSpec) -> Result<Command> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        if let WorkerRole::Cluster { cluster } = &spec.role {
            self.groups.lock().unwrap().push(cluster.consumer_group.clone());
        }
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        Ok(cmd)
    }
}

fn endpoint(id: i64, topic: &str, broker: &str) -> (InputNode, OutputNode) {
    (
        InputNode {
            id,
            name: None,
            topic: topic.into(),
            broker_address: broker.into(),
            schema: None,
        },
        OutputNode {
            id: id + 100,
            name: None,
            topic: format!("{topic}-out"),
            broker_address: broker.into(),
            schema: None,
        },
    )
}

/// Two independent input -> output paths on two brokers: two segments.
fn two_broker_graph(id: i64) -> PipelineGraph {
    let mut g = PipelineGraph::new(id, "two-brokers");
    for (node, broker) in [(1, "b1"), (2, "b2")] {
        let (input, output) = endpoint(node, "x", broker);
        g.flows
            .push(Flow::new(NodeRef::Input(input.id), NodeRef::Output(output.id)));
        g.inputs.push(input);
        g.outputs.push(output);
    }
    g
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        poll_min: Duration::from_millis(50),
        poll_max: Duration::from_millis(200),
        grace_period: Duration::from_millis(500),
        drain_delay: Duration::from_millis(50),
        ..SupervisorConfig::default()
    }
}

struct Harness {
    supervisor: Supervisor,
    launcher: Arc<SleepLauncher>,
}

fn harness(graphs: Vec<PipelineGraph>) -> Harness {
    harness_with_probe(graphs, Arc::new(AlwaysUp))
}

fn harness_with_probe(graphs: Vec<PipelineGraph>, probe: Arc<dyn BrokerProbe>) -> Harness {
    let store = Arc::new(MemoryGraphStore::new());
    for g in graphs {
        store.put(g);
    }
    let config = fast_config();
    let bus = EventBus::new(Arc::new(LifecycleRegistry::new()), config.broadcast_capacity);
    let launcher = Arc::new(SleepLauncher::default());
    let supervisor = Supervisor::new(
        store,
        Validator::new(probe),
        launcher.clone(),
        bus,
        config,
    );
    Harness {
        supervisor,
        launcher,
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_spawns_one_worker_per_segment() {
    let h = harness(vec![two_broker_graph(1)]);
    let report = h.supervisor.start(1, StartOptions::default()).await.unwrap();

    assert_eq!(report.status, ControlStatus::Started);
    assert_eq!(report.segments, 2);
    assert_eq!(report.producers, 0);
    assert_eq!(report.pids.len(), 2);
    assert!(report.pids.iter().all(|pid| pid_alive(*pid)));

    let status = h.supervisor.get_status(1).await;
    assert_eq!(status.status, ProcessStatus::Running);
    assert_eq!(status.run.unwrap().total_segments, 2);

    h.supervisor.stop(1).await;
}

#[tokio::test]
async fn second_start_while_running_is_rejected() {
    let h = harness(vec![two_broker_graph(1)]);
    h.supervisor.start(1, StartOptions::default()).await.unwrap();

    let err = h.supervisor.start(1, StartOptions::default()).await.unwrap_err();
    assert!(matches!(err, FlowgateError::AlreadyRunning(1)));
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 2);

    h.supervisor.stop(1).await;
}

#[tokio::test]
async fn killed_worker_fails_run_and_stops_siblings() {
    let h = harness(vec![two_broker_graph(1)]);
    let mut observer = h.supervisor.bus().subscribe();
    let report = h.supervisor.start(1, StartOptions::default()).await.unwrap();
    let (victim, sibling) = (report.pids[0], report.pids[1]);

    unsafe {
        libc::kill(victim as i32, libc::SIGKILL);
    }

    let mut failed = false;
    for _ in 0..40 {
        if h.supervisor.get_status(1).await.status == ProcessStatus::Failed {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(failed, "status never turned failed");

    let event = tokio::time::timeout(Duration::from_secs(5), observer.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, "failed");
    assert_eq!(event.segment_index, Some(0));
    assert!(event.message().contains("segment #1"), "{}", event.message());

    assert!(eventually(|| !pid_alive(sibling)).await, "sibling {sibling} survived");
    let state = h.supervisor.registry().get(1).unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(h.supervisor.get_status(1).await.status, ProcessStatus::Failed);
}

#[tokio::test]
async fn stop_twice_is_a_no_op() {
    let h = harness(vec![two_broker_graph(1)]);
    let report = h.supervisor.start(1, StartOptions::default()).await.unwrap();

    let first = h.supervisor.stop(1).await;
    assert_eq!(first.status, ControlStatus::Stopped);
    assert!(report.pids.iter().all(|pid| !pid_alive(*pid)));

    let second = h.supervisor.stop(1).await;
    assert_eq!(second.status, ControlStatus::Stopped);

    let status = h.supervisor.get_status(1).await;
    assert_eq!(status.status, ProcessStatus::Stopped);
    assert_eq!(status.message, "Pipeline stopped");
}

#[tokio::test]
async fn invalid_graph_is_rejected_before_spawning() {
    let mut graph = two_broker_graph(2);
    graph.flows.clear();
    let h = harness(vec![graph]);

    let err = h.supervisor.start(2, StartOptions::default()).await.unwrap_err();
    match err {
        FlowgateError::Validation(message) => {
            assert!(message.contains("no flows"), "{message}")
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 0);
    assert_eq!(h.supervisor.get_status(2).await.status, ProcessStatus::Stopped);
}

#[tokio::test]
async fn unknown_pipeline_is_not_found_and_status_never_fails() {
    let h = harness(vec![]);
    let err = h.supervisor.start(42, StartOptions::default()).await.unwrap_err();
    assert!(matches!(err, FlowgateError::PipelineNotFound(42)));

    let status = h.supervisor.get_status(42).await;
    assert_eq!(status.status, ProcessStatus::Stopped);
    assert!(status.run.is_none());

    assert_eq!(h.supervisor.abort(42).await.status, ControlStatus::NotFound);
}

#[tokio::test]
async fn runtime_elapsing_completes_the_run_once() {
    let h = harness(vec![two_broker_graph(3)]);
    let mut observer = h.supervisor.bus().subscribe();
    let options = StartOptions {
        runtime: Some(Duration::from_millis(300)),
        producer: Some(ProducerOptions::default()),
    };
    let report = h.supervisor.start(3, options).await.unwrap();
    assert_eq!(report.producers, 2);
    assert_eq!(report.pids.len(), 4);

    let mut kinds = Vec::new();
    while !kinds.iter().any(|k| k == "completed") {
        let event = tokio::time::timeout(Duration::from_secs(10), observer.next())
            .await
            .expect("run never completed")
            .unwrap();
        kinds.push(event.kind);
    }
    assert_eq!(kinds, vec!["segment_completed", "segment_completed", "completed"]);

    assert!(report.pids.iter().all(|pid| !pid_alive(*pid)));
    let status = h.supervisor.get_status(3).await;
    assert_eq!(status.status, ProcessStatus::Stopped);
    assert_eq!(status.run.unwrap().status, RunStatus::Completed);

    // A finished run can be started again.
    h.supervisor.start(3, StartOptions::default()).await.unwrap();
    assert_eq!(
        h.supervisor.registry().get(3).unwrap().status,
        RunStatus::Starting
    );
    h.supervisor.stop(3).await;
}

#[tokio::test]
async fn abort_is_terminal_and_reported_once() {
    let h = harness(vec![two_broker_graph(4)]);
    let report = h.supervisor.start(4, StartOptions::default()).await.unwrap();

    let first = h.supervisor.abort(4).await;
    assert_eq!(first.status, ControlStatus::Aborted);
    assert_eq!(first.message, "Pipeline aborted");
    assert!(report.pids.iter().all(|pid| !pid_alive(*pid)));

    let second = h.supervisor.abort(4).await;
    assert_eq!(second.status, ControlStatus::Aborted);
    assert_eq!(second.message, "Pipeline already aborted");

    // Stop after abort keeps the abort.
    h.supervisor.stop(4).await;
    assert_eq!(h.supervisor.registry().get(4).unwrap().status, RunStatus::Aborted);
}

#[tokio::test]
async fn unusable_producer_rate_is_rejected_before_spawning() {
    let h = harness(vec![two_broker_graph(5)]);
    for producer in [
        ProducerOptions { n_channels: 2, frequency_hz: 1e10 },
        ProducerOptions { n_channels: 2, frequency_hz: 1e-320 },
        ProducerOptions { n_channels: 0, frequency_hz: 1.0 },
    ] {
        let options = StartOptions {
            runtime: None,
            producer: Some(producer),
        };
        let err = h.supervisor.start(5, options).await.unwrap_err();
        assert!(matches!(err, FlowgateError::Validation(_)), "{err:?}");
    }
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 0);
    assert_eq!(h.supervisor.get_status(5).await.status, ProcessStatus::Stopped);
}

#[tokio::test]
async fn status_during_validation_is_not_running() {
    let probe = Arc::new(GatedProbe {
        entered: Notify::new(),
        gate: Semaphore::new(0),
    });
    let h = harness_with_probe(vec![two_broker_graph(6)], probe.clone());

    let (started, during) = tokio::join!(h.supervisor.start(6, StartOptions::default()), async {
        probe.entered.notified().await;
        let status = h.supervisor.get_status(6).await;
        probe.gate.add_permits(1);
        status
    });

    assert_eq!(during.status, ProcessStatus::Stopped);
    assert_eq!(during.message, "Pipeline is starting");
    assert!(during.pids.is_empty());

    started.unwrap();
    assert_eq!(h.supervisor.get_status(6).await.status, ProcessStatus::Running);
    h.supervisor.stop(6).await;
}

#[tokio::test]
async fn restart_uses_fresh_consumer_groups() {
    let h = harness(vec![two_broker_graph(7)]);
    h.supervisor.start(7, StartOptions::default()).await.unwrap();
    h.supervisor.stop(7).await;
    h.supervisor.start(7, StartOptions::default()).await.unwrap();
    h.supervisor.stop(7).await;

    let groups = h.launcher.groups.lock().unwrap().clone();
    assert_eq!(groups.len(), 4);
    assert!(groups[..2].iter().all(|g| !groups[2..].contains(g)), "{groups:?}");
}
