//! Pipeline validation, plan compilation, transformation loading, and cluster execution.
//!
//! This crate turns a stored [`flowgate_types::PipelineGraph`] into running
//! dataflow: the [`validation`] checks gate execution, the [`compiler`]
//! partitions the graph by broker, the [`loader`] turns transformation source
//! into sandboxed steps, and the [`runner`] wires subscriptions, steps and
//! publishers together inside a [`worker`] process.

pub mod compiler;
pub mod emitter;
pub mod loader;
pub mod runner;
pub mod validation;
pub mod worker;

pub use compiler::{compile, sort_flows_topologically, Cluster, ExecutionPlan};
pub use emitter::{EventEmitter, EventSink, HttpEventSink};
pub use loader::{check_source, Passthrough, RhaiStep, ScriptedStep, TransformationLoader};
pub use runner::{ClusterRunner, Sink, Topology};
pub use validation::{check_presence, lint, Diagnostic, LintRule, Severity, Validator};
pub use worker::{
    check_producer, producer_period, run_worker, run_worker_with, synthetic_record, ProducerSpec,
    WorkerRole, WorkerSpec, MAX_PRODUCER_HZ, WORKER_SPEC_ENV,
};
