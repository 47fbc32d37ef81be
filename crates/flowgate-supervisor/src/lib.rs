//! Execution supervision for flowgate pipelines.
//!
//! The [`Supervisor`] turns a validated [`PipelineGraph`](flowgate_types::PipelineGraph)
//! into a group of worker processes, watches them, and tears them down. Run
//! state lives in the [`LifecycleRegistry`]; worker events enter through the
//! [`EventBus`] and are fanned out to observers.

pub mod bus;
pub mod config;
pub mod launcher;
pub mod process;
pub mod registry;
pub mod store;
pub mod supervisor;

pub use bus::{EventBus, Ingest, Observer};
pub use config::SupervisorConfig;
pub use launcher::{ExecutableLauncher, WorkerLauncher};
pub use process::SupervisedProcess;
pub use registry::LifecycleRegistry;
pub use store::{GraphStore, JsonDirGraphStore, MemoryGraphStore};
pub use supervisor::{
    ProducerOptions, StartOptions, StartReport, StatusReport, Supervisor,
};
