//! CLI binary for serving, running, and inspecting flowgate pipelines.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use flowgate_broker::{BrokerConnector, TcpProbe};
use flowgate_pipeline::{compile, run_worker, Validator, WorkerSpec};
use flowgate_server::AppState;
use flowgate_supervisor::{
    EventBus, ExecutableLauncher, GraphStore, JsonDirGraphStore, LifecycleRegistry, Supervisor,
    SupervisorConfig,
};
use flowgate_types::duration_serde::parse_duration_str;
use flowgate_types::PipelineGraph;

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Broker-to-broker streaming pipeline supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Supervisor configuration file (TOML)
    #[arg(short, long, global = true, env = "FLOWGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control API, event ingestion and observer stream
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8000", env = "FLOWGATE_BIND")]
        bind: String,

        /// Directory of `<id>.json` pipeline graphs
        #[arg(short, long, default_value = "pipelines", env = "FLOWGATE_STORE")]
        store: PathBuf,

        /// URL workers post events to (default: this server's /stream/event)
        #[arg(long, env = "FLOWGATE_EVENT_ENDPOINT")]
        event_endpoint: Option<String>,

        /// Terminate-to-kill escalation window, e.g. "3s"
        #[arg(long, value_parser = parse_duration_str)]
        grace_period: Option<Duration>,

        /// Upper bound of the monitoring interval, e.g. "10s"
        #[arg(long, value_parser = parse_duration_str)]
        poll_max: Option<Duration>,
    },

    /// Run one worker; spawned by `serve`, reads its job from FLOWGATE_WORKER_SPEC
    #[command(hide = true)]
    Worker,

    /// Validate a stored pipeline
    Validate {
        pipeline_id: i64,

        #[arg(short, long, default_value = "pipelines", env = "FLOWGATE_STORE")]
        store: PathBuf,
    },

    /// Show the compiled execution plan of a stored pipeline
    Plan {
        pipeline_id: i64,

        #[arg(short, long, default_value = "pipelines", env = "FLOWGATE_STORE")]
        store: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::default(),
    };

    match cli.command {
        // Workers run a single-threaded loop, one process per cluster.
        Commands::Worker => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(cmd_worker()),
        command => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(dispatch(command, config)),
    }
}

async fn dispatch(command: Commands, config: SupervisorConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            bind,
            store,
            event_endpoint,
            grace_period,
            poll_max,
        } => {
            let config = apply_serve_overrides(config, event_endpoint, grace_period, poll_max)?;
            cmd_serve(&bind, store, config).await
        }
        Commands::Validate { pipeline_id, store } => cmd_validate(pipeline_id, &store, &config).await,
        Commands::Plan {
            pipeline_id,
            store,
            json,
        } => cmd_plan(pipeline_id, &store, json).await,
        Commands::Worker => cmd_worker().await,
    }
}

/// Layer `serve` flags over the file config and re-check the result.
fn apply_serve_overrides(
    mut config: SupervisorConfig,
    event_endpoint: Option<String>,
    grace_period: Option<Duration>,
    poll_max: Option<Duration>,
) -> anyhow::Result<SupervisorConfig> {
    if event_endpoint.is_some() {
        config.event_endpoint = event_endpoint;
    }
    if let Some(grace) = grace_period {
        config.grace_period = grace;
    }
    if let Some(max) = poll_max {
        config.poll_max = max;
        config.poll_min = config.poll_min.min(max);
    }
    config.check()?;
    Ok(config)
}

fn connector() -> Arc<dyn BrokerConnector> {
    #[cfg(feature = "kafka")]
    {
        Arc::new(flowgate_broker::kafka::KafkaConnector)
    }
    #[cfg(not(feature = "kafka"))]
    {
        tracing::warn!("Built without the kafka feature; worker uses a process-local in-memory broker");
        Arc::new(flowgate_broker::MemoryHub::new())
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn cmd_worker() -> anyhow::Result<()> {
    let spec = WorkerSpec::from_env()?;
    let span = tracing::info_span!(
        "worker",
        pipeline_id = spec.pipeline_id,
        segment = spec.segment_index
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Termination requested");
        on_signal.cancel();
    });

    run_worker(spec, connector(), cancel).instrument(span).await?;
    Ok(())
}

/// Workers reach the server on loopback when it listens on every interface.
fn local_endpoint(addr: SocketAddr) -> String {
    let host = if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    };
    format!("http://{host}/stream/event")
}

async fn cmd_serve(bind: &str, store: PathBuf, mut config: SupervisorConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    if config.event_endpoint.is_none() {
        config.event_endpoint = Some(local_endpoint(listener.local_addr()?));
    }
    tracing::info!(store = %store.display(), endpoint = ?config.event_endpoint, "Starting supervisor");

    let bus = EventBus::new(Arc::new(LifecycleRegistry::new()), config.broadcast_capacity);
    let supervisor = Supervisor::new(
        Arc::new(JsonDirGraphStore::new(store)),
        Validator::new(Arc::new(TcpProbe::new(config.probe_timeout))),
        Arc::new(ExecutableLauncher::current_exe()?),
        bus,
        config,
    );

    flowgate_server::serve(listener, AppState::new(Arc::new(supervisor)), shutdown_signal()).await?;
    tracing::info!("Supervisor stopped");
    Ok(())
}

async fn load_graph(pipeline_id: i64, store: &Path) -> anyhow::Result<PipelineGraph> {
    JsonDirGraphStore::new(store)
        .fetch_graph(pipeline_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("pipeline {pipeline_id} not found in {}", store.display()))
}

async fn cmd_validate(pipeline_id: i64, store: &Path, config: &SupervisorConfig) -> anyhow::Result<()> {
    let graph = load_graph(pipeline_id, store).await?;
    let validator = Validator::new(Arc::new(TcpProbe::new(config.probe_timeout)));
    let report = validator.validate(&graph).await;

    for error in &report.errors {
        println!("[ERROR] {error}");
    }
    for warning in &report.warnings {
        println!("[WARN] {warning}");
    }

    if !report.valid {
        std::process::exit(1);
    }
    println!("Pipeline is valid");
    Ok(())
}

async fn cmd_plan(pipeline_id: i64, store: &Path, json: bool) -> anyhow::Result<()> {
    let graph = load_graph(pipeline_id, store).await?;
    let plan = compile(&graph)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Pipeline: {} ({})", graph.name, graph.pipeline_id);
    println!("Flows: {}", plan.ordered_flows.len());
    for flow in &plan.ordered_flows {
        println!("  {flow}");
    }

    println!("\nClusters: {}", plan.clusters.len());
    for cluster in &plan.clusters {
        let bridge = if cluster.bridges() { " (bridges)" } else { "" };
        println!("  #{} broker={} group={}{}", cluster.index, cluster.broker, cluster.consumer_group, bridge);
        for input in &cluster.inputs {
            println!("    input  {} <- {}", input.id, input.topic);
        }
        for t in &cluster.transformations {
            println!("    step   {}", t.name.as_deref().unwrap_or("(unnamed)"));
        }
        for output in &cluster.outputs {
            println!("    output {} -> {}@{}", output.id, output.topic, output.broker_address);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_poll_max_is_rejected() {
        let err = apply_serve_overrides(SupervisorConfig::default(), None, None, Some(Duration::ZERO));
        assert!(err.is_err());
    }

    #[test]
    fn poll_max_below_poll_min_lowers_both() {
        let config = apply_serve_overrides(
            SupervisorConfig::default(),
            Some("http://10.0.0.1:9000/stream/event".into()),
            Some(Duration::from_millis(500)),
            Some(Duration::from_millis(200)),
        )
        .unwrap();
        assert_eq!(config.poll_min, Duration::from_millis(200));
        assert_eq!(config.poll_max, Duration::from_millis(200));
        assert_eq!(config.grace_period, Duration::from_millis(500));
        assert_eq!(config.event_endpoint.as_deref(), Some("http://10.0.0.1:9000/stream/event"));
    }

    #[test]
    fn unspecified_bind_reaches_loopback() {
        let addr: SocketAddr = "0.0.0.0:8123".parse().unwrap();
        assert_eq!(local_endpoint(addr), "http://127.0.0.1:8123/stream/event");
    }
}
