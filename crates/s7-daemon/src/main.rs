//! S7 adapter daemon entry point.
//!
//! Opens one PLC link, registers the configured read and write endpoints
//! and logs every delivered result as JSON until a shutdown signal arrives.

mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use s7_common::config::{AdapterConfig, EndpointConfig, EndpointKind};
use s7_common::state::ConnectionState;
use s7_link::{ConnectionManager, LinkEvent, ReadOptions, SimulatedTransport, TagResult, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticsCollector, DiagnosticsState};
use crate::signals::SignalHandler;

/// Adapter daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "s7-daemon",
    about = "S7 adapter daemon - polls and writes PLC tags",
    version,
    long_about = None
)]
struct Args {
    /// Path to an adapter configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run against the in-memory simulated PLC.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Stop after this long (e.g. "30s"); runs until signalled if absent.
    #[arg(long, value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,

    /// Interval between status reports.
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    status_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting S7 adapter daemon");

    let config = load_config(&args)?;
    info!(
        plc = %config.connection.target(),
        endpoints = config.endpoints.len(),
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    let diagnostics = DiagnosticsCollector::new(Arc::new(DiagnosticsState::new()));

    run_daemon(&config, &args, signal_handler, &diagnostics).await
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("s7_daemon={level},s7_link={level},s7_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `S7_CONFIG_PATH` environment variable
/// 3. `/etc/s7/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<AdapterConfig> {
    // 1. Command-line argument (highest priority)
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return AdapterConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    // 2. Environment variable
    if let Ok(env_path) = std::env::var("S7_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from S7_CONFIG_PATH");
            return AdapterConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from S7_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "S7_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    // 3. System path
    let system_path = PathBuf::from("/etc/s7/config.toml");
    if system_path.exists() {
        info!(?system_path, "Loading config from system path");
        return AdapterConfig::from_file(&system_path)
            .with_context(|| format!("Failed to load config from {system_path:?}"));
    }

    // 4. Local development path
    let local_path = PathBuf::from("config/default.toml");
    if local_path.exists() {
        info!(?local_path, "Loading config from local path");
        return AdapterConfig::from_file(&local_path)
            .with_context(|| format!("Failed to load config from {local_path:?}"));
    }

    // 5. Built-in defaults
    info!("No config file found, using built-in defaults");
    Ok(AdapterConfig::default())
}

/// Build the transport for the configured PLC.
fn create_transport(args: &Args) -> Arc<dyn Transport> {
    if !args.simulated {
        warn!("No ISO-on-TCP transport is built in, falling back to the simulated PLC");
    }
    Arc::new(SimulatedTransport::new())
}

/// Main daemon run loop.
async fn run_daemon(
    config: &AdapterConfig,
    args: &Args,
    mut signal_handler: SignalHandler,
    diagnostics: &DiagnosticsCollector,
) -> Result<()> {
    let transport = create_transport(args);
    let manager = ConnectionManager::spawn(&config.connection, transport);
    info!(plc = %manager.target(), "Connection manager started");

    let events = spawn_event_logger(&manager);
    let endpoints = start_endpoints(&manager, &config.endpoints, diagnostics);

    let status_interval = args.status_interval.max(Duration::from_secs(1));
    let mut status =
        tokio::time::interval_at(tokio::time::Instant::now() + status_interval, status_interval);
    let deadline = async {
        match args.run_for {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = signal_handler.recv() => {
                if signal_handler.shutdown_requested() {
                    break;
                }
                if signal_handler.state().take_report_request() {
                    report_status(&manager, diagnostics);
                }
            }
            _ = status.tick() => report_status(&manager, diagnostics),
            () = &mut deadline => {
                info!("Run time limit reached");
                signal_handler.state().request_shutdown();
                break;
            }
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    diagnostics.state().set_shutting_down();

    for task in endpoints {
        task.abort();
    }
    manager.close().await;
    events.abort();

    let snapshot = diagnostics.snapshot(manager.status(), manager.target(), manager.stats());
    info!(
        results = snapshot.results,
        failed_results = snapshot.failed_results,
        connects = snapshot.link.connects,
        link_losses = snapshot.link.link_losses,
        signals = signal_handler.state().signal_count(),
        uptime_secs = snapshot.uptime_secs,
        "Daemon shutdown complete"
    );

    Ok(())
}

/// Register every configured endpoint and spawn a task logging its results.
///
/// Write endpoints fire their configured values once, as soon as the
/// link first reports connected. Writes requested earlier are rejected.
fn start_endpoints(
    manager: &ConnectionManager,
    endpoints: &[EndpointConfig],
    diagnostics: &DiagnosticsCollector,
) -> Vec<JoinHandle<()>> {
    endpoints
        .iter()
        .map(|endpoint| {
            let topic = if endpoint.topic.is_empty() {
                endpoint.tag.name().to_string()
            } else {
                endpoint.topic.clone()
            };
            let state = Arc::clone(diagnostics.state());
            match endpoint.kind {
                EndpointKind::Read => {
                    let mut reader = manager.register_read(
                        endpoint.tag.clone(),
                        ReadOptions {
                            topic,
                            period: endpoint.period,
                            trigger_once: endpoint.trigger_once,
                        },
                    );
                    info!(
                        endpoint = %reader.id(),
                        address = %reader.addresses().data,
                        periodic = reader.is_periodic(),
                        "Read endpoint registered"
                    );
                    tokio::spawn(async move {
                        while let Some(result) = reader.recv().await {
                            state.record_result(result.is_ok());
                            log_result(&result);
                        }
                    })
                }
                EndpointKind::Write => {
                    let mut writer = manager.register_write(endpoint.tag.clone(), topic);
                    info!(
                        endpoint = %writer.id(),
                        address = %writer.addresses().data,
                        "Write endpoint registered"
                    );
                    let values = endpoint.values.clone();
                    let mut link_state = manager.subscribe_state();
                    tokio::spawn(async move {
                        if !values.is_empty() {
                            if link_state
                                .wait_for(|s| *s == ConnectionState::Connected)
                                .await
                                .is_err()
                            {
                                return;
                            }
                            writer.request_write(&values);
                        }
                        while let Some(result) = writer.recv().await {
                            state.record_result(result.is_ok());
                            log_result(&result);
                        }
                    })
                }
            }
        })
        .collect()
}

fn log_result(result: &TagResult) {
    let json = match serde_json::to_string(result) {
        Ok(json) => json,
        Err(e) => {
            warn!(topic = %result.topic, error = %e, "Failed to serialize result");
            return;
        }
    };
    match &result.cause {
        None => info!(topic = %result.topic, result = %json, "Tag result"),
        Some(cause) => warn!(topic = %result.topic, result = %json, cause = %cause, "Tag result"),
    }
}

fn spawn_event_logger(manager: &ConnectionManager) -> JoinHandle<()> {
    let mut events = manager.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LinkEvent::StateChanged { from, to }) => {
                    info!(%from, %to, "Link state changed");
                }
                Ok(LinkEvent::Polled { sequence, any_bad }) => {
                    debug!(sequence, any_bad, "Poll completed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Link event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn report_status(manager: &ConnectionManager, diagnostics: &DiagnosticsCollector) {
    let snapshot = diagnostics.snapshot(manager.status(), manager.target(), manager.stats());
    match serde_json::to_string(&snapshot) {
        Ok(json) => info!(health = %snapshot.health, status = %json, "Periodic status"),
        Err(e) => warn!(error = %e, "Failed to serialize status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s7_common::tag::{DataType, MemoryArea, TagDescriptor, TagValue};
    use s7_link::{PolledValue, TransportCall, WireAddress};
    use std::io::Write;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["s7-daemon", "--simulated"]);
        assert!(args.simulated);
        assert!(args.config.is_none());
        assert!(args.run_for.is_none());
        assert_eq!(args.status_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_args_with_config() {
        let args = Args::parse_from(["s7-daemon", "-c", "plant.toml", "--run-for", "1m 30s"]);
        assert_eq!(args.config, Some(PathBuf::from("plant.toml")));
        assert_eq!(args.run_for, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_load_config_from_argument() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[connection]\nhost = \"10.0.0.5\"\n\n[[endpoints]]\ntopic = \"level\"\n[endpoints.tag]\nname = \"level\"\narea = \"M\"\ndatatype = \"W\"\nbyte_offset = 4"
        )
        .unwrap();
        let args = Args::parse_from(["s7-daemon", "-c", file.path().to_str().unwrap()]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.connection.host, "10.0.0.5");
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].kind, EndpointKind::Read);
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let args = Args::parse_from(["s7-daemon", "-c", "/nonexistent/s7.toml"]);
        assert!(load_config(&args).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_endpoints_registers_and_writes() {
        let sim = Arc::new(SimulatedTransport::new());
        let config = AdapterConfig::default();
        let manager = ConnectionManager::spawn(&config.connection, sim.clone());
        let diagnostics = DiagnosticsCollector::new(Arc::new(DiagnosticsState::new()));

        let endpoints = vec![
            EndpointConfig {
                kind: EndpointKind::Read,
                topic: String::new(),
                period: Some(Duration::from_secs(1)),
                trigger_once: false,
                values: Vec::new(),
                tag: TagDescriptor::new("level", MemoryArea::Marker, DataType::Word, 4, 0, 1)
                    .unwrap(),
            },
            EndpointConfig {
                kind: EndpointKind::Write,
                topic: "setpoint".into(),
                period: None,
                trigger_once: false,
                values: vec![TagValue::Int(7)],
                tag: TagDescriptor::new("sp", MemoryArea::Marker, DataType::Byte, 0, 0, 1)
                    .unwrap(),
            },
        ];
        let tasks = start_endpoints(&manager, &endpoints, &diagnostics);
        assert_eq!(tasks.len(), 2);

        // One write result plus the periodic reader's results at 1s and 2s.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(diagnostics.state().results(), 3);
        assert_eq!(diagnostics.state().failed_results(), 0);
        assert_eq!(manager.stats().connects, 1);
        assert_eq!(
            sim.call_count(|c| matches!(c, TransportCall::WriteItems(_))),
            1
        );
        assert_eq!(
            sim.value(&WireAddress::from("MB0")),
            Some(PolledValue::Scalar(Some(TagValue::Int(7))))
        );

        for task in tasks {
            task.abort();
        }
        manager.close().await;
    }
}
