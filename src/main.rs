//! Modbus-to-MQTT field gateway
//!
//! Polls Modbus RTU/TCP devices on a schedule, decodes registers into
//! engineering values, and publishes them to MQTT on change/interval;
//! accepts MQTT commands back onto `mode=rw` parameters.
//!
//! Module structure:
//! - `domain/` - Core types (BusSpec/NodeSpec/ParamSpec, codec, envelopes)
//! - `io/` - External interfaces (Modbus transports, planner, MQTT bridge, journal)
//! - `services/` - Business logic (Current Store, Decider, Bus Worker, hot reload)
//! - `infra/` - Infrastructure (Config, Metrics, embedded broker)

use std::sync::Arc;

use clap::Parser;
use modbus_gateway::infra::{Config, Metrics};
use modbus_gateway::io::journal::Journal;
use modbus_gateway::io::mqtt_bridge::MqttBridge;
use modbus_gateway::services::{CurrentStore, HotReloadController};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

fn default_config_path() -> String {
    std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config/dev.toml".to_string())
}

/// Modbus-to-MQTT field gateway
#[derive(Parser, Debug)]
#[command(name = "modbus-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value_t = default_config_path())]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = option_env!("GIT_HASH").unwrap_or("unknown"),
        "modbus_gateway_starting"
    );

    // Load configuration from TOML file (path resolved from --config/CONFIG_FILE/default)
    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    // Start embedded MQTT broker, if enabled
    modbus_gateway::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_base_topic = %config.mqtt_base_topic(),
        lines = config.lines().len(),
        addressing_normalize = %config.addressing_normalize(),
        batch_read_enabled = %config.batch_read_enabled(),
        "config_loaded"
    );

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let journal = Arc::new(Journal::new(
        config.history_max_rows(),
        config.history_ttl_days(),
        config.history_cleanup_every(),
    ));
    let current_store = Arc::new(CurrentStore::new());
    let bridge = Arc::new(MqttBridge::start(&config, journal.clone()));

    // Hot-reload controller owns the set of running Bus Workers; the
    // initial start is just a reload from an empty set.
    let controller = Arc::new(HotReloadController::new(bridge, current_store.clone(), metrics.clone()));
    controller.reload(&config).await;
    info!(lines = config.lines().len(), "bus_workers_started");

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let bus_count = config.lines().len();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let summary = metrics_clone.report(bus_count, 0);
            summary.log();
        }
    });

    // Handle shutdown on Ctrl+C
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    shutdown_rx.changed().await.ok();
    controller.stop_all().await;

    info!("modbus-gateway shutdown complete");
    Ok(())
}
