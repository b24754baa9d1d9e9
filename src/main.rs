//! coopwatch - Main Entry Point

use clap::{Parser, Subcommand};
use coopwatch::config::CoopConfig;
use coopwatch::error::{CoopError, CoopResult};
use coopwatch::link::host::HostLinkDriver;
use coopwatch::observability::{init_default_logging, HealthServer};
use coopwatch::session::RumqttTransport;
use coopwatch::telemetry::{BackgroundSensor, W1ThermSource};
use coopwatch::{
    BackoffPolicy, BrokerSession, NetworkLink, QoS, SupervisorLoop, TelemetryPublisher,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Time allowed for the MQTT driver to flush DISCONNECT on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Keeps a coop monitor online and publishing sensor readings over MQTT
#[derive(Parser)]
#[command(name = "coopwatch")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "COOPWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the parsed configuration with defaults filled in
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting coopwatch v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Commands::Run => run_supervisor(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(e.exit_code());
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> CoopResult<CoopConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(CoopConfig::load_from_file(path)?);
    }

    for candidate in ["coopwatch.toml", "config/coopwatch.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(CoopConfig::load_from_file(path)?);
        }
    }

    Err(CoopError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no configuration file found; pass -c/--config or create coopwatch.toml",
    )))
}

fn handle_config_command(config: &CoopConfig, show: bool) -> CoopResult<()> {
    // Resolving secrets catches unset environment variables as well
    let connection = config.connection_config()?;
    info!(
        client_id = %connection.client_id,
        broker = %connection.broker_address,
        port = connection.broker_port,
        "Configuration is valid"
    );

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

async fn run_supervisor(config: CoopConfig) -> CoopResult<()> {
    let connection = Arc::new(config.connection_config()?);
    info!(
        client_id = %connection.client_id,
        link_type = %connection.link_type,
        "Supervisor starting"
    );

    let link = NetworkLink::new(
        HostLinkDriver::new(connection.broker_address.clone(), connection.broker_port),
        connection.clone(),
        BackoffPolicy::from_config(&config.backoff),
    );

    let mut session = BrokerSession::new(RumqttTransport::new(), connection.clone());
    let command_filter = format!("{}/cmd/#", config.topic_prefix());
    session.subscribe(
        &command_filter,
        QoS::AtLeastOnce,
        Box::new(|topic, payload| {
            info!(
                topic,
                payload = %String::from_utf8_lossy(payload),
                "Command received"
            );
        }),
    )?;

    let sample_interval = Duration::from_secs(config.telemetry.sample_interval_secs);
    let supervisor = SupervisorLoop::new(
        link,
        session,
        TelemetryPublisher::from_config(&config),
        BackgroundSensor::new(W1ThermSource::new(&config.telemetry.w1_devices_path)),
        BackoffPolicy::from_config(&config.backoff),
        sample_interval,
    )
    .with_cycle_interval(Duration::from_millis(config.device.poll_interval_ms));

    if config.health.enabled {
        let health_server = Arc::new(HealthServer::new(
            connection.client_id.clone(),
            config.health.port,
            sample_interval * 3,
        ));
        tokio::spawn(health_server.start());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = shutdown_tx.send(true);
    });

    let supervisor = supervisor.run(shutdown_rx).await;
    let (mut link, mut session, publisher) = supervisor.into_parts();
    session.transport_mut().wait_closed(SHUTDOWN_GRACE).await;
    link.shut_down();

    if !publisher.is_empty() {
        warn!(
            unsent = publisher.len(),
            "Discarding buffered samples at shutdown"
        );
    }
    Ok(())
}
