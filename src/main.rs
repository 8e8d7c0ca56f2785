//! fleetwire - Main Entry Point
//!
//! `serve` runs the session server and registers it for discovery,
//! `agent` runs a reconnecting client that pushes heartbeats to a server.

use clap::{Parser, Subcommand};
use fleetwire::config::{FleetConfig, StoreKind};
use fleetwire::discovery::{CoordinationStore, LeaseRegistrar, MemoryStore, RegistrarState};
use fleetwire::observability::logging::LogFormat;
use fleetwire::observability::{init_default_logging, init_logging, HealthCheck, HealthServer};
use fleetwire::runtime::{spawn_supervised, Shutdown, ShutdownSignal};
use fleetwire::session::SessionRegistry;
use fleetwire::transport::tcp::{self, TcpDialer};
use fleetwire::transport::{ConnectionState, Envelope, HealthMonitor, ReconnectingClient};
use fleetwire::FleetError;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn, Level};

/// Liveness and session layer for fleet telemetry
#[derive(Parser)]
#[command(name = "fleetwire")]
#[command(about = "Reconnecting agent streams, server sessions and lease-based discovery")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept agent streams and register this server for discovery
    Serve,
    /// Connect to a server and push heartbeats
    Agent,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        verbose => {
            let format = LogFormat::parse(
                &std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            );
            let level = if verbose == 1 { Level::DEBUG } else { Level::TRACE };
            init_logging(level, format, false);
        }
    }

    info!("Starting fleetwire v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve => run_server(config).await,
        Commands::Agent => run_agent(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<FleetConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(FleetConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["fleetwire.toml", "config/fleetwire.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(FleetConfig::load_from_file(&path)?);
                }
            }

            Err("no configuration file found; pass -c/--config or create fleetwire.toml".into())
        }
    }
}

async fn run_server(config: FleetConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !config.registry.enabled {
        return serve_with::<MemoryStore>(config, None).await;
    }

    match config.registry.store {
        StoreKind::Memory => serve_with(config, Some(Arc::new(MemoryStore::new()))).await,
        StoreKind::Etcd => connect_etcd_and_serve(config).await,
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd_and_serve(config: FleetConfig) -> Result<(), Box<dyn std::error::Error>> {
    use fleetwire::discovery::{EtcdOptions, EtcdStore};

    let options = EtcdOptions {
        endpoints: config.registry.endpoints.clone(),
        username: config.get_registry_username(),
        password: config.get_registry_password()?,
        dial_timeout: Some(Duration::from_secs(config.registry.dial_timeout_secs)),
    };
    let store = EtcdStore::connect(&options).await?;
    serve_with(config, Some(Arc::new(store))).await
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd_and_serve(_config: FleetConfig) -> Result<(), Box<dyn std::error::Error>> {
    Err("registry.store = \"etcd\" needs a build with the `etcd` feature".into())
}

async fn serve_with<S: CoordinationStore>(
    config: FleetConfig,
    store: Option<Arc<S>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = config.server_section()?.clone();
    info!(
        service_id = %config.node.service_id,
        instance_id = %config.node.instance_id,
        "Server starting"
    );

    let shutdown = Shutdown::new();
    let health = start_health_server(&config, &shutdown);

    let registry = SessionRegistry::new(config.session_config()?);
    let (inbound_tx, inbound_rx) = mpsc::channel(server.inbound_capacity);
    registry.set_inbound_sender(inbound_tx);
    spawn_supervised("inbound-drain", drain_inbound(inbound_rx));

    let listener = TcpListener::bind(&server.listen_addr).await?;
    let local = listener.local_addr()?;
    let accept = tokio::spawn(tcp::serve(
        listener,
        registry.clone(),
        config.transport_options(),
        shutdown.subscribe(),
    ));

    let registrar = match store {
        Some(store) => Some(register_service(&config, store, local).await?),
        None => None,
    };

    if let Some(health) = &health {
        health
            .set_check("listener", HealthCheck::healthy(format!("accepting on {local}")))
            .await;
        health.set_ready(true);
        spawn_supervised(
            "server-health-reporter",
            report_server_health(
                health.clone(),
                registry.clone(),
                registrar.clone(),
                shutdown.subscribe(),
            ),
        );
    }

    info!(address = %local, "Server is running");
    wait_for_signal().await?;

    info!("Application shutdown initiated");
    shutdown.fire();
    if let Some(registrar) = &registrar {
        registrar.close().await;
    }
    let closed = registry.close_all();
    info!(sessions = closed, "Closed sessions");

    match accept.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "Accept loop ended abnormally"),
    }
    Ok(())
}

async fn register_service<S: CoordinationStore>(
    config: &FleetConfig,
    store: Arc<S>,
    local: SocketAddr,
) -> Result<LeaseRegistrar<S>, FleetError> {
    let registrar = LeaseRegistrar::new(store, config.registrar_config());
    let descriptor = json!({
        "service_id": config.node.service_id,
        "instance_id": config.node.instance_id,
        "addr": local.to_string(),
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": chrono::Utc::now().to_rfc3339(),
    });
    registrar.set_service(&descriptor.to_string()).await?;
    info!(root_key = %registrar.root_key(), "Registered service");
    Ok(registrar)
}

async fn report_server_health<S: CoordinationStore>(
    health: Arc<HealthServer>,
    registry: SessionRegistry,
    registrar: Option<LeaseRegistrar<S>>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        health
            .set_check(
                "sessions",
                HealthCheck::healthy(format!("{} active sessions", registry.len())),
            )
            .await;

        if let Some(registrar) = &registrar {
            let check = match registrar.state() {
                RegistrarState::Leased => HealthCheck::healthy("lease held"),
                state => HealthCheck::unhealthy(format!("registrar {state}")),
            };
            health.set_check("registry", check).await;
        }

        tokio::select! {
            _ = shutdown.wait() => return,
            _ = sleep(Duration::from_secs(5)) => {}
        }
    }
}

async fn drain_inbound(mut inbound: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = inbound.recv().await {
        debug!(
            client_id = %envelope.client_id,
            bytes = envelope.payload.len(),
            "Inbound payload"
        );
    }
}

async fn run_agent(config: FleetConfig) -> Result<(), Box<dyn std::error::Error>> {
    let section = config.client_section()?.clone();
    let dialer = TcpDialer::new(&section.server_addr, config.transport_options())?;
    let client = ReconnectingClient::new(dialer, config.client_config()?);
    info!(
        client_id = %client.client_id(),
        server = %section.server_addr,
        "Agent starting"
    );

    let shutdown = Shutdown::new();
    let health = start_health_server(&config, &shutdown);

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    client.set_inbound_sender(inbound_tx);
    spawn_supervised("inbound-drain", drain_inbound(inbound_rx));

    let runner = client.clone();
    spawn_supervised("agent-client", async move {
        if let Err(e) = runner.run().await {
            debug!(error = %e, "Client run ended");
        }
    });
    spawn_supervised(
        "agent-push",
        push_heartbeats(
            client.clone(),
            health,
            Duration::from_secs(section.push_interval_secs),
            shutdown.subscribe(),
        ),
    );

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let outcome = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            Ok(())
        }
        _ = monitor_connection_health(&client) => {
            error!("Server connection permanently lost, shutting down agent...");
            Err("reconnect attempts exhausted".into())
        }
    };

    shutdown.fire();
    client.close();
    outcome
}

async fn push_heartbeats(
    client: ReconnectingClient<TcpDialer>,
    health: Option<Arc<HealthServer>>,
    every: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(every);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => {}
        }

        let state = client.connection_state();
        if let Some(health) = &health {
            health.set_ready(state == ConnectionState::Ready);
            let check = if state == ConnectionState::Ready {
                HealthCheck::healthy("connected to server")
            } else {
                HealthCheck::unhealthy(format!("connection {state}"))
            };
            health.set_check("client", check).await;
        }

        sequence += 1;
        let health_metrics = client.health_metrics();
        let payload = json!({
            "client_id": client.client_id(),
            "sequence": sequence,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "quality": HealthMonitor::assess_connection_quality(&health_metrics),
            "health": health_metrics,
        });
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Could not encode heartbeat");
                continue;
            }
        };

        match client.send(bytes).await {
            Ok(()) => debug!(sequence, "Heartbeat sent"),
            Err(FleetError::NotConnected { state }) => {
                info!(sequence, state = %state, "Not connected, skipping heartbeat");
            }
            Err(FleetError::Closed) => return,
            Err(e) => warn!(sequence, error = %e, "Heartbeat send failed"),
        }
    }
}

/// Resolve once the client has given up reconnecting
async fn monitor_connection_health(client: &ReconnectingClient<TcpDialer>) {
    loop {
        if client.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn start_health_server(config: &FleetConfig, shutdown: &Shutdown) -> Option<Arc<HealthServer>> {
    let port = config.health.port?;
    let health = Arc::new(HealthServer::new(config.node.instance_id.clone(), port));

    let server = health.clone();
    let signal = shutdown.subscribe();
    spawn_supervised("health-server", async move {
        if let Err(e) = server.start(signal).await {
            error!("Health server error: {}", e);
        }
    });
    Some(health)
}

async fn wait_for_signal() -> Result<(), Box<dyn std::error::Error>> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

fn handle_config_command(config: FleetConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
