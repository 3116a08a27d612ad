//! nsm - Network Service Mesh dataplane daemons
//!
//! Runs either the dataplane registrar, which tracks registered dataplanes and
//! monitors their health, or the kernel forwarder, which programs remote
//! cross-connects and keeps itself registered with the registrar.

mod config;
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
mod dataplane;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{forwarder_settings, load_config_file, registrar_settings, ConfigFile};
use dataplane::Backoff;
use nsm_control::{DataplaneRegistrar, DataplaneStore, RegistrarServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Network Service Mesh dataplane daemons
#[derive(Parser, Debug)]
#[command(name = "nsm")]
#[command(version = VERSION)]
#[command(long_about = r#"
Network Service Mesh dataplane daemons.

EXAMPLES:
  # Run the dataplane registrar on the default socket
  nsm registrar

  # Run a kernel forwarder registered under an explicit name
  nsm forwarder --name kernel-forwarder-1 --src-ip 172.16.0.1

  # Use a config file with debug logging
  nsm --config nsm.yaml --log-level debug forwarder

ENVIRONMENT VARIABLES:
  NSM_REGISTRAR_SOCKET   Registrar socket path
  NSM_FORWARDER_NAME     Name the forwarder registers under
  NSM_FORWARDER_SOCKET   Socket the forwarder serves on
  NSM_FORWARDER_SRC_IP   Local VXLAN tunnel endpoint address
"#)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dataplane registrar
    Registrar {
        /// Registrar socket path
        #[arg(long, env = "NSM_REGISTRAR_SOCKET")]
        socket: Option<PathBuf>,

        /// Seconds between liveness heartbeats
        #[arg(long)]
        liveness_interval: Option<u64>,
    },

    /// Run the kernel forwarder
    Forwarder {
        /// Name to register under (defaults to one derived from the host name)
        #[arg(long, env = "NSM_FORWARDER_NAME")]
        name: Option<String>,

        /// Socket to serve cross-connect requests on
        #[arg(long, env = "NSM_FORWARDER_SOCKET")]
        socket: Option<PathBuf>,

        /// Registrar socket path
        #[arg(long, env = "NSM_REGISTRAR_SOCKET")]
        registrar_socket: Option<PathBuf>,

        /// Local VXLAN tunnel endpoint address
        #[arg(long, env = "NSM_FORWARDER_SRC_IP")]
        src_ip: Option<String>,

        /// Initial delay between registration attempts, in seconds
        #[arg(long, default_value = "1")]
        retry_initial: u64,

        /// Maximum delay between registration attempts, in seconds
        #[arg(long, default_value = "60")]
        retry_max: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Registrar {
            socket,
            liveness_interval,
        } => run_registrar(socket, liveness_interval, file).await,
        Commands::Forwarder {
            name,
            socket,
            registrar_socket,
            src_ip,
            retry_initial,
            retry_max,
        } => {
            let settings = forwarder_settings(name, socket, registrar_socket, src_ip, file.forwarder)?;
            let backoff = Backoff {
                initial: Duration::from_secs(retry_initial.max(1)),
                max: Duration::from_secs(retry_max.max(retry_initial).max(1)),
            };
            run_forwarder(settings, backoff).await
        }
    }
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn run_registrar(
    socket: Option<PathBuf>,
    liveness_interval: Option<u64>,
    file: ConfigFile,
) -> Result<()> {
    let settings = registrar_settings(socket, liveness_interval, file.registrar)?;

    info!("Starting dataplane registrar {}", VERSION);

    let registrar = Arc::new(
        DataplaneRegistrar::new(DataplaneStore::new())
            .with_liveness_interval(settings.liveness_interval),
    );
    let server = RegistrarServer::bind(&settings.socket, registrar)
        .await
        .with_context(|| format!("Failed to serve on {}", settings.socket.display()))?;

    info!("Dataplane registrar listening on {}", settings.socket.display());

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down dataplane registrar");

    shutdown.cancel();
    server_task.await.context("Registrar server task failed")?;

    info!("Dataplane registrar stopped");
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_forwarder(settings: config::ForwarderSettings, backoff: Backoff) -> Result<()> {
    use nsm_control::RegistrarClient;
    use nsm_forwarder::{
        AgentServer, DataplaneAgent, IpRouteOps, MechanismSet, RemoteConnectionForwarder,
    };
    use nsm_proto::{Mechanism, MechanismType, VXLAN_SRC_IP_KEY};
    use tokio::sync::watch;
    use tracing::error;

    info!(dataplane = %settings.name, "Starting kernel forwarder {}", VERSION);

    let mut vxlan = Mechanism::new(MechanismType::Vxlan);
    if let Some(src_ip) = &settings.src_ip {
        vxlan = vxlan.with_parameter(VXLAN_SRC_IP_KEY, src_ip);
    }
    // Mechanisms stay fixed for the lifetime of the process
    let (_mechanisms, mechanisms_rx) = watch::channel(MechanismSet {
        local: vec![Mechanism::new(MechanismType::KernelInterface)],
        remote: vec![vxlan],
    });

    let forwarder = RemoteConnectionForwarder::new(IpRouteOps::new());
    let agent = Arc::new(DataplaneAgent::new(forwarder, mechanisms_rx));
    let server = AgentServer::bind(&settings.socket, agent)
        .await
        .with_context(|| format!("Failed to serve on {}", settings.socket.display()))?;

    info!("Forwarder listening on {}", settings.socket.display());

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(shutdown.clone()));

    let client = RegistrarClient::new(&settings.registrar_socket);
    let registration = tokio::spawn(dataplane::maintain_registration(
        client,
        settings.name.clone(),
        settings.socket.to_string_lossy().into_owned(),
        backoff,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!(dataplane = %settings.name, "Shutting down kernel forwarder");

    shutdown.cancel();
    match registration.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Registration loop failed: {:#}", e),
        Err(e) => error!("Registration task panicked: {}", e),
    }
    server_task.await.context("Forwarder server task failed")?;

    info!(dataplane = %settings.name, "Kernel forwarder stopped");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_forwarder(settings: config::ForwarderSettings, _backoff: Backoff) -> Result<()> {
    anyhow::bail!(
        "The kernel forwarder {} requires Linux network namespaces",
        settings.name
    )
}
