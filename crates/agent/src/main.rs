mod config;
mod device;
mod executor;
mod firewall;
mod logsink;
mod registry;
mod rpc;
mod runtime;
mod session;
mod stream;
mod wifi;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::firewall::Ufw;
use crate::registry::OperationRegistry;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::session::wamp::WampTransport;
use crate::session::{Collaborators, SessionController, SessionEvent};
use crate::wifi::IwWifi;

#[derive(Debug, Parser)]
#[command(name = "mgmt-agent")]
#[command(about = "Device management agent", version)]
struct Cli {
    /// Device configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent (default mode when no subcommand specified)
    Agent,
    /// Load the configuration and print it with the secret redacted
    CheckConfig,
    /// Print every procedure topic the agent registers
    Topics,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref()).context("loading device configuration")?;

    match cli.command.unwrap_or(Commands::Agent) {
        Commands::Agent => {
            let code = run_agent(config).await?;
            std::process::exit(code);
        }
        Commands::CheckConfig => {
            let rendered = toml::to_string_pretty(&config.redacted()).context("rendering configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Topics => {
            for topic in rpc::catalogue::topics(&config.identity()) {
                println!("{topic}");
            }
            Ok(())
        }
    }
}

async fn run_agent(config: AgentConfig) -> anyhow::Result<i32> {
    info!(
        device = %config.identity(),
        endpoint = %config.device_endpoint_url,
        stage = config.stage(),
        arch = std::env::consts::ARCH,
        "starting management agent"
    );
    if config.dev_mode {
        info!(registry = %config.docker_registry_url, "development mode");
    }

    let runtime = DockerRuntime::connect(config.agent.docker_host.as_deref()).context("connecting to docker")?;
    if let Err(e) = runtime.ping().await {
        warn!(error = %e, "docker daemon is not answering yet");
    }

    let config = Arc::new(config);
    let collaborators = Collaborators {
        runtime: Arc::new(runtime),
        firewall: Arc::new(Ufw::default()),
        wifi: Arc::new(IwWifi::new(config.agent.wifi_interface.clone())),
    };
    let registry = Arc::new(OperationRegistry::new());
    let controller = SessionController::new(config.clone(), collaborators, registry);

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        setup_shutdown_handler().await;
        info!("Shutdown signal received, stopping agent gracefully");
        let _ = shutdown_tx.send(SessionEvent::Shutdown);
    });
    tokio::spawn(WampTransport::new(config, tx).run());

    let code = controller.run(rx).await;
    info!(code, "management agent stopped");
    Ok(code)
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
