//! SDN host agent.
//!
//! Binds the local control socket, watches workload membership and keeps
//! each virtual bridge's flow table in sync. Stops on SIGINT/SIGTERM or
//! when the host configuration changes; the process manager restarts it.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sdnagent::config::SwitchBackend;
use sdnagent::host_config::FileHostConfigSource;
use sdnagent::janitor::SysfsLinkManager;
use sdnagent::membership::DirWorkloadSource;
use sdnagent::switch::{FlowSwitch, MockSwitch, OvsSwitch};
use sdnagent::{AgentDeps, AgentError, AgentSupervisor, Config, EXIT_BIND_FAILURE};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        socket = %config.socket_path.display(),
        host_config = %config.host_config_path.display(),
        servers_dir = %config.servers_dir.display(),
        switch = ?config.switch_backend,
        "Starting SDN agent"
    );

    let switch: Arc<dyn FlowSwitch> = match config.switch_backend {
        SwitchBackend::Ovs => Arc::new(OvsSwitch::new()),
        SwitchBackend::Mock => {
            warn!("Using in-memory switch, no flows reach the host");
            Arc::new(MockSwitch::new())
        }
    };

    let deps = AgentDeps {
        host_config: Arc::new(FileHostConfigSource::new(&config.host_config_path)?),
        workloads: Arc::new(DirWorkloadSource::new(&config.servers_dir)),
        links: Arc::new(SysfsLinkManager::new()),
        switch,
    };

    let supervisor = Arc::new(AgentSupervisor::new(config, deps));

    tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            supervisor.stop();
        }
    });

    match supervisor.start().await {
        Ok(()) => {
            info!("SDN agent shutdown complete");
            Ok(())
        }
        Err(e @ AgentError::Bind { .. }) => {
            error!(error = %e, "Cannot serve without the control socket");
            std::process::exit(EXIT_BIND_FAILURE);
        }
        Err(e) => {
            error!(error = %e, "SDN agent failed");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
