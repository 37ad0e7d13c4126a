//! Agent entry point. Loads configuration, creates the virtual
//! interface and route installer, then hands off to [`runtime::run`]
//! until a shutdown signal (Ctrl-C) arrives.

mod config;
mod error;
mod iface;
mod routes;
mod runtime;
mod state;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use iface::TunInterface;
use routes::IpRouteInstaller;
use state::AgentState;
use tunnel_protocol::config::LogFormat;

fn init_logging(log: &tunnel_protocol::config::LogConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    let (writer, guard) = match &log.file {
        Some(path) => {
            let dir = std::path::Path::new(path).parent().unwrap_or(std::path::Path::new("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "tunnel-agent.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = config::parse_args()?;
    let agent_config = config::load_config(&args.config_path)?;
    config::validate(&agent_config, args.id_override.as_deref())?;

    let _log_guard = init_logging(&agent_config.log);

    // `config::validate` already rejects a gateway with neither `id` nor
    // `-id`, so this fallback only ever fires for clients, which §6
    // doesn't require a persisted id for.
    let agent_id = args
        .id_override
        .clone()
        .or_else(|| agent_config.id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(agent_id = %agent_id, server = %agent_config.server, mode = ?agent_config.mode, "starting agent");

    // Bring the interface into existence here (name + an initial MTU);
    // the runtime reconfigures IP/MTU/up from the first `Register`
    // response and keeps reusing this same handle across reconnects.
    let iface_name = "tun0";
    let iface: Arc<dyn iface::VirtualInterface> =
        Arc::new(TunInterface::new(iface_name, 1400).context("creating virtual interface")?);
    let routes: Arc<dyn routes::RouteInstaller> = Arc::new(IpRouteInstaller::new());

    let state = AgentState::new(agent_config, agent_id, iface, routes);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_handle = tokio::spawn(runtime::run(state, shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = run_handle.await;
    Ok(())
}
