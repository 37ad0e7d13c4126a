//! Coordinator entry point. Loads configuration, wires the repository,
//! address pool and session table into [`state::AppState`], opens the
//! `quinn` endpoint, and runs the accept loop alongside a background
//! heartbeat reaper until the process is killed.

mod config;
mod error;
mod pool;
mod repository;
mod rpc;
mod session;
mod state;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunnel_protocol::config::{CoordinatorConfig, LogFormat};

use pool::AddressPool;
use repository::memory::InMemoryRepository;
use repository::sqlite::SqliteRepository;
use repository::Repository;
use state::AppState;

fn init_logging(log: &tunnel_protocol::config::LogConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    let (writer, guard) = match &log.file {
        Some(path) => {
            let dir = std::path::Path::new(path).parent().unwrap_or(std::path::Path::new("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "tunnel-coordinator.log".to_string());
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

async fn build_repository(database: &tunnel_protocol::config::DatabaseConfig) -> Result<Arc<dyn Repository>> {
    match database.db_type.as_str() {
        "sqlite" => {
            let repo = SqliteRepository::connect(&database.database, database.max_open_conns)
                .await
                .context("connecting to sqlite repository")?;
            Ok(Arc::new(repo))
        }
        "memory" => Ok(Arc::new(InMemoryRepository::new())),
        other => anyhow::bail!("unsupported database.type: {other}"),
    }
}

/// Rebuilds the address pool's allocation map from persisted agent
/// records (§3 Address Allocation lifecycle: "rebuilt at coordinator
/// startup"), so a restart does not hand out an already-assigned IP to
/// a second agent before the owner re-registers.
async fn rebuild_pool(pool: &AddressPool, repository: &dyn Repository) -> Result<()> {
    let agents = repository.list_all_agents().await.context("listing persisted agents")?;
    for agent in agents {
        if let Some(ip) = agent.overlay_ip.as_deref().and_then(|s| s.parse().ok()) {
            if let Err(e) = pool.allocate_specific(&agent.id, ip) {
                tracing::warn!(agent_id = %agent.id, error = %e, "skipping stale address record at startup");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config::parse_config_path()?;
    let config: CoordinatorConfig = config::load_config(&config_path)?;

    let _log_guard = init_logging(&config.log);

    info!(listen = %config.listen, "starting coordinator");

    let repository = build_repository(&config.database).await?;
    let pool = AddressPool::new(&config.network.overlay_cidr).context("constructing address pool")?;
    rebuild_pool(&pool, repository.as_ref()).await?;

    let state = AppState::new(pool, repository, config.network.clone());

    let listen: SocketAddr = config.listen.parse().context("parsing listen address")?;
    let endpoint = transport::build_server_endpoint(listen, config.cert_file.as_deref(), config.key_file.as_deref())
        .context("building quinn endpoint")?;

    info!(%listen, overlay_cidr = %config.network.overlay_cidr, "coordinator ready");

    let reaper_state = state.clone();
    tokio::spawn(async move { rpc::run_heartbeat_reaper(reaper_state).await });

    rpc::serve(endpoint, state).await;
    Ok(())
}
