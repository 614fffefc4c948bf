mod config;
mod failover;
mod handlers;
mod mpc_service;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use common::{BinaryConfigMap, LocalInstanceRepository};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::CoordinatorConfig;
use crate::mpc_service::LocalMpcService;
use crate::state::AppState;

pub const MAX_TASK_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("pcs_coordinator=debug,common=debug,tower_http=info,axum=info")
        }))
        .init();

    let cfg = CoordinatorConfig::from_env();
    info!("config: {:?}", cfg);

    let binary_configs = match &cfg.binary_config_path {
        Some(path) => BinaryConfigMap::load_from_file(path)?,
        None => BinaryConfigMap::default(),
    };

    let repository = Arc::new(LocalInstanceRepository::new(&cfg.instance_dir));
    let mpc = Arc::new(LocalMpcService::new(cfg.mpc_run_timeout, MAX_TASK_ATTEMPTS));
    let state = AppState::new(repository, Arc::new(binary_configs), mpc.clone());

    let app = handlers::build_router(state);

    // failover de workers en segundo plano
    tokio::spawn(failover::run_failover_loop(
        mpc,
        cfg.failover_sweep_interval,
        cfg.worker_heartbeat_timeout,
    ));

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", cfg.listen_addr))?;
    info!("coordinator escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
