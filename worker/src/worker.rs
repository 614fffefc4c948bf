use anyhow::Result;
use common::{
    ShardTask, TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest,
    WorkerHeartbeatRequest, WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::{env, sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_SIMULATED_SECS: u64 = 2;

#[derive(Debug, Clone)]
struct WorkerConfig {
    base_url: String,
    max_concurrency: u32,
    /// Duración de un shard cuando el binario del game no está instalado
    simulated: Duration,
}

impl WorkerConfig {
    fn from_env() -> Self {
        let base_url = env::var("MASTER_BASE_URL")
            .unwrap_or_else(|_| "http://coordinator:8080".to_string());

        let max_concurrency: u32 = env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

        let simulated_secs: u64 = env::var("WORKER_SIMULATED_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SIMULATED_SECS);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            max_concurrency,
            simulated: Duration::from_secs(simulated_secs),
        }
    }
}

async fn register(client: &Client, cfg: &WorkerConfig, hostname: &str) -> Result<String> {
    let register_url = format!("{}/api/v1/workers/register", cfg.base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname: hostname.to_string(),
            max_concurrency: cfg.max_concurrency,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;
    Ok(worker_id)
}

/// Loop principal del worker.
/// - Se registra en el coordinator.
/// - Hace heartbeats periódicos con CPU y memoria.
/// - Pide shards mientras tenga "slots" libres.
/// - Ejecuta cada shard en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mpc_worker=debug,reqwest=info")),
        )
        .init();

    let cfg = WorkerConfig::from_env();
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let mut worker_id = register(&client, &cfg, &hostname).await?;
    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id, cfg.max_concurrency, cfg.base_url
    );

    let sem = Arc::new(Semaphore::new(cfg.max_concurrency as usize));
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let hb_url = format!("{}/api/v1/workers/heartbeat", cfg.base_url);
        let hb = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
                mem_bytes: Some(sys.used_memory()),
            })
            .send()
            .await;

        match hb {
            // el coordinator se reinició y no nos conoce
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                warn!("coordinator no conoce al worker {}, re-registrando", worker_id);
                worker_id = register(&client, &cfg, &hostname).await?;
                info!("worker re-registrado con id {}", worker_id);
            }
            Ok(_) => {}
            Err(e) => warn!("heartbeat falló: {}", e),
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let assign_url = format!("{}/api/v1/tasks/next", cfg.base_url);
        let assignment: TaskAssignmentResponse = match client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
        {
            Ok(res) => res.json().await?,
            Err(e) => {
                warn!("no se pudo pedir tarea: {}", e);
                drop(permit);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let Some(task) = assignment.task else {
            drop(permit);
            sleep(Duration::from_secs(2)).await;
            continue;
        };

        info!(
            "tengo shard {} de la corrida {} (attempt={}, input={})",
            task.shard_index, task.run_id, task.attempt, task.game_args.input_path
        );

        let client = client.clone();
        let base_url = cfg.base_url.clone();
        let simulated = cfg.simulated;

        tokio::spawn(async move {
            let success = execute_task(&task, simulated).await;

            let complete_url = format!("{}/api/v1/tasks/complete", base_url);
            if let Err(e) = client
                .post(&complete_url)
                .json(&TaskCompleteRequest {
                    task_id: task.id.clone(),
                    success,
                })
                .send()
                .await
            {
                warn!("no se pudo reportar el shard {}: {}", task.id, e);
            }

            drop(permit);
        });
    }
}

/// Corre el binario del game con los argumentos del shard.
/// Si el binario no está instalado en este host, simula el trabajo.
async fn execute_task(task: &ShardTask, simulated: Duration) -> bool {
    let binary = task.binary_path();

    if !Path::new(&binary).exists() {
        info!(
            "binario {} no encontrado, simulando shard {} por {:?}",
            binary, task.id, simulated
        );
        sleep(simulated).await;
        return true;
    }

    let output = Command::new(&binary)
        .args(task.command_args())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            info!("shard {} terminó bien", task.id);
            true
        }
        Ok(out) => {
            warn!(
                "shard {} salió con {}: {}",
                task.id,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("no se pudo lanzar {}: {}", binary, e);
            false
        }
    }
}
