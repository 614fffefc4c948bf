use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    CreateInstanceRequest, MpcRunHandle, PcsFeature, PrivateComputationGameType,
    PrivateComputationInstance, PrivateComputationRole, RunStageRequest, RunStageResponse,
    WorkerMetrics, ALL_STAGES,
};
use reqwest::{Client, Response};
use std::env;

/// - En Docker: MASTER_URL=http://coordinator:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "pcs-cli")]
#[command(about = "CLI para crear instancias y correr stages en el coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crea una instancia nueva en estado CREATED
    Create {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
        /// partner | publisher
        #[arg(long)]
        role: PrivateComputationRole,
        /// lift | attribution | private_id_dfca
        #[arg(long)]
        game_type: PrivateComputationGameType,
        #[arg(long)]
        input_path: String,
        #[arg(long)]
        output_dir: String,
        #[arg(long, default_value_t = 1)]
        num_pid_containers: u32,
        #[arg(long, default_value_t = 1)]
        num_mpc_containers: u32,
        #[arg(long, default_value_t = 1)]
        num_files_per_mpc_container: u32,
        /// Compartido con la otra parte; si falta se genera uno
        #[arg(long)]
        run_id: Option<String>,
        /// Separadas por coma, ej: pcs_dummy,pid_snmk_fix
        #[arg(long, value_delimiter = ',')]
        features: Vec<PcsFeature>,
    },
    /// Muestra el estado de una instancia
    Status {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
    },
    /// Corre un stage MPC sobre una instancia
    RunStage {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
        #[arg(value_name = "STAGE")]
        stage: String,
        /// IPs de los servidores de la otra parte, separadas por coma
        #[arg(long, value_delimiter = ',')]
        server_ips: Vec<String>,
        /// Arranca la corrida y vuelve sin esperar el resultado
        #[arg(long)]
        no_wait: bool,
    },
    /// Lista las corridas MPC registradas en una instancia
    Runs {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
    },
    Workers,
}

async fn error_body(resp: Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let msg = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    format!("status {status}: {msg}")
}

fn print_instance(inst: &PrivateComputationInstance) {
    let infra = &inst.infra_config;
    println!("Instancia:");
    println!("  id        : {}", infra.instance_id);
    println!("  rol       : {:?}", infra.role);
    println!("  game_type : {:?}", infra.game_type);
    println!("  estado    : {:?}", infra.status);
    println!("  run_id    : {}", infra.run_id);
    println!(
        "  contenedores: pid={}, mpc={}, archivos/mpc={}",
        infra.num_pid_containers, infra.num_mpc_containers, infra.num_files_per_mpc_container
    );
    if !infra.pcs_features.is_empty() {
        let features: Vec<&str> = infra.pcs_features.iter().map(|f| f.as_str()).collect();
        println!("  features  : {}", features.join(","));
    }
    println!("  corridas  : {}", infra.instances.len());
    println!("  historial :");
    for u in &infra.status_updates {
        println!("    - {:?} @ {}", u.status, u.status_update_ts);
    }
}

fn print_run(run: &MpcRunHandle) {
    println!(
        "  {} game={} party={:?} workers={} estado={:?} (actualizado {})",
        run.instance_id, run.game_name, run.mpc_party, run.num_workers, run.status, run.updated_at
    );
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Create {
            id,
            role,
            game_type,
            input_path,
            output_dir,
            num_pid_containers,
            num_mpc_containers,
            num_files_per_mpc_container,
            run_id,
            features,
        } => {
            let req = CreateInstanceRequest {
                instance_id: id,
                role,
                game_type,
                input_path,
                output_dir,
                num_pid_containers,
                num_mpc_containers,
                num_files_per_mpc_container,
                run_id,
                pcs_features: features.into_iter().collect(),
            };

            let url = format!("{}/api/v1/instances", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                bail!("no se pudo crear la instancia ({})", error_body(resp).await);
            }
            let inst: PrivateComputationInstance = resp.json().await?;
            print_instance(&inst);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/instances/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("instancia {id} no disponible ({})", error_body(resp).await);
            }
            let inst: PrivateComputationInstance = resp.json().await?;
            print_instance(&inst);
        }

        Commands::RunStage {
            id,
            stage,
            server_ips,
            no_wait,
        } => {
            if !ALL_STAGES.iter().any(|s| s.name == stage) {
                let names: Vec<&str> = ALL_STAGES.iter().map(|s| s.name).collect();
                bail!("stage desconocido {stage}, opciones: {}", names.join(", "));
            }

            let url = format!("{}/api/v1/instances/{}/stages/{}", base_url, id, stage);
            let req = RunStageRequest {
                server_ips,
                wait: !no_wait,
            };
            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                bail!("el stage {stage} falló ({})", error_body(resp).await);
            }
            let out: RunStageResponse = resp.json().await?;
            println!("Corrida:");
            print_run(&out.run);
            print_instance(&out.instance);
        }

        Commands::Runs { id } => {
            let url = format!("{}/api/v1/instances/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("instancia {id} no disponible ({})", error_body(resp).await);
            }
            let inst: PrivateComputationInstance = resp.json().await?;

            if inst.infra_config.instances.is_empty() {
                println!("La instancia {id} no tiene corridas registradas.");
                return Ok(());
            }

            println!("Corridas registradas en {id}:");
            for recorded in &inst.infra_config.instances {
                print_run(recorded);

                // estado vivo según el coordinator
                let url = format!("{}/api/v1/runs/{}", base_url, recorded.instance_id);
                match client.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        let live: MpcRunHandle = resp.json().await?;
                        println!("    en vivo: {:?}", live.status);
                    }
                    Ok(resp) => println!("    en vivo: ({})", resp.status()),
                    Err(e) => println!("    en vivo: error {e}"),
                }
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("error consultando /api/v1/workers ({})", error_body(resp).await);
            }
            let workers: Vec<WorkerMetrics> = resp.json().await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  concurrency    : max={}, activos={}",
                    w.max_concurrency, w.active_tasks
                );
                println!(
                    "  shards         : started={}, ok={}, failed={}",
                    w.tasks_started, w.tasks_succeeded, w.tasks_failed
                );
                match w.avg_task_ms {
                    Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
                    None => println!("  avg_task_ms    : (sin datos)"),
                }
                match w.cpu_percent {
                    Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                    None => println!("  cpu_percent    : (sin datos)"),
                }
                match w.mem_bytes {
                    Some(mem) => println!("  mem_bytes      : {}", mem),
                    None => println!("  mem_bytes      : (sin datos)"),
                }
                println!();
            }
        }
    }

    Ok(())
}
