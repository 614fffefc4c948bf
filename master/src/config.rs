use std::env;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_INSTANCE_DIR: &str = "/data/instances";
const DEFAULT_MPC_RUN_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;

/// Configuración del coordinator, toda por variables de entorno.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: String,
    /// Directorio donde se guarda un JSON por instancia
    pub instance_dir: String,
    /// JSON opcional con la config de binarios por rol
    pub binary_config_path: Option<String>,
    pub mpc_run_timeout: Duration,
    pub worker_heartbeat_timeout: Duration,
    pub failover_sweep_interval: Duration,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("PCS_LISTEN_ADDR")
                .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string()),
            instance_dir: env::var("PCS_INSTANCE_DIR")
                .unwrap_or_else(|_| DEFAULT_INSTANCE_DIR.to_string()),
            binary_config_path: env::var("PCS_BINARY_CONFIG").ok().filter(|p| !p.is_empty()),
            mpc_run_timeout: secs_from_env("MPC_RUN_TIMEOUT_SECS", DEFAULT_MPC_RUN_TIMEOUT_SECS),
            worker_heartbeat_timeout: secs_from_env(
                "WORKER_HEARTBEAT_TIMEOUT_SECS",
                DEFAULT_WORKER_HEARTBEAT_TIMEOUT_SECS,
            ),
            failover_sweep_interval: secs_from_env(
                "FAILOVER_SWEEP_INTERVAL_SECS",
                DEFAULT_FAILOVER_SWEEP_INTERVAL_SECS,
            ),
        }
    }
}

fn secs_from_env(key: &str, default: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_from_env_usa_default_si_falta_o_es_invalido() {
        std::env::remove_var("PCS_TEST_SECS_MISSING");
        assert_eq!(secs_from_env("PCS_TEST_SECS_MISSING", 7), Duration::from_secs(7));

        std::env::set_var("PCS_TEST_SECS_BAD", "abc");
        assert_eq!(secs_from_env("PCS_TEST_SECS_BAD", 7), Duration::from_secs(7));

        std::env::set_var("PCS_TEST_SECS_ZERO", "0");
        assert_eq!(secs_from_env("PCS_TEST_SECS_ZERO", 7), Duration::from_secs(7));

        std::env::set_var("PCS_TEST_SECS_OK", "42");
        assert_eq!(secs_from_env("PCS_TEST_SECS_OK", 7), Duration::from_secs(42));
    }
}
