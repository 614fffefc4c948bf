use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binary_config::OneDockerBinaryConfig;
use crate::game_args::GameArgs;

/// Lado de la corrida MPC: los servidores escuchan, los clientes se conectan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MpcParty {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MpcRunStatus {
    Created,
    Started,
    Completed,
    Failed,
    Canceled,
}

impl MpcRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MpcRunStatus::Completed | MpcRunStatus::Failed | MpcRunStatus::Canceled
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, MpcRunStatus::Failed | MpcRunStatus::Canceled)
    }
}

/// Referencia a una corrida distribuida. El dueño es el cliente MPC;
/// la instancia sólo guarda una copia para auditoría.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpcRunHandle {
    /// Identificador derivado `{instance_id}_{stage}`
    pub instance_id: String,
    pub game_name: String,
    pub mpc_party: MpcParty,
    pub num_workers: u32,
    pub server_ips: Vec<String>,
    pub status: MpcRunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MpcRunHandle {
    pub fn new(
        instance_id: impl Into<String>,
        game_name: impl Into<String>,
        mpc_party: MpcParty,
        num_workers: u32,
        server_ips: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            game_name: game_name.into(),
            mpc_party,
            num_workers,
            server_ips,
            status: MpcRunStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: MpcRunStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }
}

/// Todo lo necesario para registrar una corrida. Las dos partes construyen
/// su propio request y los `game_args` tienen que coincidir shard a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpcRunRequest {
    pub instance_id: String,
    pub game_name: String,
    pub mpc_party: MpcParty,
    pub num_workers: u32,
    pub game_args: Vec<GameArgs>,
    pub server_ips: Vec<String>,
    pub binary: OneDockerBinaryConfig,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MpcClientError {
    #[error("mpc run {0} not found")]
    NotFound(String),
    #[error("mpc run rejected: {0}")]
    Rejected(String),
    #[error("mpc run {0} timed out")]
    Timeout(String),
    #[error("mpc transport error: {0}")]
    Transport(String),
}

/// Frontera con el runtime MPC: único punto que lanza procesos o habla por red.
#[async_trait]
pub trait MpcRunClient: Send + Sync {
    async fn lookup(&self, run_id: &str) -> Result<MpcRunHandle, MpcClientError>;

    /// Registro sincrónico: no implica que los workers hayan arrancado.
    async fn create(&self, request: MpcRunRequest) -> Result<MpcRunHandle, MpcClientError>;

    /// Arranca la corrida y vuelve enseguida.
    async fn start(&self, run_id: &str) -> Result<MpcRunHandle, MpcClientError>;

    /// Arranca (si hace falta) y espera a que todos los shards terminen.
    async fn start_and_await(&self, run_id: &str) -> Result<MpcRunHandle, MpcClientError>;
}
