use serde::{Deserialize, Serialize};

use crate::binary_config::OneDockerBinaryConfig;
use crate::game_args::GameArgs;
use crate::mpc::MpcParty;

pub type TaskId = String;

/// Un shard de una corrida MPC, tal como lo recibe un worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTask {
    pub id: TaskId,
    /// Corrida a la que pertenece (`{instance_id}_{stage}`)
    pub run_id: String,
    pub game_name: String,
    pub mpc_party: MpcParty,
    pub shard_index: u32,
    pub attempt: u32,

    pub game_args: GameArgs,
    /// Servidor de la otra parte para este shard (sólo del lado cliente)
    pub server_ip: Option<String>,
    pub binary: OneDockerBinaryConfig,
}

impl ShardTask {
    /// Ruta del binario del game dentro del contenedor.
    pub fn binary_path(&self) -> String {
        format!("{}{}", self.binary.repository_path, self.game_name)
    }

    /// Argumentos completos: los del game más el servidor a contactar.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.game_args.to_cli_args();
        args.push(format!("--party={:?}", self.mpc_party).to_lowercase());
        if let Some(ip) = &self.server_ip {
            args.push(format!("--server_ip={ip}"));
        }
        args
    }
}
