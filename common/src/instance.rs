use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::StageError;
use crate::mpc::{MpcParty, MpcRunHandle};

pub type InstanceId = String;

/// Lado del protocolo de dos partes que representa este proceso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivateComputationRole {
    Partner,
    Publisher,
}

impl PrivateComputationRole {
    /// El publisher levanta los servidores del protocolo, el partner se conecta como cliente.
    pub fn mpc_party(self) -> MpcParty {
        match self {
            PrivateComputationRole::Publisher => MpcParty::Server,
            PrivateComputationRole::Partner => MpcParty::Client,
        }
    }
}

impl FromStr for PrivateComputationRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "partner" => Ok(Self::Partner),
            "publisher" => Ok(Self::Publisher),
            other => Err(format!("rol desconocido: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivateComputationGameType {
    Lift,
    Attribution,
    PrivateIdDfca,
}

impl FromStr for PrivateComputationGameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lift" => Ok(Self::Lift),
            "attribution" => Ok(Self::Attribution),
            "private_id_dfca" => Ok(Self::PrivateIdDfca),
            other => Err(format!("game type desconocido: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivateComputationInstanceStatus {
    Created,

    ComputationStarted,
    ComputationCompleted,
    ComputationFailed,

    Pcf2LiftStarted,
    Pcf2LiftCompleted,
    Pcf2LiftFailed,

    DecoupledAttributionStarted,
    DecoupledAttributionCompleted,
    DecoupledAttributionFailed,

    PrivateIdDfcaAggregationStarted,
    PrivateIdDfcaAggregationCompleted,
    PrivateIdDfcaAggregationFailed,
}

impl PrivateComputationInstanceStatus {
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::ComputationFailed
                | Self::Pcf2LiftFailed
                | Self::DecoupledAttributionFailed
                | Self::PrivateIdDfcaAggregationFailed
        )
    }
}

/// Flags opcionales del protocolo. Se copian tal cual en cada descriptor
/// para que ambas partes activen exactamente el mismo comportamiento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcsFeature {
    PcsDummy,
    PrivateLiftUnifiedDataProcess,
    PrivateAttributionMrPid,
    NumMpcContainerMutation,
    PidSnmkFix,
}

impl PcsFeature {
    pub fn as_str(self) -> &'static str {
        match self {
            PcsFeature::PcsDummy => "pcs_dummy",
            PcsFeature::PrivateLiftUnifiedDataProcess => "private_lift_unified_data_process",
            PcsFeature::PrivateAttributionMrPid => "private_attribution_mr_pid",
            PcsFeature::NumMpcContainerMutation => "num_mpc_container_mutation",
            PcsFeature::PidSnmkFix => "pid_snmk_fix",
        }
    }
}

impl fmt::Display for PcsFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PcsFeature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcs_dummy" => Ok(Self::PcsDummy),
            "private_lift_unified_data_process" => Ok(Self::PrivateLiftUnifiedDataProcess),
            "private_attribution_mr_pid" => Ok(Self::PrivateAttributionMrPid),
            "num_mpc_container_mutation" => Ok(Self::NumMpcContainerMutation),
            "pid_snmk_fix" => Ok(Self::PidSnmkFix),
            other => Err(format!("feature desconocida: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: PrivateComputationInstanceStatus,
    pub status_update_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    pub instance_id: InstanceId,
    pub role: PrivateComputationRole,
    pub status: PrivateComputationInstanceStatus,
    /// Unix seconds del último cambio de status
    pub status_update_ts: i64,

    /// Handles de cada corrida MPC, en orden de envío (no por stage)
    pub instances: Vec<MpcRunHandle>,

    pub game_type: PrivateComputationGameType,
    pub num_pid_containers: u32,
    pub num_mpc_containers: u32,
    pub num_files_per_mpc_container: u32,

    /// Historial append-only de status
    pub status_updates: Vec<StatusUpdate>,

    /// Asignado al crear la instancia, igual para todos los stages
    pub run_id: String,
    pub pcs_features: BTreeSet<PcsFeature>,

    pub creation_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonProductConfig {
    pub input_path: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConfig {
    pub common: CommonProductConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateComputationInstance {
    pub infra_config: InfraConfig,
    pub product_config: ProductConfig,
}

/// Lo que manda el CLI para crear una instancia nueva.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub instance_id: InstanceId,
    pub role: PrivateComputationRole,
    pub game_type: PrivateComputationGameType,
    pub input_path: String,
    pub output_dir: String,
    pub num_pid_containers: u32,
    pub num_mpc_containers: u32,
    pub num_files_per_mpc_container: u32,

    /// Si viene vacío se genera un UUID nuevo. Las dos partes deben usar el mismo.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub pcs_features: BTreeSet<PcsFeature>,
}

/// Pedido para correr un stage sobre una instancia existente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStageRequest {
    /// Una ip de contenedor de la otra parte por shard
    #[serde(default)]
    pub server_ips: Vec<String>,
    /// false = arrancar y volver sin esperar el final de la corrida
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStageResponse {
    pub instance: PrivateComputationInstance,
    pub run: MpcRunHandle,
}

impl PrivateComputationInstance {
    pub fn create(req: CreateInstanceRequest) -> Result<Self, StageError> {
        if req.instance_id.trim().is_empty() {
            return Err(StageError::InvalidInput("instance_id vacío".into()));
        }
        if req.output_dir.trim().is_empty() || req.input_path.trim().is_empty() {
            return Err(StageError::InvalidInput(
                "input_path y output_dir son obligatorios".into(),
            ));
        }
        for (name, n) in [
            ("num_pid_containers", req.num_pid_containers),
            ("num_mpc_containers", req.num_mpc_containers),
            ("num_files_per_mpc_container", req.num_files_per_mpc_container),
        ] {
            if n == 0 {
                return Err(StageError::InvalidInput(format!("{name} debe ser > 0")));
            }
        }

        let now = Utc::now().timestamp();
        let run_id = req
            .run_id
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let status = PrivateComputationInstanceStatus::Created;
        Ok(Self {
            infra_config: InfraConfig {
                instance_id: req.instance_id,
                role: req.role,
                status,
                status_update_ts: now,
                instances: Vec::new(),
                game_type: req.game_type,
                num_pid_containers: req.num_pid_containers,
                num_mpc_containers: req.num_mpc_containers,
                num_files_per_mpc_container: req.num_files_per_mpc_container,
                status_updates: vec![StatusUpdate {
                    status,
                    status_update_ts: now,
                }],
                run_id,
                pcs_features: req.pcs_features,
                creation_ts: now,
            },
            product_config: ProductConfig {
                common: CommonProductConfig {
                    input_path: req.input_path,
                    output_dir: req.output_dir,
                },
            },
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.infra_config.instance_id
    }

    pub fn status(&self) -> PrivateComputationInstanceStatus {
        self.infra_config.status
    }

    /// Cambia el status y agrega una entrada al historial.
    /// El timestamp nunca retrocede respecto de la última entrada.
    pub fn update_status(&mut self, status: PrivateComputationInstanceStatus) {
        let now = Utc::now().timestamp();
        self.update_status_at(status, now);
    }

    fn update_status_at(&mut self, status: PrivateComputationInstanceStatus, ts: i64) {
        let last_ts = self
            .infra_config
            .status_updates
            .last()
            .map(|u| u.status_update_ts)
            .unwrap_or(i64::MIN);
        let ts = ts.max(last_ts).max(self.infra_config.status_update_ts);

        self.infra_config.status = status;
        self.infra_config.status_update_ts = ts;
        self.infra_config.status_updates.push(StatusUpdate {
            status,
            status_update_ts: ts,
        });
    }

    /// Índice del último handle registrado para `run_id`, si hay.
    pub fn latest_mpc_instance(&self, run_id: &str) -> Option<(usize, &MpcRunHandle)> {
        self.infra_config
            .instances
            .iter()
            .enumerate()
            .rev()
            .find(|(_, h)| h.instance_id == run_id)
    }

    /// Agrega un handle al final de la lista y devuelve su posición.
    pub fn append_mpc_instance(&mut self, handle: MpcRunHandle) -> usize {
        self.infra_config.instances.push(handle);
        self.infra_config.instances.len() - 1
    }

    /// Refresca el snapshot de un handle ya registrado (misma corrida, mismo lugar).
    /// La lista no cambia de largo ni de orden.
    pub fn refresh_mpc_instance(&mut self, index: usize, handle: MpcRunHandle) -> bool {
        match self.infra_config.instances.get_mut(index) {
            Some(slot) if slot.instance_id == handle.instance_id => {
                *slot = handle;
                true
            }
            _ => false,
        }
    }

    /* --------- rutas derivadas --------- */

    fn out_dir(&self) -> String {
        format!(
            "{}/{}_out_dir",
            self.product_config.common.output_dir.trim_end_matches('/'),
            self.infra_config.instance_id
        )
    }

    pub fn data_processing_output_path(&self) -> String {
        format!("{}/data_processing_stage/out.csv", self.out_dir())
    }

    pub fn compute_stage_output_base_path(&self) -> String {
        format!("{}/compute_stage/out.json", self.out_dir())
    }

    pub fn pcf2_lift_stage_output_base_path(&self) -> String {
        format!("{}/pcf2_lift_stage/out.json", self.out_dir())
    }

    pub fn decoupled_attribution_stage_output_base_path(&self) -> String {
        format!("{}/decoupled_attribution_stage/out.json", self.out_dir())
    }

    pub fn private_id_dfca_aggregate_stage_output_path(&self) -> String {
        format!("{}/private_id_dfca_aggregate_stage/out.json", self.out_dir())
    }
}
