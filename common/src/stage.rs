use crate::instance::{
    InfraConfig, PrivateComputationGameType, PrivateComputationInstance,
    PrivateComputationInstanceStatus as Status,
};

/// Nombres de los games MPC. Son convención entre las dos partes:
/// si no coinciden es un error de despliegue, no de runtime.
pub mod game_names {
    pub const LIFT: &str = "lift";
    pub const PCF2_LIFT: &str = "pcf2_lift";
    pub const DECOUPLED_ATTRIBUTION: &str = "decoupled_attribution";
    pub const PRIVATE_ID_DFCA_AGGREGATION: &str = "private_id_dfca_aggregation";
}

/// Descripción estática de un stage MPC.
pub struct StageSpec {
    pub name: &'static str,
    pub game_name: &'static str,
    /// Sufijo que se agrega a la salida de data processing para leer el input
    pub input_suffix: &'static str,
    pub output_base_path: fn(&PrivateComputationInstance) -> String,
    pub num_shards: fn(&InfraConfig) -> u32,
    pub started_status: Status,
    pub completed_status: Status,
    pub failed_status: Status,
    pub game_types: &'static [PrivateComputationGameType],
}

impl StageSpec {
    /// Identificador canónico de la corrida de este stage para una instancia.
    pub fn run_id_for(&self, instance: &PrivateComputationInstance) -> String {
        format!("{}_{}", instance.infra_config.instance_id, self.name)
    }

    pub fn supports(&self, game_type: PrivateComputationGameType) -> bool {
        self.game_types.contains(&game_type)
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("game_name", &self.game_name)
            .finish()
    }
}

fn mpc_containers(infra: &InfraConfig) -> u32 {
    infra.num_mpc_containers
}

pub static COMPUTE_STAGE: StageSpec = StageSpec {
    name: "compute",
    game_name: game_names::LIFT,
    input_suffix: "combine",
    output_base_path: PrivateComputationInstance::compute_stage_output_base_path,
    num_shards: mpc_containers,
    started_status: Status::ComputationStarted,
    completed_status: Status::ComputationCompleted,
    failed_status: Status::ComputationFailed,
    game_types: &[PrivateComputationGameType::Lift],
};

pub static PCF2_LIFT_STAGE: StageSpec = StageSpec {
    name: "pcf2_lift",
    game_name: game_names::PCF2_LIFT,
    input_suffix: "combine",
    output_base_path: PrivateComputationInstance::pcf2_lift_stage_output_base_path,
    num_shards: mpc_containers,
    started_status: Status::Pcf2LiftStarted,
    completed_status: Status::Pcf2LiftCompleted,
    failed_status: Status::Pcf2LiftFailed,
    game_types: &[PrivateComputationGameType::Lift],
};

pub static DECOUPLED_ATTRIBUTION_STAGE: StageSpec = StageSpec {
    name: "decoupled_attribution",
    game_name: game_names::DECOUPLED_ATTRIBUTION,
    input_suffix: "combine",
    output_base_path: PrivateComputationInstance::decoupled_attribution_stage_output_base_path,
    num_shards: mpc_containers,
    started_status: Status::DecoupledAttributionStarted,
    completed_status: Status::DecoupledAttributionCompleted,
    failed_status: Status::DecoupledAttributionFailed,
    game_types: &[PrivateComputationGameType::Attribution],
};

pub static PRIVATE_ID_DFCA_AGGREGATE_STAGE: StageSpec = StageSpec {
    name: "private_id_dfca_aggregate",
    game_name: game_names::PRIVATE_ID_DFCA_AGGREGATION,
    input_suffix: "combine",
    output_base_path: PrivateComputationInstance::private_id_dfca_aggregate_stage_output_path,
    num_shards: mpc_containers,
    started_status: Status::PrivateIdDfcaAggregationStarted,
    completed_status: Status::PrivateIdDfcaAggregationCompleted,
    failed_status: Status::PrivateIdDfcaAggregationFailed,
    game_types: &[PrivateComputationGameType::PrivateIdDfca],
};

pub static ALL_STAGES: [&StageSpec; 4] = [
    &COMPUTE_STAGE,
    &PCF2_LIFT_STAGE,
    &DECOUPLED_ATTRIBUTION_STAGE,
    &PRIVATE_ID_DFCA_AGGREGATE_STAGE,
];

pub fn find_stage(name: &str) -> Option<&'static StageSpec> {
    ALL_STAGES.iter().copied().find(|s| s.name == name)
}

/// Stage cuya corrida sigue en vuelo cuando la instancia quedó en `status`.
pub fn stage_started_with(status: Status) -> Option<&'static StageSpec> {
    ALL_STAGES
        .iter()
        .copied()
        .find(|s| s.started_status == status)
}
