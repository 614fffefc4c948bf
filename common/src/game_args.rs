use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::StageError;
use crate::instance::{PcsFeature, PrivateComputationInstance};

/// Argumentos de un shard de una corrida MPC.
///
/// Las dos partes arman sus propios `GameArgs` por separado; el handshake del
/// protocolo sólo funciona si coinciden en orden y contenido.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameArgs {
    pub input_path: String,
    pub output_path: String,
    /// Igual al instance id en las dos partes, así los logs se correlacionan
    pub run_name: String,
    pub log_cost: bool,
    pub run_id: String,
    pub pc_feature_flags: BTreeSet<PcsFeature>,
}

impl GameArgs {
    /// Argumentos de línea de comando para el binario del contenedor, en orden fijo.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--input_path={}", self.input_path),
            format!("--output_path={}", self.output_path),
            format!("--run_name={}", self.run_name),
            format!("--log_cost={}", self.log_cost),
            format!("--run_id={}", self.run_id),
        ];
        if !self.pc_feature_flags.is_empty() {
            let flags: Vec<&str> = self.pc_feature_flags.iter().map(|f| f.as_str()).collect();
            args.push(format!("--pc_feature_flags={}", flags.join(",")));
        }
        args
    }
}

/// Un descriptor por shard, shards `0..num_shards` en orden.
///
/// input:  `{data_processing_output_path}_{suffix}_{i}`
/// output: `{output_base_path}_{i}`
pub fn build_game_args(
    instance: &PrivateComputationInstance,
    input_suffix: &str,
    output_base_path: &str,
    num_shards: u32,
) -> Result<Vec<GameArgs>, StageError> {
    if num_shards == 0 {
        return Err(StageError::InvalidInput(
            "la cantidad de shards debe ser > 0".into(),
        ));
    }
    if instance.product_config.common.output_dir.trim().is_empty() {
        return Err(StageError::InvalidInput(
            "la instancia no tiene output_dir".into(),
        ));
    }
    if output_base_path.trim().is_empty() {
        return Err(StageError::InvalidInput(
            "ruta de salida del stage vacía".into(),
        ));
    }

    let input_base = instance.data_processing_output_path();
    let infra = &instance.infra_config;

    let args = (0..num_shards)
        .map(|i| GameArgs {
            input_path: format!("{input_base}_{input_suffix}_{i}"),
            output_path: format!("{output_base_path}_{i}"),
            run_name: infra.instance_id.clone(),
            log_cost: true,
            run_id: infra.run_id.clone(),
            pc_feature_flags: infra.pcs_features.clone(),
        })
        .collect();

    Ok(args)
}
