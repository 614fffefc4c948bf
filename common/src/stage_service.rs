use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::binary_config::BinaryConfigMap;
use crate::error::StageError;
use crate::game_args::build_game_args;
use crate::instance::{PrivateComputationInstance, PrivateComputationInstanceStatus};
use crate::mpc::{MpcClientError, MpcParty, MpcRunClient, MpcRunHandle, MpcRunRequest, MpcRunStatus};
use crate::repository::InstanceRepository;
use crate::stage::StageSpec;

/// Orquesta un stage MPC sobre una instancia:
/// lookup idempotente -> game args -> create -> start/await -> historial.
///
/// Una misma instancia no puede tener dos `run_async` en vuelo; quien llama
/// serializa por instance id.
pub struct StageService {
    stage: &'static StageSpec,
    binary_configs: Arc<BinaryConfigMap>,
    mpc: Arc<dyn MpcRunClient>,
    repository: Arc<dyn InstanceRepository>,
    wait_for_completion: bool,
}

impl StageService {
    pub fn new(
        stage: &'static StageSpec,
        binary_configs: Arc<BinaryConfigMap>,
        mpc: Arc<dyn MpcRunClient>,
        repository: Arc<dyn InstanceRepository>,
    ) -> Self {
        Self {
            stage,
            binary_configs,
            mpc,
            repository,
            wait_for_completion: true,
        }
    }

    /// No espera a que la corrida termine: deja la instancia en el status
    /// "started" del stage. `update_status` completa la transición después.
    pub fn fire_and_forget(mut self) -> Self {
        self.wait_for_completion = false;
        self
    }

    pub fn stage(&self) -> &'static StageSpec {
        self.stage
    }

    pub async fn run_async(
        &self,
        instance: &mut PrivateComputationInstance,
        server_ips: &[String],
    ) -> Result<MpcRunHandle, StageError> {
        let stage = self.stage;
        let infra = &instance.infra_config;

        if !stage.supports(infra.game_type) {
            return Err(StageError::InvalidInput(format!(
                "stage {} no aplica a game type {:?}",
                stage.name, infra.game_type
            )));
        }

        let num_shards = (stage.num_shards)(infra);
        if num_shards == 0 {
            return Err(StageError::InvalidInput(format!(
                "stage {} sin contenedores configurados",
                stage.name
            )));
        }

        // el cliente necesita una ip de servidor por shard; el servidor puede no mandar ninguna
        let party = infra.role.mpc_party();
        let needs_ips = party == MpcParty::Client || !server_ips.is_empty();
        if needs_ips && server_ips.len() != num_shards as usize {
            return Err(StageError::InvalidInput(format!(
                "se esperaban {} server ips, llegaron {}",
                num_shards,
                server_ips.len()
            )));
        }

        let run_id = stage.run_id_for(instance);

        match self.mpc.lookup(&run_id).await {
            Ok(existing) => match existing.status {
                MpcRunStatus::Completed => {
                    info!("corrida {} ya completada, no se reenvía", run_id);
                    return Ok(existing);
                }
                MpcRunStatus::Created | MpcRunStatus::Started => {
                    info!(
                        "corrida {} ya existe en estado {:?}, se retoma la espera",
                        run_id, existing.status
                    );
                    return self.resume(instance, existing).await;
                }
                MpcRunStatus::Failed | MpcRunStatus::Canceled => {
                    warn!(
                        "corrida previa {} terminó en {:?}, se reenvía",
                        run_id, existing.status
                    );
                }
            },
            Err(MpcClientError::NotFound(_)) => {
                debug!("no hay corrida {} todavía, se crea", run_id);
            }
            Err(source) => return Err(StageError::Lookup { run_id, source }),
        }

        self.submit(instance, run_id, num_shards, server_ips).await
    }

    /// Refresca una corrida lanzada en modo fire-and-forget. Si terminó,
    /// pasa la instancia a completed/failed. Devuelve el status resultante.
    pub async fn update_status(
        &self,
        instance: &mut PrivateComputationInstance,
    ) -> Result<PrivateComputationInstanceStatus, StageError> {
        let stage = self.stage;
        if instance.status() != stage.started_status {
            return Ok(instance.status());
        }

        let run_id = stage.run_id_for(instance);
        let handle = match self.mpc.lookup(&run_id).await {
            Ok(h) => h,
            Err(MpcClientError::NotFound(_)) => {
                warn!("instancia {} en {:?} pero la corrida {} no existe", instance.instance_id(), instance.status(), run_id);
                return Ok(instance.status());
            }
            Err(source) => return Err(StageError::Lookup { run_id, source }),
        };

        if !handle.status.is_terminal() {
            return Ok(instance.status());
        }

        let next = if handle.status == MpcRunStatus::Completed {
            stage.completed_status
        } else {
            stage.failed_status
        };
        self.record_handle(instance, handle);
        instance.update_status(next);
        self.repository.update(instance).await?;

        info!("instancia {} pasa a {:?}", instance.instance_id(), next);
        Ok(next)
    }

    async fn submit(
        &self,
        instance: &mut PrivateComputationInstance,
        run_id: String,
        num_shards: u32,
        server_ips: &[String],
    ) -> Result<MpcRunHandle, StageError> {
        let stage = self.stage;
        let role = instance.infra_config.role;

        let binary = self.binary_configs.resolve(role).clone();
        let output_base = (stage.output_base_path)(instance);
        let game_args = build_game_args(instance, stage.input_suffix, &output_base, num_shards)?;

        let request = MpcRunRequest {
            instance_id: run_id.clone(),
            game_name: stage.game_name.to_string(),
            mpc_party: role.mpc_party(),
            num_workers: num_shards,
            game_args,
            server_ips: server_ips.to_vec(),
            binary,
        };

        let handle = match self.mpc.create(request).await {
            Ok(h) => h,
            Err(source) => {
                warn!("el cliente MPC rechazó {}: {}", run_id, source);
                instance.update_status(stage.failed_status);
                self.repository.update(instance).await?;
                return Err(StageError::Submission { run_id, source });
            }
        };

        info!(
            "corrida {} creada (game={}, workers={}, party={:?})",
            handle.instance_id, handle.game_name, handle.num_workers, handle.mpc_party
        );

        // el handle queda registrado antes de arrancar: si se cancela la espera,
        // un reintento lo encuentra por lookup y no vuelve a crear
        let index = instance.append_mpc_instance(handle.clone());
        self.repository.update(instance).await?;

        self.drive(instance, index, handle).await
    }

    async fn resume(
        &self,
        instance: &mut PrivateComputationInstance,
        existing: MpcRunHandle,
    ) -> Result<MpcRunHandle, StageError> {
        let index = match instance.latest_mpc_instance(&existing.instance_id) {
            Some((i, recorded)) if !recorded.status.is_terminal() => i,
            _ => {
                let i = instance.append_mpc_instance(existing.clone());
                self.repository.update(instance).await?;
                i
            }
        };
        self.drive(instance, index, existing).await
    }

    async fn drive(
        &self,
        instance: &mut PrivateComputationInstance,
        index: usize,
        handle: MpcRunHandle,
    ) -> Result<MpcRunHandle, StageError> {
        let stage = self.stage;
        let run_id = handle.instance_id.clone();

        if !self.wait_for_completion {
            return match self.mpc.start(&run_id).await {
                Ok(started) => {
                    instance.refresh_mpc_instance(index, started.clone());
                    instance.update_status(stage.started_status);
                    self.repository.update(instance).await?;
                    info!("corrida {} arrancada sin esperar", run_id);
                    Ok(started)
                }
                Err(e) => {
                    self.refresh_snapshot(instance, index, &run_id).await;
                    self.fail(instance, run_id, e.to_string()).await
                }
            };
        }

        match self.mpc.start_and_await(&run_id).await {
            Ok(done) if done.status == MpcRunStatus::Completed => {
                instance.refresh_mpc_instance(index, done.clone());
                instance.update_status(stage.completed_status);
                self.repository.update(instance).await?;
                info!(
                    "stage {} completado para {}",
                    stage.name,
                    instance.instance_id()
                );
                Ok(done)
            }
            Ok(done) => {
                let reason = format!("terminal status {:?}", done.status);
                instance.refresh_mpc_instance(index, done);
                self.fail(instance, run_id, reason).await
            }
            Err(e) => {
                self.refresh_snapshot(instance, index, &run_id).await;
                self.fail(instance, run_id, e.to_string()).await
            }
        }
    }

    /// Trae el último estado de la corrida al handle registrado. Si el
    /// cliente tampoco responde, el snapshot queda como estaba.
    async fn refresh_snapshot(
        &self,
        instance: &mut PrivateComputationInstance,
        index: usize,
        run_id: &str,
    ) {
        match self.mpc.lookup(run_id).await {
            Ok(current) => {
                instance.refresh_mpc_instance(index, current);
            }
            Err(e) => debug!("no se pudo refrescar {}: {}", run_id, e),
        }
    }

    async fn fail(
        &self,
        instance: &mut PrivateComputationInstance,
        run_id: String,
        reason: String,
    ) -> Result<MpcRunHandle, StageError> {
        warn!("corrida {} falló: {}", run_id, reason);
        instance.update_status(self.stage.failed_status);
        self.repository.update(instance).await?;
        Err(StageError::RunFailure { run_id, reason })
    }

    fn record_handle(&self, instance: &mut PrivateComputationInstance, handle: MpcRunHandle) {
        let index = instance
            .latest_mpc_instance(&handle.instance_id)
            .map(|(i, _)| i);
        match index {
            Some(i) => {
                instance.refresh_mpc_instance(i, handle);
            }
            None => {
                instance.append_mpc_instance(handle);
            }
        }
    }
}
