use common::{
    BinaryConfigMap, InstanceRepository, MpcRunClient, ShardTask, StageService, StageSpec, WorkerId,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};
use tokio::sync::OwnedMutexGuard;

use crate::mpc_service::LocalMpcService;

#[derive(Clone)]
pub struct AppState {
    pub instances: Arc<dyn InstanceRepository>,
    pub binary_configs: Arc<BinaryConfigMap>,
    pub mpc: Arc<LocalMpcService>,
    // una sola operación de stage en vuelo por instancia
    pub instance_locks: InstanceLocks,
}

impl AppState {
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        binary_configs: Arc<BinaryConfigMap>,
        mpc: Arc<LocalMpcService>,
    ) -> Self {
        Self {
            instances,
            binary_configs,
            mpc,
            instance_locks: InstanceLocks::default(),
        }
    }

    pub fn stage_service(&self, stage: &'static StageSpec) -> StageService {
        let mpc: Arc<dyn MpcRunClient> = self.mpc.clone();
        StageService::new(
            stage,
            self.binary_configs.clone(),
            mpc,
            self.instances.clone(),
        )
    }
}

/// Un mutex async por instance id.
#[derive(Clone, Default)]
pub struct InstanceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl InstanceLocks {
    fn slot(&self, instance_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = lock(&self.inner);
        // sin guard ni espera, el mapa es el único dueño
        map.retain(|_, m| Arc::strong_count(m) > 1);
        map.entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        self.slot(instance_id).lock_owned().await
    }

    /// None si hay otra operación en vuelo sobre la instancia.
    pub fn try_lock(&self, instance_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(instance_id).try_lock_owned().ok()
    }
}

/// Toma el lock aunque otro hilo haya hecho panic con él tomado.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: ShardTask,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn instance_locks_serializa_la_misma_instancia() {
        let locks = InstanceLocks::default();
        let guard = locks.lock("a").await;

        // otra instancia no espera
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(other.is_ok());

        // la misma sí
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(same.is_err());
        assert!(locks.try_lock("a").is_none());

        drop(guard);
        assert!(locks.try_lock("a").is_some());
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(same.is_ok());
    }

    #[tokio::test]
    async fn instance_locks_no_acumula_ids_sueltos() {
        let locks = InstanceLocks::default();
        for i in 0..100 {
            drop(locks.lock(&format!("nadie_{i}")).await);
        }

        let held = locks.lock("vivo").await;
        assert_eq!(lock(&locks.inner).len(), 1);

        // un slot tomado sobrevive a la limpieza
        drop(locks.lock("otro").await);
        assert_eq!(lock(&locks.inner).len(), 2);
        assert!(locks.try_lock("vivo").is_none());
        assert_eq!(lock(&locks.inner).len(), 1);

        drop(held);
        drop(locks.try_lock("x"));
        let map = lock(&locks.inner);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("x"));
    }
}
