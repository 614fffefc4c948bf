use async_trait::async_trait;
use chrono::Utc;
use common::{
    MpcClientError, MpcParty, MpcRunClient, MpcRunHandle, MpcRunRequest, MpcRunStatus, ShardTask,
    TaskId, WorkerHeartbeatRequest, WorkerId, WorkerMetrics,
};
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::{Duration, SystemTime},
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::{lock, InFlight, WorkerMeta};

struct RunEntry {
    handle: MpcRunHandle,
    request: MpcRunRequest,
    // ids de los shards de esta corrida; un reemplazo arranca vacío
    task_ids: HashSet<TaskId>,
    completed_shards: BTreeSet<u32>,
    status_tx: watch::Sender<MpcRunStatus>,
}

impl RunEntry {
    fn owns(&self, task: &ShardTask) -> bool {
        !self.handle.status.is_terminal() && self.task_ids.contains(&task.id)
    }
}

/// Runtime MPC local: cada corrida se parte en un `ShardTask` por worker,
/// los workers los piden por HTTP y reportan cuando terminan.
pub struct LocalMpcService {
    runs: Mutex<HashMap<String, RunEntry>>,
    pub(crate) workers: Mutex<HashMap<WorkerId, WorkerMeta>>,
    // shards pendientes de asignar
    pub(crate) tasks_queue: Mutex<VecDeque<ShardTask>>,
    // shards ya asignados pero no completados
    pub(crate) in_flight: Mutex<HashMap<TaskId, InFlight>>,
    run_timeout: Duration,
    max_task_attempts: u32,
}

impl LocalMpcService {
    pub fn new(run_timeout: Duration, max_task_attempts: u32) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            tasks_queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            run_timeout,
            max_task_attempts,
        }
    }

    /* ---------------- corridas ---------------- */

    fn validate(request: &MpcRunRequest) -> Result<(), MpcClientError> {
        if request.num_workers == 0 {
            return Err(MpcClientError::Rejected("num_workers debe ser > 0".into()));
        }
        if request.game_args.len() != request.num_workers as usize {
            return Err(MpcClientError::Rejected(format!(
                "{} game_args para {} workers",
                request.game_args.len(),
                request.num_workers
            )));
        }
        if request.mpc_party == MpcParty::Client
            && request.server_ips.len() != request.num_workers as usize
        {
            return Err(MpcClientError::Rejected(format!(
                "el cliente necesita {} server ips, llegaron {}",
                request.num_workers,
                request.server_ips.len()
            )));
        }
        Ok(())
    }

    /// Pasa la corrida a Started y encola sus shards. Idempotente.
    fn start_inner(&self, run_id: &str) -> Result<watch::Receiver<MpcRunStatus>, MpcClientError> {
        let mut runs = lock(&self.runs);
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| MpcClientError::NotFound(run_id.to_string()))?;

        if entry.handle.status == MpcRunStatus::Created {
            let tasks: Vec<ShardTask> = entry
                .request
                .game_args
                .iter()
                .enumerate()
                .map(|(i, args)| ShardTask {
                    id: uuid::Uuid::new_v4().to_string(),
                    run_id: run_id.to_string(),
                    game_name: entry.request.game_name.clone(),
                    mpc_party: entry.request.mpc_party,
                    shard_index: i as u32,
                    attempt: 0,
                    game_args: args.clone(),
                    server_ip: entry.request.server_ips.get(i).cloned(),
                    binary: entry.request.binary.clone(),
                })
                .collect();

            entry.task_ids = tasks.iter().map(|t| t.id.clone()).collect();
            entry.handle.status = MpcRunStatus::Started;
            entry.handle.updated_at = Utc::now();
            entry.status_tx.send_replace(MpcRunStatus::Started);

            info!("corrida {} arrancada con {} shards", run_id, tasks.len());
            let mut queue = lock(&self.tasks_queue);
            queue.extend(tasks);
        }

        Ok(entry.status_tx.subscribe())
    }

    /// Cierra una corrida. Si falla, saca de la cola y de in_flight sus shards.
    fn finish_run(&self, run_id: &str, status: MpcRunStatus) {
        {
            let mut runs = lock(&self.runs);
            match runs.get_mut(run_id) {
                Some(entry) if !entry.handle.status.is_terminal() => {
                    entry.handle.status = status;
                    entry.handle.updated_at = Utc::now();
                    entry.status_tx.send_replace(status);
                }
                _ => return,
            }
        }

        if status.is_failure() {
            lock(&self.tasks_queue).retain(|t| t.run_id != run_id);
            lock(&self.in_flight).retain(|_, f| f.task.run_id != run_id);
        }
        info!("corrida {} terminó en {:?}", run_id, status);
    }

    /// Reintenta un shard fallido o, si superó el máximo de intentos, falla la corrida.
    /// Un shard de una corrida que ya terminó o fue reemplazada se descarta.
    pub(crate) fn requeue_or_fail(&self, mut task: ShardTask) {
        let live = lock(&self.runs)
            .get(&task.run_id)
            .is_some_and(|entry| entry.owns(&task));
        if !live {
            info!(
                "descartando shard {} de la corrida {}: ya no está viva",
                task.shard_index, task.run_id
            );
            return;
        }

        if task.attempt + 1 <= self.max_task_attempts {
            task.attempt += 1;
            info!(
                "reencolando shard {} de la corrida {} (attempt={})",
                task.shard_index, task.run_id, task.attempt
            );
            lock(&self.tasks_queue).push_back(task);
        } else {
            warn!(
                "shard {} de la corrida {} superó el máximo de intentos ({}), marcando FAILED",
                task.shard_index, task.run_id, self.max_task_attempts
            );
            self.finish_run(&task.run_id, MpcRunStatus::Failed);
        }
    }

    /* ---------------- workers ---------------- */

    pub fn register_worker(&self, hostname: String, max_concurrency: u32) -> WorkerId {
        let worker_id = uuid::Uuid::new_v4().to_string();
        let max_concurrency = max_concurrency.max(1);

        lock(&self.workers).insert(
            worker_id.clone(),
            WorkerMeta {
                hostname,
                last_heartbeat: SystemTime::now(),
                dead: false,
                max_concurrency,

                tasks_started: 0,
                tasks_succeeded: 0,
                tasks_failed: 0,
                total_task_time_ms: 0,

                last_cpu_percent: None,
                last_mem_bytes: None,
            },
        );

        info!(
            "worker registrado: {} (max_concurrency={})",
            worker_id, max_concurrency
        );
        worker_id
    }

    pub fn heartbeat(&self, req: &WorkerHeartbeatRequest) -> bool {
        let mut workers = lock(&self.workers);
        match workers.get_mut(&req.worker_id) {
            Some(meta) => {
                meta.last_heartbeat = SystemTime::now();
                meta.last_cpu_percent = req.cpu_percent;
                meta.last_mem_bytes = req.mem_bytes;
                if meta.dead {
                    info!("worker {} volvió a mandar heartbeat", req.worker_id);
                    meta.dead = false;
                }
                true
            }
            None => false,
        }
    }

    pub fn next_task(&self, worker_id: &str) -> Option<ShardTask> {
        // 1) Capacidad del worker; si no existe o está muerto no recibe nada
        let max_for_worker = {
            let workers = lock(&self.workers);
            match workers.get(worker_id) {
                Some(meta) if !meta.dead => meta.max_concurrency,
                _ => {
                    warn!("worker desconocido o muerto {} pidió tarea", worker_id);
                    return None;
                }
            }
        };

        // 2) Cuántos shards tiene ya en vuelo
        let active_for_worker = lock(&self.in_flight)
            .values()
            .filter(|entry| entry.worker_id == worker_id)
            .count() as u32;

        if active_for_worker >= max_for_worker {
            return None;
        }

        // 3) Siguiente shard de la cola global
        let task = lock(&self.tasks_queue).pop_front()?;

        info!(
            "asignando shard {} de {} (input={}) al worker {} ({}/{} en vuelo -> +1)",
            task.shard_index,
            task.run_id,
            task.game_args.input_path,
            worker_id,
            active_for_worker,
            max_for_worker,
        );

        lock(&self.in_flight).insert(
            task.id.clone(),
            InFlight {
                task: task.clone(),
                worker_id: worker_id.to_string(),
                started_at: SystemTime::now(),
            },
        );

        if let Some(meta) = lock(&self.workers).get_mut(worker_id) {
            meta.tasks_started += 1;
        }

        Some(task)
    }

    /// Devuelve false si el shard no estaba en vuelo.
    pub fn complete_task(&self, task_id: &str, success: bool) -> bool {
        let Some(inflight) = lock(&self.in_flight).remove(task_id) else {
            return false;
        };

        let duration_ms: u64 = inflight
            .started_at
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        if let Some(meta) = lock(&self.workers).get_mut(&inflight.worker_id) {
            meta.total_task_time_ms += duration_ms;
            if success {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }

        let task = inflight.task;
        if !success {
            self.requeue_or_fail(task);
            return true;
        }

        let all_done = {
            let mut runs = lock(&self.runs);
            match runs.get_mut(&task.run_id) {
                Some(entry) if entry.owns(&task) => {
                    entry.completed_shards.insert(task.shard_index);
                    entry.completed_shards.len() as u32 >= entry.handle.num_workers
                }
                _ => {
                    info!(
                        "ignorando shard {} de la corrida {}: no pertenece a la corrida viva",
                        task.shard_index, task.run_id
                    );
                    false
                }
            }
        };

        if all_done {
            self.finish_run(&task.run_id, MpcRunStatus::Completed);
        }
        true
    }

    pub fn worker_metrics(&self) -> Vec<WorkerMetrics> {
        let now = SystemTime::now();

        let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
        for inf in lock(&self.in_flight).values() {
            *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
        }

        let workers = lock(&self.workers);
        let mut out: Vec<WorkerMetrics> = workers
            .iter()
            .map(|(wid, meta)| {
                let done = meta.tasks_succeeded + meta.tasks_failed;
                WorkerMetrics {
                    worker_id: wid.clone(),
                    hostname: meta.hostname.clone(),
                    dead: meta.dead,
                    max_concurrency: meta.max_concurrency,
                    last_heartbeat_secs_ago: now
                        .duration_since(meta.last_heartbeat)
                        .unwrap_or_default()
                        .as_secs(),
                    active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
                    tasks_started: meta.tasks_started,
                    tasks_succeeded: meta.tasks_succeeded,
                    tasks_failed: meta.tasks_failed,
                    avg_task_ms: (done > 0).then(|| meta.total_task_time_ms as f64 / done as f64),
                    cpu_percent: meta.last_cpu_percent,
                    mem_bytes: meta.last_mem_bytes,
                }
            })
            .collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }
}

#[async_trait]
impl MpcRunClient for LocalMpcService {
    async fn lookup(&self, run_id: &str) -> Result<MpcRunHandle, MpcClientError> {
        lock(&self.runs)
            .get(run_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| MpcClientError::NotFound(run_id.to_string()))
    }

    async fn create(&self, request: MpcRunRequest) -> Result<MpcRunHandle, MpcClientError> {
        Self::validate(&request)?;

        let mut runs = lock(&self.runs);
        if let Some(existing) = runs.get(&request.instance_id) {
            // sólo se reemplaza una corrida que terminó mal
            if !existing.handle.status.is_failure() {
                return Err(MpcClientError::Rejected(format!(
                    "la corrida {} ya existe en estado {:?}",
                    request.instance_id, existing.handle.status
                )));
            }
        }

        let handle = MpcRunHandle::new(
            request.instance_id.clone(),
            request.game_name.clone(),
            request.mpc_party,
            request.num_workers,
            request.server_ips.clone(),
        );
        let (status_tx, _) = watch::channel(MpcRunStatus::Created);

        info!(
            "corrida {} registrada (game={}, workers={})",
            handle.instance_id, handle.game_name, handle.num_workers
        );
        runs.insert(
            request.instance_id.clone(),
            RunEntry {
                handle: handle.clone(),
                request,
                task_ids: HashSet::new(),
                completed_shards: BTreeSet::new(),
                status_tx,
            },
        );
        Ok(handle)
    }

    async fn start(&self, run_id: &str) -> Result<MpcRunHandle, MpcClientError> {
        self.start_inner(run_id)?;
        self.lookup(run_id).await
    }

    async fn start_and_await(&self, run_id: &str) -> Result<MpcRunHandle, MpcClientError> {
        let mut rx = self.start_inner(run_id)?;

        let wait = async {
            loop {
                let done = rx.borrow_and_update().is_terminal();
                if done {
                    break;
                }
                // el sender se cae si la corrida fue reemplazada
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };

        if tokio::time::timeout(self.run_timeout, wait).await.is_err() {
            warn!("corrida {} superó el timeout de {:?}", run_id, self.run_timeout);
            self.finish_run(run_id, MpcRunStatus::Failed);
            return Err(MpcClientError::Timeout(run_id.to_string()));
        }

        self.lookup(run_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::{GameArgs, OneDockerBinaryConfig};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    pub(crate) fn request(run_id: &str, workers: u32) -> MpcRunRequest {
        MpcRunRequest {
            instance_id: run_id.to_string(),
            game_name: "lift".to_string(),
            mpc_party: MpcParty::Client,
            num_workers: workers,
            game_args: (0..workers)
                .map(|i| GameArgs {
                    input_path: format!("in_combine_{i}"),
                    output_path: format!("out_{i}"),
                    run_name: "inst".to_string(),
                    log_cost: true,
                    run_id: "r".to_string(),
                    pc_feature_flags: BTreeSet::new(),
                })
                .collect(),
            server_ips: (0..workers).map(|i| format!("192.0.2.{i}")).collect(),
            binary: OneDockerBinaryConfig::default(),
        }
    }

    fn service() -> Arc<LocalMpcService> {
        Arc::new(LocalMpcService::new(Duration::from_secs(5), 1))
    }

    #[tokio::test]
    async fn lookup_de_corrida_inexistente_es_not_found() {
        let svc = service();
        assert_eq!(
            svc.lookup("nada").await.unwrap_err(),
            MpcClientError::NotFound("nada".into())
        );
    }

    #[tokio::test]
    async fn create_rechaza_game_args_inconsistentes() {
        let svc = service();
        let mut req = request("r1", 2);
        req.game_args.pop();
        assert!(matches!(
            svc.create(req).await.unwrap_err(),
            MpcClientError::Rejected(_)
        ));

        let mut req = request("r1", 2);
        req.server_ips.clear();
        assert!(matches!(
            svc.create(req).await.unwrap_err(),
            MpcClientError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn create_no_duplica_una_corrida_viva() {
        let svc = service();
        svc.create(request("r1", 1)).await.unwrap();
        assert!(svc.create(request("r1", 1)).await.is_err());
    }

    #[tokio::test]
    async fn start_encola_un_shard_por_worker_una_sola_vez() {
        let svc = service();
        svc.create(request("r1", 3)).await.unwrap();

        let h = svc.start("r1").await.unwrap();
        assert_eq!(h.status, MpcRunStatus::Started);
        svc.start("r1").await.unwrap();

        let queue = lock(&svc.tasks_queue);
        assert_eq!(queue.len(), 3);
        let shards: Vec<u32> = queue.iter().map(|t| t.shard_index).collect();
        assert_eq!(shards, vec![0, 1, 2]);
        assert_eq!(queue[1].server_ip.as_deref(), Some("192.0.2.1"));
    }

    #[tokio::test]
    async fn start_and_await_termina_cuando_todos_los_shards_completan() {
        let svc = service();
        svc.create(request("r1", 2)).await.unwrap();
        let wid = svc.register_worker("h".into(), 2);

        let waiter = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.start_and_await("r1").await })
        };

        // esperar a que los shards estén en la cola
        let mut tasks = Vec::new();
        while tasks.len() < 2 {
            match svc.next_task(&wid) {
                Some(t) => tasks.push(t),
                None => tokio::task::yield_now().await,
            }
        }
        for t in &tasks {
            assert!(svc.complete_task(&t.id, true));
        }

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.status, MpcRunStatus::Completed);

        let metrics = svc.worker_metrics();
        assert_eq!(metrics[0].tasks_succeeded, 2);
        assert_eq!(metrics[0].active_tasks, 0);
    }

    #[tokio::test]
    async fn shard_fallido_se_reintenta_y_despues_falla_la_corrida() {
        // max_task_attempts = 1: un reintento y al segundo fallo se cae la corrida
        let svc = service();
        svc.create(request("r1", 1)).await.unwrap();
        svc.start("r1").await.unwrap();
        let wid = svc.register_worker("h".into(), 1);

        let t = svc.next_task(&wid).unwrap();
        svc.complete_task(&t.id, false);
        let retry = svc.next_task(&wid).unwrap();
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.shard_index, t.shard_index);

        svc.complete_task(&retry.id, false);
        let h = svc.lookup("r1").await.unwrap();
        assert_eq!(h.status, MpcRunStatus::Failed);
        assert!(svc.next_task(&wid).is_none());

        // una corrida fallida se puede volver a crear
        svc.create(request("r1", 1)).await.unwrap();
        assert_eq!(svc.lookup("r1").await.unwrap().status, MpcRunStatus::Created);
    }

    #[tokio::test]
    async fn start_and_await_con_timeout_marca_failed() {
        let svc = Arc::new(LocalMpcService::new(Duration::from_millis(20), 1));
        svc.create(request("r1", 1)).await.unwrap();

        let err = svc.start_and_await("r1").await.unwrap_err();
        assert_eq!(err, MpcClientError::Timeout("r1".into()));
        assert_eq!(svc.lookup("r1").await.unwrap().status, MpcRunStatus::Failed);
        assert!(lock(&svc.tasks_queue).is_empty());
    }

    #[tokio::test]
    async fn worker_respeta_max_concurrency() {
        let svc = service();
        svc.create(request("r1", 3)).await.unwrap();
        svc.start("r1").await.unwrap();
        let wid = svc.register_worker("h".into(), 2);

        assert!(svc.next_task(&wid).is_some());
        assert!(svc.next_task(&wid).is_some());
        assert!(svc.next_task(&wid).is_none());
        assert!(svc.next_task("desconocido").is_none());
    }
}
