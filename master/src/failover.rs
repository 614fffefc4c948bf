use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::{info, warn};

use common::ShardTask;

use crate::mpc_service::LocalMpcService;
use crate::state::lock;

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - reencola sus shards o falla la corrida
pub async fn run_failover_loop(
    mpc: Arc<LocalMpcService>,
    sweep_interval: Duration,
    heartbeat_timeout: Duration,
) {
    loop {
        sleep(sweep_interval).await;

        let requeued = sweep_once(&mpc, SystemTime::now(), heartbeat_timeout);
        if requeued > 0 {
            info!("failover sweep: {} shards recuperados", requeued);
        }
    }
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. saca de in_flight los shards de esos workers
/// 3. los reencola (o falla la corrida si superan el máximo de intentos)
pub(crate) fn sweep_once(mpc: &LocalMpcService, now: SystemTime, heartbeat_timeout: Duration) -> usize {
    // 1) Detectar qué workers están muertos
    let mut newly_dead_workers: HashSet<String> = HashSet::new();

    {
        let mut workers = lock(&mpc.workers);

        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }

            // last_heartbeat en el futuro: lo ignoramos
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };

            if elapsed > heartbeat_timeout {
                meta.dead = true;
                newly_dead_workers.insert(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    if newly_dead_workers.is_empty() {
        return 0;
    }

    // 2) Sacar los shards en vuelo de esos workers
    let orphaned: Vec<ShardTask> = {
        let mut in_flight = lock(&mpc.in_flight);
        let ids: Vec<String> = in_flight
            .iter()
            .filter(|(_, f)| newly_dead_workers.contains(&f.worker_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| in_flight.remove(id))
            .map(|f| f.task)
            .collect()
    };

    // 3) Reencolar o fallar
    let count = orphaned.len();
    for task in orphaned {
        info!(
            "shard {} de la corrida {} quedó huérfano",
            task.shard_index, task.run_id
        );
        mpc.requeue_or_fail(task);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc_service::tests::request;
    use common::{MpcRunClient, MpcRunStatus};

    const TIMEOUT: Duration = Duration::from_secs(20);

    #[tokio::test]
    async fn worker_sin_heartbeat_pierde_sus_shards() {
        let mpc = LocalMpcService::new(Duration::from_secs(5), 3);
        mpc.create(request("r1", 1)).await.unwrap();
        mpc.start("r1").await.unwrap();
        let wid = mpc.register_worker("h".into(), 1);
        let task = mpc.next_task(&wid).unwrap();

        // dentro del timeout no pasa nada
        assert_eq!(sweep_once(&mpc, SystemTime::now(), TIMEOUT), 0);

        let later = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(sweep_once(&mpc, later, TIMEOUT), 1);

        assert!(lock(&mpc.workers)[&wid].dead);
        assert!(lock(&mpc.in_flight).is_empty());
        let queue = lock(&mpc.tasks_queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].shard_index, task.shard_index);
        assert_eq!(queue[0].attempt, 1);

        // un worker ya muerto no se vuelve a contar
        drop(queue);
        assert_eq!(sweep_once(&mpc, later, TIMEOUT), 0);
    }

    #[tokio::test]
    async fn sin_intentos_restantes_la_corrida_falla() {
        let mpc = LocalMpcService::new(Duration::from_secs(5), 0);
        mpc.create(request("r1", 1)).await.unwrap();
        mpc.start("r1").await.unwrap();
        let wid = mpc.register_worker("h".into(), 1);
        mpc.next_task(&wid).unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        sweep_once(&mpc, later, TIMEOUT);

        assert_eq!(mpc.lookup("r1").await.unwrap().status, MpcRunStatus::Failed);
        assert!(lock(&mpc.tasks_queue).is_empty());
    }

    #[tokio::test]
    async fn corrida_reenviada_no_cuenta_shards_de_la_corrida_fallida() {
        // un solo reintento por shard
        let mpc = LocalMpcService::new(Duration::from_secs(5), 1);
        mpc.create(request("r1", 2)).await.unwrap();
        mpc.start("r1").await.unwrap();

        // el shard 0 falla una vez y vuelve a la cola con attempt=1
        let w1 = mpc.register_worker("h1".into(), 2);
        let first = mpc.next_task(&w1).unwrap();
        mpc.complete_task(&first.id, false);

        // w1 toma los dos shards y se muere con ambos en vuelo
        let a = mpc.next_task(&w1).unwrap();
        let b = mpc.next_task(&w1).unwrap();
        assert_eq!(a.attempt + b.attempt, 1);

        let later = SystemTime::now() + Duration::from_secs(60);
        sweep_once(&mpc, later, TIMEOUT);

        assert_eq!(mpc.lookup("r1").await.unwrap().status, MpcRunStatus::Failed);
        assert!(lock(&mpc.tasks_queue).is_empty());
        assert!(lock(&mpc.in_flight).is_empty());

        // reenvío con el mismo run id
        mpc.create(request("r1", 2)).await.unwrap();
        mpc.start("r1").await.unwrap();
        let w2 = mpc.register_worker("h2".into(), 2);

        let own = mpc.next_task(&w2).unwrap();
        assert_eq!(own.attempt, 0);
        assert!(mpc.complete_task(&own.id, true));
        assert_eq!(mpc.lookup("r1").await.unwrap().status, MpcRunStatus::Started);

        let own = mpc.next_task(&w2).unwrap();
        assert_eq!(own.attempt, 0);
        assert!(mpc.complete_task(&own.id, true));
        assert_eq!(mpc.lookup("r1").await.unwrap().status, MpcRunStatus::Completed);
        assert!(lock(&mpc.tasks_queue).is_empty());
    }

    #[tokio::test]
    async fn shard_de_corrida_terminada_no_se_reencola() {
        let mpc = LocalMpcService::new(Duration::from_secs(5), 3);
        mpc.create(request("r1", 1)).await.unwrap();
        mpc.start("r1").await.unwrap();
        let wid = mpc.register_worker("h".into(), 1);
        let task = mpc.next_task(&wid).unwrap();
        assert!(mpc.complete_task(&task.id, true));
        assert_eq!(mpc.lookup("r1").await.unwrap().status, MpcRunStatus::Completed);

        mpc.requeue_or_fail(task);
        assert!(lock(&mpc.tasks_queue).is_empty());
    }
}
