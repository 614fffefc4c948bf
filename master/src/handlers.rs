use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    find_stage, stage_started_with, CreateInstanceRequest, MpcClientError, MpcRunClient,
    MpcRunHandle, PrivateComputationInstance, RepositoryError, RunStageRequest, RunStageResponse,
    StageError, TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest,
    TaskCompleteResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/instances", post(create_instance))
        .route("/api/v1/instances/:id", get(get_instance))
        .route("/api/v1/instances/:id/stages/:stage", post(run_stage))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        let status = match e {
            RepositoryError::NotFound(_) => StatusCode::NOT_FOUND,
            RepositoryError::AlreadyExists(_) => StatusCode::CONFLICT,
            RepositoryError::InvalidId(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<StageError> for ApiError {
    fn from(e: StageError) -> Self {
        let status = match e {
            StageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StageError::Lookup { .. } | StageError::Submission { .. } | StageError::RunFailure { .. } => {
                StatusCode::BAD_GATEWAY
            }
            StageError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

/* ---------------- instancias ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<PrivateComputationInstance>), ApiError> {
    let instance = PrivateComputationInstance::create(req)?;
    state.instances.create(&instance).await?;

    info!(
        "instancia {} creada (role={:?}, game={:?}, run_id={})",
        instance.instance_id(),
        instance.infra_config.role,
        instance.infra_config.game_type,
        instance.infra_config.run_id
    );
    Ok((StatusCode::CREATED, Json(instance)))
}

// Si la instancia quedó esperando una corrida fire-and-forget, se refresca acá
async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PrivateComputationInstance>, ApiError> {
    let instance = state.instances.read(&id).await?;

    let Some(stage) = stage_started_with(instance.status()) else {
        return Ok(Json(instance));
    };
    // otra operación tiene la instancia: devolvemos lo que hay
    let Some(_guard) = state.instance_locks.try_lock(&id) else {
        return Ok(Json(instance));
    };

    let mut instance = state.instances.read(&id).await?;
    state
        .stage_service(stage)
        .update_status(&mut instance)
        .await?;
    Ok(Json(instance))
}

async fn run_stage(
    State(state): State<AppState>,
    Path((id, stage_name)): Path<(String, String)>,
    Json(req): Json<RunStageRequest>,
) -> Result<Json<RunStageResponse>, ApiError> {
    let stage = find_stage(&stage_name)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("stage desconocido {stage_name}")))?;

    // 404 antes de tomar el lock
    state.instances.read(&id).await?;

    let _guard = state.instance_locks.lock(&id).await;
    let mut instance = state.instances.read(&id).await?;

    let mut svc = state.stage_service(stage);
    if !req.wait {
        svc = svc.fire_and_forget();
    }

    info!(
        "corriendo stage {} sobre {} (wait={})",
        stage.name, id, req.wait
    );
    let run = svc.run_async(&mut instance, &req.server_ips).await.map_err(|e| {
        warn!("stage {} sobre {} falló: {}", stage.name, id, e);
        e
    })?;

    Ok(Json(RunStageResponse { instance, run }))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MpcRunHandle>, ApiError> {
    match state.mpc.lookup(&id).await {
        Ok(h) => Ok(Json(h)),
        Err(MpcClientError::NotFound(_)) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("corrida {id} no encontrada"),
        )),
        Err(e) => Err(ApiError::new(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

/* ---------------- workers ---------------- */

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = state.mpc.register_worker(req.hostname, req.max_concurrency);
    Json(WorkerRegisterResponse { worker_id })
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    if state.mpc.heartbeat(&req) {
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Json<TaskAssignmentResponse> {
    let task = state.mpc.next_task(&req.worker_id);
    Json(TaskAssignmentResponse { task })
}

async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    if state.mpc.complete_task(&req.task_id, req.success) {
        Ok(Json(TaskCompleteResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    Json(state.mpc.worker_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc_service::LocalMpcService;
    use axum::body::Body;
    use axum::http::Request;
    use common::{
        BinaryConfigMap, MemoryInstanceRepository, MpcRunStatus, PrivateComputationInstanceStatus,
    };
    use serde::de::DeserializeOwned;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState::new(
            Arc::new(MemoryInstanceRepository::new()),
            Arc::new(BinaryConfigMap::default()),
            Arc::new(LocalMpcService::new(Duration::from_secs(5), 3)),
        );
        build_router(state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let req = match body {
            Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    fn create_body(id: &str) -> Value {
        json!({
            "instance_id": id,
            "role": "PARTNER",
            "game_type": "PRIVATE_ID_DFCA",
            "input_path": "456",
            "output_dir": "789",
            "num_pid_containers": 2,
            "num_mpc_containers": 2,
            "num_files_per_mpc_container": 40,
            "pcs_features": ["pcs_dummy"]
        })
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let (status, body) = call(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn crear_y_leer_instancia() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/v1/instances", Some(create_body("inst1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: PrivateComputationInstance = parse(&body);
        assert_eq!(created.status(), PrivateComputationInstanceStatus::Created);

        let (status, body) = call(&app, "GET", "/api/v1/instances/inst1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse::<PrivateComputationInstance>(&body), created);

        let (status, _) = call(&app, "POST", "/api/v1/instances", Some(create_body("inst1"))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "GET", "/api/v1/instances/nadie", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stage_desconocido_o_ips_invalidas() {
        let app = app();
        call(&app, "POST", "/api/v1/instances", Some(create_body("inst1"))).await;

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/instances/nadie/stages/private_id_dfca_aggregate",
            Some(json!({ "server_ips": ["a", "b"] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/instances/inst1/stages/no_existe",
            Some(json!({ "server_ips": ["a", "b"] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/instances/inst1/stages/private_id_dfca_aggregate",
            Some(json!({ "server_ips": ["a"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stage_fire_and_forget_de_punta_a_punta_con_un_worker() {
        let app = app();
        call(&app, "POST", "/api/v1/instances", Some(create_body("inst1"))).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/instances/inst1/stages/private_id_dfca_aggregate",
            Some(json!({ "server_ips": ["192.0.2.0", "192.0.2.1"], "wait": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp: RunStageResponse = parse(&body);
        assert_eq!(resp.run.instance_id, "inst1_private_id_dfca_aggregate");
        assert_eq!(resp.run.status, MpcRunStatus::Started);
        assert_eq!(
            resp.instance.status(),
            PrivateComputationInstanceStatus::PrivateIdDfcaAggregationStarted
        );

        // un worker toma y completa los dos shards
        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/workers/register",
            Some(json!({ "hostname": "w1", "max_concurrency": 2 })),
        )
        .await;
        let reg: WorkerRegisterResponse = parse(&body);

        for _ in 0..2 {
            let (_, body) = call(
                &app,
                "POST",
                "/api/v1/tasks/next",
                Some(json!({ "worker_id": reg.worker_id })),
            )
            .await;
            let assignment: TaskAssignmentResponse = parse(&body);
            let task = assignment.task.unwrap();
            assert_eq!(task.game_name, "private_id_dfca_aggregation");

            let (status, _) = call(
                &app,
                "POST",
                "/api/v1/tasks/complete",
                Some(json!({ "task_id": task.id, "success": true })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, body) = call(&app, "GET", "/api/v1/runs/inst1_private_id_dfca_aggregate", None).await;
        assert_eq!(parse::<MpcRunHandle>(&body).status, MpcRunStatus::Completed);

        // al leer la instancia se pliega el resultado de la corrida
        let (_, body) = call(&app, "GET", "/api/v1/instances/inst1", None).await;
        let inst: PrivateComputationInstance = parse(&body);
        assert_eq!(
            inst.status(),
            PrivateComputationInstanceStatus::PrivateIdDfcaAggregationCompleted
        );
        assert_eq!(inst.infra_config.instances.len(), 1);

        let (_, body) = call(&app, "GET", "/api/v1/workers", None).await;
        let workers: Vec<WorkerMetrics> = parse(&body);
        assert_eq!(workers[0].tasks_succeeded, 2);
    }

    #[tokio::test]
    async fn completar_tarea_desconocida_es_404() {
        let (status, _) = call(
            &app(),
            "POST",
            "/api/v1/tasks/complete",
            Some(json!({ "task_id": "x", "success": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
