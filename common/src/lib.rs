pub mod binary_config;
pub mod error;
pub mod game_args;
pub mod instance;
pub mod mpc;
pub mod repository;
pub mod stage;
pub mod stage_service;
pub mod task;
pub mod worker;

pub use binary_config::{BinaryConfigMap, OneDockerBinaryConfig};
pub use error::StageError;
pub use game_args::{build_game_args, GameArgs};
pub use instance::{
    CommonProductConfig, CreateInstanceRequest, InfraConfig, InstanceId, PcsFeature,
    PrivateComputationGameType, PrivateComputationInstance, PrivateComputationInstanceStatus,
    PrivateComputationRole, ProductConfig, RunStageRequest, RunStageResponse, StatusUpdate,
};
pub use mpc::{MpcClientError, MpcParty, MpcRunClient, MpcRunHandle, MpcRunRequest, MpcRunStatus};
pub use repository::{
    InstanceRepository, LocalInstanceRepository, MemoryInstanceRepository, RepositoryError,
};
pub use stage::{find_stage, stage_started_with, StageSpec, ALL_STAGES};
pub use stage_service::StageService;
pub use task::{ShardTask, TaskId};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
