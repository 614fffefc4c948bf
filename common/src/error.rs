use thiserror::Error;

use crate::mpc::MpcClientError;
use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Falló la consulta de una corrida existente (algo distinto de not-found).
    #[error("lookup of {run_id} failed: {source}")]
    Lookup {
        run_id: String,
        #[source]
        source: MpcClientError,
    },

    /// El cliente MPC no aceptó la corrida. Reintentable.
    #[error("submission of {run_id} failed: {source}")]
    Submission {
        run_id: String,
        #[source]
        source: MpcClientError,
    },

    /// La corrida arrancó pero terminó mal. El handle queda registrado. Reintentable.
    #[error("mpc run {run_id} failed: {reason}")]
    RunFailure { run_id: String, reason: String },

    /// No se pudo persistir la instancia: el estado en memoria no es durable.
    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::Lookup { .. } | StageError::Submission { .. } | StageError::RunFailure { .. }
        )
    }
}
