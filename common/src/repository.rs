use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::instance::PrivateComputationInstance;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("instance {0} not found")]
    NotFound(String),
    #[error("instance {0} already exists")]
    AlreadyExists(String),
    #[error("invalid instance id {0:?}")]
    InvalidId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("repository lock poisoned")]
    Poisoned,
}

/// Almacenamiento durable de instancias. `update` es el `persist` que el
/// stage service llama después de cada cambio.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, instance: &PrivateComputationInstance) -> Result<(), RepositoryError>;
    async fn read(&self, instance_id: &str) -> Result<PrivateComputationInstance, RepositoryError>;
    async fn update(&self, instance: &PrivateComputationInstance) -> Result<(), RepositoryError>;
}

/* --------- en memoria --------- */

#[derive(Default)]
pub struct MemoryInstanceRepository {
    instances: Mutex<HashMap<String, PrivateComputationInstance>>,
}

impl MemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for MemoryInstanceRepository {
    async fn create(&self, instance: &PrivateComputationInstance) -> Result<(), RepositoryError> {
        let mut map = self.instances.lock().map_err(|_| RepositoryError::Poisoned)?;
        let id = instance.instance_id().to_string();
        if map.contains_key(&id) {
            return Err(RepositoryError::AlreadyExists(id));
        }
        map.insert(id, instance.clone());
        Ok(())
    }

    async fn read(&self, instance_id: &str) -> Result<PrivateComputationInstance, RepositoryError> {
        let map = self.instances.lock().map_err(|_| RepositoryError::Poisoned)?;
        map.get(instance_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(instance_id.to_string()))
    }

    async fn update(&self, instance: &PrivateComputationInstance) -> Result<(), RepositoryError> {
        let mut map = self.instances.lock().map_err(|_| RepositoryError::Poisoned)?;
        match map.get_mut(instance.instance_id()) {
            Some(slot) => {
                *slot = instance.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(instance.instance_id().to_string())),
        }
    }
}

/* --------- archivos JSON locales --------- */

/// Un archivo `{base_dir}/{instance_id}.json` por instancia.
/// Cada escritura va a un `.tmp` y se renombra, así nunca queda un JSON a medias.
pub struct LocalInstanceRepository {
    base_dir: PathBuf,
}

impl LocalInstanceRepository {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, instance_id: &str) -> Result<PathBuf, RepositoryError> {
        let valid = !instance_id.is_empty()
            && instance_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !instance_id.starts_with('.');
        if !valid {
            return Err(RepositoryError::InvalidId(instance_id.to_string()));
        }
        Ok(self.base_dir.join(format!("{instance_id}.json")))
    }

    async fn write(&self, instance: &PrivateComputationInstance) -> Result<(), RepositoryError> {
        let path = self.path_for(instance.instance_id())?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let body = serde_json::to_vec_pretty(instance)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("instancia {} persistida en {}", instance.instance_id(), path.display());
        Ok(())
    }
}

#[async_trait]
impl InstanceRepository for LocalInstanceRepository {
    /// Escribe a un temporal propio y lo publica con un hard link, que falla
    /// con AlreadyExists si el destino ya está.
    async fn create(&self, instance: &PrivateComputationInstance) -> Result<(), RepositoryError> {
        let id = instance.instance_id();
        let path = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let body = serde_json::to_vec_pretty(instance)?;
        let tmp = self
            .base_dir
            .join(format!("{id}.{}.create.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, body).await?;

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                debug!("instancia {} creada en {}", id, path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RepositoryError::AlreadyExists(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, instance_id: &str) -> Result<PrivateComputationInstance, RepositoryError> {
        let path = self.path_for(instance_id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(instance_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn update(&self, instance: &PrivateComputationInstance) -> Result<(), RepositoryError> {
        let path = self.path_for(instance.instance_id())?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(RepositoryError::NotFound(instance.instance_id().to_string()));
        }
        self.write(instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::sample_request;
    use crate::instance::PrivateComputationInstanceStatus;
    use std::sync::Arc;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("instance_repository_tests").join(sub);
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(&base).unwrap();
        base
    }

    #[tokio::test]
    async fn local_create_read_update() {
        let repo = LocalInstanceRepository::new(temp_dir("crud"));
        let mut inst = PrivateComputationInstance::create(sample_request("inst_1")).unwrap();

        repo.create(&inst).await.unwrap();
        assert_eq!(repo.read("inst_1").await.unwrap(), inst);

        inst.update_status(PrivateComputationInstanceStatus::ComputationStarted);
        repo.update(&inst).await.unwrap();

        let back = repo.read("inst_1").await.unwrap();
        assert_eq!(back.status(), PrivateComputationInstanceStatus::ComputationStarted);
        assert_eq!(back.infra_config.status_updates.len(), 2);
    }

    #[tokio::test]
    async fn local_create_dos_veces_falla() {
        let repo = LocalInstanceRepository::new(temp_dir("dup"));
        let inst = PrivateComputationInstance::create(sample_request("inst_1")).unwrap();

        repo.create(&inst).await.unwrap();
        let err = repo.create(&inst).await.unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyExists(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn local_creates_concurrentes_con_el_mismo_id_gana_uno_solo() {
        let repo = Arc::new(LocalInstanceRepository::new(temp_dir("race")));

        for round in 0..20 {
            let id = format!("inst_{round}");
            let mut handles = Vec::new();
            for run_id in ["run-A", "run-B"] {
                let repo = repo.clone();
                let mut req = sample_request(&id);
                req.run_id = Some(run_id.to_string());
                let inst = PrivateComputationInstance::create(req).unwrap();
                handles.push(tokio::spawn(async move {
                    (run_id, repo.create(&inst).await)
                }));
            }

            let mut winners = Vec::new();
            for h in handles {
                let (run_id, res) = h.await.unwrap();
                match res {
                    Ok(()) => winners.push(run_id),
                    Err(RepositoryError::AlreadyExists(_)) => {}
                    Err(e) => panic!("error inesperado {e}"),
                }
            }
            assert_eq!(winners.len(), 1, "ronda {round}");

            // el archivo es el del ganador y no quedan temporales
            let stored = repo.read(&id).await.unwrap();
            assert_eq!(stored.infra_config.run_id, winners[0]);
        }

        let leftovers = std::fs::read_dir(&repo.base_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn local_read_y_update_de_inexistente() {
        let repo = LocalInstanceRepository::new(temp_dir("missing"));
        assert!(matches!(
            repo.read("nadie").await.unwrap_err(),
            RepositoryError::NotFound(_)
        ));

        let inst = PrivateComputationInstance::create(sample_request("nadie")).unwrap();
        assert!(matches!(
            repo.update(&inst).await.unwrap_err(),
            RepositoryError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn local_rechaza_ids_con_rutas() {
        let repo = LocalInstanceRepository::new(temp_dir("ids"));
        assert!(matches!(
            repo.read("../etc/passwd").await.unwrap_err(),
            RepositoryError::InvalidId(_)
        ));
    }

    #[tokio::test]
    async fn memoria_update_requiere_create() {
        let repo = MemoryInstanceRepository::new();
        let inst = PrivateComputationInstance::create(sample_request("m")).unwrap();

        assert!(repo.update(&inst).await.is_err());
        repo.create(&inst).await.unwrap();
        repo.update(&inst).await.unwrap();
        assert_eq!(repo.read("m").await.unwrap(), inst);
    }
}
