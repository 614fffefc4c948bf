use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::instance::PrivateComputationRole;

/// Artefacto que corre cada contenedor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneDockerBinaryConfig {
    pub tmp_directory: String,
    pub binary_version: String,
    pub repository_path: String,
}

impl Default for OneDockerBinaryConfig {
    fn default() -> Self {
        Self {
            tmp_directory: "/tmp/".to_string(),
            binary_version: "latest".to_string(),
            repository_path: "/usr/local/bin/".to_string(),
        }
    }
}

/// Config por rol, con un default explícito para los roles que no aparecen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinaryConfigMap {
    #[serde(default)]
    pub configs: HashMap<PrivateComputationRole, OneDockerBinaryConfig>,
    #[serde(default)]
    pub default: OneDockerBinaryConfig,
}

impl BinaryConfigMap {
    pub fn with_default(default: OneDockerBinaryConfig) -> Self {
        Self {
            configs: HashMap::new(),
            default,
        }
    }

    pub fn insert(&mut self, role: PrivateComputationRole, config: OneDockerBinaryConfig) {
        self.configs.insert(role, config);
    }

    pub fn resolve(&self, role: PrivateComputationRole) -> &OneDockerBinaryConfig {
        self.configs.get(&role).unwrap_or(&self.default)
    }

    /// Lee un JSON con la forma `{ "configs": { "PARTNER": {...} }, "default": {...} }`.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("leyendo binary config {}", path.display()))?;
        let map = serde_json::from_str(&raw)
            .with_context(|| format!("parseando binary config {}", path.display()))?;
        Ok(map)
    }
}
