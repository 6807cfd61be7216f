//! Engine template provider — config generation per engine type.
//!
//! A pure function from `(engine type, resource spec)` to ready-to-apply
//! config artifacts and an initialization script. Generation must be
//! deterministic for identical inputs so that pipeline retries are
//! idempotent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_state::{EngineType, ResourceSpec};

/// Result type alias for template generation.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors from template generation. Always permanent: a spec the provider
/// rejects will be rejected again on retry.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid resource spec: {0}")]
    InvalidSpec(String),
}

/// One generated configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    /// Path the artifact should be written to, relative to the data dir.
    pub path: String,
    pub contents: String,
}

/// Everything needed to configure a freshly provisioned engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTemplate {
    pub config_artifacts: Vec<ConfigArtifact>,
    pub init_script: String,
}

/// Generates config artifacts for an engine type and resource spec.
pub trait EngineTemplateProvider: Send + Sync {
    fn generate(&self, engine: EngineType, resources: &ResourceSpec)
        -> TemplateResult<EngineTemplate>;
}

/// Built-in provider covering both engine variants.
///
/// Tuning values are derived arithmetically from the resource spec, so the
/// output is a pure function of the input.
pub struct StaticTemplateProvider;

impl StaticTemplateProvider {
    pub fn new() -> Self {
        Self
    }

    fn validate(resources: &ResourceSpec) -> TemplateResult<()> {
        if resources.cpu_millis == 0 {
            return Err(TemplateError::InvalidSpec("cpu_millis must be > 0".to_string()));
        }
        if resources.memory_bytes == 0 {
            return Err(TemplateError::InvalidSpec("memory_bytes must be > 0".to_string()));
        }
        if resources.replicas == 0 {
            return Err(TemplateError::InvalidSpec("replicas must be > 0".to_string()));
        }
        Ok(())
    }

    fn relational(resources: &ResourceSpec) -> EngineTemplate {
        // Shared buffers at a quarter of memory, 32 connections per core.
        let shared_buffers_mb = (resources.memory_bytes / 4) >> 20;
        let max_connections = (resources.cpu_millis / 1000).max(1) * 32;

        EngineTemplate {
            config_artifacts: vec![
                ConfigArtifact {
                    path: "conf/server.conf".to_string(),
                    contents: format!(
                        "shared_buffers = {shared_buffers_mb}MB\n\
                         max_connections = {max_connections}\n\
                         wal_level = replica\n\
                         max_wal_senders = {}\n",
                        resources.replicas.saturating_sub(1).max(1) * 2
                    ),
                },
                ConfigArtifact {
                    path: "conf/hba.conf".to_string(),
                    contents: "host all all 10.0.0.0/8 scram-sha-256\n".to_string(),
                },
            ],
            init_script: "CREATE ROLE strata_admin LOGIN;\n\
                          CREATE DATABASE app OWNER strata_admin;\n"
                .to_string(),
        }
    }

    fn key_value(resources: &ResourceSpec) -> EngineTemplate {
        let maxmemory_mb = (resources.memory_bytes * 3 / 4) >> 20;
        let io_threads = (resources.cpu_millis / 1000).clamp(1, 8);

        EngineTemplate {
            config_artifacts: vec![ConfigArtifact {
                path: "conf/kv.conf".to_string(),
                contents: format!(
                    "maxmemory {maxmemory_mb}mb\n\
                     maxmemory-policy allkeys-lru\n\
                     io-threads {io_threads}\n\
                     appendonly yes\n"
                ),
            }],
            init_script: "CONFIG SET notify-keyspace-events Ex\n".to_string(),
        }
    }
}

impl Default for StaticTemplateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineTemplateProvider for StaticTemplateProvider {
    fn generate(
        &self,
        engine: EngineType,
        resources: &ResourceSpec,
    ) -> TemplateResult<EngineTemplate> {
        Self::validate(resources)?;
        Ok(match engine {
            EngineType::Relational => Self::relational(resources),
            EngineType::KeyValue => Self::key_value(resources),
        })
    }
}
