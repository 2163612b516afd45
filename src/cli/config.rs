use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::service::IngestOptions;
use crate::storage::{Backend, RelationalSettings};

/// Configuration loaded from `flowstate.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowStateConfig {
    pub persistence: Option<PersistenceConfig>,
    pub ingest: Option<IngestConfig>,
}

/// Backend selection, e.g.
///
/// ```yaml
/// persistence:
///   type: postgres
///   settings:
///     host: db.internal
///     port: 5432
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "settings", rename_all = "lowercase")]
pub enum PersistenceConfig {
    Memory,
    #[serde(alias = "postgres")]
    Relational(RelationalSettings),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngestConfig {
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
}

impl FlowStateConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `flowstate.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("flowstate.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: FlowStateConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// The backend to open. A database URL (flag or env) wins over the file.
    pub fn backend(&self, database_url: Option<&str>) -> Backend {
        if let Some(url) = database_url.filter(|u| !u.is_empty()) {
            let mut settings = match &self.persistence {
                Some(PersistenceConfig::Relational(s)) => s.clone(),
                _ => RelationalSettings::default(),
            };
            settings.database_url = Some(url.to_string());
            return Backend::Relational(settings);
        }
        match &self.persistence {
            Some(PersistenceConfig::Relational(s)) => Backend::Relational(s.clone()),
            Some(PersistenceConfig::Memory) | None => Backend::Memory,
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        let ingest = self.ingest.clone().unwrap_or_default();
        IngestOptions {
            workers: ingest.workers,
            queue_capacity: ingest.queue_capacity,
        }
    }
}
