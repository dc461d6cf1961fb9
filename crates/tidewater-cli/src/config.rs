//! Pipeline file for the tidewater binary

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tidewater_catalog::StreamDefinition;
use tidewater_sql::{EngineConfig, QueryDefinition};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory of persisted stream definitions; in memory when unset
    #[serde(default)]
    pub catalog_dir: Option<PathBuf>,

    /// Enable colored output
    #[serde(default = "default_colored")]
    pub colored: bool,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub streams: Vec<StreamDefinition>,

    #[serde(default)]
    pub queries: Vec<QueryDefinition>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_colored() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            catalog_dir: None,
            colored: default_colored(),
            engine: EngineConfig::default(),
            streams: Vec::new(),
            queries: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a pipeline file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid pipeline file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that need no catalog: unique names and well-formed queries.
    /// Schema agreement is checked when the queries are submitted.
    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for stream in &self.streams {
            if !names.insert(stream.name.as_str()) {
                bail!("stream {} is declared twice", stream.name);
            }
        }

        let mut ids = HashSet::new();
        for (i, query) in self.queries.iter().enumerate() {
            query
                .validate()
                .with_context(|| format!("query #{} ({})", i + 1, query.target))?;
            if let Some(id) = &query.id {
                if !ids.insert(id.as_str()) {
                    bail!("query id {} is declared twice", id);
                }
            }
        }
        Ok(())
    }

    /// Target streams in order of first appearance
    pub fn targets(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.queries
            .iter()
            .map(|q| q.target.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }
}
