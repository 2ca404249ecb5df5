//! Configuration system for the reconstruction server.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RECON_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/reconstream/config.toml
//!   3. ~/.config/reconstream/config.toml

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    pub network: NetworkConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the daemon listens on.
    pub listen_addr: String,
    /// TCP port for client connections. 0 = OS-assigned.
    pub port: u16,
    /// Largest sample block accepted in one acquisition message.
    pub max_readout_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage queue, in chains.
    pub queue_capacity: usize,
    /// Stages in processing order. The last one feeds the wire writers.
    pub stages: Vec<StageSpec>,
}

/// One entry of the stage list: which kind of stage, and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Registered stage kind, e.g. "remove_ro_oversampling".
    pub kind: String,
    /// Instance name used in logs and events. Defaults to `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stage-specific parameters, validated by the stage itself.
    #[serde(default)]
    pub params: toml::Table,
}

impl StageSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            params: toml::Table::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }

    /// Deserialize `params` into a stage's typed configuration.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        toml::Value::Table(self.params.clone())
            .try_into::<T>()
            .map_err(|e| ConfigError::InvalidParams {
                stage: self.display_name().to_string(),
                source: e,
            })
    }

    /// Reject a parameter combination with a reason.
    pub fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            stage: self.display_name().to_string(),
            reason: reason.into(),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 9002,
            max_readout_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            stages: default_stages(),
        }
    }
}

/// Standard magnitude image chain.
pub fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::new("remove_ro_oversampling").param("oversampling_factor", 2i64),
        StageSpec::new("accumulate_image").param("encoding_lines", 256i64),
        StageSpec::new("image_fft"),
        StageSpec::new("coil_combine"),
        StageSpec::new("extract").param("mode", "magnitude"),
        StageSpec::new("autoscale").param("max_value", 2048i64),
    ]
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("reconstream")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("unknown stage kind: {0}")]
    UnknownStage(String),
    #[error("stage {stage}: invalid parameters: {source}")]
    InvalidParams {
        stage: String,
        source: toml::de::Error,
    },
    #[error("stage {stage}: {reason}")]
    Invalid { stage: String, reason: String },
    #[error("pipeline has no stages")]
    EmptyPipeline,
    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ReconConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(ReconConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RECON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    pub fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&ReconConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply RECON_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RECON_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("RECON_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("RECON_NETWORK__MAX_READOUT_BYTES") {
            if let Ok(n) = v.parse() {
                self.network.max_readout_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("RECON_PIPELINE__QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.pipeline.queue_capacity = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("recon-config-test-{}-{name}", std::process::id()))
            .join("config.toml")
    }

    #[test]
    fn default_config_has_image_chain() {
        let config = ReconConfig::default();
        let kinds: Vec<&str> = config
            .pipeline
            .stages
            .iter()
            .map(|s| s.kind.as_str())
            .collect();
        assert_eq!(kinds.first(), Some(&"remove_ro_oversampling"));
        assert_eq!(kinds.last(), Some(&"autoscale"));
        assert_eq!(config.pipeline.queue_capacity, 64);
    }

    #[test]
    fn stage_params_deserialize() {
        #[derive(Debug, Deserialize)]
        struct Params {
            encoding_lines: u16,
            #[serde(default)]
            image_series_index: u16,
        }

        let spec = StageSpec::new("accumulate_image").param("encoding_lines", 128i64);
        let params: Params = spec.params().unwrap();
        assert_eq!(params.encoding_lines, 128);
        assert_eq!(params.image_series_index, 0);

        let bad = StageSpec::new("accumulate_image").param("encoding_lines", "many");
        let err = bad.params::<Params>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParams { ref stage, .. } if stage == "accumulate_image"));
    }

    #[test]
    fn stage_list_parses_from_toml() {
        let text = r#"
            [pipeline]
            queue_capacity = 8

            [[pipeline.stages]]
            kind = "extract"
            name = "mag"
            params = { mode = "magnitude" }

            [[pipeline.stages]]
            kind = "autoscale"
        "#;
        let config: ReconConfig = toml::from_str(text).unwrap();
        assert_eq!(config.pipeline.queue_capacity, 8);
        assert_eq!(config.pipeline.stages.len(), 2);
        assert_eq!(config.pipeline.stages[0].display_name(), "mag");
        assert_eq!(config.pipeline.stages[1].display_name(), "autoscale");
        assert!(config.pipeline.stages[1].params.is_empty());
        // network falls back to defaults
        assert_eq!(config.network.port, 9002);
        assert_eq!(config.network.max_readout_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn write_default_then_load() {
        let path = temp_path("roundtrip");
        ReconConfig::write_default_to(&path).expect("write_default_to failed");
        assert!(path.exists());

        let config = ReconConfig::load_from(&path).expect("load should succeed");
        assert_eq!(config.pipeline.stages, default_stages());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = ReconConfig::load_from(Path::new("/nonexistent/recon/config.toml")).unwrap();
        assert_eq!(config.network.listen_addr, "0.0.0.0");
    }
}
