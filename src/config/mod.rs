use crate::error::PipelineError;
use crate::models::{PairConfig, PipelineConfig};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use ::config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::fs;

/// Environment variables the pipeline reads, mapped to their config keys.
pub const ENV_KEYS: [(&str, &str); 4] = [
    ("TOOLS_DIR", "tools_dir"),
    ("MAX_PAIRS", "max_pairs"),
    ("TIMEOUT_SECONDS", "timeout_seconds"),
    ("WORK_DIR", "work_dir"),
];

/// Default name of the optional YAML config file.
pub const DEFAULT_CONFIG_FILE: &str = "dxfdiff.yaml";

/// Configuration manager for loading and saving the pipeline configuration.
///
/// Sources are layered lowest to highest:
/// - Built-in defaults ([`PipelineConfig::default`])
/// - Optional YAML file (`dxfdiff.yaml` unless told otherwise)
/// - Environment: `TOOLS_DIR`, `MAX_PAIRS`, `TIMEOUT_SECONDS`, `WORK_DIR`
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager reading the given YAML file (which may not exist).
    pub fn new<P: AsRef<Utf8Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// Load from the file and the process environment, then validate.
    ///
    /// Fails fast with a configuration error so a bad setup never reaches a
    /// pair.
    pub fn load(&self) -> Result<PipelineConfig, PipelineError> {
        let env = ENV_KEYS
            .iter()
            .filter_map(|(var, _)| std::env::var(var).ok().map(|v| (var.to_string(), v)))
            .collect();
        self.load_with_env(env)
    }

    /// Load with an explicit environment map instead of the process environment.
    pub fn load_with_env(
        &self,
        env: HashMap<String, String>,
    ) -> Result<PipelineConfig, PipelineError> {
        let config = self
            .read_layers(env)
            .map_err(|e| PipelineError::configuration(format!("{:#}", e)))?;
        config.validate()?;

        tracing::info!(
            "Loaded pipeline config: tools_dir={}, max_pairs={}, timeout={}s, work_dir={}",
            config.tools_dir,
            config.max_pairs,
            config.timeout_seconds,
            config.work_dir
        );
        Ok(config)
    }

    /// Merge all layers without validating.
    pub fn read_layers(&self, env: HashMap<String, String>) -> Result<PipelineConfig> {
        if self.config_path.exists() {
            tracing::info!("Reading config file {}", self.config_path);
        } else {
            tracing::debug!(
                "Config file not found at {}, using defaults and environment",
                self.config_path
            );
        }

        // Only the known variables are forwarded, keyed the way Environment expects
        let env: ::config::Map<String, String> = env
            .into_iter()
            .filter(|(var, _)| ENV_KEYS.iter().any(|(known, _)| known == var))
            .collect();

        let defaults = serde_yaml_ng::to_string(&PipelineConfig::default())
            .context("Failed to serialize default config")?;

        let merged = Config::builder()
            .add_source(File::from_str(&defaults, FileFormat::Yaml))
            .add_source(
                File::new(self.config_path.as_str(), FileFormat::Yaml).required(false),
            )
            .add_source(Environment::default().source(Some(env)).try_parsing(true))
            .build()
            .with_context(|| format!("Failed to read config layers from {}", self.config_path))?;

        merged
            .try_deserialize::<PipelineConfig>()
            .context("Failed to parse pipeline config")
    }

    /// Save a configuration as YAML to the managed path.
    pub fn save(&self, config: &PipelineConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {}", parent))?;
            }
        }

        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", self.config_path))?;

        tracing::info!("Saved config to {}", self.config_path);
        Ok(())
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}

/// Read a pair manifest: a YAML list of `{pair_name, file_a, file_b}`.
///
/// Only the file format is checked here; name and count rules are enforced
/// when the pairs are registered.
pub fn load_pairs<P: AsRef<Utf8Path>>(path: P) -> Result<Vec<PairConfig>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read pair manifest: {}", path))?;
    let pairs: Vec<PairConfig> = serde_yaml_ng::from_str(&content)
        .with_context(|| format!("Failed to parse pair manifest: {}", path))?;

    tracing::info!("Loaded {} pair(s) from {}", pairs.len(), path);
    Ok(pairs)
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_FILE)
    }
}
