use crate::error::{PipelineError, StageKind};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

/// Hard ceiling on pairs per run; `max_pairs` may be lowered but never raised past this.
pub const MAX_PAIRS_CEILING: usize = 5;

pub const DEFAULT_MAX_PAIRS: usize = 5;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

static HEX_COLOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("Invalid hex color regex"));

/// Process-wide pipeline configuration.
///
/// Loaded by [`ConfigManager`](crate::config::ConfigManager) from defaults, an
/// optional YAML file, and the environment (`TOOLS_DIR`, `MAX_PAIRS`,
/// `TIMEOUT_SECONDS`, `WORK_DIR`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root for resolving relative script paths
    #[serde(default = "default_tools_dir")]
    pub tools_dir: Utf8PathBuf,

    #[serde(default)]
    pub scripts: ToolScripts,

    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub colors: ColorScheme,

    /// Root of the pair-scoped working directories
    #[serde(default = "default_work_dir")]
    pub work_dir: Utf8PathBuf,
}

/// Script locations for each external tool, absolute or relative to `tools_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolScripts {
    #[serde(default = "default_compare_script")]
    pub compare: Utf8PathBuf,

    #[serde(default = "default_diff_script")]
    pub diff: Utf8PathBuf,

    #[serde(default = "default_dxf_script")]
    pub dxf: Utf8PathBuf,
}

/// Hex colors for the three label categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorScheme {
    #[serde(default = "default_removed_color")]
    pub removed: String,

    #[serde(default = "default_added_color")]
    pub added: String,

    #[serde(default = "default_changed_color")]
    pub changed: String,
}

impl Default for ToolScripts {
    fn default() -> Self {
        Self {
            compare: default_compare_script(),
            diff: default_diff_script(),
            dxf: default_dxf_script(),
        }
    }
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self {
            removed: default_removed_color(),
            added: default_added_color(),
            changed: default_changed_color(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tools_dir: default_tools_dir(),
            scripts: ToolScripts::default(),
            max_pairs: DEFAULT_MAX_PAIRS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            colors: ColorScheme::default(),
            work_dir: default_work_dir(),
        }
    }
}

fn default_tools_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("tools")
}

fn default_work_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("work")
}

fn default_compare_script() -> Utf8PathBuf {
    Utf8PathBuf::from("compare_labels_multi")
}

fn default_diff_script() -> Utf8PathBuf {
    Utf8PathBuf::from("diff_label_processor")
}

fn default_dxf_script() -> Utf8PathBuf {
    Utf8PathBuf::from("dxf_processor")
}

fn default_max_pairs() -> usize {
    DEFAULT_MAX_PAIRS
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_removed_color() -> String {
    "#FF00FF".to_string()
}

fn default_added_color() -> String {
    "#00FFFF".to_string()
}

fn default_changed_color() -> String {
    "#FFFF00".to_string()
}

impl ColorScheme {
    pub fn is_valid_hex(color: &str) -> bool {
        HEX_COLOR.is_match(color)
    }

    /// (label, value) for every color, in argument order.
    pub fn entries(&self) -> [(&'static str, &str); 3] {
        [
            ("removed", self.removed.as_str()),
            ("added", self.added.as_str()),
            ("changed", self.changed.as_str()),
        ]
    }
}

impl PipelineConfig {
    /// Resolve the script for a stage against `tools_dir`.
    pub fn script_path(&self, stage: StageKind) -> Utf8PathBuf {
        let script = match stage {
            StageKind::Comparison => &self.scripts.compare,
            StageKind::DiffDetail => &self.scripts.diff,
            StageKind::ColorApplication => &self.scripts.dxf,
        };

        if script.is_absolute() {
            script.clone()
        } else {
            self.tools_dir.join(script)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Working directory reserved for one pair.
    pub fn pair_dir(&self, pair_name: &str) -> Utf8PathBuf {
        self.work_dir.join(pair_name)
    }

    /// Check every constraint; the first violation wins.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_pairs == 0 || self.max_pairs > MAX_PAIRS_CEILING {
            return Err(PipelineError::configuration(format!(
                "max_pairs must be between 1 and {}, got {}",
                MAX_PAIRS_CEILING, self.max_pairs
            )));
        }

        if self.timeout_seconds == 0 {
            return Err(PipelineError::configuration(
                "timeout_seconds must be positive",
            ));
        }

        for (label, value) in self.colors.entries() {
            if !ColorScheme::is_valid_hex(value) {
                return Err(PipelineError::configuration(format!(
                    "color for {} must look like #RRGGBB, got {:?}",
                    label, value
                )));
            }
        }

        for stage in [
            StageKind::Comparison,
            StageKind::DiffDetail,
            StageKind::ColorApplication,
        ] {
            let path = self.script_path(stage);
            if !path.is_file() {
                return Err(PipelineError::configuration(format!(
                    "{} script not found: {}",
                    stage, path
                )));
            }
            if !is_executable(&path) {
                return Err(PipelineError::configuration(format!(
                    "{} script is not executable: {}",
                    stage, path
                )));
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Utf8Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Utf8Path) -> bool {
    path.is_file()
}
