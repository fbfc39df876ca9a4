use crate::error::PipelineError;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Logical output names recorded by the stages.
pub mod outputs {
    pub const COMPARISON_WORKBOOK: &str = "comparison_workbook";
    pub const CSV_SHEET_PREFIX: &str = "csv_sheet_";
    pub const DIFF_RESULT: &str = "diff_result";
    pub const LABEL_PREFIX: &str = "label_";
    pub const COLORED_DXF: &str = "colored_dxf";
}

/// One comparison unit: two drawings under a user-chosen name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairConfig {
    pub pair_name: String,
    #[serde(rename = "file_a")]
    pub file_a_path: Utf8PathBuf,
    #[serde(rename = "file_b")]
    pub file_b_path: Utf8PathBuf,
}

impl PairConfig {
    pub fn new(
        pair_name: impl Into<String>,
        file_a_path: impl Into<Utf8PathBuf>,
        file_b_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            pair_name: pair_name.into(),
            file_a_path: file_a_path.into(),
            file_b_path: file_b_path.into(),
        }
    }

    /// Base name of the original drawing A as uploaded.
    pub fn original_a_name(&self) -> &str {
        self.file_a_path.file_name().unwrap_or(self.file_a_path.as_str())
    }

    /// Base name of the original drawing B as uploaded.
    pub fn original_b_name(&self) -> &str {
        self.file_b_path.file_name().unwrap_or(self.file_b_path.as_str())
    }

    /// Pair names double as directory names, so they must be a single plain
    /// path component.
    pub fn validate_name(&self) -> Result<(), PipelineError> {
        let name = self.pair_name.as_str();
        let reason = if name.trim().is_empty() {
            Some("pair name must not be empty")
        } else if name != name.trim() {
            Some("pair name must not start or end with whitespace")
        } else if name == "." || name == ".." {
            Some("pair name must not be . or ..")
        } else if name.contains(['/', '\\', '\0']) {
            Some("pair name must not contain path separators")
        } else {
            None
        };

        match reason {
            Some(message) => Err(PipelineError::validation(Some(name), message)),
            None => Ok(()),
        }
    }
}

/// Position of a pair in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairStage {
    Registered,
    Comparing,
    ConvertedCsv,
    Diffed,
    ColorApplied,
    Complete,
    Failed,
}

impl PairStage {
    /// Rank along the happy path; `Failed` sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            PairStage::Registered => Some(0),
            PairStage::Comparing => Some(1),
            PairStage::ConvertedCsv => Some(2),
            PairStage::Diffed => Some(3),
            PairStage::ColorApplied => Some(4),
            PairStage::Complete => Some(5),
            PairStage::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PairStage::Complete | PairStage::Failed)
    }
}

impl fmt::Display for PairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairStage::Registered => "registered",
            PairStage::Comparing => "comparing",
            PairStage::ConvertedCsv => "converted_csv",
            PairStage::Diffed => "diffed",
            PairStage::ColorApplied => "color_applied",
            PairStage::Complete => "complete",
            PairStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Violations of the PairState invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("pair {pair_name} cannot move from {from} to {to}")]
    InvalidTransition {
        pair_name: String,
        from: PairStage,
        to: PairStage,
    },

    #[error("pair {pair_name} already recorded output {key}")]
    OutputAlreadyRecorded { pair_name: String, key: String },
}

impl From<StateError> for PipelineError {
    fn from(error: StateError) -> Self {
        let pair_name = match &error {
            StateError::InvalidTransition { pair_name, .. }
            | StateError::OutputAlreadyRecorded { pair_name, .. } => pair_name.clone(),
        };
        PipelineError::validation(Some(&pair_name), error.to_string())
    }
}

/// Mutable per-pair record, owned by one orchestrator task at a time.
///
/// The pair's configuration is fixed at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct PairState {
    config: PairConfig,
    stage: PairStage,
    outputs: IndexMap<String, Utf8PathBuf>,
    error: Option<PipelineError>,
    stage_durations: IndexMap<PairStage, Duration>,
}

impl PairState {
    pub fn new(config: PairConfig) -> Self {
        Self {
            config,
            stage: PairStage::Registered,
            outputs: IndexMap::new(),
            error: None,
            stage_durations: IndexMap::new(),
        }
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }

    pub fn pair_name(&self) -> &str {
        &self.config.pair_name
    }

    pub fn stage(&self) -> PairStage {
        self.stage
    }

    pub fn outputs(&self) -> &IndexMap<String, Utf8PathBuf> {
        &self.outputs
    }

    pub fn output(&self, key: &str) -> Option<&Utf8Path> {
        self.outputs.get(key).map(|p| p.as_path())
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    pub fn stage_durations(&self) -> &IndexMap<PairStage, Duration> {
        &self.stage_durations
    }

    pub fn is_complete(&self) -> bool {
        self.stage == PairStage::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.stage == PairStage::Failed
    }

    /// CSV artifacts in the order the sheets were expanded.
    pub fn csv_outputs(&self) -> Vec<&Utf8Path> {
        self.outputs
            .iter()
            .filter(|(key, _)| key.starts_with(outputs::CSV_SHEET_PREFIX))
            .map(|(_, path)| path.as_path())
            .collect()
    }

    /// Move forward along the happy path.
    pub fn advance(&mut self, to: PairStage) -> Result<(), StateError> {
        let allowed = self.error.is_none()
            && match (self.stage.rank(), to.rank()) {
                (Some(from), Some(next)) => next > from,
                _ => false,
            };

        if !allowed {
            return Err(StateError::InvalidTransition {
                pair_name: self.config.pair_name.clone(),
                from: self.stage,
                to,
            });
        }

        self.stage = to;
        Ok(())
    }

    /// Terminal failure; the first error sticks.
    pub fn fail(&mut self, error: PipelineError) -> Result<(), StateError> {
        if self.stage.is_terminal() {
            return Err(StateError::InvalidTransition {
                pair_name: self.config.pair_name.clone(),
                from: self.stage,
                to: PairStage::Failed,
            });
        }

        self.stage = PairStage::Failed;
        self.error = Some(error);
        Ok(())
    }

    /// Append one output; existing keys are never overwritten.
    pub fn record_output(
        &mut self,
        key: impl Into<String>,
        path: impl Into<Utf8PathBuf>,
    ) -> Result<(), StateError> {
        let key = key.into();
        if self.outputs.contains_key(&key) {
            return Err(StateError::OutputAlreadyRecorded {
                pair_name: self.config.pair_name.clone(),
                key,
            });
        }
        self.outputs.insert(key, path.into());
        Ok(())
    }

    pub fn record_duration(&mut self, stage: PairStage, duration: Duration) {
        self.stage_durations.insert(stage, duration);
    }

    /// One-line human summary used by the CLI and logs.
    pub fn status_line(&self) -> String {
        match &self.error {
            Some(error) => format!(
                "{}: {} ({}) - {}",
                self.config.pair_name,
                self.stage,
                error.category(),
                error
            ),
            None => format!(
                "{}: {} ({} outputs)",
                self.config.pair_name,
                self.stage,
                self.outputs.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn state() -> PairState {
        PairState::new(PairConfig::new("P1", "/in/a.dxf", "/in/b.dxf"))
    }

    #[test]
    fn test_original_names() {
        let config = PairConfig::new("P1", "/uploads/rev1/panel.dxf", "/uploads/rev2/panel_v2.dxf");
        assert_eq!(config.original_a_name(), "panel.dxf");
        assert_eq!(config.original_b_name(), "panel_v2.dxf");
    }

    #[test]
    fn test_validate_name() {
        assert!(PairConfig::new("Panel-01", "a", "b").validate_name().is_ok());
        assert!(PairConfig::new("", "a", "b").validate_name().is_err());
        assert!(PairConfig::new("..", "a", "b").validate_name().is_err());
        assert!(PairConfig::new("a/b", "a", "b").validate_name().is_err());
        assert!(PairConfig::new(" x", "a", "b").validate_name().is_err());
    }

    #[test]
    fn test_config_survives_processing_unchanged() {
        let registered = PairConfig::new("P1", "/in/a.dxf", "/in/b.dxf");
        let mut state = PairState::new(registered.clone());
        state.advance(PairStage::Comparing).unwrap();
        state
            .record_output(outputs::COLORED_DXF, Utf8PathBuf::from("/w/P1/colored/b.dxf"))
            .unwrap();

        assert_eq!(state.config(), &registered);
        assert_eq!(state.config().original_b_name(), "b.dxf");
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut state = state();
        state.advance(PairStage::Comparing).unwrap();
        state.advance(PairStage::ConvertedCsv).unwrap();
        assert!(state.advance(PairStage::Comparing).is_err());
        assert!(state.advance(PairStage::ConvertedCsv).is_err());
        state.advance(PairStage::Diffed).unwrap();
        assert_eq!(state.stage(), PairStage::Diffed);
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut state = state();
        state.advance(PairStage::Comparing).unwrap();
        state
            .fail(PipelineError::comparison(
                "P1",
                ErrorCategory::MissingInput,
                "file_a missing",
            ))
            .unwrap();

        assert!(state.is_failed());
        assert!(state.advance(PairStage::ConvertedCsv).is_err());
        assert!(state.fail(PipelineError::configuration("again")).is_err());
        assert_eq!(
            state.error().map(|e| e.category()),
            Some(ErrorCategory::MissingInput)
        );
    }

    #[test]
    fn test_outputs_are_append_only() {
        let mut state = state();
        state.record_output("csv_sheet_removed", "/w/removed.csv").unwrap();
        state.record_output("csv_sheet_added", "/w/added.csv").unwrap();
        let err = state
            .record_output("csv_sheet_removed", "/w/other.csv")
            .unwrap_err();
        assert!(matches!(err, StateError::OutputAlreadyRecorded { .. }));
        assert_eq!(
            state.output("csv_sheet_removed"),
            Some(Utf8Path::new("/w/removed.csv"))
        );
        assert_eq!(state.csv_outputs().len(), 2);
    }

    #[test]
    fn test_status_line() {
        let mut state = state();
        assert_eq!(state.status_line(), "P1: registered (0 outputs)");
        state
            .fail(PipelineError::validation(Some("P1"), "bad"))
            .unwrap();
        assert!(state.status_line().starts_with("P1: failed (validation)"));
    }
}
