//! Data models for the dxfdiff pipeline.
//!
//! - [`PipelineConfig`]: tool locations, limits, timeout, colors, working directory
//! - [`PairConfig`]: one pair of drawings under a user-chosen name
//! - [`PairState`]: per-pair stage, outputs, and error
//! - [`RunContext`]: the bounded, ordered set of pairs for one run
//! - [`MAX_PAIRS_CEILING`]: the hard limit on pairs per run

pub mod config;
pub mod pair;
pub mod run_context;

pub use self::config::{ColorScheme, MAX_PAIRS_CEILING, PipelineConfig, ToolScripts};
pub use pair::{PairConfig, PairStage, PairState, StateError, outputs};
pub use run_context::RunContext;
