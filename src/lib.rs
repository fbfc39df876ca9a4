// dxfdiff - batch comparison of DXF drawing pairs
//
// This is the library crate containing the pipeline, its data model, and the
// packaging of results. The binary crate (main.rs) is a headless driver.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod progress;
pub mod services;

// Re-export commonly used types for convenience
pub use crate::config::ConfigManager;
pub use error::{ErrorCategory, PipelineError, StageKind};
pub use models::{PairConfig, PairStage, PairState, PipelineConfig, RunContext};
pub use progress::{ProgressEvent, ProgressSink};
pub use services::{ArchiveBuilder, ArchiveSource, PipelineOrchestrator};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
