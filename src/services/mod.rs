//! Services module - the pipeline that turns drawing pairs into colored diffs.
//!
//! # Components
//!
//! - [`StageRunner`]: runs one stage for one pair. The comparison runs
//!   in-process through a [`LabelComparator`]; diff detail and color
//!   application are external tools launched with typed arguments, a timeout,
//!   and captured output.
//! - [`comparison`]: the comparator seam, the [`Workbook`] it returns, and the
//!   per-sheet CSV expansion.
//! - [`PipelineOrchestrator`]: drives each pair through the stages in its own
//!   task, bounded by `max_pairs`, with cooperative cancellation.
//! - [`ArchiveBuilder`]: packages finished outputs into a deterministic ZIP.
//!
//! Stage failures never escape as errors from the orchestrator; they are
//! recorded on the pair's [`PairState`](crate::models::PairState).

pub mod archive;
pub mod comparison;
pub mod orchestrator;
pub mod stage_runner;

pub use archive::{ArchiveBuilder, ArchiveEntry, ArchiveManifest, ArchiveSource, archive_contents};
pub use comparison::{AbortSignal, CommandComparator, LabelComparator, Sheet, Workbook};
pub use orchestrator::{CancelHandle, PipelineOrchestrator};
pub use stage_runner::{
    Argument, ColorParams, ComparisonParams, DiffParams, StageOutput, StageRequest, StageResult,
    StageRunner, ToolInvocation,
};
