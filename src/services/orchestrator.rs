use crate::error::{ErrorCategory, PipelineError, StageKind};
use crate::metrics::RunMetrics;
use crate::models::{PairConfig, PairStage, PairState, PipelineConfig, RunContext, outputs};
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use crate::services::comparison::{self, LabelComparator};
use crate::services::stage_runner::{
    ColorParams, ComparisonParams, DiffParams, StageOutput, StageRequest, StageResult, StageRunner,
};
use camino::Utf8Path;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

/// Drives every registered pair through comparison, diff detail, and color
/// application.
///
/// Each pair runs in its own task and owns its [`PairState`] until the task
/// returns it. A failure stops that pair only; siblings keep going.
///
/// # Cancellation
///
/// [`request_cancel`](Self::request_cancel) flips a watch channel that every
/// pair task races against with `tokio::select!`:
/// - while queued on the semaphore
/// - between stages
/// - while a stage is running (the child process is killed on drop)
///
/// Pairs stopped this way end `Failed` with the `cancelled` category. Each run
/// starts with the flag cleared.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    runner: StageRunner,
    progress: Arc<dyn ProgressSink>,
    metrics: Arc<RunMetrics>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

/// Cloneable handle for requesting cancellation from another task.
#[derive(Clone)]
pub struct CancelHandle {
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn request_cancel(&self) {
        tracing::warn!("Cancellation requested");
        self.cancel_tx.send_replace(true);
    }
}

/// Everything one pair task needs; cloned into the task.
#[derive(Clone)]
struct PairWorker {
    config: Arc<PipelineConfig>,
    runner: StageRunner,
    progress: Arc<dyn ProgressSink>,
    metrics: Arc<RunMetrics>,
}

enum Slot {
    Settled(PairState),
    Running(PairConfig, JoinHandle<PairState>),
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig, comparator: Arc<dyn LabelComparator>) -> Self {
        let runner = StageRunner::new(&config, comparator);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            runner,
            progress: Arc::new(NoProgress),
            metrics: Arc::new(RunMetrics::new()),
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn request_cancel(&self) {
        self.cancel_handle().request_cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancel_tx: Arc::clone(&self.cancel_tx),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Validate the whole list, then process every pair.
    ///
    /// Registration problems (too many pairs, duplicate or unusable names) fail
    /// the call before any pair is touched. Stage failures never do: they end
    /// up in the returned states, which keep registration order.
    pub async fn run_all(&self, pairs: Vec<PairConfig>) -> Result<Vec<PairState>, PipelineError> {
        let context = RunContext::from_pairs(self.config.max_pairs, pairs)?;
        Ok(self.run(context).await?.into_pairs())
    }

    /// Process every `Registered` pair of an existing context.
    ///
    /// A context holding more pairs than this orchestrator's `max_pairs` is
    /// rejected before any pair is touched. Pairs already `Complete` or
    /// `Failed` are left as they are.
    pub async fn run(&self, mut context: RunContext) -> Result<RunContext, PipelineError> {
        if context.len() > self.config.max_pairs {
            return Err(PipelineError::validation(
                None,
                format!(
                    "{} pairs registered but at most {} are allowed",
                    context.len(),
                    self.config.max_pairs
                ),
            ));
        }

        let pairs = context.take_pairs();
        let finished = self.run_states(pairs).await;
        context.restore_pairs(finished);
        Ok(context)
    }

    async fn run_states(&self, pairs: Vec<PairState>) -> Vec<PairState> {
        self.cancel_tx.send_replace(false);

        if pairs.is_empty() {
            tracing::info!("No pairs registered, nothing to do");
            return pairs;
        }

        let permits = self.config.max_pairs.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        tracing::info!(
            "Starting run of {} pair(s) (max concurrent: {})",
            pairs.len(),
            permits
        );

        let worker = PairWorker {
            config: Arc::clone(&self.config),
            runner: self.runner.clone(),
            progress: Arc::clone(&self.progress),
            metrics: Arc::clone(&self.metrics),
        };

        // All tasks are spawned up front and queue on the semaphore, so a
        // cancellation reaches queued pairs immediately
        let mut slots = Vec::with_capacity(pairs.len());
        for state in pairs {
            if state.stage() != PairStage::Registered {
                tracing::warn!(
                    "Skipping pair {} already in stage {}",
                    state.pair_name(),
                    state.stage()
                );
                slots.push(Slot::Settled(state));
                continue;
            }

            let config = state.config().clone();
            let worker = worker.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel_rx = self.cancel_tx.subscribe();
            let task =
                tokio::spawn(async move { worker.process(state, semaphore, cancel_rx).await });
            slots.push(Slot::Running(config, task));
        }

        let mut finished = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Settled(state) => finished.push(state),
                Slot::Running(config, task) => match task.await {
                    Ok(state) => finished.push(state),
                    Err(e) => {
                        tracing::error!("Task for pair {} aborted: {}", config.pair_name, e);
                        let mut state = PairState::new(config);
                        let error = PipelineError::comparison(
                            state.pair_name(),
                            ErrorCategory::Comparison,
                            format!("pair task aborted: {}", e),
                        );
                        if state.fail(error).is_ok() {
                            self.metrics.record_pair_failed();
                        }
                        finished.push(state);
                    }
                },
            }
        }

        let completed = finished.iter().filter(|p| p.is_complete()).count();
        tracing::info!(
            "Run finished: {} of {} pair(s) complete",
            completed,
            finished.len()
        );
        self.metrics.log_summary();
        finished
    }
}

impl PairWorker {
    async fn process(
        self,
        mut state: PairState,
        semaphore: Arc<Semaphore>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> PairState {
        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };

        let outcome = match permit {
            Some(_permit) => self.drive(&mut state, &mut cancel_rx).await,
            None => {
                tracing::warn!("Pair {} cancelled before starting", state.pair_name());
                Err(PipelineError::Cancelled {
                    pair_name: state.pair_name().to_string(),
                    stage: StageKind::Comparison,
                })
            }
        };

        match outcome {
            Ok(()) => {
                self.metrics.record_pair_completed();
                tracing::info!("[{}] Pair complete", state.pair_name());
            }
            Err(error) => self.fail(&mut state, error),
        }

        state
    }

    /// Run all three stages in order, stopping at the first error.
    async fn drive(
        &self,
        state: &mut PairState,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let pair_name = state.pair_name().to_string();
        let pair_dir = self.config.pair_dir(&pair_name);

        // Stage 1: comparison, then one CSV per facet sheet
        self.advance(state, PairStage::Comparing)?;
        let start = Instant::now();
        let request = StageRequest::Comparison(ComparisonParams {
            pair_name: pair_name.clone(),
            file_a: state.config().file_a_path.clone(),
            file_b: state.config().file_b_path.clone(),
        });
        let StageOutput::Comparison { workbook } = self.run_stage(request, cancel_rx).await? else {
            return Err(unexpected_output(&pair_name, StageKind::Comparison));
        };

        if workbook.facet_sheets().next().is_none() {
            return Err(PipelineError::comparison(
                &pair_name,
                ErrorCategory::Comparison,
                "comparison produced no label sheets",
            ));
        }

        prepare_pair_dir(&pair_dir).map_err(|e| io_error(&pair_name, e))?;

        let workbook_path = pair_dir.join("comparison.yaml");
        comparison::write_workbook(&workbook, &workbook_path).map_err(|e| io_error(&pair_name, e))?;
        state.record_output(outputs::COMPARISON_WORKBOOK, workbook_path)?;

        let csv_dir = pair_dir.join("csv");
        fs::create_dir_all(&csv_dir).map_err(|e| {
            io_error(&pair_name, anyhow::Error::new(e).context(csv_dir.to_string()))
        })?;
        let csv_files = comparison::expand_workbook_to_csv(&workbook, &csv_dir)
            .map_err(|e| io_error(&pair_name, e))?;
        for (stem, path) in csv_files {
            state.record_output(format!("{}{}", outputs::CSV_SHEET_PREFIX, stem), path)?;
        }
        state.record_duration(PairStage::ConvertedCsv, start.elapsed());
        self.advance(state, PairStage::ConvertedCsv)?;

        // Stage 2: diff detail over the CSVs
        let start = Instant::now();
        let request = StageRequest::DiffDetail(DiffParams {
            pair_name: pair_name.clone(),
            csv_inputs: state.csv_outputs().into_iter().map(Utf8Path::to_path_buf).collect(),
            output_dir: pair_dir.join("diff"),
        });
        let StageOutput::DiffDetail {
            diff_result,
            label_files,
        } = self.run_stage(request, cancel_rx).await?
        else {
            return Err(unexpected_output(&pair_name, StageKind::DiffDetail));
        };
        state.record_output(outputs::DIFF_RESULT, diff_result.clone())?;
        for (kind, path) in label_files {
            state.record_output(format!("{}{}", outputs::LABEL_PREFIX, kind), path)?;
        }
        state.record_duration(PairStage::Diffed, start.elapsed());
        self.advance(state, PairStage::Diffed)?;

        // Stage 3: colors applied to the revised drawing
        let start = Instant::now();
        let request = StageRequest::ColorApplication(ColorParams {
            pair_name: pair_name.clone(),
            diff_result,
            drawing: state.config().file_b_path.clone(),
            colors: self.config.colors.clone(),
            output_dir: pair_dir.join("colored"),
        });
        let StageOutput::ColorApplication { colored_dxf } =
            self.run_stage(request, cancel_rx).await?
        else {
            return Err(unexpected_output(&pair_name, StageKind::ColorApplication));
        };
        state.record_output(outputs::COLORED_DXF, colored_dxf)?;
        state.record_duration(PairStage::ColorApplied, start.elapsed());
        self.advance(state, PairStage::ColorApplied)?;

        self.advance(state, PairStage::Complete)
    }

    /// Run one stage unless cancellation wins the race.
    async fn run_stage(
        &self,
        request: StageRequest,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> StageResult {
        let stage = request.kind();
        let pair_name = request.pair_name().to_string();
        let cancelled_error = || PipelineError::Cancelled {
            pair_name: pair_name.clone(),
            stage,
        };

        if *cancel_rx.borrow() {
            return Err(cancelled_error());
        }

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancelled(cancel_rx) => {
                tracing::warn!("[{}] Cancelling {} in flight", pair_name, stage);
                return Err(cancelled_error());
            }
            result = self.runner.run(request) => result,
        };

        let elapsed: Duration = start.elapsed();
        let timed_out = result.as_ref().is_err_and(|e| e.is_timeout());
        self.metrics
            .record_stage(stage, elapsed, result.is_err(), timed_out);
        result
    }

    fn advance(&self, state: &mut PairState, stage: PairStage) -> Result<(), PipelineError> {
        state.advance(stage)?;
        self.progress
            .notify(&ProgressEvent::entered(state.pair_name(), stage));
        Ok(())
    }

    fn fail(&self, state: &mut PairState, error: PipelineError) {
        if error.category() == ErrorCategory::Cancelled {
            self.metrics.record_pair_cancelled();
            tracing::warn!("{}", error);
        } else {
            self.metrics.record_pair_failed();
            tracing::error!("{}", error);
            if !error.stderr().is_empty() {
                tracing::error!("[{}] stderr tail:\n{}", state.pair_name(), error.stderr());
            }
        }

        let event = ProgressEvent::failed(state.pair_name(), error.category(), error.to_string());
        match state.fail(error) {
            Ok(()) => self.progress.notify(&event),
            Err(e) => tracing::error!("Could not mark pair as failed: {}", e),
        }
    }
}

/// Resolves once cancellation is requested; never resolves if the sender is gone.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    if cancel_rx.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Recreate the pair's working directory so no stale artifacts survive.
fn prepare_pair_dir(pair_dir: &Utf8Path) -> anyhow::Result<()> {
    use anyhow::Context;

    if pair_dir.exists() {
        fs::remove_dir_all(pair_dir)
            .with_context(|| format!("Failed to clear pair directory: {}", pair_dir))?;
    }
    fs::create_dir_all(pair_dir)
        .with_context(|| format!("Failed to create pair directory: {}", pair_dir))
}

fn io_error(pair_name: &str, error: anyhow::Error) -> PipelineError {
    PipelineError::comparison(pair_name, ErrorCategory::Io, format!("{:#}", error))
}

fn unexpected_output(pair_name: &str, stage: StageKind) -> PipelineError {
    PipelineError::comparison(
        pair_name,
        ErrorCategory::Comparison,
        format!("{} returned output for a different stage", stage),
    )
}
