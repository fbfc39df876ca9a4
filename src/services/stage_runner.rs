use crate::error::{ErrorCategory, PipelineError, StageKind, ToolExit, ToolFailure};
use crate::models::{ColorScheme, PipelineConfig};
use crate::services::comparison::{AbortSignal, LabelComparator, Workbook};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::any::Any;
use std::fs;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Label files the diff tool may write next to its main result, by kind.
pub const LABEL_KINDS: [&str; 4] = ["deleted", "added", "modified_a", "modified_b"];

/// How long to keep reading a tool's pipes after it exited or was killed.
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Parameters for the in-process comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonParams {
    pub pair_name: String,
    pub file_a: Utf8PathBuf,
    pub file_b: Utf8PathBuf,
}

/// Parameters for the diff detail tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffParams {
    pub pair_name: String,
    pub csv_inputs: Vec<Utf8PathBuf>,
    pub output_dir: Utf8PathBuf,
}

/// Parameters for the color application tool.
///
/// One drawing is colored per pair, the revised one. Labels that were removed
/// exist only in the original drawing, so `colors.removed` has nothing to act
/// on there; it is still passed so the tool sees the full scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorParams {
    pub pair_name: String,
    pub diff_result: Utf8PathBuf,
    pub drawing: Utf8PathBuf,
    pub colors: ColorScheme,
    pub output_dir: Utf8PathBuf,
}

/// One unit of work for [`StageRunner::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRequest {
    Comparison(ComparisonParams),
    DiffDetail(DiffParams),
    ColorApplication(ColorParams),
}

impl StageRequest {
    pub fn kind(&self) -> StageKind {
        match self {
            StageRequest::Comparison(_) => StageKind::Comparison,
            StageRequest::DiffDetail(_) => StageKind::DiffDetail,
            StageRequest::ColorApplication(_) => StageKind::ColorApplication,
        }
    }

    pub fn pair_name(&self) -> &str {
        match self {
            StageRequest::Comparison(p) => &p.pair_name,
            StageRequest::DiffDetail(p) => &p.pair_name,
            StageRequest::ColorApplication(p) => &p.pair_name,
        }
    }
}

/// What a successful stage produced. The caller records it.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Comparison {
        workbook: Workbook,
    },
    DiffDetail {
        diff_result: Utf8PathBuf,
        /// Optional per-kind label files, in [`LABEL_KINDS`] order
        label_files: IndexMap<String, Utf8PathBuf>,
    },
    ColorApplication {
        colored_dxf: Utf8PathBuf,
    },
}

pub type StageResult = Result<StageOutput, PipelineError>;

/// A single command-line argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Positional(String),
    Flag { name: String, value: String },
}

/// Typed argument list for an external tool.
///
/// Positional arguments always come first, in the order they were added,
/// followed by flags in the order they were added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    program: Utf8PathBuf,
    arguments: Vec<Argument>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
        }
    }

    pub fn positional(mut self, value: impl Into<String>) -> Self {
        self.arguments.push(Argument::Positional(value.into()));
        self
    }

    pub fn flag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.push(Argument::Flag {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Reject argument lists that could not mean what the caller intended.
    pub fn validate(&self) -> Result<(), String> {
        if self.program.as_str().is_empty() {
            return Err("program path is empty".to_string());
        }

        for argument in &self.arguments {
            match argument {
                Argument::Positional(value) => {
                    if value.is_empty() {
                        return Err("positional argument is empty".to_string());
                    }
                    if value.starts_with('-') {
                        return Err(format!("positional argument looks like a flag: {}", value));
                    }
                }
                Argument::Flag { name, value } => {
                    let bare = name.strip_prefix("--").unwrap_or_default();
                    if bare.is_empty()
                        || !bare.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                    {
                        return Err(format!("invalid flag name: {:?}", name));
                    }
                    if value.is_empty() {
                        return Err(format!("flag {} has no value", name));
                    }
                }
            }
        }

        Ok(())
    }

    /// Flatten into argv order (program excluded).
    pub fn to_args(&self) -> Vec<String> {
        let positionals = self.arguments.iter().filter_map(|arg| match arg {
            Argument::Positional(value) => Some(value.clone()),
            Argument::Flag { .. } => None,
        });
        let flags = self.arguments.iter().flat_map(|arg| match arg {
            Argument::Flag { name, value } => vec![name.clone(), value.clone()],
            Argument::Positional(_) => Vec::new(),
        });
        positionals.chain(flags).collect()
    }
}

/// Captured result of a tool that exited 0.
#[derive(Debug, Clone)]
struct ProcessOutput {
    stdout: String,
    stderr: String,
    duration: Duration,
}

/// Runs one stage for one pair and reports a typed result.
///
/// The runner holds no per-pair state; the orchestrator owns the PairState and
/// records whatever the runner returns.
#[derive(Clone)]
pub struct StageRunner {
    comparator: Arc<dyn LabelComparator>,
    diff_script: Utf8PathBuf,
    dxf_script: Utf8PathBuf,
    timeout: Duration,
}

impl StageRunner {
    pub fn new(config: &PipelineConfig, comparator: Arc<dyn LabelComparator>) -> Self {
        Self {
            comparator,
            diff_script: config.script_path(StageKind::DiffDetail),
            dxf_script: config.script_path(StageKind::ColorApplication),
            timeout: config.timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, request: StageRequest) -> StageResult {
        match request {
            StageRequest::Comparison(params) => self.run_comparison(params).await,
            StageRequest::DiffDetail(params) => self.run_diff(params).await,
            StageRequest::ColorApplication(params) => self.run_color(params).await,
        }
    }

    async fn run_comparison(&self, params: ComparisonParams) -> StageResult {
        for (label, path) in [("file_a", &params.file_a), ("file_b", &params.file_b)] {
            if !path.is_file() {
                return Err(PipelineError::comparison(
                    &params.pair_name,
                    ErrorCategory::MissingInput,
                    format!("{} not found: {}", label, path),
                ));
            }
        }

        tracing::info!("[{}] Comparing {} with {}", params.pair_name, params.file_a, params.file_b);

        let comparator = Arc::clone(&self.comparator);
        let ComparisonParams {
            pair_name,
            file_a,
            file_b,
        } = params;
        let name = pair_name.clone();
        // Dropping the guard (timeout, cancellation) tells the comparator to stop
        let (_abort_guard, abort) = AbortSignal::new();
        let handle = tokio::task::spawn_blocking(move || {
            comparator.compare_labels_multi(&file_a, &file_b, &name, &abort)
        });

        let joined = timeout(self.timeout, handle).await.map_err(|_| {
            tracing::warn!("[{}] Comparison timed out after {:?}", pair_name, self.timeout);
            PipelineError::comparison(
                &pair_name,
                ErrorCategory::Timeout,
                format!("comparison timed out after {}s", self.timeout.as_secs()),
            )
        })?;

        let workbook = match joined {
            Ok(Ok(workbook)) => workbook,
            Ok(Err(e)) => {
                return Err(PipelineError::comparison(
                    &pair_name,
                    ErrorCategory::Comparison,
                    format!("{:#}", e),
                ));
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("comparison panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "comparison task was cancelled".to_string()
                };
                return Err(PipelineError::comparison(
                    &pair_name,
                    ErrorCategory::Comparison,
                    message,
                ));
            }
        };

        tracing::info!(
            "[{}] Comparison produced {} sheet(s)",
            pair_name,
            workbook.sheets.len()
        );
        Ok(StageOutput::Comparison { workbook })
    }

    async fn run_diff(&self, params: DiffParams) -> StageResult {
        let stage = StageKind::DiffDetail;
        let pair = params.pair_name.as_str();

        if params.csv_inputs.is_empty() {
            return Err(invalid(pair, stage, "no CSV inputs"));
        }
        for csv in &params.csv_inputs {
            if !csv.is_file() {
                return Err(invalid(pair, stage, format!("CSV input not found: {}", csv)));
            }
        }

        let invocation = params
            .csv_inputs
            .iter()
            .fold(ToolInvocation::new(&self.diff_script), |inv, csv| {
                inv.positional(csv.as_str())
            })
            .flag("--pair-name", pair)
            .flag("--output-dir", params.output_dir.as_str());

        self.execute(pair, stage, &invocation, &params.output_dir)
            .await?;

        let diff_result = params.output_dir.join(format!("{}_diff.txt", pair));
        expect_output(pair, stage, &diff_result)?;

        let label_files: IndexMap<String, Utf8PathBuf> = LABEL_KINDS
            .iter()
            .map(|kind| {
                (
                    kind.to_string(),
                    params.output_dir.join(format!("{}_{}.txt", pair, kind)),
                )
            })
            .filter(|(_, path)| path.is_file())
            .collect();

        tracing::info!(
            "[{}] Diff detail wrote {} with {} label file(s)",
            pair,
            diff_result,
            label_files.len()
        );
        Ok(StageOutput::DiffDetail {
            diff_result,
            label_files,
        })
    }

    async fn run_color(&self, params: ColorParams) -> StageResult {
        let stage = StageKind::ColorApplication;
        let pair = params.pair_name.as_str();

        if !params.diff_result.is_file() {
            return Err(invalid(
                pair,
                stage,
                format!("diff result not found: {}", params.diff_result),
            ));
        }
        if !params.drawing.is_file() {
            return Err(invalid(
                pair,
                stage,
                format!("drawing not found: {}", params.drawing),
            ));
        }
        for (label, value) in params.colors.entries() {
            if !ColorScheme::is_valid_hex(value) {
                return Err(invalid(
                    pair,
                    stage,
                    format!("color for {} is not #RRGGBB: {:?}", label, value),
                ));
            }
        }
        let Some(drawing_name) = params.drawing.file_name() else {
            return Err(invalid(pair, stage, "drawing path has no file name"));
        };

        let invocation = ToolInvocation::new(&self.dxf_script)
            .positional(params.diff_result.as_str())
            .positional(params.drawing.as_str())
            .flag("--color-removed", &params.colors.removed)
            .flag("--color-added", &params.colors.added)
            .flag("--color-changed", &params.colors.changed)
            .flag("--output-dir", params.output_dir.as_str());

        self.execute(pair, stage, &invocation, &params.output_dir)
            .await?;

        let colored_dxf = params.output_dir.join(drawing_name);
        expect_output(pair, stage, &colored_dxf)?;

        tracing::info!("[{}] Colored drawing written to {}", pair, colored_dxf);
        Ok(StageOutput::ColorApplication { colored_dxf })
    }

    /// Launch the tool, wait up to the timeout, and classify the outcome.
    async fn execute(
        &self,
        pair_name: &str,
        stage: StageKind,
        invocation: &ToolInvocation,
        output_dir: &Utf8Path,
    ) -> Result<ProcessOutput, PipelineError> {
        invocation
            .validate()
            .map_err(|message| invalid(pair_name, stage, message))?;

        fs::create_dir_all(output_dir).map_err(|e| {
            PipelineError::from_tool(ToolFailure::new(
                pair_name,
                stage,
                ToolExit::SpawnFailed,
                format!("failed to create output directory {}: {}", output_dir, e),
            ))
        })?;

        let args = invocation.to_args();
        tracing::info!("[{}] Executing {}", pair_name, stage);
        tracing::debug!("[{}] {} {}", pair_name, invocation.program(), args.join(" "));

        let start = Instant::now();
        let mut child = Command::new(invocation.program().as_std_path())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::from_tool(ToolFailure::new(
                    pair_name,
                    stage,
                    ToolExit::SpawnFailed,
                    format!("failed to start {}: {}", invocation.program(), e),
                ))
            })?;

        let stdout = PipeCapture::drain(child.stdout.take());
        let stderr = PipeCapture::drain(child.stderr.take());

        let status = match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(PipelineError::from_tool(ToolFailure::new(
                    pair_name,
                    stage,
                    ToolExit::SpawnFailed,
                    format!("failed to wait for {}: {}", invocation.program(), e),
                )));
            }
            Err(_) => {
                tracing::warn!(
                    "[{}] {} timed out after {:?}",
                    pair_name,
                    stage,
                    self.timeout
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("[{}] Failed to kill {}: {}", pair_name, stage, e);
                }
                let stderr = stderr.finish().await;
                return Err(PipelineError::from_tool(
                    ToolFailure::new(
                        pair_name,
                        stage,
                        ToolExit::Timeout(self.timeout),
                        format!("no result after {}s", self.timeout.as_secs()),
                    )
                    .with_stderr(&stderr),
                ));
            }
        };

        let captured = ProcessOutput {
            stdout: stdout.finish().await,
            stderr: stderr.finish().await,
            duration: start.elapsed(),
        };

        if !status.success() {
            let exit = match status.code() {
                Some(code) => ToolExit::Code(code),
                None => ToolExit::Signal,
            };
            let last_line = captured
                .stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no diagnostic output")
                .trim()
                .to_string();
            return Err(PipelineError::from_tool(
                ToolFailure::new(pair_name, stage, exit, last_line).with_stderr(&captured.stderr),
            ));
        }

        tracing::info!(
            "[{}] {} completed in {:.2}s",
            pair_name,
            stage,
            captured.duration.as_secs_f32()
        );
        if !captured.stdout.trim().is_empty() {
            tracing::debug!("[{}] {} stdout: {}", pair_name, stage, captured.stdout.trim());
        }
        if !captured.stderr.trim().is_empty() {
            tracing::debug!("[{}] {} stderr: {}", pair_name, stage, captured.stderr.trim());
        }

        Ok(captured)
    }
}

/// Collects everything a child writes to one pipe, even if it never exits.
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl PipeCapture {
    fn drain<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let reader = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut buffer) = sink.lock() {
                            buffer.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        });
        Self { buffer, reader }
    }

    /// Wait briefly for the pipe to close, then return what was read.
    ///
    /// Grandchildren can hold the pipe open past the tool's exit, so the reader
    /// is abandoned after [`PIPE_GRACE`].
    async fn finish(mut self) -> String {
        if timeout(PIPE_GRACE, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
        self.buffer
            .lock()
            .map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
            .unwrap_or_default()
    }
}

fn invalid(pair_name: &str, stage: StageKind, message: impl Into<String>) -> PipelineError {
    PipelineError::from_tool(ToolFailure::new(
        pair_name,
        stage,
        ToolExit::InvalidArguments,
        message,
    ))
}

fn expect_output(pair_name: &str, stage: StageKind, path: &Utf8Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::from_tool(ToolFailure::new(
            pair_name,
            stage,
            ToolExit::MissingOutput,
            format!("expected output not found: {}", path),
        )))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::comparison::{CommandComparator, MockLabelComparator, Sheet};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn temp_dir() -> (TempDir, Utf8PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        (temp, path)
    }

    fn runner_with(comparator: MockLabelComparator, dir: &Utf8Path) -> StageRunner {
        let config = PipelineConfig {
            tools_dir: dir.to_path_buf(),
            timeout_seconds: 5,
            ..PipelineConfig::default()
        };
        StageRunner::new(&config, Arc::new(comparator))
    }

    fn touch(path: &Utf8Path) {
        fs::write(path, "0\nSECTION\n").unwrap();
    }

    struct PanickingComparator;

    impl LabelComparator for PanickingComparator {
        fn compare_labels_multi(
            &self,
            _: &Utf8Path,
            _: &Utf8Path,
            _: &str,
            _: &AbortSignal,
        ) -> anyhow::Result<Workbook> {
            panic!("corrupt drawing header")
        }
    }

    #[cfg(unix)]
    fn write_script(path: &Utf8Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_invocation_orders_positionals_before_flags() {
        let invocation = ToolInvocation::new("/tools/dxf_processor")
            .flag("--color-added", "#00FFFF")
            .positional("diff.txt")
            .flag("--output-dir", "/out")
            .positional("panel.dxf");

        assert_eq!(
            invocation.to_args(),
            vec![
                "diff.txt",
                "panel.dxf",
                "--color-added",
                "#00FFFF",
                "--output-dir",
                "/out"
            ]
        );
        assert!(invocation.validate().is_ok());
    }

    #[test]
    fn test_invocation_validation() {
        assert!(ToolInvocation::new("tool").positional("").validate().is_err());
        assert!(ToolInvocation::new("tool").positional("-x").validate().is_err());
        assert!(ToolInvocation::new("tool").flag("color", "#fff").validate().is_err());
        assert!(ToolInvocation::new("tool").flag("--color", "").validate().is_err());
        assert!(ToolInvocation::new("").validate().is_err());
    }

    #[test]
    fn test_request_accessors() {
        let request = StageRequest::DiffDetail(DiffParams {
            pair_name: "P1".to_string(),
            csv_inputs: vec![],
            output_dir: Utf8PathBuf::from("/w"),
        });
        assert_eq!(request.kind(), StageKind::DiffDetail);
        assert_eq!(request.pair_name(), "P1");
    }

    #[test]
    fn test_diff_without_inputs_is_rejected_before_launch() {
        let (_temp, dir) = temp_dir();
        let runner = runner_with(MockLabelComparator::new(), &dir);
        let request = StageRequest::DiffDetail(DiffParams {
            pair_name: "P1".to_string(),
            csv_inputs: vec![],
            output_dir: dir.join("out"),
        });

        let err = tokio_test::block_on(runner.run(request)).unwrap_err();
        assert!(matches!(err, PipelineError::DiffProcessor(_)));
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!dir.join("out").exists());
    }

    #[test]
    fn test_color_rejects_bad_hex_before_launch() {
        let (_temp, dir) = temp_dir();
        let runner = runner_with(MockLabelComparator::new(), &dir);
        touch(&dir.join("diff.txt"));
        touch(&dir.join("b.dxf"));
        let mut colors = ColorScheme::default();
        colors.added = "cyan".to_string();

        let err = tokio_test::block_on(runner.run(StageRequest::ColorApplication(ColorParams {
            pair_name: "P1".to_string(),
            diff_result: dir.join("diff.txt"),
            drawing: dir.join("b.dxf"),
            colors,
            output_dir: dir.join("colored"),
        })))
        .unwrap_err();

        assert!(matches!(err, PipelineError::DxfProcessor(_)));
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn test_comparison_missing_input() {
        let (_temp, dir) = temp_dir();
        let mut mock = MockLabelComparator::new();
        mock.expect_compare_labels_multi().never();
        let runner = runner_with(mock, &dir);
        touch(&dir.join("b.dxf"));

        let err = runner
            .run(StageRequest::Comparison(ComparisonParams {
                pair_name: "P1".to_string(),
                file_a: dir.join("missing.dxf"),
                file_b: dir.join("b.dxf"),
            }))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::MissingInput);
        assert!(err.to_string().contains("file_a"));
    }

    #[tokio::test]
    async fn test_comparison_returns_workbook() {
        let (_temp, dir) = temp_dir();
        touch(&dir.join("a.dxf"));
        touch(&dir.join("b.dxf"));
        let mut mock = MockLabelComparator::new();
        mock.expect_compare_labels_multi()
            .withf(|a, b, name, _| a.ends_with("a.dxf") && b.ends_with("b.dxf") && name == "P1")
            .times(1)
            .returning(|_, _, _, _| Ok(Workbook::default().with_sheet("added", Sheet::default())));
        let runner = runner_with(mock, &dir);

        let output = runner
            .run(StageRequest::Comparison(ComparisonParams {
                pair_name: "P1".to_string(),
                file_a: dir.join("a.dxf"),
                file_b: dir.join("b.dxf"),
            }))
            .await
            .unwrap();

        match output {
            StageOutput::Comparison { workbook } => assert!(workbook.sheets.contains_key("added")),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_comparison_error_and_panic_become_comparison_errors() {
        let (_temp, dir) = temp_dir();
        touch(&dir.join("a.dxf"));
        touch(&dir.join("b.dxf"));
        let params = ComparisonParams {
            pair_name: "P1".to_string(),
            file_a: dir.join("a.dxf"),
            file_b: dir.join("b.dxf"),
        };

        let mut failing = MockLabelComparator::new();
        failing
            .expect_compare_labels_multi()
            .returning(|_, _, _, _| Err(anyhow::anyhow!("no TEXT entities in layer 0")));
        let err = runner_with(failing, &dir)
            .run(StageRequest::Comparison(params.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Comparison { .. }));
        assert!(err.to_string().contains("no TEXT entities"));

        let config = PipelineConfig {
            tools_dir: dir.clone(),
            ..PipelineConfig::default()
        };
        let err = StageRunner::new(&config, Arc::new(PanickingComparator))
            .run(StageRequest::Comparison(params))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Comparison);
        assert!(err.to_string().contains("corrupt drawing header"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_diff_records_result_and_label_files() {
        let (_temp, dir) = temp_dir();
        write_script(
            &dir.join("diff_label_processor"),
            r#"out=""; name=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output-dir) out="$2"; shift 2 ;;
    --pair-name) name="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo diff > "$out/${name}_diff.txt"
echo A1 > "$out/${name}_added.txt"
echo R1 > "$out/${name}_deleted.txt""#,
        );
        let csv = dir.join("added.csv");
        fs::write(&csv, "label\nA1\n").unwrap();
        let runner = runner_with(MockLabelComparator::new(), &dir);

        let output = runner
            .run(StageRequest::DiffDetail(DiffParams {
                pair_name: "P1".to_string(),
                csv_inputs: vec![csv],
                output_dir: dir.join("out"),
            }))
            .await
            .unwrap();

        match output {
            StageOutput::DiffDetail {
                diff_result,
                label_files,
            } => {
                assert_eq!(diff_result, dir.join("out/P1_diff.txt"));
                let kinds: Vec<&str> = label_files.keys().map(|k| k.as_str()).collect();
                assert_eq!(kinds, vec!["deleted", "added"]);
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_stderr() {
        let (_temp, dir) = temp_dir();
        write_script(
            &dir.join("diff_label_processor"),
            "echo 'reading sheet' >&2\necho 'KeyError: label' >&2\nexit 3",
        );
        let csv = dir.join("added.csv");
        fs::write(&csv, "label\n").unwrap();
        let runner = runner_with(MockLabelComparator::new(), &dir);

        let err = runner
            .run(StageRequest::DiffDetail(DiffParams {
                pair_name: "P1".to_string(),
                csv_inputs: vec![csv],
                output_dir: dir.join("out"),
            }))
            .await
            .unwrap_err();

        match &err {
            PipelineError::DiffProcessor(failure) => {
                assert_eq!(failure.exit, ToolExit::Code(3));
                assert_eq!(failure.message, "KeyError: label");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.stderr(), "reading sheet\nKeyError: label");
        assert_eq!(err.category(), ErrorCategory::ToolFailure);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_expected_output() {
        let (_temp, dir) = temp_dir();
        write_script(&dir.join("dxf_processor"), "exit 0");
        touch(&dir.join("diff.txt"));
        touch(&dir.join("panel.dxf"));
        let runner = runner_with(MockLabelComparator::new(), &dir);

        let err = runner
            .run(StageRequest::ColorApplication(ColorParams {
                pair_name: "P1".to_string(),
                diff_result: dir.join("diff.txt"),
                drawing: dir.join("panel.dxf"),
                colors: ColorScheme::default(),
                output_dir: dir.join("colored"),
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::DxfProcessor(_)));
        assert_eq!(err.category(), ErrorCategory::MissingOutput);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_color_passes_colors_and_names_output_after_drawing() {
        let (_temp, dir) = temp_dir();
        write_script(
            &dir.join("dxf_processor"),
            r#"echo "$@" > "$(dirname "$1")/args.txt"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output-dir) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo colored > "$out/panel.dxf""#,
        );
        touch(&dir.join("diff.txt"));
        touch(&dir.join("panel.dxf"));
        let runner = runner_with(MockLabelComparator::new(), &dir);

        let output = runner
            .run(StageRequest::ColorApplication(ColorParams {
                pair_name: "P1".to_string(),
                diff_result: dir.join("diff.txt"),
                drawing: dir.join("panel.dxf"),
                colors: ColorScheme::default(),
                output_dir: dir.join("colored"),
            }))
            .await
            .unwrap();

        assert_eq!(
            output,
            StageOutput::ColorApplication {
                colored_dxf: dir.join("colored/panel.dxf")
            }
        );
        let args = fs::read_to_string(dir.join("args.txt")).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "{} {} --color-removed #FF00FF --color-added #00FFFF --color-changed #FFFF00 --output-dir {}",
                dir.join("diff.txt"),
                dir.join("panel.dxf"),
                dir.join("colored")
            )
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_slow_tool() {
        let (_temp, dir) = temp_dir();
        write_script(&dir.join("diff_label_processor"), "exec sleep 5");
        let csv = dir.join("added.csv");
        fs::write(&csv, "label\n").unwrap();
        let config = PipelineConfig {
            tools_dir: dir.clone(),
            timeout_seconds: 1,
            ..PipelineConfig::default()
        };
        let runner = StageRunner::new(&config, Arc::new(MockLabelComparator::new()));

        let start = Instant::now();
        let err = runner
            .run(StageRequest::DiffDetail(DiffParams {
                pair_name: "P1".to_string(),
                csv_inputs: vec![csv],
                output_dir: dir.join("out"),
            }))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_keeps_stderr_written_before_it() {
        let (_temp, dir) = temp_dir();
        write_script(
            &dir.join("diff_label_processor"),
            "echo 'loading sheet removed' >&2\nexec sleep 5",
        );
        let csv = dir.join("removed.csv");
        fs::write(&csv, "label\n").unwrap();
        let config = PipelineConfig {
            tools_dir: dir.clone(),
            timeout_seconds: 1,
            ..PipelineConfig::default()
        };
        let runner = StageRunner::new(&config, Arc::new(MockLabelComparator::new()));

        let err = runner
            .run(StageRequest::DiffDetail(DiffParams {
                pair_name: "P1".to_string(),
                csv_inputs: vec![csv],
                output_dir: dir.join("out"),
            }))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.stderr(), "loading sheet removed");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_comparison_timeout_kills_comparison_script() {
        let (_temp, dir) = temp_dir();
        touch(&dir.join("a.dxf"));
        touch(&dir.join("b.dxf"));
        let marker = dir.join("finished");
        let script = dir.join("compare_labels_multi");
        write_script(&script, &format!("sleep 3\ntouch {}", marker));
        let config = PipelineConfig {
            tools_dir: dir.clone(),
            timeout_seconds: 1,
            ..PipelineConfig::default()
        };
        let runner = StageRunner::new(&config, Arc::new(CommandComparator::new(&script)));

        let err = runner
            .run(StageRequest::Comparison(ComparisonParams {
                pair_name: "P1".to_string(),
                file_a: dir.join("a.dxf"),
                file_b: dir.join("b.dxf"),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_script() {
        let (_temp, dir) = temp_dir();
        let csv = dir.join("added.csv");
        fs::write(&csv, "label\n").unwrap();
        let runner = runner_with(MockLabelComparator::new(), &dir);

        let err = runner
            .run(StageRequest::DiffDetail(DiffParams {
                pair_name: "P1".to_string(),
                csv_inputs: vec![csv],
                output_dir: dir.join("out"),
            }))
            .await
            .unwrap_err();

        match err {
            PipelineError::DiffProcessor(failure) => {
                assert_eq!(failure.exit, ToolExit::SpawnFailed)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic");
    }

    proptest! {
        #[test]
        fn positionals_always_precede_flags(
            steps in proptest::collection::vec((any::<bool>(), "[a-z]{1,8}"), 0..12)
        ) {
            let mut invocation = ToolInvocation::new("tool");
            let mut expected_positionals = Vec::new();
            let mut expected_flags = Vec::new();
            for (is_flag, value) in &steps {
                if *is_flag {
                    invocation = invocation.flag(format!("--{}", value), value.clone());
                    expected_flags.push(format!("--{}", value));
                    expected_flags.push(value.clone());
                } else {
                    invocation = invocation.positional(value.clone());
                    expected_positionals.push(value.clone());
                }
            }

            prop_assert!(invocation.validate().is_ok());
            let mut expected = expected_positionals;
            expected.extend(expected_flags);
            prop_assert_eq!(invocation.to_args(), expected);
        }
    }
}
