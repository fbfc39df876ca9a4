//! In-process label comparison and the workbook it produces.
//!
//! The comparison algorithm itself lives outside this crate. [`LabelComparator`]
//! is the seam: the pipeline hands it two drawings and a pair name and gets a
//! [`Workbook`] back, one sheet per comparison facet (labels only in A, only
//! in B, and labels whose counts differ). The workbook is then expanded into
//! one CSV per sheet for the diff stage.

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tokio::sync::watch;

/// Sheet the comparison tool adds for humans; it carries no labels.
pub const SUMMARY_SHEET: &str = "Summary";

static UNSAFE_FILE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("Invalid file name regex"));

/// One sheet of the comparison workbook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sheet {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

/// Comparison result: sheets in the order the tool produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: IndexMap<String, Sheet>,
}

impl Workbook {
    pub fn with_sheet(mut self, name: impl Into<String>, sheet: Sheet) -> Self {
        self.sheets.insert(name.into(), sheet);
        self
    }

    /// Sheets that become CSV artifacts (everything but the summary).
    pub fn facet_sheets(&self) -> impl Iterator<Item = (&String, &Sheet)> {
        self.sheets
            .iter()
            .filter(|(name, _)| name.as_str() != SUMMARY_SHEET)
    }
}

/// Tells a running comparison that nobody is waiting for its result anymore.
///
/// The stage runner holds the matching [`AbortGuard`] for as long as it waits.
/// Once the guard is dropped (timeout, cancellation, or the stage future being
/// dropped) the signal fires.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    rx: Option<watch::Receiver<()>>,
}

/// Keeps an [`AbortSignal`] quiet while alive.
#[derive(Debug)]
pub struct AbortGuard {
    _tx: watch::Sender<()>,
}

impl AbortSignal {
    pub fn new() -> (AbortGuard, Self) {
        let (tx, rx) = watch::channel(());
        (AbortGuard { _tx: tx }, Self { rx: Some(rx) })
    }

    /// A signal that never fires, for callers that wait unconditionally.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| rx.has_changed().is_err())
    }

    /// Resolves once the guard is gone. Pending forever for [`AbortSignal::never`].
    pub async fn aborted(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                while rx.changed().await.is_ok() {}
            }
            None => std::future::pending().await,
        }
    }
}

/// The comparison routine, called in-process on a blocking worker.
///
/// Implementations report failure by returning an error; the stage runner
/// turns any error (or panic) into a comparison failure for the pair. Long
/// running implementations should give up once `abort` fires.
#[cfg_attr(test, mockall::automock)]
pub trait LabelComparator: Send + Sync {
    fn compare_labels_multi(
        &self,
        file_a: &Utf8Path,
        file_b: &Utf8Path,
        pair_name: &str,
        abort: &AbortSignal,
    ) -> Result<Workbook>;
}

/// Comparator backed by the configured comparison script.
///
/// Runs `<script> <file_a> <file_b> --pair-name <name>` and reads the workbook
/// as YAML from stdout. The script is killed when the abort signal fires.
///
/// Must be called from a blocking worker or outside any runtime, never from
/// inside an async task.
#[derive(Debug, Clone)]
pub struct CommandComparator {
    script: Utf8PathBuf,
}

impl CommandComparator {
    pub fn new(script: impl Into<Utf8PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    async fn run_script(
        &self,
        file_a: &Utf8Path,
        file_b: &Utf8Path,
        pair_name: &str,
        abort: &AbortSignal,
    ) -> Result<Workbook> {
        let child = Command::new(self.script.as_std_path())
            .arg(file_a.as_std_path())
            .arg(file_b.as_std_path())
            .arg("--pair-name")
            .arg(pair_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run comparison script {}", self.script))?;

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            biased;
            _ = abort.aborted() => {
                tracing::warn!("[{}] Stopping comparison script {}", pair_name, self.script);
                bail!("comparison script {} was stopped before it finished", self.script);
            }
            output = child.wait_with_output() => output
                .with_context(|| format!("Failed to wait for comparison script {}", self.script))?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "comparison script exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        serde_yaml_ng::from_slice(&output.stdout)
            .context("Comparison script produced an unreadable workbook")
    }
}

impl LabelComparator for CommandComparator {
    fn compare_labels_multi(
        &self,
        file_a: &Utf8Path,
        file_b: &Utf8Path,
        pair_name: &str,
        abort: &AbortSignal,
    ) -> Result<Workbook> {
        tracing::debug!("Running comparison script {} for {}", self.script, pair_name);

        let script = self.run_script(file_a, file_b, pair_name, abort);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(script),
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build runtime for comparison script")?
                .block_on(script),
        }
    }
}

/// Turn a sheet name into a file stem that is safe on every platform.
pub fn sanitize_sheet_name(name: &str) -> String {
    let cleaned = UNSAFE_FILE_CHARS.replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "sheet".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Persist the workbook as YAML so it can be packaged later.
pub fn write_workbook(workbook: &Workbook, path: &Utf8Path) -> Result<()> {
    let yaml = serde_yaml_ng::to_string(workbook).context("Failed to serialize workbook")?;
    fs::write(path, yaml).with_context(|| format!("Failed to write workbook: {}", path))
}

/// Write each facet sheet to `<output_dir>/<sheet>.csv`.
///
/// Returns sheet stem to CSV path, in sheet order. Sheets whose names clean up
/// to the same stem get a numeric suffix.
pub fn expand_workbook_to_csv(
    workbook: &Workbook,
    output_dir: &Utf8Path,
) -> Result<IndexMap<String, Utf8PathBuf>> {
    let mut csv_files = IndexMap::new();

    for (sheet_name, sheet) in workbook.facet_sheets() {
        let base = sanitize_sheet_name(sheet_name);
        let mut stem = base.clone();
        let mut suffix = 2;
        while csv_files.contains_key(&stem) {
            stem = format!("{}_{}", base, suffix);
            suffix += 1;
        }

        let csv_path = output_dir.join(format!("{}.csv", stem));
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(&csv_path)
            .with_context(|| format!("Failed to create CSV file: {}", csv_path))?;

        if !sheet.headers.is_empty() {
            writer
                .write_record(&sheet.headers)
                .with_context(|| format!("Failed to write headers for sheet {}", sheet_name))?;
        }
        for row in &sheet.rows {
            writer
                .write_record(row)
                .with_context(|| format!("Failed to write row for sheet {}", sheet_name))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush CSV file: {}", csv_path))?;

        tracing::debug!("Expanded sheet {} into {}", sheet_name, csv_path);
        csv_files.insert(stem, csv_path);
    }

    if csv_files.is_empty() {
        bail!("workbook has no comparison sheets");
    }

    Ok(csv_files)
}
