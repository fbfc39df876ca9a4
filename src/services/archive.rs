//! ZIP packaging of finished pair outputs.
//!
//! Archives are built in memory from a [`ArchiveManifest`] compiled at build
//! time. Entries carry a fixed timestamp, so building the same manifest twice
//! yields byte-identical archives.

use crate::error::PipelineError;
use crate::models::{PairState, outputs};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// What to package.
#[derive(Debug, Clone, Copy)]
pub enum ArchiveSource<'a> {
    /// Every output one pair recorded, whatever its final stage
    Pair(&'a PairState),
    /// Outputs of the `Complete` pairs of a run; others are skipped
    Run(&'a [PairState]),
}

/// One file to place in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: Utf8PathBuf,
    pub pair_name: String,
    pub output_key: String,
}

/// Ordered list of entries, compiled from pair outputs. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveManifest {
    entries: Vec<ArchiveEntry>,
}

struct Candidate<'a> {
    pair_name: &'a str,
    output_key: &'a str,
    base_name: String,
    source: &'a Utf8Path,
}

impl ArchiveManifest {
    pub fn compile(source: ArchiveSource<'_>) -> Result<Self, PipelineError> {
        let pairs: Vec<&PairState> = match source {
            ArchiveSource::Pair(pair) => {
                if pair.outputs().is_empty() {
                    return Err(PipelineError::archive(
                        Some(pair.pair_name()),
                        "pair has no outputs to package",
                    ));
                }
                vec![pair]
            }
            ArchiveSource::Run(pairs) => {
                let complete: Vec<&PairState> = pairs.iter().filter(|p| p.is_complete()).collect();
                for skipped in pairs.iter().filter(|p| !p.is_complete()) {
                    tracing::warn!(
                        "Leaving pair {} out of the archive (stage {})",
                        skipped.pair_name(),
                        skipped.stage()
                    );
                }
                if complete.is_empty() {
                    return Err(PipelineError::archive(None, "no completed pairs to package"));
                }
                complete
            }
        };

        let candidates: Vec<Candidate<'_>> = pairs
            .iter()
            .flat_map(|pair| {
                pair.outputs().iter().map(move |(key, path)| Candidate {
                    pair_name: pair.pair_name(),
                    output_key: key.as_str(),
                    base_name: entry_base_name(pair, key, path),
                    source: path.as_path(),
                })
            })
            .collect();

        let mut by_name: HashMap<&str, usize> = HashMap::new();
        let mut by_pair_and_name: HashMap<(&str, &str), usize> = HashMap::new();
        for candidate in &candidates {
            *by_name.entry(candidate.base_name.as_str()).or_default() += 1;
            *by_pair_and_name
                .entry((candidate.pair_name, candidate.base_name.as_str()))
                .or_default() += 1;
        }

        let entries = candidates
            .iter()
            .map(|candidate| {
                let name = if by_name[candidate.base_name.as_str()] == 1 {
                    candidate.base_name.clone()
                } else if by_pair_and_name[&(candidate.pair_name, candidate.base_name.as_str())]
                    == 1
                {
                    format!("{}/{}", candidate.pair_name, candidate.base_name)
                } else {
                    format!(
                        "{}/{}/{}",
                        candidate.pair_name, candidate.output_key, candidate.base_name
                    )
                };
                ArchiveEntry {
                    name,
                    source: candidate.source.to_path_buf(),
                    pair_name: candidate.pair_name.to_string(),
                    output_key: candidate.output_key.to_string(),
                }
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The colored drawing keeps the name of the drawing the user uploaded.
fn entry_base_name(pair: &PairState, key: &str, path: &Utf8Path) -> String {
    if key == outputs::COLORED_DXF {
        pair.config().original_b_name().to_string()
    } else {
        path.file_name().unwrap_or(key).to_string()
    }
}

/// Builds ZIP archives from pair outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveBuilder;

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Package the source into an in-memory ZIP.
    pub fn build(&self, source: ArchiveSource<'_>) -> Result<Vec<u8>, PipelineError> {
        let scope = match source {
            ArchiveSource::Pair(pair) => Some(pair.pair_name()),
            ArchiveSource::Run(_) => None,
        };
        let manifest = ArchiveManifest::compile(source)?;
        let bytes = self.write_manifest(&manifest, scope)?;

        tracing::info!(
            "Built archive with {} entr{} ({} bytes)",
            manifest.len(),
            if manifest.len() == 1 { "y" } else { "ies" },
            bytes.len()
        );
        Ok(bytes)
    }

    fn write_manifest(
        &self,
        manifest: &ArchiveManifest,
        scope: Option<&str>,
    ) -> Result<Vec<u8>, PipelineError> {
        let fail = |message: String| PipelineError::archive(scope, message);

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644);

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for entry in manifest.entries() {
            let data = fs::read(&entry.source).map_err(|e| {
                fail(format!(
                    "cannot read {} output {}: {}",
                    entry.pair_name, entry.source, e
                ))
            })?;

            writer
                .start_file(entry.name.as_str(), options)
                .map_err(|e| fail(format!("cannot add {}: {}", entry.name, e)))?;
            writer
                .write_all(&data)
                .map_err(|e| fail(format!("cannot write {}: {}", entry.name, e)))?;
            tracing::debug!("Archived {} as {}", entry.source, entry.name);
        }

        let cursor = writer
            .finish()
            .map_err(|e| fail(format!("cannot finish archive: {}", e)))?;
        Ok(cursor.into_inner())
    }
}

/// Entry names one pair's archive would contain, without building it.
pub fn archive_contents(pair: &PairState) -> Result<Vec<String>, PipelineError> {
    let manifest = ArchiveManifest::compile(ArchiveSource::Pair(pair))?;
    Ok(manifest.entries().iter().map(|e| e.name.clone()).collect())
}
