//! Durable run progress: a JSON snapshot plus an append-only journal.
//!
//! Every `record` appends one journal line and syncs it. The snapshot is
//! rewritten atomically every `compact_every` records, after which the
//! journal is truncated. Journal entries carry the sequence number they
//! produce, so replaying a journal that survived a compaction is a no-op.
//!
//! The checkpoint also stores the output byte offset reached after each
//! recorded item. A resumed writer truncates the output to that offset, so
//! the checkpoint is never behind or ahead of the items it describes.
//!
//! Seen keys only cover the records of each source's current cursor
//! position. A resumed source restarts at that position, so earlier keys
//! can never come back; this keeps the snapshot small for exact cursors
//! (one key) and for page cursors (one page of keys).

use crate::error::Error;
use crate::filter::FilterSet;
use crate::model::{ItemKey, RunStatus, SourceKind, SummaryStats};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Derive the run id from everything that makes two runs "the same run".
pub fn derive_run_id(
    output: &Path,
    sources: &[SourceKind],
    filters: &FilterSet,
    dry_run: bool,
) -> String {
    let output = crate::lock::output_identity(output);
    let sources: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();

    let mut hasher = blake3::Hasher::new();
    hasher.update(output.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(sources.join(",").as_bytes());
    hasher.update(b"\0");
    hasher.update(filters.fingerprint().as_bytes());
    hasher.update(if dry_run { "\0dry-run" } else { "\0write" }.as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// How a source's enumeration ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Exhausted,
    /// Natural end, but with recorded unit failures.
    ExhaustedWithFailures { failures: usize },
    /// Too many consecutive unit errors.
    Failed { consecutive_errors: u32 },
    /// Could not be opened; only reachable for non-required sources.
    Unavailable { reason: String },
}

impl SourceOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, SourceOutcome::Exhausted)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceProgress {
    pub cursor: Option<String>,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SourceOutcome>,
    /// Unit failures recorded for this source.
    #[serde(default)]
    pub failures: usize,
}

/// A unit that could not be read, with the owning source's recorded cursor
/// at the time it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKind>,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run_id: String,
    pub status: RunStatus,
    /// Most recently recorded cursor, whichever source it belongs to.
    pub cursor: Option<String>,
    pub emitted_count: u64,
    pub output_offset: u64,
    pub stats: SummaryStats,
    pub sources: BTreeMap<SourceKind, SourceProgress>,
    pub seen_keys: HashSet<ItemKey>,
    pub failed_paths: Vec<FailedUnit>,
    /// Sequence of the last failure-list change; makes replay idempotent.
    #[serde(default)]
    pub failure_seq: u64,
    pub updated_at: String,
}

impl CheckpointState {
    pub fn new(run_id: impl Into<String>, sources: &[SourceKind]) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::InProgress,
            cursor: None,
            emitted_count: 0,
            output_offset: 0,
            stats: SummaryStats::for_sources(sources),
            sources: sources
                .iter()
                .map(|s| (*s, SourceProgress::default()))
                .collect(),
            seen_keys: HashSet::new(),
            failed_paths: Vec::new(),
            failure_seq: 0,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    /// Whether `key` was already recorded at `cursor`, the position the
    /// record was yielded from. Keys recorded at another position never
    /// count.
    pub fn is_seen(&self, key: &ItemKey, cursor: Option<&str>) -> bool {
        let recorded = self
            .sources
            .get(&key.source)
            .and_then(|p| p.cursor.as_deref());
        recorded == cursor && self.seen_keys.contains(key)
    }

    pub fn failed_units(&self) -> Vec<String> {
        self.failed_paths.iter().map(|f| f.unit.clone()).collect()
    }

    /// Failures of `source` that a restart from its recorded cursor will
    /// run into again.
    fn retryable(&self, source: SourceKind) -> impl Iterator<Item = &FailedUnit> + '_ {
        let cursor = self.sources.get(&source).and_then(|p| p.cursor.clone());
        self.failed_paths
            .iter()
            .filter(move |f| f.source == Some(source) && f.cursor == cursor)
    }

    pub fn source(&self, source: SourceKind) -> Option<&SourceProgress> {
        self.sources.get(&source)
    }

    fn apply(&mut self, entry: &JournalEntry) -> Result<(), String> {
        match entry {
            JournalEntry::Record {
                seq,
                source,
                path,
                cursor,
                offset,
                present,
            } => {
                if *seq <= self.emitted_count {
                    return Ok(());
                }
                if *seq != self.emitted_count + 1 {
                    return Err(format!(
                        "journal record {} does not follow emitted count {}",
                        seq, self.emitted_count
                    ));
                }
                self.emitted_count = *seq;
                self.output_offset = *offset;
                self.stats.observe_parts(*source, *present);

                let progress = self.sources.entry(*source).or_default();
                if cursor.is_some() && *cursor != progress.cursor {
                    self.seen_keys.retain(|k| k.source != *source);
                    progress.cursor = cursor.clone();
                    self.cursor = cursor.clone();
                }
                self.seen_keys.insert(ItemKey::new(*source, path.clone()));
            }
            JournalEntry::Failure {
                seq,
                source,
                unit,
                cursor,
            } => {
                if *seq <= self.failure_seq {
                    return Ok(());
                }
                self.failure_seq = *seq;
                self.failed_paths.push(FailedUnit {
                    source: *source,
                    unit: unit.clone(),
                    cursor: cursor.clone(),
                });
                if let Some(source) = source {
                    self.sources.entry(*source).or_default().failures += 1;
                }
            }
            JournalEntry::RetryFailures { seq, source } => {
                if *seq <= self.failure_seq {
                    return Ok(());
                }
                self.failure_seq = *seq;
                let retried: Vec<FailedUnit> = self.retryable(*source).cloned().collect();
                self.failed_paths.retain(|f| !retried.contains(f));
                let progress = self.sources.entry(*source).or_default();
                progress.failures = progress.failures.saturating_sub(retried.len());
            }
            JournalEntry::SourceFinished { source, outcome } => {
                let progress = self.sources.entry(*source).or_default();
                progress.finished = true;
                progress.outcome = Some(outcome.clone());
            }
        }
        Ok(())
    }

    fn prune_finished_sources(&mut self) {
        let finished: Vec<SourceKind> = self
            .sources
            .iter()
            .filter(|(_, p)| p.finished)
            .map(|(s, _)| *s)
            .collect();
        if !finished.is_empty() {
            self.seen_keys.retain(|k| !finished.contains(&k.source));
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Record {
        seq: u64,
        source: SourceKind,
        path: String,
        cursor: Option<String>,
        offset: u64,
        present: bool,
    },
    Failure {
        seq: u64,
        source: Option<SourceKind>,
        unit: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    /// The source restarts from its cursor; drop the failures it will meet
    /// again.
    RetryFailures {
        seq: u64,
        source: SourceKind,
    },
    SourceFinished {
        source: SourceKind,
        outcome: SourceOutcome,
    },
}

#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    pub compact_every: u64,
    pub prune_finished_sources: bool,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            compact_every: 1000,
            prune_finished_sources: true,
        }
    }
}

pub struct CheckpointStore {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    archive_path: PathBuf,
    journal: File,
    state: CheckpointState,
    options: CheckpointOptions,
    since_compaction: u64,
}

fn paths_for(dir: &Path, run_id: &str) -> (PathBuf, PathBuf, PathBuf) {
    (
        dir.join(format!("{}.json", run_id)),
        dir.join(format!("{}.journal", run_id)),
        dir.join(format!("{}.completed.json", run_id)),
    )
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

impl CheckpointStore {
    /// Read prior state for `run_id`. Completed runs are never resumed.
    pub fn load(dir: &Path, run_id: &str) -> Result<Option<CheckpointState>, Error> {
        let (snapshot_path, journal_path, _) = paths_for(dir, run_id);

        let raw = match fs::read_to_string(&snapshot_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut state: CheckpointState =
            serde_json::from_str(&raw).map_err(|e| corrupt(&snapshot_path, e))?;
        if state.run_id != run_id {
            return Err(corrupt(
                &snapshot_path,
                format!("belongs to run {}", state.run_id),
            ));
        }

        match File::open(&journal_path) {
            Ok(file) => replay_journal(&mut state, file, &journal_path)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if state.status == RunStatus::Completed {
            warn!(
                "Checkpoint for run {} is already completed; starting a fresh run",
                run_id
            );
            return Ok(None);
        }

        debug!(
            "Loaded checkpoint {}: {} items emitted, {} failures",
            run_id,
            state.emitted_count,
            state.failed_paths.len()
        );
        Ok(Some(state))
    }

    /// Start persisting `state`: writes a fresh snapshot and an empty journal.
    pub fn create(dir: &Path, state: CheckpointState, options: CheckpointOptions) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        let (snapshot_path, journal_path, archive_path) = paths_for(dir, &state.run_id);
        write_snapshot(&snapshot_path, &state)?;

        let journal = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&journal_path)?;
        journal.sync_all()?;

        Ok(Self {
            snapshot_path,
            journal_path,
            archive_path,
            journal,
            state,
            options,
            since_compaction: 0,
        })
    }

    /// Remove any state for `run_id` (not the archive of completed runs).
    pub fn discard(dir: &Path, run_id: &str) -> Result<(), Error> {
        let (snapshot_path, journal_path, _) = paths_for(dir, run_id);
        for path in [snapshot_path, journal_path] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn is_seen(&self, key: &ItemKey, cursor: Option<&str>) -> bool {
        self.state.is_seen(key, cursor)
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Record one item that is already durably in the output.
    pub fn record(
        &mut self,
        key: &ItemKey,
        cursor: Option<String>,
        output_offset: u64,
        present_locally: bool,
    ) -> Result<(), Error> {
        let entry = JournalEntry::Record {
            seq: self.state.emitted_count + 1,
            source: key.source,
            path: key.path.clone(),
            cursor,
            offset: output_offset,
            present: present_locally,
        };
        self.append(&entry)?;
        self.since_compaction += 1;
        if self.options.compact_every > 0 && self.since_compaction >= self.options.compact_every {
            self.compact()?;
        }
        Ok(())
    }

    /// Append a failed unit. Units already listed are not repeated.
    pub fn record_failure(&mut self, source: Option<SourceKind>, unit: &str) -> Result<(), Error> {
        if self.state.failed_paths.iter().any(|f| f.unit == unit) {
            return Ok(());
        }
        let cursor = source
            .and_then(|s| self.state.source(s))
            .and_then(|p| p.cursor.clone());
        let entry = JournalEntry::Failure {
            seq: self.state.failure_seq + 1,
            source,
            unit: unit.to_string(),
            cursor,
        };
        self.append(&entry)
    }

    /// Called when `source` is reopened at its recorded cursor. Failures
    /// recorded at that cursor lie ahead of it and will be attempted again,
    /// so they are dropped; returns how many.
    pub fn retry_failures(&mut self, source: SourceKind) -> Result<usize, Error> {
        let count = self.state.retryable(source).count();
        if count > 0 {
            self.append(&JournalEntry::RetryFailures {
                seq: self.state.failure_seq + 1,
                source,
            })?;
            info!("Retrying {} failed units of {}", count, source);
        }
        Ok(count)
    }

    pub fn finish_source(&mut self, source: SourceKind, outcome: SourceOutcome) -> Result<(), Error> {
        self.append(&JournalEntry::SourceFinished { source, outcome })?;
        self.compact()
    }

    /// Write the terminal status. Completed runs are archived.
    pub fn finalize(&mut self, status: RunStatus) -> Result<(), Error> {
        self.state.status = status;
        self.compact()?;
        if status == RunStatus::Completed {
            fs::rename(&self.snapshot_path, &self.archive_path)?;
            match fs::remove_file(&self.journal_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!("Checkpoint archived to {}", self.archive_path.display());
        }
        Ok(())
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<(), Error> {
        self.state
            .apply(entry)
            .map_err(|reason| corrupt(&self.journal_path, reason))?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.journal.write_all(&line)?;
        self.journal.sync_data()?;
        Ok(())
    }

    fn compact(&mut self) -> Result<(), Error> {
        if self.options.prune_finished_sources {
            self.state.prune_finished_sources();
        }
        self.state.updated_at = Utc::now().to_rfc3339();
        write_snapshot(&self.snapshot_path, &self.state)?;
        self.journal.set_len(0)?;
        self.journal.seek(SeekFrom::Start(0))?;
        self.journal.sync_all()?;
        self.since_compaction = 0;
        debug!(
            "Checkpoint compacted at {} items",
            self.state.emitted_count
        );
        Ok(())
    }
}

fn write_snapshot(path: &Path, state: &CheckpointState) -> Result<(), Error> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, state)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn replay_journal(state: &mut CheckpointState, file: File, path: &Path) -> Result<(), Error> {
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()?;
    let last = lines.len().saturating_sub(1);

    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => state.apply(&entry).map_err(|reason| corrupt(path, reason))?,
            // A torn final line means the process died mid-append; the item
            // it described is past the recorded offset and gets rewritten.
            Err(e) if index == last => {
                warn!("Ignoring torn journal tail in {}: {}", path.display(), e)
            }
            Err(e) => return Err(corrupt(path, format!("line {}: {}", index + 1, e))),
        }
    }
    Ok(())
}
