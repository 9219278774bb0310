use crate::error::Error;
use crate::model::{InventoryItem, RunStatus, RunSummary, SourceKind, SummaryStats};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HEADER: &str = "{\n  \"items\": [\n";
const ITEM_INDENT: &str = "    ";
const ITEM_SEPARATOR: &str = ",\n    ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Refuse to touch an existing target unless the caller confirmed.
    Prompt { confirmed: bool },
    Force,
    /// Run everything, write nothing to the target.
    DryRun,
}

/// Where a resumed writer continues from, as recorded in the checkpoint.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub offset: u64,
    pub emitted: u64,
    pub stats: SummaryStats,
}

/// Streams `{"items": [...], "summary": {...}}` one item at a time.
///
/// Array delimiters are written once at open and finalize; each item is
/// appended and synced, so a crash leaves every previously written byte in
/// place and the checkpoint offset can truncate any tail.
pub struct InventoryWriter {
    target: PathBuf,
    file: Option<BufWriter<File>>,
    offset: u64,
    emitted: u64,
    stats: SummaryStats,
    finalized: bool,
}

impl InventoryWriter {
    pub fn open(
        target: &Path,
        policy: OverwritePolicy,
        sources: &[SourceKind],
        resume: Option<ResumePoint>,
    ) -> Result<Self, Error> {
        let dry_run = policy == OverwritePolicy::DryRun;
        let resume = resume.filter(|r| r.emitted > 0);

        let (file, offset, emitted, stats) = match (dry_run, resume) {
            (true, Some(point)) => (None, point.offset, point.emitted, point.stats),
            (true, None) => (
                None,
                HEADER.len() as u64,
                0,
                SummaryStats::for_sources(sources),
            ),
            (false, Some(point)) => {
                let file = reopen_at(target, point.offset)?;
                info!(
                    "Resuming {} at byte {} after {} items",
                    target.display(),
                    point.offset,
                    point.emitted
                );
                (Some(file), point.offset, point.emitted, point.stats)
            }
            (false, None) => {
                if target.exists() {
                    if let OverwritePolicy::Prompt { confirmed: false } = policy {
                        return Err(Error::OutputExists(target.to_path_buf()));
                    }
                    warn!("Overwriting existing inventory {}", target.display());
                }
                (
                    Some(create_with_header(target)?),
                    HEADER.len() as u64,
                    0,
                    SummaryStats::for_sources(sources),
                )
            }
        };

        Ok(Self {
            target: target.to_path_buf(),
            file,
            offset,
            emitted,
            stats,
            finalized: false,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.file.is_none()
    }

    /// Byte length of the output once the last item is on disk.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn stats(&self) -> &SummaryStats {
        &self.stats
    }

    /// Append one item and sync it. Returns the new output offset.
    pub fn write_item(&mut self, item: &InventoryItem) -> Result<u64, Error> {
        let prefix = if self.emitted == 0 {
            ITEM_INDENT
        } else {
            ITEM_SEPARATOR
        };
        let body = serde_json::to_vec(item)?;

        if let Some(file) = self.file.as_mut() {
            file.write_all(prefix.as_bytes()).map_err(Error::WriterIo)?;
            file.write_all(&body).map_err(Error::WriterIo)?;
            file.flush().map_err(Error::WriterIo)?;
            file.get_ref().sync_data().map_err(Error::WriterIo)?;
        }

        self.offset += (prefix.len() + body.len()) as u64;
        self.emitted += 1;
        self.stats.observe(item);
        Ok(self.offset)
    }

    /// Close the array and write the summary.
    pub fn finalize(
        &mut self,
        status: RunStatus,
        failed_paths: Vec<String>,
    ) -> Result<RunSummary, Error> {
        let summary = RunSummary {
            total_items: self.emitted,
            stats: self.stats.clone(),
            status,
            failed_paths,
        };

        if let Some(mut file) = self.file.take() {
            let summary_json = serde_json::to_string(&summary)?;
            let trailer = format!("\n  ],\n  \"summary\": {}\n}}\n", summary_json);
            file.write_all(trailer.as_bytes()).map_err(Error::WriterIo)?;
            file.flush().map_err(Error::WriterIo)?;
            file.get_ref().sync_all().map_err(Error::WriterIo)?;
            info!(
                "Inventory saved to {}. Total: {}",
                self.target.display(),
                self.emitted
            );
        } else {
            info!(
                "[DRY RUN] Inventory not written. Total: {}",
                self.emitted
            );
        }
        self.finalized = true;
        Ok(summary)
    }
}

impl Drop for InventoryWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                warn!("Failed to flush {}: {}", self.target.display(), e);
            }
            if !self.finalized {
                debug!(
                    "Inventory {} left open at {} items for resume",
                    self.target.display(),
                    self.emitted
                );
            }
        }
    }
}

fn create_with_header(target: &Path) -> Result<BufWriter<File>, Error> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(Error::WriterIo)?;
    }
    let mut file = BufWriter::new(File::create(target).map_err(Error::WriterIo)?);
    file.write_all(HEADER.as_bytes()).map_err(Error::WriterIo)?;
    file.flush().map_err(Error::WriterIo)?;
    file.get_ref().sync_all().map_err(Error::WriterIo)?;
    Ok(file)
}

fn reopen_at(target: &Path, offset: u64) -> Result<BufWriter<File>, Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(target)
        .map_err(|e| Error::CheckpointCorrupt {
            path: target.to_path_buf(),
            reason: format!("cannot reopen output for resume: {}", e),
        })?;
    let len = file.metadata().map_err(Error::WriterIo)?.len();
    if len < offset {
        return Err(Error::CheckpointCorrupt {
            path: target.to_path_buf(),
            reason: format!("output is {} bytes, checkpoint expects {}", len, offset),
        });
    }
    file.set_len(offset).map_err(Error::WriterIo)?;
    file.seek(SeekFrom::Start(offset)).map_err(Error::WriterIo)?;
    Ok(BufWriter::new(file))
}
