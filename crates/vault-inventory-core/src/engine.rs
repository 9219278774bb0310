use crate::checkpoint::{
    derive_run_id, CheckpointOptions, CheckpointState, CheckpointStore, SourceOutcome,
};
use crate::config::AppConfig;
use crate::error::Error;
use crate::filter::FilterSet;
use crate::lock;
use crate::matcher::PresenceMatcher;
use crate::model::{ItemKey, RunStatus, RunSummary, SourceKind};
use crate::progress::ProgressReporter;
use crate::source::{Advance, EnumerationHandle, Source, SourceEnumerator};
use crate::writer::{InventoryWriter, OverwritePolicy, ResumePoint};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Continue a matching in-progress checkpoint instead of starting over.
    pub resume: bool,
    pub policy: OverwritePolicy,
    pub filters: FilterSet,
    /// Checked between units; setting it aborts the run resumably.
    pub cancel: Arc<AtomicBool>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: false,
            policy: OverwritePolicy::Prompt { confirmed: false },
            filters: FilterSet::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub output: PathBuf,
    pub resumed: bool,
    pub summary: RunSummary,
    pub outcomes: Vec<(SourceKind, SourceOutcome)>,
    pub duration: Duration,
}

/// Drives sources through filter, matcher, writer and checkpoint.
///
/// Sources run one after another in the configured order. For every item
/// that survives filtering the output append happens strictly before the
/// checkpoint record.
pub struct RunOrchestrator {
    config: AppConfig,
    sources: Vec<Source>,
    matcher: PresenceMatcher,
}

struct SourceLimits {
    required: bool,
    max_consecutive_errors: u32,
}

fn limits_for(config: &AppConfig, kind: SourceKind) -> SourceLimits {
    match kind {
        SourceKind::Pdm => SourceLimits {
            required: config.pdm.required,
            max_consecutive_errors: config.pdm.max_consecutive_errors,
        },
        SourceKind::Plm => SourceLimits {
            required: config.plm.required,
            max_consecutive_errors: config.plm.max_consecutive_errors,
        },
    }
}

struct Pass<'a> {
    writer: &'a mut InventoryWriter,
    store: &'a mut CheckpointStore,
    matcher: &'a mut PresenceMatcher,
    filters: &'a FilterSet,
    cancel: &'a AtomicBool,
    reporter: &'a dyn ProgressReporter,
    partial_after_failures: usize,
}

impl RunOrchestrator {
    pub fn new(config: AppConfig, sources: Vec<Source>) -> Result<Self, Error> {
        if sources.is_empty() {
            return Err(Error::Config(config::ConfigError::Message(
                "no sources selected".to_string(),
            )));
        }
        let matcher = PresenceMatcher::from_config(&config)?;
        Ok(Self {
            config,
            sources,
            matcher,
        })
    }

    /// Build the configured sources in `run.source_order`, keeping only
    /// those in `selection`.
    pub fn from_config(config: AppConfig, selection: &[SourceKind]) -> Result<Self, Error> {
        let mut kinds: Vec<SourceKind> = Vec::new();
        for kind in &config.run.source_order {
            if selection.contains(kind) && !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        let sources = kinds
            .into_iter()
            .map(|kind| Source::from_config(kind, &config))
            .collect();
        Self::new(config, sources)
    }

    pub fn source_kinds(&self) -> Vec<SourceKind> {
        self.sources.iter().map(|s| s.kind()).collect()
    }

    pub fn run_id(&self, options: &RunOptions) -> String {
        derive_run_id(
            &self.config.output.path,
            &self.source_kinds(),
            &options.filters,
            options.policy == OverwritePolicy::DryRun,
        )
    }

    pub fn run(
        &mut self,
        options: &RunOptions,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunOutcome, Error> {
        let start = Instant::now();
        let kinds = self.source_kinds();
        let run_id = self.run_id(options);
        let output = self.config.output.path.clone();
        let checkpoint_dir = self.config.checkpoint.dir.clone();

        let _lock = lock::try_lock_run(&output)?;

        let prior = if options.resume {
            let prior = CheckpointStore::load(&checkpoint_dir, &run_id)?;
            if prior.is_none() {
                warn!("No resumable checkpoint for run {}; starting fresh", run_id);
            }
            prior
        } else {
            CheckpointStore::discard(&checkpoint_dir, &run_id)?;
            None
        };
        let resumed = prior.is_some();

        let state = prior.unwrap_or_else(|| CheckpointState::new(run_id.clone(), &kinds));
        let resume_point = (state.emitted_count > 0).then(|| ResumePoint {
            offset: state.output_offset,
            emitted: state.emitted_count,
            stats: state.stats.clone(),
        });
        // The output of a checkpointed run is ours to rewrite.
        let policy = match options.policy {
            OverwritePolicy::Prompt { .. } if resumed => OverwritePolicy::Force,
            policy => policy,
        };

        let mut writer = match InventoryWriter::open(&output, policy, &kinds, resume_point) {
            Err(Error::OutputExists(path)) if options.resume => {
                return Err(Error::NothingToResume(path))
            }
            opened => opened?,
        };
        let mut store = CheckpointStore::create(
            &checkpoint_dir,
            state,
            CheckpointOptions {
                compact_every: self.config.checkpoint.compact_every,
                prune_finished_sources: self.config.checkpoint.prune_finished_sources,
            },
        )?;

        info!(
            "{} run {} -> {}",
            if resumed { "Resuming" } else { "Starting" },
            run_id,
            output.display()
        );
        reporter.on_run_start(&run_id, resumed);

        let mut pass = Pass {
            writer: &mut writer,
            store: &mut store,
            matcher: &mut self.matcher,
            filters: &options.filters,
            cancel: &options.cancel,
            reporter,
            partial_after_failures: self.config.run.partial_after_failures,
        };

        let mut outcomes = Vec::with_capacity(self.sources.len());
        let mut unavailable = Vec::new();
        for source in self.sources.iter_mut() {
            let result = run_source(source, &self.config, &mut pass);
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(cause) => {
                    let state = pass.store.state();
                    error!(
                        "Run {} aborted after {} items: {}",
                        run_id, state.emitted_count, cause
                    );
                    return Err(Error::RunAborted {
                        cause: Box::new(cause),
                        emitted: state.emitted_count,
                        last_cursor: state.cursor.clone(),
                    });
                }
            };
            if let SourceOutcome::Unavailable { reason } = &outcome {
                unavailable.push(format!("{} unavailable: {}", source.kind(), reason));
            }
            outcomes.push((source.kind(), outcome));
        }

        let mut failed_paths = store.state().failed_units();
        failed_paths.extend(unavailable);
        let clean = outcomes.iter().all(|(_, outcome)| outcome.is_clean());
        let status = if clean && failed_paths.len() <= self.config.run.partial_after_failures {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        let summary = writer
            .finalize(status, failed_paths)
            .map_err(|cause| Error::RunAborted {
                cause: Box::new(cause),
                emitted: store.state().emitted_count,
                last_cursor: store.state().cursor.clone(),
            })?;
        store.finalize(status)?;
        reporter.on_finalize(&summary);

        let duration = start.elapsed();
        info!(
            "Run {} finished as {} in {:.2}s: {} items",
            run_id,
            status,
            duration.as_secs_f64(),
            summary.total_items
        );

        Ok(RunOutcome {
            run_id,
            output,
            resumed,
            summary,
            outcomes,
            duration,
        })
    }
}

/// Enumerate one source to its end. `Err` aborts the whole run.
fn run_source(
    source: &mut Source,
    config: &AppConfig,
    pass: &mut Pass<'_>,
) -> Result<SourceOutcome, Error> {
    let kind = source.kind();
    let limits = limits_for(config, kind);
    let progress = pass.store.state().source(kind).cloned().unwrap_or_default();

    if progress.finished {
        let outcome = progress.outcome.unwrap_or(SourceOutcome::Exhausted);
        info!("Source {} already finished ({:?}); skipping", kind, outcome);
        return Ok(outcome);
    }

    pass.reporter.on_source_start(kind);
    info!(
        "Enumerating {}{}",
        kind,
        if progress.cursor.is_some() { " from checkpoint" } else { "" }
    );

    let opened = EnumerationHandle::open(
        source,
        progress.cursor.as_deref(),
        pass.reporter,
        pass.cancel,
    );
    let mut handle = match opened {
        Ok(handle) => handle,
        Err(Error::Interrupted) => return Err(Error::Interrupted),
        Err(e) if limits.required => return Err(e),
        Err(e) => {
            warn!("Optional source {} skipped: {}", kind, e);
            let reason = match e {
                Error::SourceUnavailable { reason, .. } => reason,
                other => other.to_string(),
            };
            let outcome = SourceOutcome::Unavailable { reason };
            pass.reporter.on_source_complete(kind, &outcome);
            return Ok(outcome);
        }
    };
    pass.store.retry_failures(kind)?;

    let mut consecutive_errors = 0u32;
    loop {
        if pass.cancel.load(Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }

        let record = match handle.next() {
            Advance::End => break,
            Advance::Error(unit) => {
                warn!("Skipping {}: {}", unit.unit, unit.message);
                pass.reporter.on_unit_error(kind, &unit);
                pass.store.record_failure(Some(kind), &unit.unit)?;
                consecutive_errors += 1;
                if limits.max_consecutive_errors > 0
                    && consecutive_errors >= limits.max_consecutive_errors
                {
                    error!(
                        "Source {} failed after {} consecutive errors",
                        kind, consecutive_errors
                    );
                    let outcome = SourceOutcome::Failed { consecutive_errors };
                    pass.reporter.on_source_complete(kind, &outcome);
                    return Ok(outcome);
                }
                continue;
            }
            Advance::Record(record) => record,
        };
        consecutive_errors = 0;

        if !pass.filters.accepts(&record) {
            trace!("Filtered out {}", record.path);
            continue;
        }
        let key = ItemKey::new(kind, record.path.clone());
        let cursor = handle.cursor();
        if pass.store.is_seen(&key, cursor.as_deref()) {
            debug!("Already emitted {}", record.path);
            continue;
        }

        let item = pass.matcher.resolve(record, kind);
        let offset = pass.writer.write_item(&item)?;
        pass.store
            .record(&key, cursor, offset, item.present_locally)?;
        pass.reporter.on_item(&item, pass.store.state().emitted_count);
    }
    drop(handle);

    let failures = pass.store.state().source(kind).map_or(0, |p| p.failures);
    let outcome = if failures > pass.partial_after_failures {
        SourceOutcome::ExhaustedWithFailures { failures }
    } else {
        SourceOutcome::Exhausted
    };
    pass.store.finish_source(kind, outcome.clone())?;
    pass.reporter.on_source_complete(kind, &outcome);
    info!("Source {} done: {:?}", kind, outcome);
    Ok(outcome)
}
