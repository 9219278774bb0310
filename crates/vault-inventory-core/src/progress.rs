use crate::checkpoint::SourceOutcome;
use crate::model::{InventoryItem, RecordError, RunSummary, SourceKind};

/// Trait for reporting run progress.
///
/// The CLI implements it with tracing/indicatif; tests use it to observe or
/// interrupt a run. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_run_start(&self, _run_id: &str, _resumed: bool) {}
    fn on_source_start(&self, _source: SourceKind) {}
    /// Called after the item is written and recorded.
    fn on_item(&self, _item: &InventoryItem, _emitted: u64) {}
    fn on_unit_error(&self, _source: SourceKind, _error: &RecordError) {}
    /// A remote login is waiting on an out-of-band step (e.g. MFA).
    fn on_manual_step(&self, _source: SourceKind, _prompt: &str, _waited_secs: u64) {}
    fn on_source_complete(&self, _source: SourceKind, _outcome: &SourceOutcome) {}
    fn on_finalize(&self, _summary: &RunSummary) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
