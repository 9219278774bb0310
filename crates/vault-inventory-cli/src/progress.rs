use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;
use vault_inventory_core::model::RecordError;
use vault_inventory_core::{
    InventoryItem, ProgressReporter, RunSummary, SourceKind, SourceOutcome,
};

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter: one spinner per source, item count in the message.
#[derive(Default)]
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn spinner(message: String) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(TICKS),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_run_start(&self, run_id: &str, resumed: bool) {
        eprintln!(
            "  {} run {}",
            if resumed { "Resuming" } else { "Starting" },
            run_id
        );
    }

    fn on_source_start(&self, source: SourceKind) {
        self.set_bar(Self::spinner(format!("Enumerating {}...", source)));
    }

    fn on_item(&self, item: &InventoryItem, emitted: u64) {
        if emitted % 50 == 0 {
            self.with_bar(|pb| {
                pb.set_message(format!(
                    "Enumerating {}... {} items ({})",
                    item.source, emitted, item.name
                ))
            });
        }
    }

    fn on_unit_error(&self, _source: SourceKind, error: &RecordError) {
        self.with_bar(|pb| pb.println(format!("  {} skipped {}", "!".yellow(), error)));
    }

    fn on_manual_step(&self, source: SourceKind, prompt: &str, waited_secs: u64) {
        self.with_bar(|pb| {
            pb.set_message(format!(
                "{} login waiting for manual step ({}s): {}",
                source, waited_secs, prompt
            ))
        });
    }

    fn on_source_complete(&self, source: SourceKind, outcome: &SourceOutcome) {
        self.finish_bar();
        let (mark, text) = match outcome {
            SourceOutcome::Exhausted => ("✓".green(), "complete".to_string()),
            SourceOutcome::ExhaustedWithFailures { failures } => (
                "!".yellow(),
                format!("complete with {} failed units", failures),
            ),
            SourceOutcome::Failed { consecutive_errors } => (
                "✗".red(),
                format!("failed after {} consecutive errors", consecutive_errors),
            ),
            SourceOutcome::Unavailable { reason } => {
                ("✗".red(), format!("unavailable: {}", reason))
            }
        };
        eprintln!("  {} {} {}", mark, source, text);
    }

    fn on_finalize(&self, summary: &RunSummary) {
        self.finish_bar();
        eprintln!(
            "  {} Inventory finalized: {} items ({})",
            "✓".green(),
            summary.total_items,
            summary.status
        );
    }
}
