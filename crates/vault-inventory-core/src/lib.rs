pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod inventory;
pub mod lock;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod progress;
pub mod source;
pub mod writer;

pub use checkpoint::{CheckpointState, CheckpointStore, SourceOutcome};
pub use config::AppConfig;
pub use engine::{RunOptions, RunOrchestrator, RunOutcome};
pub use error::Error;
pub use filter::FilterSet;
pub use inventory::InventoryReader;
pub use model::{InventoryItem, RunStatus, RunSummary, SourceKind, SummaryStats};
pub use progress::{ProgressReporter, SilentReporter};
pub use source::{Source, SourceEnumerator};
pub use writer::{InventoryWriter, OverwritePolicy};
