use crate::model::SourceKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The source could not be reached or authenticated at all.
    #[error("Source '{source_kind}' unavailable: {reason}")]
    SourceUnavailable {
        source_kind: SourceKind,
        reason: String,
    },

    /// Output could not be durably written; the checkpoint stays resumable.
    #[error("Inventory write failed: {0}")]
    WriterIo(#[source] std::io::Error),

    #[error("Checkpoint {path} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Output {0} already exists. Use --force to overwrite or --resume to continue.")]
    OutputExists(PathBuf),

    #[error("No checkpoint to resume for {0}. Use --force to start a new run over it.")]
    NothingToResume(PathBuf),

    #[error("Another run holds the lock {0}")]
    Locked(PathBuf),

    #[error("Run interrupted by operator")]
    Interrupted,

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Run aborted after {emitted} items: {cause}")]
    RunAborted {
        #[source]
        cause: Box<Error>,
        emitted: u64,
        last_cursor: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn unavailable(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        Error::SourceUnavailable {
            source_kind,
            reason: reason.into(),
        }
    }
}
