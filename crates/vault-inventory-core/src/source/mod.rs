//! Source enumerators: one lazy, resumable record stream per source kind.

pub mod csv_export;
pub mod filesystem;
pub mod remote;

pub use csv_export::CsvExportSession;
pub use filesystem::FilesystemSource;
pub use remote::{
    LoginState, Page, Pacer, RemoteOptions, RemoteSession, RemoteUiSource, SessionError,
    SessionState, Sleeper, ThreadSleeper,
};

use crate::config::AppConfig;
use crate::error::Error;
use crate::model::{RawRecord, RecordError, SourceKind};
use crate::progress::ProgressReporter;
use std::sync::atomic::AtomicBool;
use tracing::debug;

/// Result of advancing a source by one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Record(RawRecord),
    /// The unit could not be read. Enumeration continues with the next one.
    Error(RecordError),
    End,
}

pub trait SourceEnumerator {
    fn kind(&self) -> SourceKind;

    /// Establish the session or traversal position. `resume` is a cursor
    /// previously returned by `cursor()`. Fails only when the source cannot
    /// be reached at all, or with `Error::Interrupted` when `cancel` is set
    /// while opening blocks.
    fn open(
        &mut self,
        resume: Option<&str>,
        reporter: &dyn ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<(), Error>;

    fn next(&mut self) -> Advance;

    /// Resume position after the last unit returned by `next()`.
    fn cursor(&self) -> Option<String>;

    /// Release any session or handle. Must be safe to call more than once.
    fn close(&mut self);
}

/// An opened source. Closing happens on drop, whatever the exit path.
pub struct EnumerationHandle<'a> {
    source: &'a mut dyn SourceEnumerator,
}

impl<'a> EnumerationHandle<'a> {
    pub fn open(
        source: &'a mut dyn SourceEnumerator,
        resume: Option<&str>,
        reporter: &dyn ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<Self, Error> {
        if let Err(e) = source.open(resume, reporter, cancel) {
            source.close();
            return Err(e);
        }
        Ok(Self { source })
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn next(&mut self) -> Advance {
        self.source.next()
    }

    pub fn cursor(&self) -> Option<String> {
        self.source.cursor()
    }
}

impl Drop for EnumerationHandle<'_> {
    fn drop(&mut self) {
        debug!("Closing {} source", self.source.kind());
        self.source.close();
    }
}

/// The closed set of source variants, dispatched by configuration.
pub enum Source {
    Filesystem(FilesystemSource),
    Remote(RemoteUiSource),
}

impl Source {
    pub fn from_config(kind: SourceKind, config: &AppConfig) -> Self {
        match kind {
            SourceKind::Pdm => Source::Filesystem(FilesystemSource::from_config(&config.pdm)),
            SourceKind::Plm => Source::Remote(RemoteUiSource::new(
                SourceKind::Plm,
                Box::new(CsvExportSession::from_config(&config.plm)),
                RemoteOptions::from_config(&config.plm),
            )),
        }
    }
}

impl SourceEnumerator for Source {
    fn kind(&self) -> SourceKind {
        match self {
            Source::Filesystem(s) => s.kind(),
            Source::Remote(s) => s.kind(),
        }
    }

    fn open(
        &mut self,
        resume: Option<&str>,
        reporter: &dyn ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<(), Error> {
        match self {
            Source::Filesystem(s) => s.open(resume, reporter, cancel),
            Source::Remote(s) => s.open(resume, reporter, cancel),
        }
    }

    fn next(&mut self) -> Advance {
        match self {
            Source::Filesystem(s) => s.next(),
            Source::Remote(s) => s.next(),
        }
    }

    fn cursor(&self) -> Option<String> {
        match self {
            Source::Filesystem(s) => s.cursor(),
            Source::Remote(s) => s.cursor(),
        }
    }

    fn close(&mut self) {
        match self {
            Source::Filesystem(s) => s.close(),
            Source::Remote(s) => s.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentReporter;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        opens_fail: bool,
        closes: Arc<AtomicUsize>,
    }

    impl SourceEnumerator for Counting {
        fn kind(&self) -> SourceKind {
            SourceKind::Pdm
        }

        fn open(
            &mut self,
            _: Option<&str>,
            _: &dyn ProgressReporter,
            _: &AtomicBool,
        ) -> Result<(), Error> {
            if self.opens_fail {
                Err(Error::unavailable(SourceKind::Pdm, "drive missing"))
            } else {
                Ok(())
            }
        }

        fn next(&mut self) -> Advance {
            Advance::End
        }

        fn cursor(&self) -> Option<String> {
            None
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_handle_closes_on_drop_and_on_failed_open() {
        let closes = Arc::new(AtomicUsize::new(0));
        let cancel = AtomicBool::new(false);
        let mut ok = Counting {
            opens_fail: false,
            closes: closes.clone(),
        };
        {
            let mut handle =
                EnumerationHandle::open(&mut ok, None, &SilentReporter, &cancel).unwrap();
            assert_eq!(handle.next(), Advance::End);
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let mut failing = Counting {
            opens_fail: true,
            closes: closes.clone(),
        };
        assert!(EnumerationHandle::open(&mut failing, None, &SilentReporter, &cancel).is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
