//! Remote, web-UI-backed repositories.
//!
//! The site-specific part (logging in, rendering a page of rows) lives
//! behind [`RemoteSession`]. [`RemoteUiSource`] owns everything that is the
//! same for every site: the login handshake including out-of-band manual
//! steps, pagination, pacing between page fetches and the resume cursor.

use crate::config::{PacingConfig, PlmConfig};
use crate::error::Error;
use crate::model::{RawRecord, RecordError, SourceKind};
use crate::progress::ProgressReporter;
use crate::source::{Advance, SourceEnumerator};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Ready,
    /// Waiting on the operator, e.g. a multi-factor prompt.
    ManualStepPending(String),
}

/// One page of rows. `next` is the token of the following page, if any.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<Result<RawRecord, RecordError>>,
    pub next: Option<String>,
}

#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("login failed: {0}")]
    Login(String),

    /// The page could not be fetched. `next` is where to continue when the
    /// session still knows it.
    #[error("page fetch failed: {message}")]
    Page {
        message: String,
        next: Option<String>,
    },
}

pub trait RemoteSession: Send {
    fn login(&mut self) -> Result<LoginState, SessionError>;

    /// Re-check a pending manual step.
    fn poll_login(&mut self) -> Result<LoginState, SessionError>;

    /// Fetch the page at `token`; `None` is the first page.
    fn next_page(&mut self, token: Option<&str>) -> Result<Page, SessionError>;

    fn close(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    AwaitingManualStep { prompt: String },
    Ready,
    Closed,
}

pub trait Sleeper: Send {
    fn sleep(&mut self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Jittered delays between page fetches: short after most pages, long
/// after every `long_every`-th.
pub struct Pacer {
    config: PacingConfig,
    pages: u32,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Self { config, pages: 0 }
    }

    /// Register a fetched page and return the delay to wait before the next.
    pub fn after_page(&mut self) -> Duration {
        self.pages += 1;
        let long = self.config.long_every > 0 && self.pages % self.config.long_every == 0;
        let (min, max) = if long {
            (self.config.long_min_ms, self.config.long_max_ms)
        } else {
            (self.config.short_min_ms, self.config.short_max_ms)
        };
        Duration::from_millis(jitter(min, max))
    }
}

fn jitter(min: u64, max: u64) -> u64 {
    if max <= min {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub manual_step_timeout: Duration,
    pub manual_step_poll: Duration,
    pub pacing: PacingConfig,
}

impl RemoteOptions {
    pub fn from_config(config: &PlmConfig) -> Self {
        Self {
            manual_step_timeout: Duration::from_secs(config.manual_step_timeout_secs),
            manual_step_poll: Duration::from_secs(config.manual_step_poll_secs.max(1)),
            pacing: config.pacing.clone(),
        }
    }
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self::from_config(&PlmConfig::default())
    }
}

/// Paginates a [`RemoteSession`]. The cursor is the token of the page whose
/// rows are being yielded, so a resume refetches that page and relies on
/// the checkpoint's seen keys to drop rows already emitted.
pub struct RemoteUiSource {
    kind: SourceKind,
    session: Box<dyn RemoteSession>,
    options: RemoteOptions,
    sleeper: Box<dyn Sleeper>,
    pacer: Pacer,
    state: SessionState,
    buffer: VecDeque<Result<RawRecord, RecordError>>,
    current_token: Option<String>,
    next_token: Option<String>,
    pending_delay: Option<Duration>,
    exhausted: bool,
}

impl RemoteUiSource {
    pub fn new(kind: SourceKind, session: Box<dyn RemoteSession>, options: RemoteOptions) -> Self {
        let pacer = Pacer::new(options.pacing.clone());
        Self {
            kind,
            session,
            options,
            sleeper: Box::new(ThreadSleeper),
            pacer,
            state: SessionState::Disconnected,
            buffer: VecDeque::new(),
            current_token: None,
            next_token: None,
            pending_delay: None,
            exhausted: false,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn session_state(&self) -> &SessionState {
        &self.state
    }

    fn unavailable(&self, reason: impl Into<String>) -> Error {
        Error::unavailable(self.kind, reason)
    }

    fn await_manual_step(
        &mut self,
        mut prompt: String,
        reporter: &dyn ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<(), Error> {
        let mut waited = Duration::ZERO;
        loop {
            warn!("{} login waiting for manual step: {}", self.kind, prompt);
            self.state = SessionState::AwaitingManualStep {
                prompt: prompt.clone(),
            };
            reporter.on_manual_step(self.kind, &prompt, waited.as_secs());

            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }
            if waited >= self.options.manual_step_timeout {
                return Err(self.unavailable(format!(
                    "manual login step not completed within {}s",
                    self.options.manual_step_timeout.as_secs()
                )));
            }
            self.sleeper.sleep(self.options.manual_step_poll);
            waited += self.options.manual_step_poll;

            match self.session.poll_login() {
                Ok(LoginState::Ready) => return Ok(()),
                Ok(LoginState::ManualStepPending(next)) => prompt = next,
                Err(e) => return Err(self.unavailable(e.to_string())),
            }
        }
    }

    fn fetch(&mut self) -> Option<RecordError> {
        if let Some(delay) = self.pending_delay.take() {
            debug!("Pacing {} for {} ms", self.kind, delay.as_millis());
            self.sleeper.sleep(delay);
        }

        let token = self.next_token.take();
        let result = self.session.next_page(token.as_deref());
        self.pending_delay = Some(self.pacer.after_page());
        self.current_token = token;

        match result {
            Ok(page) => {
                debug!(
                    "Fetched {} page {} ({} rows)",
                    self.kind,
                    self.current_token.as_deref().unwrap_or("start"),
                    page.rows.len()
                );
                self.next_token = page.next;
                self.exhausted = self.next_token.is_none();
                self.buffer.extend(page.rows);
                None
            }
            Err(SessionError::Page { message, next }) => {
                self.exhausted = next.is_none();
                self.next_token = next;
                Some(RecordError::new(
                    format!(
                        "{} page {}",
                        self.kind,
                        self.current_token.as_deref().unwrap_or("start")
                    ),
                    message,
                ))
            }
            Err(e @ SessionError::Login(_)) => {
                self.exhausted = true;
                Some(RecordError::new(format!("{} session", self.kind), e))
            }
        }
    }
}

impl SourceEnumerator for RemoteUiSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn open(
        &mut self,
        resume: Option<&str>,
        reporter: &dyn ProgressReporter,
        cancel: &AtomicBool,
    ) -> Result<(), Error> {
        self.state = SessionState::Disconnected;
        match self.session.login() {
            Ok(LoginState::Ready) => {}
            Ok(LoginState::ManualStepPending(prompt)) => {
                self.await_manual_step(prompt, reporter, cancel)?
            }
            Err(e) => return Err(self.unavailable(e.to_string())),
        }
        self.state = SessionState::Ready;
        info!("{} session ready", self.kind);

        self.buffer.clear();
        self.next_token = resume.map(str::to_string);
        self.current_token = self.next_token.clone();
        self.pending_delay = None;
        self.exhausted = false;
        Ok(())
    }

    fn next(&mut self) -> Advance {
        loop {
            match self.buffer.pop_front() {
                Some(Ok(record)) => return Advance::Record(record),
                Some(Err(e)) => return Advance::Error(e),
                None => {}
            }
            if self.exhausted || self.state != SessionState::Ready {
                return Advance::End;
            }
            if let Some(e) = self.fetch() {
                return Advance::Error(e);
            }
        }
    }

    fn cursor(&self) -> Option<String> {
        self.current_token.clone()
    }

    fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.session.close();
            self.state = SessionState::Closed;
        }
    }
}
