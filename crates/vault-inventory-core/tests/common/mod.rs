#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vault_inventory_core::config::{PacingConfig, RootMappingConfig};
use vault_inventory_core::model::{InventoryItem, RawRecord, RecordError, SourceKind};
use vault_inventory_core::source::{
    FilesystemSource, LoginState, Page, RemoteOptions, RemoteSession, RemoteUiSource,
    SessionError, Sleeper,
};
use vault_inventory_core::{AppConfig, InventoryReader, ProgressReporter, Source, SummaryStats};

/// In-memory remote repository. Page tokens are page indexes.
#[derive(Clone, Default)]
pub struct ScriptedSession {
    pub pages: Vec<Vec<Result<RawRecord, RecordError>>>,
    pub failing_pages: Vec<usize>,
    pub login_error: Option<String>,
    pub manual_polls: usize,
}

impl ScriptedSession {
    pub fn with_pages(pages: Vec<Vec<RawRecord>>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .map(|page| page.into_iter().map(Ok).collect())
                .collect(),
            ..Self::default()
        }
    }
}

impl RemoteSession for ScriptedSession {
    fn login(&mut self) -> Result<LoginState, SessionError> {
        if let Some(reason) = &self.login_error {
            return Err(SessionError::Login(reason.clone()));
        }
        self.poll_login()
    }

    fn poll_login(&mut self) -> Result<LoginState, SessionError> {
        if self.manual_polls == 0 {
            Ok(LoginState::Ready)
        } else {
            self.manual_polls -= 1;
            Ok(LoginState::ManualStepPending("enter the code sent to your phone".into()))
        }
    }

    fn next_page(&mut self, token: Option<&str>) -> Result<Page, SessionError> {
        let index: usize = token.map_or(0, |t| t.parse().unwrap());
        let next = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        if self.failing_pages.contains(&index) {
            return Err(SessionError::Page {
                message: "grid did not render".into(),
                next,
            });
        }
        Ok(Page {
            rows: self.pages.get(index).cloned().unwrap_or_default(),
            next,
        })
    }
}

pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&mut self, _duration: Duration) {}
}

/// Sets the cancel flag once `limit` items have been emitted.
pub struct StopAfter {
    pub limit: u64,
    pub cancel: Arc<AtomicBool>,
}

impl ProgressReporter for StopAfter {
    fn on_item(&self, _item: &InventoryItem, emitted: u64) {
        if emitted >= self.limit {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }
}

pub fn remote(name: &str, path: &str, id: Option<&str>) -> RawRecord {
    RawRecord {
        name: name.to_string(),
        path: path.to_string(),
        remote_id: id.map(str::to_string),
        size: None,
        created_at: None,
        modified_at: None,
    }
}

/// root/a.sldprt, root/b.sldprt, root/sub/c.sldasm
pub fn create_vault_tree(root: &Path) {
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("a.sldprt"), "part a").unwrap();
    fs::write(root.join("b.sldprt"), "part b").unwrap();
    fs::write(root.join("sub").join("c.sldasm"), "assembly c").unwrap();
}

/// Output and checkpoint under `work`, one PDM root mapped from `/Vault`.
pub fn config_for(work: &Path, vault: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.output.path = work.join("out").join("inventory.json");
    config.checkpoint.dir = work.join("checkpoint");
    config.checkpoint.compact_every = 2;
    config.pdm.roots = vec![vault.to_string_lossy().into_owned()];
    config.root_mappings = vec![RootMappingConfig {
        remote_prefix: "/Vault".to_string(),
        local_root: vault.to_string_lossy().into_owned(),
    }];
    config.plm.pacing = PacingConfig::disabled();
    config
}

pub fn remote_source(session: ScriptedSession) -> RemoteUiSource {
    RemoteUiSource::new(
        SourceKind::Plm,
        Box::new(session),
        RemoteOptions {
            manual_step_timeout: Duration::from_secs(60),
            manual_step_poll: Duration::from_secs(5),
            pacing: PacingConfig::disabled(),
        },
    )
    .with_sleeper(Box::new(NoSleep))
}

pub fn sources(config: &AppConfig, session: ScriptedSession) -> Vec<Source> {
    vec![
        Source::Filesystem(FilesystemSource::from_config(&config.pdm)),
        Source::Remote(remote_source(session)),
    ]
}

/// Sorted `(source, path)` keys of the items in a finished inventory.
pub fn item_keys(reader: &InventoryReader) -> Vec<(SourceKind, String)> {
    let mut keys: Vec<(SourceKind, String)> = reader
        .items()
        .iter()
        .map(|item| (item.source, item.remote_path.clone()))
        .collect();
    keys.sort();
    keys
}

pub fn assert_summary_recomputable(reader: &InventoryReader) {
    let summary = reader.summary();
    let recomputed = SummaryStats::from_items(reader.items());
    assert_eq!(summary.total_items, reader.items().len() as u64);
    for kind in [SourceKind::Pdm, SourceKind::Plm] {
        assert_eq!(summary.stats.total(kind), recomputed.total(kind), "total_{}", kind);
    }
    assert_eq!(summary.stats.matched, recomputed.matched);
    assert_eq!(summary.stats.missing_locally, recomputed.missing_locally);
}
