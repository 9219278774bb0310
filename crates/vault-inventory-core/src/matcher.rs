use crate::config::{AppConfig, LocalRootConfig, RootMappingConfig};
use crate::error::Error;
use crate::model::{InventoryItem, RawRecord, SourceKind};
use crate::normalize::{Candidate, RootMap};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const LISTING_CACHE_LIMIT: usize = 256;

/// Decides local presence for records by looking them up under the configured local roots.
///
/// Remote items from one folder tend to arrive together, so the directory
/// listings that lookups walk are cached (bounded).
pub struct PresenceMatcher {
    roots: Vec<PathBuf>,
    map: RootMap,
    listings: HashMap<PathBuf, Vec<(String, String)>>,
}

impl PresenceMatcher {
    pub fn new(roots: &[LocalRootConfig], mappings: &[RootMappingConfig]) -> Result<Self, Error> {
        Ok(Self {
            roots: roots.iter().map(|r| PathBuf::from(&r.path)).collect(),
            map: RootMap::new(roots, mappings)?,
            listings: HashMap::new(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        Self::new(&config.effective_local_roots(), &config.root_mappings)
    }

    /// Attach presence to a filtered record.
    pub fn resolve(&mut self, record: RawRecord, source: SourceKind) -> InventoryItem {
        let local_path = if source.is_local() {
            Some(record.path.clone())
        } else {
            self.locate(&record.path)
                .map(|p| p.to_string_lossy().into_owned())
        };
        InventoryItem::from_record(record, source, local_path)
    }

    /// First matching local file across roots in priority order. Unmappable
    /// paths return `None` without touching the filesystem.
    pub fn locate(&mut self, remote_path: &str) -> Option<PathBuf> {
        let candidates = self.map.candidates(remote_path);
        if candidates.is_empty() {
            debug!("No root mapping for {}", remote_path);
            return None;
        }
        candidates
            .into_iter()
            .find_map(|candidate| self.look_up(&candidate))
    }

    /// Walk the candidate one component at a time against directory
    /// listings. Names are compared here rather than by the OS, which folds
    /// case on Windows and macOS whatever the root's policy says.
    fn look_up(&mut self, candidate: &Candidate) -> Option<PathBuf> {
        let policy = self.map.policy(candidate.root_index);
        let mut current = self.roots[candidate.root_index].clone();

        for component in &candidate.relative {
            let listing = self.listing(&current)?;
            let exact = listing.iter().find(|(_, name)| name == component);
            let found = if policy.case_sensitive {
                exact
            } else {
                let wanted = policy.fold(component);
                exact.or_else(|| listing.iter().find(|(folded, _)| *folded == wanted))
            };
            let name = found.map(|(_, name)| name.clone())?;
            current = current.join(name);
        }
        trace!("Checking {}", current.display());
        current.is_file().then_some(current)
    }

    fn listing(&mut self, dir: &Path) -> Option<&Vec<(String, String)>> {
        if !self.listings.contains_key(dir) {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    trace!("Cannot list {}: {}", dir.display(), err);
                    return None;
                }
            };
            let mut names: Vec<(String, String)> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    (name.to_lowercase(), name)
                })
                .collect();
            names.sort();

            if self.listings.len() >= LISTING_CACHE_LIMIT {
                self.listings.clear();
            }
            self.listings.insert(dir.to_path_buf(), names);
        }
        self.listings.get(dir)
    }
}
