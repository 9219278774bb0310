//! Path normalization and remote-to-local root mapping.
//!
//! Keys are built per local root: a single run can combine case-sensitive
//! archive shares with case-insensitive Windows drives, so the policy travels
//! with the root rather than being global.

use crate::config::{LocalRootConfig, RootMappingConfig};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparatorStyle {
    /// Both `\` and `/` separate components.
    Windows,
    /// Only `/` separates components.
    Posix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathPolicy {
    pub case_sensitive: bool,
    pub separator_style: SeparatorStyle,
}

impl PathPolicy {
    pub fn windows() -> Self {
        Self {
            case_sensitive: false,
            separator_style: SeparatorStyle::Windows,
        }
    }

    pub fn posix() -> Self {
        Self {
            case_sensitive: true,
            separator_style: SeparatorStyle::Posix,
        }
    }

    /// Case-insensitive for Windows-style roots, case-sensitive otherwise.
    pub fn for_root(root: &str) -> Self {
        if is_windows_style(root) {
            Self::windows()
        } else {
            Self::posix()
        }
    }

    fn is_separator(&self, c: char) -> bool {
        match self.separator_style {
            SeparatorStyle::Windows => c == '\\' || c == '/',
            SeparatorStyle::Posix => c == '/',
        }
    }

    /// Fold one component for comparison.
    pub fn fold(&self, component: &str) -> String {
        if self.case_sensitive {
            component.to_string()
        } else {
            component.to_lowercase()
        }
    }
}

/// Drive-letter (`Z:`) or UNC (`\\server`) paths.
pub fn is_windows_style(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    drive || path.starts_with("\\\\")
}

/// A path reduced to comparable form: components joined by `/`, no leading
/// or trailing separator, case folded per policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComparableKey(String);

impl ComparableKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }
}

impl fmt::Display for ComparableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize(path: &str, policy: PathPolicy) -> ComparableKey {
    let parts = split_components(path, policy);
    let folded: Vec<String> = parts.iter().map(|c| policy.fold(c)).collect();
    ComparableKey(folded.join("/"))
}

/// Split on the policy's separators, dropping empty and `.` components and
/// resolving `..` lexically. Original case is kept.
pub fn split_components(path: &str, policy: PathPolicy) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.split(|c| policy.is_separator(c)) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    parts
}

/// One lookup target for a remote path: the root to look under and the path
/// components relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub root_index: usize,
    pub relative: Vec<String>,
}

#[derive(Debug, Clone)]
struct Mapping {
    prefix: Vec<String>,
    root_index: usize,
}

/// Remote prefix -> local root table.
#[derive(Debug, Clone)]
pub struct RootMap {
    policies: Vec<PathPolicy>,
    mappings: Vec<Mapping>,
}

impl RootMap {
    pub fn new(roots: &[LocalRootConfig], mappings: &[RootMappingConfig]) -> Result<Self, Error> {
        let policies: Vec<PathPolicy> = roots.iter().map(|r| r.policy()).collect();

        let mut resolved = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let root_index = roots
                .iter()
                .zip(&policies)
                .position(|(root, policy)| {
                    normalize(&root.path, *policy) == normalize(&mapping.local_root, *policy)
                })
                .ok_or_else(|| {
                    Error::Config(config::ConfigError::Message(format!(
                        "root mapping '{}' targets unknown local root '{}'",
                        mapping.remote_prefix, mapping.local_root
                    )))
                })?;
            resolved.push(Mapping {
                prefix: split_components(&mapping.remote_prefix, PathPolicy::windows()),
                root_index,
            });
        }

        // Lookup order follows root priority; within a root, the longest prefix wins.
        resolved.sort_by(|a, b| {
            a.root_index
                .cmp(&b.root_index)
                .then(b.prefix.len().cmp(&a.prefix.len()))
        });

        Ok(Self {
            policies,
            mappings: resolved,
        })
    }

    pub fn policy(&self, root_index: usize) -> PathPolicy {
        self.policies[root_index]
    }

    /// Lookup targets for a remote path. Empty means unmappable.
    pub fn candidates(&self, remote_path: &str) -> Vec<Candidate> {
        let remote = split_components(remote_path, PathPolicy::windows());
        let mut candidates: Vec<Candidate> = Vec::new();

        for mapping in &self.mappings {
            let policy = self.policies[mapping.root_index];
            if remote.len() <= mapping.prefix.len() {
                continue;
            }
            let matches = mapping
                .prefix
                .iter()
                .zip(&remote)
                .all(|(p, r)| policy.fold(p) == policy.fold(r));
            if !matches {
                continue;
            }
            let candidate = Candidate {
                root_index: mapping.root_index,
                relative: remote[mapping.prefix.len()..].to_vec(),
            };
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }

        candidates
    }
}
