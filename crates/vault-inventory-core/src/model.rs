use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which enumerator produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Filesystem-backed vault tree.
    Pdm,
    /// Remote, web-UI-backed repository.
    Plm,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdm => "pdm",
            SourceKind::Plm => "plm",
        }
    }

    /// Records from a local source define presence themselves.
    pub fn is_local(&self) -> bool {
        matches!(self, SourceKind::Pdm)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdm" => Ok(SourceKind::Pdm),
            "plm" => Ok(SourceKind::Plm),
            other => Err(format!("unknown source '{}'", other)),
        }
    }
}

/// One unit yielded by a source, before filtering and matching.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub name: String,
    pub path: String,
    pub remote_id: Option<String>,
    pub size: Option<u64>,
    pub created_at: Option<NaiveDateTime>,
    pub modified_at: Option<NaiveDateTime>,
}

/// A unit the source could not read. Enumeration continues past it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordError {
    pub unit: String,
    pub message: String,
}

impl RecordError {
    pub fn new(unit: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            unit: unit.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.message)
    }
}

/// Identity of an emitted item: `(source, source_path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub source: SourceKind,
    pub path: String,
}

impl ItemKey {
    pub fn new(source: SourceKind, path: impl Into<String>) -> Self {
        Self {
            source,
            path: path.into(),
        }
    }
}

/// One record of the output inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    pub remote_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<NaiveDateTime>,
    pub present_locally: bool,
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl InventoryItem {
    /// Build an item from a raw record. `local_path` decides presence, so
    /// the two fields cannot disagree.
    pub fn from_record(record: RawRecord, source: SourceKind, local_path: Option<String>) -> Self {
        Self {
            name: record.name,
            remote_path: record.path,
            remote_id: record.remote_id,
            present_locally: local_path.is_some(),
            local_path,
            created_at: record.created_at,
            modified_at: record.modified_at,
            source,
            size: record.size,
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.source, self.remote_path.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Partial,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Running counters, derived only from emitted items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryStats {
    #[serde(flatten)]
    pub totals: BTreeMap<String, u64>,
    pub matched: u64,
    pub missing_locally: u64,
}

impl SummaryStats {
    /// Counters with a zero `total_<source>` entry for each selected source.
    pub fn for_sources(sources: &[SourceKind]) -> Self {
        let mut stats = SummaryStats::default();
        for source in sources {
            stats.totals.entry(total_key(*source)).or_insert(0);
        }
        stats
    }

    pub fn observe(&mut self, item: &InventoryItem) {
        self.observe_parts(item.source, item.present_locally);
    }

    pub fn observe_parts(&mut self, source: SourceKind, present_locally: bool) {
        *self.totals.entry(total_key(source)).or_insert(0) += 1;
        if !source.is_local() {
            if present_locally {
                self.matched += 1;
            } else {
                self.missing_locally += 1;
            }
        }
    }

    pub fn total(&self, source: SourceKind) -> u64 {
        self.totals.get(&total_key(source)).copied().unwrap_or(0)
    }

    pub fn total_items(&self) -> u64 {
        self.totals.values().sum()
    }

    /// Recompute counters by scanning items.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a InventoryItem>) -> Self {
        let mut stats = SummaryStats::default();
        for item in items {
            stats.observe(item);
        }
        stats
    }
}

fn total_key(source: SourceKind) -> String {
    format!("total_{}", source.as_str())
}

/// The `summary` object closing an inventory document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_items: u64,
    pub stats: SummaryStats,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: SourceKind, path: &str, local: Option<&str>) -> InventoryItem {
        InventoryItem::from_record(
            RawRecord {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                path: path.to_string(),
                remote_id: None,
                size: None,
                created_at: None,
                modified_at: None,
            },
            source,
            local.map(str::to_string),
        )
    }

    #[test]
    fn test_presence_follows_local_path() {
        let found = item(SourceKind::Plm, "/Vault/a.prt", Some("Z:/Vault/a.prt"));
        assert!(found.present_locally);
        let missing = item(SourceKind::Plm, "/Vault/b.prt", None);
        assert!(!missing.present_locally);
        assert!(missing.local_path.is_none());
    }

    #[test]
    fn test_stats_only_match_remote_items() {
        let items = vec![
            item(SourceKind::Pdm, "/v/a", Some("/v/a")),
            item(SourceKind::Plm, "/v/a", Some("/v/a")),
            item(SourceKind::Plm, "/v/z", None),
        ];
        let stats = SummaryStats::from_items(&items);
        assert_eq!(stats.total(SourceKind::Pdm), 1);
        assert_eq!(stats.total(SourceKind::Plm), 2);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.missing_locally, 1);
        assert_eq!(stats.total_items(), 3);
    }

    #[test]
    fn test_stats_serialize_flat_totals() {
        let stats = SummaryStats::for_sources(&[SourceKind::Pdm, SourceKind::Plm]);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_pdm"], 0);
        assert_eq!(json["total_plm"], 0);
        assert_eq!(json["matched"], 0);
    }

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("PLM".parse::<SourceKind>().unwrap(), SourceKind::Plm);
        assert!("ftp".parse::<SourceKind>().is_err());
    }
}
