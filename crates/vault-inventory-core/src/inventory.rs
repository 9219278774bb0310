use crate::error::Error;
use crate::model::{InventoryItem, RunSummary};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct InventoryDocument {
    items: Vec<InventoryItem>,
    summary: RunSummary,
}

/// A finished inventory loaded for local queries.
#[derive(Debug)]
pub struct InventoryReader {
    items: Vec<InventoryItem>,
    summary: RunSummary,
}

impl InventoryReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let document: InventoryDocument = serde_json::from_reader(BufReader::new(file))?;
        debug!(
            "Loaded {} items from {}",
            document.items.len(),
            path.display()
        );
        Ok(Self {
            items: document.items,
            summary: document.summary,
        })
    }

    pub fn items(&self) -> &[InventoryItem] {
        &self.items
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Case-insensitive substring match on name, local path and remote path.
    pub fn search(&self, term: &str) -> Vec<&InventoryItem> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.items
            .iter()
            .filter(|item| {
                item.name.to_lowercase().contains(&needle)
                    || item.remote_path.to_lowercase().contains(&needle)
                    || item
                        .local_path
                        .as_deref()
                        .is_some_and(|p| p.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Remote-sourced items with no local copy.
    pub fn report_missing(&self) -> Vec<&InventoryItem> {
        self.items
            .iter()
            .filter(|item| !item.source.is_local() && !item.present_locally)
            .collect()
    }
}
