use crate::model::SourceKind;
use crate::normalize::{PathPolicy, SeparatorStyle};
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output: OutputConfig,
    pub checkpoint: CheckpointConfig,
    pub pdm: PdmConfig,
    pub plm: PlmConfig,
    pub local_roots: Vec<LocalRootConfig>,
    pub root_mappings: Vec<RootMappingConfig>,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inventory.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Journal records between snapshot compactions.
    pub compact_every: u64,
    /// Drop seen keys of finished sources when compacting.
    pub prune_finished_sources: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".checkpoint"),
            compact_every: 1000,
            prune_finished_sources: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PdmConfig {
    pub roots: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub required: bool,
    pub max_consecutive_errors: u32,
}

impl Default for PdmConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            ignore_patterns: Vec::new(),
            required: true,
            max_consecutive_errors: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlmConfig {
    pub export_csv: Option<PathBuf>,
    pub base_path: String,
    pub page_size: usize,
    pub required: bool,
    pub max_consecutive_errors: u32,
    pub manual_step_timeout_secs: u64,
    pub manual_step_poll_secs: u64,
    pub pacing: PacingConfig,
}

impl Default for PlmConfig {
    fn default() -> Self {
        Self {
            export_csv: None,
            base_path: "/".to_string(),
            page_size: 100,
            required: false,
            max_consecutive_errors: 5,
            manual_step_timeout_secs: 300,
            manual_step_poll_secs: 5,
            pacing: PacingConfig::default(),
        }
    }
}

/// Delay bounds between remote page fetches, in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub short_min_ms: u64,
    pub short_max_ms: u64,
    pub long_every: u32,
    pub long_min_ms: u64,
    pub long_max_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            short_min_ms: 1000,
            short_max_ms: 3000,
            long_every: 10,
            long_min_ms: 3000,
            long_max_ms: 6000,
        }
    }
}

impl PacingConfig {
    pub fn disabled() -> Self {
        Self {
            short_min_ms: 0,
            short_max_ms: 0,
            long_every: 0,
            long_min_ms: 0,
            long_max_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalRootConfig {
    pub path: String,
    #[serde(default)]
    pub case_sensitive: Option<bool>,
    #[serde(default)]
    pub separator: Option<SeparatorStyle>,
}

impl LocalRootConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            case_sensitive: None,
            separator: None,
        }
    }

    /// Explicit settings win over the root-style default.
    pub fn policy(&self) -> PathPolicy {
        let default = PathPolicy::for_root(&self.path);
        PathPolicy {
            case_sensitive: self.case_sensitive.unwrap_or(default.case_sensitive),
            separator_style: self.separator.unwrap_or(default.separator_style),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootMappingConfig {
    pub remote_prefix: String,
    pub local_root: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub source_order: Vec<SourceKind>,
    /// Recorded failures tolerated before the run is marked partial.
    pub partial_after_failures: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_order: vec![SourceKind::Pdm, SourceKind::Plm],
            partial_after_failures: 0,
        }
    }
}

impl AppConfig {
    /// Local roots for presence matching, falling back to the PDM roots.
    pub fn effective_local_roots(&self) -> Vec<LocalRootConfig> {
        if !self.local_roots.is_empty() {
            return self.local_roots.clone();
        }
        non_overlapping_directories(self.pdm.roots.clone())
            .into_iter()
            .map(LocalRootConfig::new)
            .collect()
    }
}

/// Load `Settings.*` (or the given file), then `VAULT_INVENTORY__*` env overrides.
pub fn load_configuration(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file_source = match path {
        Some(path) => ConfigFile::from(path).required(true),
        None => ConfigFile::with_name("Settings").required(false),
    };
    let builder = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("VAULT_INVENTORY")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        let mut should_add = true;
        let result_clone = result.clone();

        for res_dir in &result_clone {
            let res_dir_path = Path::new(res_dir);

            if dir_path.starts_with(res_dir_path) {
                should_add = false;
                break;
            }

            if res_dir_path.starts_with(dir_path) {
                result.retain(|x| x != res_dir);
                break;
            }
        }

        if should_add {
            result.push(dir);
        }
    }

    result
}
