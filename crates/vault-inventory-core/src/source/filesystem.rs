use crate::config::{non_overlapping_directories, PdmConfig};
use crate::error::Error;
use crate::model::{RawRecord, RecordError, SourceKind};
use crate::progress::ProgressReporter;
use crate::source::{Advance, SourceEnumerator};
use chrono::{DateTime, Local, NaiveDateTime};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::SystemTime;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// One path component of a cursor. Names that are not valid UTF-8 keep
/// their raw bytes so the cursor round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Segment {
    Text(String),
    Raw { raw: Vec<u8> },
}

impl Segment {
    fn from_os(name: &OsStr) -> Self {
        match name.to_str() {
            Some(text) => Segment::Text(text.to_string()),
            None => Segment::Raw {
                raw: name.as_encoded_bytes().to_vec(),
            },
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Segment::Text(text) => text.as_bytes(),
            Segment::Raw { raw } => raw,
        }
    }
}

/// Resume position: the last file yielded, as components below its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FsCursor {
    root: usize,
    path: Vec<Segment>,
}

/// Components of `path` below `root`, as the bytes `OsStr` orders by.
fn relative_key(root: &Path, path: &Path) -> Vec<Vec<u8>> {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().as_encoded_bytes().to_vec())
        .collect()
}

/// Walks the configured roots depth-first with entries sorted by file name.
///
/// Pre-order with sorted siblings is exactly the lexicographic order of the
/// component lists, so "everything up to the cursor" is a simple comparison
/// and whole subtrees that end before the cursor can be pruned on resume.
pub struct FilesystemSource {
    roots: Vec<PathBuf>,
    ignore_patterns: Vec<Pattern>,
    root_index: usize,
    walker: Option<walkdir::IntoIter>,
    resume: Option<(usize, Vec<Vec<u8>>)>,
    last: Option<FsCursor>,
}

impl FilesystemSource {
    pub fn new(roots: Vec<String>, ignore_globs: &[String]) -> Self {
        let ignore_patterns = ignore_globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();

        Self {
            roots: non_overlapping_directories(roots)
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            ignore_patterns,
            root_index: 0,
            walker: None,
            resume: None,
            last: None,
        }
    }

    pub fn from_config(config: &PdmConfig) -> Self {
        Self::new(config.roots.clone(), &config.ignore_patterns)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn is_ignored(patterns: &[Pattern], path: &Path) -> bool {
        patterns.iter().any(|pattern| pattern.matches_path(path))
    }
}

impl SourceEnumerator for FilesystemSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Pdm
    }

    fn open(
        &mut self,
        resume: Option<&str>,
        _reporter: &dyn ProgressReporter,
        _cancel: &AtomicBool,
    ) -> Result<(), Error> {
        if self.roots.is_empty() {
            return Err(Error::unavailable(SourceKind::Pdm, "no roots configured"));
        }
        if !self.roots.iter().any(|root| root.is_dir()) {
            let roots: Vec<String> = self.roots.iter().map(|r| r.display().to_string()).collect();
            return Err(Error::unavailable(
                SourceKind::Pdm,
                format!("no configured root is accessible: {}", roots.join(", ")),
            ));
        }

        let cursor = resume.and_then(|raw| match serde_json::from_str::<FsCursor>(raw) {
            Ok(cursor) if cursor.root < self.roots.len() => Some(cursor),
            Ok(cursor) => {
                warn!("Cursor root {} no longer configured; walking from the start", cursor.root);
                None
            }
            Err(e) => {
                warn!("Unreadable filesystem cursor '{}': {}; walking from the start", raw, e);
                None
            }
        });
        self.root_index = cursor.as_ref().map_or(0, |c| c.root);
        self.resume = cursor.as_ref().map(|c| {
            let key = c.path.iter().map(|s| s.bytes().to_vec()).collect();
            (c.root, key)
        });
        self.last = cursor;
        self.walker = None;

        info!("Processing directories: {:?}", self.roots);
        Ok(())
    }

    fn next(&mut self) -> Advance {
        loop {
            if self.walker.is_none() {
                let Some(root) = self.roots.get(self.root_index) else {
                    return Advance::End;
                };
                if !root.is_dir() {
                    let unit = root.display().to_string();
                    self.root_index += 1;
                    return Advance::Error(RecordError::new(unit, "root is not accessible"));
                }
                self.walker = Some(
                    WalkDir::new(root)
                        .follow_links(false)
                        .sort_by_file_name()
                        .into_iter(),
                );
            }

            let Some(walker) = self.walker.as_mut() else {
                return Advance::End;
            };
            let entry = match walker.next() {
                None => {
                    self.walker = None;
                    self.root_index += 1;
                    continue;
                }
                Some(Err(e)) => {
                    let unit = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| self.roots[self.root_index].display().to_string());
                    return Advance::Error(RecordError::new(unit, e));
                }
                Some(Ok(entry)) => entry,
            };

            let path = entry.path();
            let file_type = entry.file_type();

            if Self::is_ignored(&self.ignore_patterns, path) {
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let root = &self.roots[self.root_index];
            let resume = self
                .resume
                .as_ref()
                .filter(|(index, _)| *index == self.root_index);
            if let Some((_, cursor)) = resume {
                let key = relative_key(root, path);
                if file_type.is_dir() {
                    if key < *cursor && !cursor.starts_with(&key) {
                        walker.skip_current_dir();
                    }
                    continue;
                }
                if key <= *cursor {
                    continue;
                }
            }

            if file_type.is_dir() || file_type.is_symlink() {
                continue;
            }

            self.last = Some(FsCursor {
                root: self.root_index,
                path: path
                    .strip_prefix(root)
                    .unwrap_or(path)
                    .components()
                    .map(|c| Segment::from_os(c.as_os_str()))
                    .collect(),
            });

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => return Advance::Error(RecordError::new(path.display().to_string(), e)),
            };

            return Advance::Record(RawRecord {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: path.to_string_lossy().into_owned(),
                remote_id: None,
                size: Some(metadata.len()),
                created_at: metadata.created().ok().map(to_naive),
                modified_at: metadata.modified().ok().map(to_naive),
            });
        }
    }

    fn cursor(&self) -> Option<String> {
        self.last
            .as_ref()
            .and_then(|cursor| serde_json::to_string(cursor).ok())
    }

    fn close(&mut self) {
        self.walker = None;
    }
}

fn to_naive(time: SystemTime) -> NaiveDateTime {
    DateTime::<Local>::from(time).naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentReporter;
    use std::fs;
    use tempfile::tempdir;

    fn drain(source: &mut FilesystemSource) -> (Vec<String>, Vec<RecordError>) {
        let mut names = Vec::new();
        let mut errors = Vec::new();
        loop {
            match source.next() {
                Advance::Record(r) => names.push(r.name),
                Advance::Error(e) => errors.push(e),
                Advance::End => break,
            }
        }
        (names, errors)
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub").join("deep")).unwrap();
        fs::write(dir.path().join("a.sldprt"), "a").unwrap();
        fs::write(dir.path().join("b.sldprt"), "b").unwrap();
        fs::write(dir.path().join("sub").join("c.sldasm"), "c").unwrap();
        fs::write(dir.path().join("sub").join("deep").join("d.txt"), "d").unwrap();
        fs::write(dir.path().join("z.txt"), "z").unwrap();
        dir
    }

    #[test]
    fn test_walk_is_sorted_and_skips_directories() {
        let dir = tree();
        let mut source =
            FilesystemSource::new(vec![dir.path().to_string_lossy().into_owned()], &[]);
        source.open(None, &SilentReporter, &AtomicBool::new(false)).unwrap();
        let (names, errors) = drain(&mut source);
        assert_eq!(names, vec!["a.sldprt", "b.sldprt", "c.sldasm", "d.txt", "z.txt"]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_resume_from_every_cursor_yields_the_rest() {
        let dir = tree();
        let roots = vec![dir.path().to_string_lossy().into_owned()];
        let mut full = FilesystemSource::new(roots.clone(), &[]);
        full.open(None, &SilentReporter, &AtomicBool::new(false)).unwrap();

        let mut seen = Vec::new();
        let mut cursors = Vec::new();
        while let Advance::Record(r) = full.next() {
            seen.push(r.name);
            cursors.push(full.cursor().unwrap());
        }

        for (k, cursor) in cursors.iter().enumerate() {
            let mut resumed = FilesystemSource::new(roots.clone(), &[]);
            resumed.open(Some(cursor), &SilentReporter, &AtomicBool::new(false)).unwrap();
            let (rest, _) = drain(&mut resumed);
            assert_eq!(rest, seen[k + 1..].to_vec(), "resume after {}", seen[k]);
        }
    }

    #[test]
    fn test_ignore_patterns_prune_directories() {
        let dir = tree();
        let pattern = format!("{}/sub", dir.path().display());
        let mut source = FilesystemSource::new(
            vec![dir.path().to_string_lossy().into_owned()],
            &[pattern, "*.txt".to_string()],
        );
        source.open(None, &SilentReporter, &AtomicBool::new(false)).unwrap();
        let (names, _) = drain(&mut source);
        assert_eq!(names, vec!["a.sldprt", "b.sldprt"]);
    }

    #[test]
    fn test_missing_roots() {
        let dir = tree();
        let missing = dir.path().join("nope").to_string_lossy().into_owned();

        let mut none = FilesystemSource::new(vec![missing.clone()], &[]);
        assert!(matches!(
            none.open(None, &SilentReporter, &AtomicBool::new(false)),
            Err(Error::SourceUnavailable { .. })
        ));

        let other = tempdir().unwrap();
        fs::write(other.path().join("x.prt"), "x").unwrap();
        let mut some = FilesystemSource::new(
            vec![missing, other.path().to_string_lossy().into_owned()],
            &[],
        );
        some.open(None, &SilentReporter, &AtomicBool::new(false)).unwrap();
        let (names, errors) = drain(&mut some);
        assert_eq!(names, vec!["x.prt"]);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_garbage_cursor_restarts_walk() {
        let dir = tree();
        let mut source =
            FilesystemSource::new(vec![dir.path().to_string_lossy().into_owned()], &[]);
        source.open(Some("not a cursor"), &SilentReporter, &AtomicBool::new(false)).unwrap();
        let (names, _) = drain(&mut source);
        assert_eq!(names.len(), 5);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_names_keep_distinct_cursors() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"part\xfe.prt")), "1").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"part\xff.prt")), "2").unwrap();
        fs::write(dir.path().join("zz.prt"), "3").unwrap();
        let roots = vec![dir.path().to_string_lossy().into_owned()];

        let mut full = FilesystemSource::new(roots.clone(), &[]);
        full.open(None, &SilentReporter, &AtomicBool::new(false)).unwrap();
        let mut cursors = Vec::new();
        while let Advance::Record(_) = full.next() {
            cursors.push(full.cursor().expect("cursor after every record"));
        }
        assert_eq!(cursors.len(), 3);
        assert_ne!(cursors[0], cursors[1]);

        let mut resumed = FilesystemSource::new(roots, &[]);
        resumed
            .open(Some(&cursors[0]), &SilentReporter, &AtomicBool::new(false))
            .unwrap();
        let (rest, errors) = drain(&mut resumed);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1], "zz.prt");
        assert!(errors.is_empty());
    }
}
