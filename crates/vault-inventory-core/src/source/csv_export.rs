use crate::config::PlmConfig;
use crate::filter::parse_timestamp;
use crate::model::{RawRecord, RecordError};
use crate::source::remote::{LoginState, Page, RemoteSession, SessionError};
use csv::{Reader, ReaderBuilder, StringRecord};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const ID_COLUMNS: &[&str] = &["id", "object id", "objectid", "oid"];
const NAME_COLUMNS: &[&str] = &["name", "title", "file name", "filename"];
const PATH_COLUMNS: &[&str] = &["path", "remote path", "location"];
const CREATED_COLUMNS: &[&str] = &["created", "created on", "createdon"];
const MODIFIED_COLUMNS: &[&str] = &["modified", "last modified", "lastmodified", "modified on"];

#[derive(Debug, Clone, Default)]
struct Columns {
    id: Option<usize>,
    name: usize,
    path: Option<usize>,
    created: Option<usize>,
    modified: Option<usize>,
}

impl Columns {
    fn resolve(headers: &StringRecord) -> Option<Self> {
        let names: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();
        let find = |aliases: &[&str]| {
            aliases
                .iter()
                .find_map(|alias| names.iter().position(|n| n == alias))
        };
        Some(Self {
            id: find(ID_COLUMNS),
            name: find(NAME_COLUMNS)?,
            path: find(PATH_COLUMNS),
            created: find(CREATED_COLUMNS),
            modified: find(MODIFIED_COLUMNS),
        })
    }
}

/// Pages through a repository export CSV as if it were the remote UI.
///
/// Page tokens are row offsets. Sequential fetches keep one reader open;
/// a token that does not continue from the current position reopens the
/// file and skips ahead.
pub struct CsvExportSession {
    path: Option<PathBuf>,
    base_path: String,
    page_size: usize,
    delimiter: u8,
    columns: Columns,
    reader: Option<Reader<File>>,
    position: u64,
}

impl CsvExportSession {
    pub fn new(path: Option<PathBuf>, base_path: impl Into<String>, page_size: usize) -> Self {
        Self {
            path,
            base_path: base_path.into(),
            page_size: page_size.max(1),
            delimiter: b',',
            columns: Columns::default(),
            reader: None,
            position: 0,
        }
    }

    pub fn from_config(config: &PlmConfig) -> Self {
        Self::new(
            config.export_csv.clone(),
            config.base_path.clone(),
            config.page_size,
        )
    }

    fn open_reader(&self) -> Result<Reader<File>, String> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| "plm.export_csv is not configured".to_string())?;
        let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
        Ok(ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file))
    }

    fn seek_to(&mut self, offset: u64) -> Result<(), String> {
        if self.reader.is_some() && self.position == offset {
            return Ok(());
        }
        let mut reader = self.open_reader()?;
        let mut record = StringRecord::new();
        let mut position = 0;
        while position < offset {
            match reader.read_record(&mut record) {
                Ok(true) => position += 1,
                Ok(false) => break,
                Err(e) if e.is_io_error() => return Err(e.to_string()),
                Err(_) => position += 1,
            }
        }
        debug!("Export reader positioned at row {}", position);
        self.reader = Some(reader);
        self.position = position;
        Ok(())
    }

    fn to_record(&self, row: &StringRecord) -> Result<RawRecord, String> {
        let field = |index: Option<usize>| {
            index
                .and_then(|i| row.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let name = field(Some(self.columns.name))
            .ok_or_else(|| "missing name".to_string())?
            .to_string();
        let path = match field(self.columns.path) {
            Some(path) => path.to_string(),
            None => format!("{}/{}", self.base_path.trim_end_matches('/'), name),
        };

        Ok(RawRecord {
            name,
            path,
            remote_id: field(self.columns.id).map(str::to_string),
            size: None,
            created_at: field(self.columns.created).and_then(parse_timestamp),
            modified_at: field(self.columns.modified).and_then(parse_timestamp),
        })
    }
}

fn sniff_delimiter(path: &Path) -> Result<u8, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let commas = first.matches(',').count();
    let semicolons = first.matches(';').count();
    Ok(if semicolons > commas { b';' } else { b',' })
}

impl RemoteSession for CsvExportSession {
    fn login(&mut self) -> Result<LoginState, SessionError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| SessionError::Login("plm.export_csv is not configured".into()))?;
        self.delimiter = sniff_delimiter(&path).map_err(SessionError::Login)?;

        let mut reader = self.open_reader().map_err(SessionError::Login)?;
        let headers = reader
            .headers()
            .map_err(|e| SessionError::Login(format!("unreadable header: {}", e)))?
            .clone();
        self.columns = Columns::resolve(&headers).ok_or_else(|| {
            SessionError::Login(format!("{} has no name column", path.display()))
        })?;

        info!(
            "Reading repository export {} (delimiter '{}')",
            path.display(),
            self.delimiter as char
        );
        self.reader = Some(reader);
        self.position = 0;
        Ok(LoginState::Ready)
    }

    fn poll_login(&mut self) -> Result<LoginState, SessionError> {
        Ok(LoginState::Ready)
    }

    fn next_page(&mut self, token: Option<&str>) -> Result<Page, SessionError> {
        let offset = match token {
            None => 0,
            Some(raw) => raw.parse::<u64>().map_err(|_| SessionError::Page {
                message: format!("invalid page token '{}'", raw),
                next: None,
            })?,
        };
        self.seek_to(offset).map_err(|message| SessionError::Page {
            message,
            next: None,
        })?;

        let mut rows = Vec::with_capacity(self.page_size);
        let mut record = StringRecord::new();
        let mut finished = false;
        while rows.len() < self.page_size {
            let Some(reader) = self.reader.as_mut() else {
                finished = true;
                break;
            };
            // Header is line 1.
            let unit = format!("row {}", self.position + 2);
            match reader.read_record(&mut record) {
                Ok(true) => {
                    self.position += 1;
                    rows.push(
                        self.to_record(&record)
                            .map_err(|message| RecordError::new(unit, message)),
                    );
                }
                Ok(false) => {
                    finished = true;
                    break;
                }
                Err(e) if e.is_io_error() => {
                    return Err(SessionError::Page {
                        message: e.to_string(),
                        next: None,
                    })
                }
                Err(e) => {
                    self.position += 1;
                    rows.push(Err(RecordError::new(unit, e)));
                }
            }
        }

        // A full page may still be the last one; peeking would cost a
        // reopen, so the next fetch simply comes back empty.
        let next = (!finished).then(|| self.position.to_string());
        Ok(Page { rows, next })
    }

    fn close(&mut self) {
        self.reader = None;
    }
}
