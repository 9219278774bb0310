use crate::error::Error;
use crate::model::RawRecord;
use crate::normalize::{normalize, PathPolicy};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Lenient timestamp parsing for values reported by sources.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
    {
        return Some(dt);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// Parse a date filter bound. Date-only values cover the whole day.
pub fn parse_bound(value: &str, end_of_day: bool) -> Result<NaiveDateTime, Error> {
    let trimmed = value.trim();
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
    {
        let time = if end_of_day {
            NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN)
        } else {
            NaiveTime::MIN
        };
        return Ok(date.and_time(time));
    }
    parse_timestamp(trimmed)
        .ok_or_else(|| Error::InvalidFilter(format!("unrecognized date '{}'", value)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Lowercased extensions without the leading dot.
    Extension(Vec<String>),
    PathPrefix(String),
    /// Inclusive on both ends.
    ModifiedRange {
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    },
}

impl Filter {
    pub fn accepts(&self, record: &RawRecord) -> bool {
        match self {
            Filter::Extension(extensions) => {
                let name = record.name.to_lowercase();
                extensions
                    .iter()
                    .any(|ext| name.len() > ext.len() + 1 && name.ends_with(&format!(".{}", ext)))
            }
            Filter::PathPrefix(prefix) => normalize(&record.path, PathPolicy::windows())
                .as_str()
                .starts_with(prefix.as_str()),
            Filter::ModifiedRange { from, to } => {
                let Some(stamp) = record.modified_at.or(record.created_at) else {
                    return true;
                };
                from.map_or(true, |from| stamp >= from) && to.map_or(true, |to| stamp <= to)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Filter::Extension(extensions) => format!("ext={}", extensions.join(",")),
            Filter::PathPrefix(prefix) => format!("prefix={}", prefix),
            Filter::ModifiedRange { from, to } => format!(
                "modified={}..{}",
                from.map(|d| d.to_string()).unwrap_or_default(),
                to.map(|d| d.to_string()).unwrap_or_default()
            ),
        }
    }
}

/// Ordered predicates applied before matching. Empty accepts everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from CLI-style values. Extensions may be repeated or comma separated.
    pub fn from_args(
        extensions: &[String],
        path_prefix: Option<&str>,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> Result<Self, Error> {
        let mut set = FilterSet::new();
        set = set.with_extensions(extensions.iter().flat_map(|e| e.split(',')));
        if let Some(prefix) = path_prefix {
            set = set.with_path_prefix(prefix);
        }
        let from = date_from.map(|d| parse_bound(d, false)).transpose()?;
        let to = date_to.map(|d| parse_bound(d, true)).transpose()?;
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(Error::InvalidFilter(format!(
                    "date range is empty: {} is after {}",
                    from, to
                )));
            }
        }
        Ok(set.with_modified_range(from, to))
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cleaned: Vec<String> = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        if !cleaned.is_empty() {
            cleaned.sort();
            cleaned.dedup();
            self.filters.push(Filter::Extension(cleaned));
        }
        self
    }

    pub fn with_path_prefix(mut self, prefix: &str) -> Self {
        let key = normalize(prefix, PathPolicy::windows());
        if !key.as_str().is_empty() {
            self.filters.push(Filter::PathPrefix(key.as_str().to_string()));
        }
        self
    }

    pub fn with_modified_range(
        mut self,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Self {
        if from.is_some() || to.is_some() {
            self.filters.push(Filter::ModifiedRange { from, to });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn accepts(&self, record: &RawRecord) -> bool {
        self.filters.iter().all(|f| f.accepts(record))
    }

    /// Stable description used when deriving a run id.
    pub fn fingerprint(&self) -> String {
        self.filters
            .iter()
            .map(Filter::describe)
            .collect::<Vec<_>>()
            .join(";")
    }
}
