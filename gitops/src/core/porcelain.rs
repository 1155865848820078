//! Parsers for machine-readable `git` output.
//!
//! Every format parsed here is requested explicitly by the inspector or the
//! operation handlers (`-z`, `--format` with unit separators), never scraped
//! from human-oriented text.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;
use serde::Serialize;

use crate::core::types::{InProgressOperation, StashEntry};

/// XY codes `git status` uses for unmerged paths.
const UNMERGED_CODES: [&str; 7] = ["DD", "AU", "UD", "UA", "DU", "AA", "UU"];

/// Field separator requested in `--format` strings.
pub const UNIT_SEP: char = '\x1f';
/// Record separator requested in `--format` strings.
pub const RECORD_SEP: char = '\x1e';

static STASH_SELECTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^stash@\{(\d+)\}$").expect("static stash selector regex"));

/// Opening or closing line of a conflict hunk as git writes it.
static CONFLICT_MARKER: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
    regex::bytes::Regex::new(r"(?m)^(?:<{7}|>{7})(?: |\r?$)")
        .expect("static conflict marker regex")
});

/// Parsed `git status --porcelain=v1 -z` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file (destination path for renames).
    pub path: String,
}

impl StatusEntry {
    pub fn is_unmerged(&self) -> bool {
        UNMERGED_CODES.contains(&self.code.as_str())
    }
}

/// Parse NUL-separated porcelain v1 status output.
///
/// Rename and copy entries are followed by an extra field holding the source
/// path, which is skipped.
pub fn parse_status_z(raw: &str) -> Result<Vec<StatusEntry>, String> {
    let mut entries = Vec::new();
    let mut fields = raw.split('\0');
    while let Some(field) = fields.next() {
        if field.is_empty() {
            continue;
        }
        let (Some(code), Some(sep), Some(path)) = (field.get(..2), field.get(2..3), field.get(3..))
        else {
            return Err(format!("unexpected porcelain entry '{field}'"));
        };
        if sep != " " || path.is_empty() {
            return Err(format!("unexpected porcelain entry '{field}'"));
        }
        if code.contains('R') || code.contains('C') {
            fields.next();
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        });
    }
    Ok(entries)
}

/// Which operation marker files exist in the repository metadata dir.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationMarkers {
    pub rebase_merge: bool,
    pub rebase_apply: bool,
    pub merge_head: bool,
    pub cherry_pick_head: bool,
}

impl OperationMarkers {
    /// Rebase wins over the others: a conflicted rebase step also leaves
    /// per-commit state behind.
    pub fn in_progress(self) -> InProgressOperation {
        if self.rebase_merge || self.rebase_apply {
            InProgressOperation::Rebase
        } else if self.merge_head {
            InProgressOperation::Merge
        } else if self.cherry_pick_head {
            InProgressOperation::CherryPick
        } else {
            InProgressOperation::None
        }
    }
}

/// Parse `git stash list --format=%gd%x1f%ct%x1f%gs`.
pub fn parse_stash_list(raw: &str) -> Result<Vec<StashEntry>, String> {
    let mut entries = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, UNIT_SEP);
        let (Some(selector), Some(timestamp), Some(message)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("unexpected stash entry '{line}'"));
        };
        let index = STASH_SELECTOR
            .captures(selector)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .ok_or_else(|| format!("unexpected stash selector '{selector}'"))?;
        let created_at = timestamp
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| format!("unexpected stash timestamp '{timestamp}'"))?;
        entries.push(StashEntry {
            index,
            message: message.to_string(),
            created_at,
        });
    }
    Ok(entries)
}

/// `git log` entry as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub commit: String,
    pub author: String,
    pub date: String,
    pub message: String,
}

/// Format string matching [`parse_log`].
pub const LOG_FORMAT: &str = "--format=%H%x1f%an <%ae>%x1f%aI%x1f%B%x1e";

pub fn parse_log(raw: &str) -> Result<Vec<LogEntry>, String> {
    let mut entries = Vec::new();
    for record in raw.split(RECORD_SEP) {
        let record = record.trim_start_matches('\n');
        if record.trim().is_empty() {
            continue;
        }
        let mut parts = record.splitn(4, UNIT_SEP);
        let (Some(commit), Some(author), Some(date), Some(message)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("unexpected log record '{record}'"));
        };
        entries.push(LogEntry {
            commit: commit.to_string(),
            author: author.to_string(),
            date: date.to_string(),
            message: message.trim_end().to_string(),
        });
    }
    Ok(entries)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub fetch_url: Option<String>,
    pub push_url: Option<String>,
}

/// Parse `git remote -v`, folding fetch/push lines per remote.
pub fn parse_remotes(raw: &str) -> Result<Vec<RemoteEntry>, String> {
    let mut remotes: BTreeMap<String, RemoteEntry> = BTreeMap::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((name, rest)) = line.split_once('\t') else {
            return Err(format!("unexpected remote line '{line}'"));
        };
        let Some((url, direction)) = rest.rsplit_once(' ') else {
            return Err(format!("unexpected remote line '{line}'"));
        };
        let entry = remotes
            .entry(name.to_string())
            .or_insert_with(|| RemoteEntry {
                name: name.to_string(),
                ..RemoteEntry::default()
            });
        match direction {
            "(fetch)" => entry.fetch_url = Some(url.to_string()),
            "(push)" => entry.push_url = Some(url.to_string()),
            other => return Err(format!("unexpected remote direction '{other}'")),
        }
    }
    Ok(remotes.into_values().collect())
}

pub fn parse_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether file contents still carry conflict hunk markers.
pub fn has_conflict_markers(contents: &[u8]) -> bool {
    CONFLICT_MARKER.is_match(contents)
}
