//! Core data types that flow through the ingestion pipeline.
//!
//! A [`ScoredFile`] is produced once by the scorer and is read-only from then
//! on. The loader turns each kept one into a [`FileRecord`] plus one
//! [`LineRecord`] per line of its content.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A candidate file after its content has been read and scored.
#[derive(Debug, Clone)]
pub struct ScoredFile {
    pub file_path: PathBuf,
    /// Full content snapshot taken at scan time.
    pub content: String,
    pub modified_at: DateTime<Utc>,
    pub size_bytes: i64,
    /// Number of non-overlapping signal matches in `content`.
    pub signal_count: usize,
}

impl ScoredFile {
    /// Splits the content into lines exactly on `\n`.
    ///
    /// A trailing newline yields a final empty line, and `\r` is kept.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.content.split('\n')
    }
}

/// One persisted row per ingested file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub system_tag: String,
    pub path: String,
    pub modified_at: DateTime<Utc>,
    pub size_bytes: i64,
}

/// One persisted row per line of an ingested file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    pub file_id: i64,
    /// Zero-based ordinal within the file.
    pub line_number: i64,
    pub text: String,
}

/// The CDC cutoff used for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    /// Max `modified_at` stored for the system, if any rows exist.
    pub stored_max: Option<DateTime<Utc>>,
    /// Files modified at or after this instant are captured.
    pub capture_start: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(content: &str) -> ScoredFile {
        ScoredFile {
            file_path: PathBuf::from("x.log"),
            content: content.to_string(),
            modified_at: Utc::now(),
            size_bytes: content.len() as i64,
            signal_count: 0,
        }
    }

    #[test]
    fn lines_keep_trailing_empty_line() {
        let f = scored("a\nb\n");
        assert_eq!(f.lines().collect::<Vec<_>>(), vec!["a", "b", ""]);
    }

    #[test]
    fn empty_content_is_one_empty_line() {
        let f = scored("");
        assert_eq!(f.lines().count(), 1);
    }

    #[test]
    fn carriage_returns_are_kept() {
        let f = scored("one\r\ntwo");
        assert_eq!(f.lines().collect::<Vec<_>>(), vec!["one\r", "two"]);
    }
}
