use chrono::{Days, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::client::RetryPolicy;
use crate::model::Scope;

/// Configuration required to run the export process.
/// This decouples the logic from how the arguments were parsed (CLI/Config file).
#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub scope: Scope,
    pub range: DateRange,
    pub default_range: DateRange,
    pub order: SortOrder,
    pub workers: usize,
    pub image_workers: usize,
    pub retry: RetryPolicy,
    pub strip_indent: bool,
    pub images_only_for_default_range: bool,
    pub write_summary: bool,
    pub quiet: bool,
}

impl ExportConfig {
    /// `<output>/<myself|partner>`
    pub fn scope_dir(&self) -> PathBuf {
        self.output_dir.join(self.scope.folder_name())
    }

    pub fn markdown_root(&self) -> PathBuf {
        self.scope_dir().join("markdown")
    }

    pub fn html_root(&self) -> PathBuf {
        self.scope_dir().join("html")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    Created,
    Updated,
    Unchanged,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Inclusive date range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// The last `days` days up to and including `today`.
    pub fn trailing(today: NaiveDate, days: u64) -> Self {
        let start = today.checked_sub_days(Days::new(days)).unwrap_or(today);
        Self { start, end: today }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Drop one level of 4-space indentation from every line. Keeps long
/// indented paragraphs from turning into code blocks in the HTML page.
pub fn strip_indent(text: &str) -> String {
    text.split('\n')
        .map(|line| line.strip_prefix("    ").unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write `contents` to `path` through a temp file in the same directory.
/// Leaves the file untouched when it already holds exactly these bytes.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<ProcessResult> {
    let existed = match fs::read(path) {
        Ok(current) if current == contents => return Ok(ProcessResult::Unchanged),
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(if existed {
        ProcessResult::Updated
    } else {
        ProcessResult::Created
    })
}

pub fn make_bar(total: u64, message: &'static str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-");
    bar.set_style(style);
    bar.set_message(message);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn range_is_inclusive() {
        let r = DateRange::new(d("2024-03-01"), d("2024-03-31"));
        assert!(r.contains(d("2024-03-01")));
        assert!(r.contains(d("2024-03-31")));
        assert!(!r.contains(d("2024-02-29")));
        assert!(!r.contains(d("2024-04-01")));
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        let r = DateRange::new(d("2024-03-31"), d("2024-03-01"));
        assert_eq!(r.start, d("2024-03-01"));
    }

    #[test]
    fn trailing_range() {
        let r = DateRange::trailing(d("2024-03-05"), 3);
        assert_eq!(r, DateRange::new(d("2024-03-02"), d("2024-03-05")));
    }

    #[test]
    fn strips_one_indent_level() {
        assert_eq!(strip_indent("    a\n        b\nc\n  d"), "a\n    b\nc\n  d");
    }

    #[test]
    fn atomic_write_reports_what_happened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.md");
        assert_eq!(write_atomic(&path, b"one").unwrap(), ProcessResult::Created);
        assert_eq!(write_atomic(&path, b"one").unwrap(), ProcessResult::Unchanged);
        assert_eq!(write_atomic(&path, b"two").unwrap(), ProcessResult::Updated);
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
