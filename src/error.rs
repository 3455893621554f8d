//! Error taxonomy for the export pipeline.
//!
//! Only [`AuthError`] and the run-level variants of [`ExportError`] end a run.
//! [`FetchError`] and [`DecodeError`] are caught at the single diary or image
//! they concern, logged, and counted.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Login failed. Nothing has been written when this is returned.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login rejected by server: {0}")]
    Rejected(String),

    #[error("login request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("login response malformed: {0}")]
    Malformed(String),
}

/// A single remote call failed. The caller skips the affected item.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("server answered HTTP {0}")]
    Status(u16),

    #[error("server reported error code {code}")]
    Api { code: i64 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response is not an image (content-type {content_type:?})")]
    NotAnImage { content_type: String },
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Transport(_) => true,
            FetchError::Status(code) => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else if e.is_decode() {
            FetchError::Malformed(e.to_string())
        } else {
            FetchError::Transport(e)
        }
    }
}

/// A privacy block could not be turned into ciphertext bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("block is empty")]
    Empty,

    #[error("block is neither base64 nor hex")]
    NotEncoded,

    #[error("decoded length {0} is not a whole number of cipher blocks")]
    Misaligned(usize),
}

/// A diary record violated the date invariant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("diary {id}: invalid created date {value:?}")]
    InvalidDate { id: String, value: String },
}

/// Run-level failures.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("could not fetch diary index: {0}")]
    Index(#[source] FetchError),

    #[error("no diaries between {start} and {end}")]
    NoDiariesInRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ExportError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ExportError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type ExportResult<T> = Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Status(503).is_transient());
        assert!(FetchError::Status(429).is_transient());
        assert!(!FetchError::Status(404).is_transient());
        assert!(!FetchError::Api { code: 1 }.is_transient());
        assert!(
            !FetchError::NotAnImage {
                content_type: "text/html".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn display_messages() {
        let e = RecordError::InvalidDate {
            id: "7".into(),
            value: "2024-13-01".into(),
        };
        assert_eq!(e.to_string(), "diary 7: invalid created date \"2024-13-01\"");

        let e = ExportError::NoDiariesInRange {
            start: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        };
        assert_eq!(e.to_string(), "no diaries between 2024-01-01 and 2024-01-31");
    }
}
