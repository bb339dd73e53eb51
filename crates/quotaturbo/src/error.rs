//! Error types for the quota controller
//!
//! Batch operations never stop at the first failing container. They collect
//! every failure into a [`MultiError`], keyed by the cgroup path (or file)
//! that failed, so callers can tell which container misbehaved without
//! parsing strings.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TurboError>;

/// Broad classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected configuration or arguments
    Validation,
    /// A single cgroup or proc file could not be read or written
    TransientIo,
    /// A cgroup path could not be turned into a write chain
    Structural,
    /// File contents were malformed
    Parse,
}

/// Errors raised by the quota controller
#[derive(Debug, Error)]
pub enum TurboError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("cgroup path should not be empty")]
    EmptyPath,

    #[error("undefined cgroup mount point, please set it firstly")]
    UndefinedCgroupRoot,

    #[error("cgroup {0} does not exist under the cpu controller")]
    CgroupNotFound(String),

    #[error("invalid cpu limit {limit}: must be greater than 0 and less than {total_cores}")]
    InvalidCpuLimit { limit: f64, total_cores: usize },

    #[error("failed to read {file} of cgroup {path}: {source}")]
    Read {
        path: String,
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {value} to {file} of cgroup {path}: {source}")]
    Write {
        path: String,
        file: String,
        value: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("invalid cgroup path {0:?}")]
    InvalidPath(String),

    #[error(transparent)]
    Multiple(#[from] MultiError),
}

impl TurboError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurboError::Validation(_)
            | TurboError::EmptyPath
            | TurboError::UndefinedCgroupRoot
            | TurboError::CgroupNotFound(_)
            | TurboError::InvalidCpuLimit { .. } => ErrorKind::Validation,
            TurboError::Read { .. } | TurboError::Write { .. } | TurboError::Io { .. } => {
                ErrorKind::TransientIo
            }
            TurboError::Parse { .. } => ErrorKind::Parse,
            TurboError::InvalidPath(_) => ErrorKind::Structural,
            TurboError::Multiple(errors) => errors
                .iter()
                .next()
                .map(|e| e.error.kind())
                .unwrap_or(ErrorKind::TransientIo),
        }
    }

    pub(crate) fn parse(what: impl Into<String>, reason: impl fmt::Display) -> Self {
        TurboError::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// A failure attributed to one key (a cgroup path or an attribute file)
#[derive(Debug)]
pub struct KeyedError {
    pub key: String,
    pub error: TurboError,
}

/// Aggregated failures of a batch operation
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<KeyedError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `key`
    pub fn push(&mut self, key: impl Into<String>, error: TurboError) {
        self.errors.push(KeyedError {
            key: key.into(),
            error,
        });
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyedError> {
        self.errors.iter()
    }

    /// Keys that failed, in the order they were recorded
    pub fn keys(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.key.as_str()).collect()
    }

    /// `Ok(())` when nothing failed
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(TurboError::Multiple(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n* {}: {}", e.key, e.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_multi_error_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }

    #[test]
    fn test_multi_error_keeps_every_key() {
        let mut errors = MultiError::new();
        errors.push("kubepods/pod1/c1", TurboError::EmptyPath);
        errors.push(
            "kubepods/pod2/c2",
            TurboError::parse("cpu.stat", "bad line"),
        );

        assert_eq!(errors.keys(), vec!["kubepods/pod1/c1", "kubepods/pod2/c2"]);

        let message = errors.to_string();
        assert!(message.starts_with("2 error(s) occurred:"));
        assert!(message.contains("* kubepods/pod2/c2: failed to parse cpu.stat: bad line"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(TurboError::EmptyPath.kind(), ErrorKind::Validation);
        assert_eq!(
            TurboError::InvalidPath(String::new()).kind(),
            ErrorKind::Structural
        );
        let io = TurboError::Read {
            path: "a".into(),
            file: "cpu.stat".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(io.kind(), ErrorKind::TransientIo);

        let mut errors = MultiError::new();
        errors.push("a", TurboError::parse("x", "y"));
        assert_eq!(TurboError::Multiple(errors).kind(), ErrorKind::Parse);
    }
}
