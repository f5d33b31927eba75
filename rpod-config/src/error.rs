use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Lookup failures from a [`UserDirectory`](crate::UserDirectory).
///
/// `NotFound` is the caller's mistake; `Configuration` means the directory
/// source itself is broken and must surface as a server-side failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("User '{0}' not found")]
    NotFound(String),

    #[error("User directory error: {0}")]
    Configuration(String),
}
