use std::path::PathBuf;
use thiserror::Error;

/// A scan where no zone answered
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error("all {zones} zone queries failed, last error: {last_error}")]
    AllZonesFailed { zones: usize, last_error: String },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode snapshot at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot schema version {found} is not supported (expected {expected})")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("snapshot is inconsistent: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("refresh already in progress")]
    InProgress,

    #[error("no zones to scan")]
    NoZones,

    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Cloneable so that coalesced lookups can share one outcome
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("empty VM name")]
    EmptyName,

    #[error("VM {name} not found in any of {zones_scanned} zones")]
    NotFound { name: String, zones_scanned: usize },

    #[error("provider unavailable while looking up {name}: {reason}")]
    ProviderUnavailable { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("initial refresh failed: {0}")]
    InitialRefresh(#[source] RefreshError),

    #[error("location cache has been shut down")]
    ShutDown,
}
