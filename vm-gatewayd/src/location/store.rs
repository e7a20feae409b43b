//! Durable copy of the location snapshot.
//!
//! The file is versioned JSON. Writes go to a sibling temp file which is
//! synced and then renamed over the target, so a crash mid-write leaves the
//! previous file intact.

use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::LocationRecord;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use super::error::PersistenceError;
use super::snapshot::Snapshot;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub schema_version: u32,
    pub built_at: DateTime<Utc>,
    pub record_count: usize,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    metadata: CacheMetadata,
    records: Vec<LocationRecord>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Read the persisted snapshot. Ok(None) when no file exists.
    pub async fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };

        // Version is checked before the body so that a future layout is
        // reported as a mismatch rather than a decode failure.
        #[derive(Deserialize)]
        struct Header {
            metadata: VersionOnly,
        }
        #[derive(Deserialize)]
        struct VersionOnly {
            schema_version: u32,
        }

        let header: Header = serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Decode {
            path: self.path.clone(),
            source,
        })?;
        if header.metadata.schema_version != SCHEMA_VERSION {
            return Err(PersistenceError::SchemaMismatch {
                found: header.metadata.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        let file: SnapshotFile = serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Decode {
            path: self.path.clone(),
            source,
        })?;

        if file.records.len() != file.metadata.record_count {
            return Err(PersistenceError::Corrupt(format!(
                "metadata lists {} records, file holds {}",
                file.metadata.record_count,
                file.records.len()
            )));
        }

        Ok(Some(Snapshot::from_records(file.records, file.metadata.built_at)))
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let records = snapshot.sorted_records();
        let file = SnapshotFile {
            metadata: CacheMetadata {
                schema_version: SCHEMA_VERSION,
                built_at: snapshot.built_at().unwrap_or_else(Utc::now),
                record_count: records.len(),
            },
            records,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(PersistenceError::Encode)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::io(parent, e))?;
        }

        let tmp = self.temp_path();
        let mut out = fs::File::create(&tmp)
            .await
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        out.write_all(&json)
            .await
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        out.sync_all()
            .await
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        drop(out);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;

        tracing::debug!("Saved {} records to {}", file.metadata.record_count, self.path.display());
        Ok(())
    }
}
