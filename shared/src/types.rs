use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Last known location of a machine.
/// This is the canonical record held by the daemon's location cache and
/// persisted in its snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Machine name, unique within a snapshot
    pub name: String,

    /// Zone the machine was last discovered in, e.g. "us-east4-a"
    pub zone: String,

    /// When a scan last reported the machine
    pub last_seen: DateTime<Utc>,
}

/// Observability view of the location cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatusInfo {
    /// Build time of the current snapshot, None before the first scan
    pub last_update: Option<DateTime<Utc>>,

    pub record_count: usize,

    /// Age of the current snapshot in minutes
    pub age_minutes: Option<f64>,

    /// Minutes until the scheduler's next refresh, None when it is not running
    pub next_refresh_in_minutes: Option<f64>,

    pub refresh_in_progress: bool,

    /// Content hash of the current snapshot
    pub fingerprint: String,
}

/// Details reported by the provider for a single machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDetails {
    pub name: String,
    pub status: String,
    pub zone: String,
    pub machine_type: String,
    pub network_ip: String,
}

/// One entry of the operation audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub vm_name: String,
    /// Display name the caller used, equal to vm_name when no alias applies
    pub vanity_name: String,
    pub operation: String,
    pub client_ip: String,
    /// "unknown" when no zone could be resolved
    pub zone: String,
    /// started, completed, failed, failed-no-zone, not-found, error
    pub status: String,
}
