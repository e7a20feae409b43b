//! VM control provider.
//!
//! The location cache only needs zone and machine enumeration; the
//! dispatcher additionally describes machines and runs lifecycle operations.

pub mod gcloud;
#[cfg(test)]
pub mod fake;

use std::fmt;
use std::str::FromStr;
use async_trait::async_trait;
use shared::types::MachineDetails;
use thiserror::Error;
use tokio::sync::mpsc;

pub use gcloud::GcloudProvider;

/// A machine reported by a zone listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSummary {
    pub name: String,
    /// Zone reported by the provider, may be empty
    pub zone: String,
    pub status: String,
}

/// Lifecycle operation accepted by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmOperation {
    Status,
    Start,
    Stop,
    Suspend,
    Resume,
}

impl VmOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Status => "checked",
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Suspend => "suspended",
            Self::Resume => "resumed",
        }
    }
}

impl fmt::Display for VmOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for VmOperation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "suspend" => Ok(Self::Suspend),
            "resume" => Ok(Self::Resume),
            _ => Err(UnknownOperation(s.to_string())),
        }
    }
}

/// Failures of a single provider call
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {command}: {source}")]
    Unavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from {command}: {reason}")]
    Parse { command: String, reason: String },

    #[error("{call} timed out after {secs}s")]
    Timeout { call: String, secs: u64 },
}

impl ProviderError {
    /// Raw provider text worth sanitising before it reaches a client
    pub fn detail(&self) -> String {
        match self {
            Self::CommandFailed { stderr, .. } => stderr.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait VmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every zone visible to the project
    async fn list_zones(&self) -> Result<Vec<String>, ProviderError>;

    async fn list_machines_in_zone(&self, zone: &str) -> Result<Vec<MachineSummary>, ProviderError>;

    async fn describe(&self, name: &str, zone: &str) -> Result<MachineDetails, ProviderError>;

    /// Run a lifecycle operation, forwarding output lines to `progress`.
    async fn execute(
        &self,
        op: VmOperation,
        name: &str,
        zone: &str,
        progress: mpsc::Sender<String>,
    ) -> Result<(), ProviderError>;
}
