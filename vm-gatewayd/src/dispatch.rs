//! Runs machine operations on behalf of API callers.
//!
//! A request is resolved to a real hostname and a zone, executed through the
//! provider, and reported as a stream of events plus a final outcome. Every
//! request leaves a trail in the operation log.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use shared::protocol::{EVENT_ERROR, EVENT_INFO, EVENT_PROGRESS, EVENT_STATUS, EVENT_SUCCESS};
use shared::types::{MachineDetails, OperationRecord};
use thiserror::Error;
use tokio::sync::mpsc;
use crate::location::{LocationCache, LookupError};
use crate::names::{NameResolver, ResolvedName};
use crate::oplog::OpLogHandle;
use crate::provider::{ProviderError, VmOperation, VmProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Info,
    Status,
    Progress,
    Success,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => EVENT_INFO,
            Self::Status => EVENT_STATUS,
            Self::Progress => EVENT_PROGRESS,
            Self::Success => EVENT_SUCCESS,
            Self::Error => EVENT_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEvent {
    pub kind: EventKind,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub vm_name: String,
    pub operation: VmOperation,
    /// Explicit zone; looked up in the location cache when absent
    pub zone: Option<String>,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub vm_name: String,
    pub vanity_name: Option<String>,
    pub zone: String,
    pub message: String,
    /// Present for status checks
    pub details: Option<MachineDetails>,
}

/// Failure of a dispatched operation. The display text is safe to show to
/// clients.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("VM name is required")]
    EmptyName,

    #[error("VM {name} not found in any zone. Please specify a zone parameter.")]
    ZoneNotFound { name: String },

    #[error("Unable to locate VM {name}, the cloud provider is unavailable. Please specify a zone parameter.")]
    ZoneLookupUnavailable { name: String },

    #[error("Error: The resource '{name}' was not found in zone '{zone}'.")]
    InstanceNotFound { name: String, zone: String },

    #[error("{message}")]
    Failed { message: String },

    #[error("{message}")]
    Unavailable { message: String },
}

impl DispatchError {
    /// Terminal status written to the operation log
    pub fn log_status(&self) -> &'static str {
        match self {
            Self::EmptyName | Self::ZoneNotFound { .. } | Self::ZoneLookupUnavailable { .. } => "failed-no-zone",
            Self::InstanceNotFound { .. } => "not-found",
            Self::Failed { .. } => "failed",
            Self::Unavailable { .. } => "error",
        }
    }

    fn from_provider(err: &ProviderError) -> Self {
        match err {
            ProviderError::Unavailable { .. } | ProviderError::Timeout { .. } => Self::Unavailable {
                message: "Error: The cloud provider is currently unavailable. Please try again later.".to_string(),
            },
            other => Self::Failed {
                message: sanitize_error(&other.detail()),
            },
        }
    }
}

/// Name of the instance in a provider "was not found" error, if it is one
pub fn missing_instance(raw: &str) -> Option<&str> {
    if !raw.contains("was not found") {
        return None;
    }
    let start = raw.find("instances/")? + "instances/".len();
    let rest = &raw[start..];
    let end = rest
        .find(|c: char| c == '\'' || c == '"' || c.is_whitespace())
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

/// Reduce provider error output to a message that leaks no project details
pub fn sanitize_error(raw: &str) -> String {
    if let Some(name) = missing_instance(raw) {
        return format!("Error: VM '{name}' not found. Please verify the VM name and try again.");
    }

    let lower = raw.to_lowercase();
    if lower.contains("permission") || lower.contains("authorized") {
        return "Error: Insufficient permissions to perform this operation.".to_string();
    }

    "An error occurred while performing the operation. Please check VM name and try again.".to_string()
}

/// Optional event channel; a closed or missing receiver is not an error.
struct EventSink(Option<mpsc::Sender<OperationEvent>>);

impl EventSink {
    async fn emit(&self, kind: EventKind, data: impl Into<String>) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(OperationEvent { kind, data: data.into() }).await;
        }
    }
}

pub struct Dispatcher {
    provider: Arc<dyn VmProvider>,
    cache: LocationCache,
    names: NameResolver,
    oplog: OpLogHandle,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn VmProvider>,
        cache: LocationCache,
        names: NameResolver,
        oplog: OpLogHandle,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            cache,
            names,
            oplog,
            call_timeout,
        }
    }

    /// Run `request`, reporting progress on `events` when given.
    pub async fn dispatch(
        &self,
        request: OperationRequest,
        events: Option<mpsc::Sender<OperationEvent>>,
    ) -> Result<OperationOutcome, DispatchError> {
        let sink = EventSink(events);
        let resolved = self.names.resolve(&request.vm_name);
        let op = request.operation;

        tracing::info!(
            "Received {} for VM {} from {}",
            op,
            resolved.real,
            request.client_ip
        );

        if resolved.real.is_empty() {
            let err = DispatchError::EmptyName;
            sink.emit(EventKind::Error, err.to_string()).await;
            return Err(err);
        }

        let zone = match self.resolve_zone(&request, &resolved).await {
            Ok(zone) => zone,
            Err(err) => {
                sink.emit(EventKind::Error, err.to_string()).await;
                self.log(&request, &resolved, "unknown", err.log_status()).await;
                return Err(err);
            }
        };

        tracing::info!(
            "Starting {} operation on {} ({}) in zone {}",
            op,
            resolved.real,
            resolved.vanity,
            zone
        );
        self.log(&request, &resolved, &zone, "started").await;

        let result = match op {
            VmOperation::Status => self.check_status(&resolved, &zone, &sink).await,
            _ => self.run_operation(op, &resolved, &zone, &sink).await,
        };

        match &result {
            Ok(outcome) => {
                sink.emit(EventKind::Success, outcome.message.clone()).await;
                self.log(&request, &resolved, &zone, "completed").await;
            }
            Err(err) => {
                sink.emit(EventKind::Error, err.to_string()).await;
                self.log(&request, &resolved, &zone, err.log_status()).await;
            }
        }
        result
    }

    async fn resolve_zone(&self, request: &OperationRequest, resolved: &ResolvedName) -> Result<String, DispatchError> {
        if let Some(zone) = request.zone.as_deref().map(str::trim).filter(|z| !z.is_empty()) {
            return Ok(zone.to_string());
        }

        tracing::info!("Looking up zone for VM {} in cache", resolved.real);
        self.cache.lookup(&resolved.real).await.map_err(|e| {
            tracing::warn!("Zone lookup for {} failed: {}", resolved.real, e);
            match e {
                LookupError::ProviderUnavailable { name, .. } => DispatchError::ZoneLookupUnavailable { name },
                LookupError::EmptyName => DispatchError::EmptyName,
                LookupError::NotFound { name, .. } => DispatchError::ZoneNotFound { name },
            }
        })
    }

    async fn check_status(
        &self,
        resolved: &ResolvedName,
        zone: &str,
        sink: &EventSink,
    ) -> Result<OperationOutcome, DispatchError> {
        sink.emit(
            EventKind::Info,
            format!("Checking status of VM {} in zone {}", resolved.real, zone),
        )
        .await;

        let describe = self.provider.describe(&resolved.real, zone);
        let details = tokio::time::timeout(self.call_timeout, describe)
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Timeout {
                    call: format!("describe {}", resolved.real),
                    secs: self.call_timeout.as_secs(),
                })
            })
            .map_err(|e| {
                tracing::error!("Error getting VM status: {}", e);
                match missing_instance(&e.detail()) {
                    Some(name) => DispatchError::InstanceNotFound {
                        name: name.to_string(),
                        zone: zone.to_string(),
                    },
                    None => DispatchError::from_provider(&e),
                }
            })?;

        #[derive(serde::Serialize)]
        struct StatusEvent<'a> {
            #[serde(flatten)]
            details: &'a MachineDetails,
            vanity_name: Option<&'a str>,
        }
        let payload = StatusEvent {
            details: &details,
            vanity_name: resolved.alias(),
        };
        match serde_json::to_string(&payload) {
            Ok(json) => sink.emit(EventKind::Status, json).await,
            Err(e) => tracing::warn!("Failed to encode status event: {}", e),
        }

        Ok(OperationOutcome {
            vm_name: resolved.real.clone(),
            vanity_name: resolved.alias().map(String::from),
            zone: zone.to_string(),
            message: format!(
                "VM {} is {} ({}, IP: {})",
                resolved.real, details.status, details.machine_type, details.network_ip
            ),
            details: Some(details),
        })
    }

    async fn run_operation(
        &self,
        op: VmOperation,
        resolved: &ResolvedName,
        zone: &str,
        sink: &EventSink,
    ) -> Result<OperationOutcome, DispatchError> {
        sink.emit(
            EventKind::Info,
            format!("Executing {} on VM {} in zone {}", op, resolved.real, zone),
        )
        .await;

        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(64);
        let execute = self.provider.execute(op, &resolved.real, zone, progress_tx);
        // Drained even without a sink so the provider never blocks on it.
        let forward = async {
            while let Some(line) = progress_rx.recv().await {
                sink.emit(EventKind::Progress, line).await;
            }
        };
        let (result, ()) = tokio::join!(execute, forward);

        result.map_err(|e| {
            tracing::error!("Operation {} on {} failed: {}", op, resolved.real, e);
            DispatchError::from_provider(&e)
        })?;

        let message = format!(
            "VM {} ({}) {} successfully.",
            resolved.real,
            resolved.vanity,
            op.past_tense()
        );
        tracing::info!("{}", message);

        Ok(OperationOutcome {
            vm_name: resolved.real.clone(),
            vanity_name: resolved.alias().map(String::from),
            zone: zone.to_string(),
            message,
            details: None,
        })
    }

    async fn log(&self, request: &OperationRequest, resolved: &ResolvedName, zone: &str, status: &str) {
        self.oplog
            .record_quietly(OperationRecord {
                timestamp: Utc::now(),
                vm_name: resolved.real.clone(),
                vanity_name: resolved.vanity.clone(),
                operation: request.operation.to_string(),
                client_ip: request.client_ip.clone(),
                zone: zone.to_string(),
                status: status.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, NamesConfig};
    use crate::oplog::db::OpLogDb;
    use crate::provider::fake::FakeProvider;

    struct Harness {
        provider: Arc<FakeProvider>,
        oplog: OpLogHandle,
        dispatcher: Dispatcher,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            FakeProvider::new()
                .with_zone("us-east4-a", &["guedfocanoop01", "guedfocnlq03"])
                .with_zone("us-central1-f", &["guedfocdsml01"]),
        );
        let cache_config = CacheConfig {
            snapshot_path: dir.path().join("locations.json"),
            regions: vec!["us-".to_string()],
            ..CacheConfig::default()
        };
        let cache = LocationCache::new(provider.clone(), &cache_config);
        cache.refresh().await.unwrap();

        let oplog = OpLogHandle::spawn(OpLogDb::open(":memory:").unwrap());
        let dispatcher = Dispatcher::new(
            provider.clone(),
            cache,
            NameResolver::new(&NamesConfig::default()),
            oplog.clone(),
            Duration::from_secs(5),
        );

        Harness {
            provider,
            oplog,
            dispatcher,
            _dir: dir,
        }
    }

    fn request(vm: &str, operation: VmOperation, zone: Option<&str>) -> OperationRequest {
        OperationRequest {
            vm_name: vm.to_string(),
            operation,
            zone: zone.map(String::from),
            client_ip: "10.0.0.1".to_string(),
        }
    }

    async fn run(
        h: &Harness,
        req: OperationRequest,
    ) -> (Result<OperationOutcome, DispatchError>, Vec<OperationEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = h.dispatcher.dispatch(req, Some(tx)).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn kinds(events: &[OperationEvent]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    async fn statuses(h: &Harness, vm: &str) -> Vec<String> {
        let mut ops = h.oplog.for_vm(vm.to_string(), 10).await.unwrap();
        ops.reverse();
        ops.into_iter().map(|op| op.status).collect()
    }

    #[tokio::test]
    async fn test_status_uses_cached_zone() {
        let h = harness().await;
        let (result, events) = run(&h, request("guedfocanoop01.dev.tibco.com", VmOperation::Status, None)).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.zone, "us-east4-a");
        assert_eq!(outcome.details.as_ref().unwrap().status, "RUNNING");
        assert_eq!(outcome.message, "VM guedfocanoop01 is RUNNING (e2-standard-4, IP: 10.0.0.7)");
        assert_eq!(kinds(&events), vec![EventKind::Info, EventKind::Status, EventKind::Success]);

        let status: serde_json::Value = serde_json::from_str(&events[1].data).unwrap();
        assert_eq!(status["name"], "guedfocanoop01");
        assert!(status["vanity_name"].is_null());

        assert_eq!(statuses(&h, "guedfocanoop01").await, vec!["started", "completed"]);
    }

    #[tokio::test]
    async fn test_unconfigured_domain_is_stripped() {
        let h = harness().await;
        let (result, _) = run(&h, request("guedfocanoop01.example.org", VmOperation::Status, None)).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.vm_name, "guedfocanoop01");
        assert_eq!(outcome.zone, "us-east4-a");

        let (result, _) = run(&h, request("guedfocanoop01.example.org", VmOperation::Stop, None)).await;
        assert!(result.is_ok());
        assert_eq!(
            h.provider.executed(),
            vec![(VmOperation::Stop, "guedfocanoop01".to_string(), "us-east4-a".to_string())]
        );
    }

    #[tokio::test]
    async fn test_start_with_vanity_name() {
        let h = harness().await;
        let (result, events) = run(&h, request("nlq.ibi.systems", VmOperation::Start, None)).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.vm_name, "guedfocnlq03");
        assert_eq!(outcome.vanity_name.as_deref(), Some("nlq.ibi.systems"));
        assert_eq!(outcome.message, "VM guedfocnlq03 (nlq.ibi.systems) started successfully.");
        assert_eq!(
            kinds(&events),
            vec![EventKind::Info, EventKind::Progress, EventKind::Success]
        );
        assert_eq!(
            h.provider.executed(),
            vec![(VmOperation::Start, "guedfocnlq03".to_string(), "us-east4-a".to_string())]
        );

        let ops = h.oplog.for_vm("guedfocnlq03".to_string(), 10).await.unwrap();
        assert!(ops.iter().all(|op| op.vanity_name == "nlq.ibi.systems"));
    }

    #[tokio::test]
    async fn test_explicit_zone_skips_lookup() {
        let h = harness().await;
        let calls = h.provider.machine_calls();

        let (result, _) = run(&h, request("not-cached", VmOperation::Stop, Some("europe-west1-b"))).await;
        assert_eq!(result.unwrap().zone, "europe-west1-b");
        assert_eq!(h.provider.machine_calls(), calls);
    }

    #[tokio::test]
    async fn test_unknown_vm_has_no_zone() {
        let h = harness().await;
        let (result, events) = run(&h, request("guedfocghost01", VmOperation::Start, None)).await;

        let err = result.unwrap_err();
        assert!(matches!(err, DispatchError::ZoneNotFound { .. }));
        assert_eq!(kinds(&events), vec![EventKind::Error]);
        assert!(events[0].data.contains("Please specify a zone parameter"));
        assert!(h.provider.executed().is_empty());
        assert_eq!(statuses(&h, "guedfocghost01").await, vec!["failed-no-zone"]);
    }

    #[tokio::test]
    async fn test_status_in_wrong_zone_is_not_found() {
        let h = harness().await;
        let (result, events) = run(
            &h,
            request("guedfocanoop01", VmOperation::Status, Some("us-central1-f")),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, DispatchError::InstanceNotFound { .. }));
        assert_eq!(
            err.to_string(),
            "Error: The resource 'guedfocanoop01' was not found in zone 'us-central1-f'."
        );
        assert!(!events.last().unwrap().data.contains("projects/"));
        assert_eq!(statuses(&h, "guedfocanoop01").await, vec!["started", "not-found"]);
    }

    #[tokio::test]
    async fn test_failed_operation_is_sanitized() {
        let h = harness().await;
        h.provider.fail_execute(true);

        let (result, events) = run(&h, request("guedfocdsml01", VmOperation::Stop, None)).await;
        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error: Insufficient permissions to perform this operation."
        );
        assert_eq!(events.last().unwrap().kind, EventKind::Error);
        assert_eq!(statuses(&h, "guedfocdsml01").await, vec!["started", "failed"]);
    }

    #[tokio::test]
    async fn test_dispatch_without_events() {
        let h = harness().await;
        let outcome = h
            .dispatcher
            .dispatch(request("guedfocanoop01", VmOperation::Resume, None), None)
            .await
            .unwrap();
        assert_eq!(outcome.message, "VM guedfocanoop01 (guedfocanoop01) resumed successfully.");
    }

    #[test]
    fn test_sanitize_error() {
        let not_found = "ERROR: (gcloud.compute.instances.start) HTTPError 404: The resource \
                         'projects/secret-project/zones/us-east4-a/instances/guedfoc99' was not found";
        assert_eq!(
            sanitize_error(not_found),
            "Error: VM 'guedfoc99' not found. Please verify the VM name and try again."
        );
        assert_eq!(
            sanitize_error("ERROR: caller is not AUTHORIZED"),
            "Error: Insufficient permissions to perform this operation."
        );
        assert!(sanitize_error("ERROR: quota exceeded in projects/secret-project").starts_with("An error occurred"));
    }

    #[test]
    fn test_missing_instance() {
        assert_eq!(
            missing_instance("The resource 'projects/p/zones/z/instances/vm-1' was not found"),
            Some("vm-1")
        );
        assert_eq!(missing_instance("instances/vm-1 exploded"), None);
    }
}
