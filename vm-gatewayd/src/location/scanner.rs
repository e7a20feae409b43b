use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use futures::stream::{self, StreamExt};
use crate::provider::{MachineSummary, ProviderError, VmProvider};
use super::error::ScanError;

/// Result of scanning a set of zones
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Machine name -> zone
    pub locations: HashMap<String, String>,
    pub zones_ok: Vec<String>,
    pub zones_failed: Vec<String>,
}

impl ScanOutcome {
    /// Machines found per zone, for logging
    pub fn per_zone(&self) -> BTreeMap<&str, usize> {
        let mut counts: BTreeMap<&str, usize> =
            self.zones_ok.iter().map(|z| (z.as_str(), 0)).collect();
        for zone in self.locations.values() {
            *counts.entry(zone.as_str()).or_default() += 1;
        }
        counts
    }
}

/// Queries zones in parallel with a bounded fan-out.
pub struct ZoneScanner {
    provider: Arc<dyn VmProvider>,
    concurrency: usize,
    call_timeout: Duration,
}

impl ZoneScanner {
    pub fn new(provider: Arc<dyn VmProvider>, concurrency: usize, call_timeout: Duration) -> Self {
        Self {
            provider,
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    async fn query(&self, zone: String) -> (String, Result<Vec<MachineSummary>, ProviderError>) {
        let result = tokio::time::timeout(self.call_timeout, self.provider.list_machines_in_zone(&zone))
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Timeout {
                    call: format!("machine listing for {zone}"),
                    secs: self.call_timeout.as_secs(),
                })
            });
        (zone, result)
    }

    /// Scan `zones`, at most `concurrency` at a time.
    ///
    /// Results are folded in input order, so when a name shows up in more
    /// than one zone the later zone wins. A failing zone only loses its own
    /// records; the scan fails when every zone failed.
    pub async fn scan_zones(&self, zones: &[String]) -> Result<ScanOutcome, ScanError> {
        let results: Vec<_> = stream::iter(zones.iter().cloned())
            .map(|zone| self.query(zone))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut outcome = ScanOutcome::default();
        let mut last_error = None;

        for (zone, result) in results {
            match result {
                Ok(machines) => {
                    tracing::debug!("Zone {}: {} machines", zone, machines.len());
                    for machine in machines {
                        let found_in = if machine.zone.is_empty() { zone.clone() } else { machine.zone };
                        outcome.locations.insert(machine.name, found_in);
                    }
                    outcome.zones_ok.push(zone);
                }
                Err(e) => {
                    tracing::warn!("Error scanning zone {}: {}", zone, e);
                    last_error = Some(e.to_string());
                    outcome.zones_failed.push(zone);
                }
            }
        }

        if outcome.zones_ok.is_empty() {
            if let Some(last_error) = last_error {
                return Err(ScanError::AllZonesFailed {
                    zones: outcome.zones_failed.len(),
                    last_error,
                });
            }
        }

        Ok(outcome)
    }
}
