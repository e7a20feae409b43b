use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use crate::provider::{ProviderError, VmProvider};

struct CachedZones {
    zones: Vec<String>,
    fetched_at: Instant,
}

/// Enumerates zones with a cache of its own, refreshed far less often than
/// machine locations.
pub struct ZoneDirectory {
    provider: Arc<dyn VmProvider>,
    max_age: Duration,
    call_timeout: Duration,
    fallback: Vec<String>,
    // Held across the provider call so concurrent callers share one enumeration.
    cached: Mutex<Option<CachedZones>>,
}

impl ZoneDirectory {
    pub fn new(
        provider: Arc<dyn VmProvider>,
        max_age: Duration,
        call_timeout: Duration,
        fallback: Vec<String>,
    ) -> Self {
        Self {
            provider,
            max_age,
            call_timeout,
            fallback,
            cached: Mutex::new(None),
        }
    }

    /// Every zone visible to the project.
    ///
    /// Never fails: when enumeration fails the stale cached list is served,
    /// and without one the configured fallback list.
    pub async fn all_zones(&self) -> Vec<String> {
        let mut cached = self.cached.lock().await;

        if let Some(c) = cached.as_ref() {
            if c.fetched_at.elapsed() < self.max_age {
                return c.zones.clone();
            }
        }

        match self.fetch().await {
            Ok(zones) => {
                tracing::info!("Discovered {} zones", zones.len());
                *cached = Some(CachedZones {
                    zones: zones.clone(),
                    fetched_at: Instant::now(),
                });
                zones
            }
            Err(e) => match cached.as_ref() {
                Some(c) => {
                    tracing::warn!("Zone enumeration failed, serving stale list of {} zones: {}", c.zones.len(), e);
                    c.zones.clone()
                }
                None => {
                    tracing::warn!("Zone enumeration failed, using fallback zones {:?}: {}", self.fallback, e);
                    self.fallback.clone()
                }
            },
        }
    }

    async fn fetch(&self) -> Result<Vec<String>, ProviderError> {
        let zones = tokio::time::timeout(self.call_timeout, self.provider.list_zones())
            .await
            .map_err(|_| ProviderError::Timeout {
                call: "zone enumeration".to_string(),
                secs: self.call_timeout.as_secs(),
            })??;

        if zones.is_empty() {
            return Err(ProviderError::Parse {
                command: "zone enumeration".to_string(),
                reason: "no zones returned, check authentication and permissions".to_string(),
            });
        }
        Ok(zones)
    }

    /// Zones matching `pattern`; see [`matches_pattern`].
    pub async fn filter_zones(&self, pattern: &str) -> Vec<String> {
        self.all_zones()
            .await
            .into_iter()
            .filter(|zone| matches_pattern(zone, pattern))
            .collect()
    }

    /// Zones starting with any of `prefixes`; all zones when none are given.
    pub async fn scoped_zones(&self, prefixes: &[String]) -> Vec<String> {
        let zones = self.all_zones().await;
        if prefixes.is_empty() {
            return zones;
        }
        zones
            .into_iter()
            .filter(|zone| prefixes.iter().any(|p| zone.starts_with(p.as_str())))
            .collect()
    }
}

/// `|`-separated alternatives; `^alt` matches a prefix, plain `alt` a
/// substring. An empty pattern matches everything.
pub fn matches_pattern(zone: &str, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return true;
    }
    pattern
        .split('|')
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .any(|alt| match alt.strip_prefix('^') {
            Some(prefix) => zone.starts_with(prefix),
            None => zone.contains(alt),
        })
}
