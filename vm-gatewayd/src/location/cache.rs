//! VM location cache.
//!
//! Holds the current name -> zone snapshot behind a `watch` slot. Readers
//! clone an `Arc<Snapshot>` out of a single borrow; writers build a new
//! snapshot outside any lock and only serialize on the short merge-and-swap
//! step. One background task re-scans every `max_age`, and lookups that miss
//! fall back to a narrow scan of the zones most likely to hold the machine.
//!
//! Concurrent writers resolve by completion order: whichever commits last
//! wins for a key present in both. A full refresh keeps records merged on
//! demand after it started, so a lookup that raced it is never lost.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use shared::types::{CacheStatusInfo, LocationRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::CacheConfig;
use crate::provider::VmProvider;
use super::error::{CacheError, LookupError, PersistenceError, RefreshError};
use super::scanner::{ScanOutcome, ZoneScanner};
use super::snapshot::Snapshot;
use super::store::SnapshotStore;
use super::zones::ZoneDirectory;

type PendingLookup = Shared<BoxFuture<'static, Result<String, LookupError>>>;

/// Outcome of [`LocationCache::initialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    LoadedFromDisk { records: usize },
    Refreshed { records: usize },
    AlreadyInitialized,
}

struct Scheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(Scheduler),
    Stopped,
}

struct Inner {
    max_age: Duration,
    retry_delay: Duration,
    default_zone: String,
    regions: Vec<String>,
    zones: ZoneDirectory,
    scanner: ZoneScanner,
    store: SnapshotStore,
    current: watch::Sender<Arc<Snapshot>>,
    /// Serializes the swap-in step of every writer
    commit: tokio::sync::Mutex<()>,
    /// Set while a full refresh is running
    refreshing: AtomicBool,
    /// Zones where machines have been seen since start
    history: Mutex<BTreeSet<String>>,
    pending: Mutex<HashMap<String, PendingLookup>>,
    next_refresh: Mutex<Option<DateTime<Utc>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// Handle to the location cache; clones share the same state.
#[derive(Clone)]
pub struct LocationCache {
    inner: Arc<Inner>,
}

/// Clears the refresh flag however the refresh ends, including cancellation.
struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn minutes(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 60_000.0
}

/// Strip whitespace and any domain part: "vm-a.example.com" -> "vm-a"
pub fn normalize_name(name: &str) -> &str {
    let name = name.trim();
    name.split('.').next().unwrap_or(name)
}

fn to_records(locations: HashMap<String, String>, seen: DateTime<Utc>) -> HashMap<String, LocationRecord> {
    locations
        .into_iter()
        .map(|(name, zone)| {
            let record = LocationRecord {
                name: name.clone(),
                zone,
                last_seen: seen,
            };
            (name, record)
        })
        .collect()
}

impl LocationCache {
    pub fn new(provider: Arc<dyn VmProvider>, config: &CacheConfig) -> Self {
        let (current, _) = watch::channel(Arc::new(Snapshot::empty()));

        Self {
            inner: Arc::new(Inner {
                max_age: config.max_age(),
                retry_delay: config.retry_delay(),
                default_zone: config.default_zone.trim().to_string(),
                regions: config.regions.clone(),
                zones: ZoneDirectory::new(
                    provider.clone(),
                    config.zone_max_age(),
                    config.call_timeout(),
                    config.fallback_zones.clone(),
                ),
                scanner: ZoneScanner::new(provider, config.scan_concurrency, config.call_timeout()),
                store: SnapshotStore::new(&config.snapshot_path),
                current,
                commit: tokio::sync::Mutex::new(()),
                refreshing: AtomicBool::new(false),
                history: Mutex::new(BTreeSet::new()),
                pending: Mutex::new(HashMap::new()),
                next_refresh: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
            }),
        }
    }

    /// The snapshot currently in effect
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.current.borrow().clone()
    }

    pub fn zone_directory(&self) -> &ZoneDirectory {
        &self.inner.zones
    }

    /// Load the persisted snapshot, or scan when it is missing, stale or
    /// unreadable, then start the refresh scheduler.
    ///
    /// The scheduler is started even when the initial scan fails so that it
    /// keeps retrying; the failure is still reported to the caller.
    pub async fn initialize(&self) -> Result<InitOutcome, CacheError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(InitOutcome::AlreadyInitialized),
            Lifecycle::Stopped => return Err(CacheError::ShutDown),
            Lifecycle::Idle => {}
        }

        tracing::info!("Initializing VM location cache");

        let outcome = match self.load_persisted().await {
            Some(snapshot) => {
                let records = snapshot.len();
                self.install(snapshot).await;
                Ok(InitOutcome::LoadedFromDisk { records })
            }
            None => self
                .refresh()
                .await
                .map(|s| InitOutcome::Refreshed { records: s.len() })
                .map_err(CacheError::InitialRefresh),
        };

        *lifecycle = Lifecycle::Running(self.spawn_scheduler());
        outcome
    }

    async fn load_persisted(&self) -> Option<Snapshot> {
        let path = self.inner.store.path().display().to_string();
        match self.inner.store.load().await {
            Ok(Some(snapshot)) => {
                let age = snapshot.age(Utc::now()).unwrap_or_else(chrono::Duration::zero);
                let fresh = age.to_std().map(|a| a < self.inner.max_age).unwrap_or(true);
                if fresh {
                    tracing::info!(
                        "Loaded {} locations from {}, age {:.1} minutes",
                        snapshot.len(),
                        path,
                        minutes(age)
                    );
                    Some(snapshot)
                } else {
                    tracing::info!("Snapshot at {} is too old ({:.1} hours), will refresh", path, minutes(age) / 60.0);
                    None
                }
            }
            Ok(None) => {
                tracing::info!("No snapshot found at {}", path);
                None
            }
            Err(e @ PersistenceError::SchemaMismatch { .. }) => {
                tracing::warn!("Ignoring snapshot at {}: {}", path, e);
                None
            }
            Err(e) => {
                tracing::error!("Failed to load snapshot: {}", e);
                None
            }
        }
    }

    async fn install(&self, snapshot: Snapshot) {
        let _commit = self.inner.commit.lock().await;
        let snapshot = Arc::new(snapshot);
        self.remember_zones(&snapshot);
        self.inner.current.send_replace(snapshot);
    }

    fn remember_zones(&self, snapshot: &Snapshot) {
        lock(&self.inner.history).extend(snapshot.zones());
    }

    /// Default zone first, then every zone that has hosted a machine
    fn candidate_zones(&self) -> Vec<String> {
        let mut zones = Vec::new();
        if !self.inner.default_zone.is_empty() {
            zones.push(self.inner.default_zone.clone());
        }
        for zone in lock(&self.inner.history).iter() {
            if *zone != self.inner.default_zone {
                zones.push(zone.clone());
            }
        }
        zones
    }

    /// Full scan of every scoped zone, swapped in as a new snapshot and
    /// persisted. On failure the current snapshot stays in effect.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, RefreshError> {
        let Some(_guard) = RefreshGuard::acquire(&self.inner.refreshing) else {
            tracing::info!("Refresh already in progress, skipping");
            return Err(RefreshError::InProgress);
        };

        let started = Utc::now();
        tracing::info!("Updating VM location cache for regions {:?}", self.inner.regions);

        let zones = self.inner.zones.scoped_zones(&self.inner.regions).await;
        if zones.is_empty() {
            tracing::error!("No zones match regions {:?}", self.inner.regions);
            return Err(RefreshError::NoZones);
        }

        let outcome = match self.inner.scanner.scan_zones(&zones).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Cache refresh failed, keeping current snapshot: {}", e);
                return Err(e.into());
            }
        };

        let snapshot = self.commit_refresh(&outcome, started).await;
        log_refresh_summary(&outcome, &snapshot, zones.len());

        // The in-memory snapshot is valid even if the disk copy is stale.
        if let Err(e) = self.inner.store.save(&snapshot).await {
            tracing::warn!("Failed to persist snapshot: {}", e);
        }

        Ok(snapshot)
    }

    async fn commit_refresh(&self, outcome: &ScanOutcome, started: DateTime<Utc>) -> Arc<Snapshot> {
        let now = Utc::now();
        let mut records = to_records(outcome.locations.clone(), now);
        let failed: HashSet<&str> = outcome.zones_failed.iter().map(String::as_str).collect();

        let _commit = self.inner.commit.lock().await;
        let previous = self.snapshot();

        for old in previous.records() {
            if records.contains_key(&old.name) {
                continue;
            }
            // Merged by a lookup while this refresh was scanning, or sitting
            // in a zone that did not answer this time.
            if old.last_seen >= started || failed.contains(old.zone.as_str()) {
                records.insert(old.name.clone(), old.clone());
            }
        }

        let snapshot = Arc::new(Snapshot::new(records, now));
        self.remember_zones(&snapshot);
        self.inner.current.send_replace(snapshot.clone());
        snapshot
    }

    /// Zone of `name`, scanning candidate zones when it is not cached.
    pub async fn lookup(&self, name: &str) -> Result<String, LookupError> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(LookupError::EmptyName);
        }

        let snapshot = self.snapshot();
        if let Some(record) = snapshot.find(name) {
            tracing::debug!("Found VM {} in zone {}", name, record.zone);
            self.refresh_if_stale(&snapshot);
            return Ok(record.zone.clone());
        }

        self.refresh_if_stale(&snapshot);
        if snapshot.is_empty() {
            tracing::info!("Cache is empty, scanning candidate zones for VM {}", name);
        } else {
            tracing::info!(
                "VM {} not in cache ({} records), scanning candidate zones",
                name,
                snapshot.len()
            );
        }
        self.coalesced_rescan(name.to_string()).await
    }

    fn refresh_if_stale(&self, snapshot: &Snapshot) {
        let stale = snapshot
            .age(Utc::now())
            .and_then(|age| age.to_std().ok())
            .is_some_and(|age| age > self.inner.max_age);
        if !stale || self.inner.refreshing.load(Ordering::Acquire) {
            return;
        }

        tracing::warn!("Cache is stale, scheduling background refresh");
        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.refresh().await {
                tracing::debug!("Background refresh did not run: {}", e);
            }
        });
    }

    /// Misses for the same name share a single scan.
    async fn coalesced_rescan(&self, name: String) -> Result<String, LookupError> {
        let key = name.to_ascii_lowercase();

        let pending = lock(&self.inner.pending)
            .entry(key.clone())
            .or_insert_with(|| {
                let cache = self.clone();
                let lookup_name = name.clone();
                // Spawned so the scan completes even if every waiter goes away.
                let task = tokio::spawn(async move {
                    let result = cache.targeted_rescan(&lookup_name).await;
                    lock(&cache.inner.pending).remove(&key);
                    result
                });
                async move {
                    task.await.unwrap_or_else(|e| {
                        Err(LookupError::ProviderUnavailable {
                            name,
                            reason: e.to_string(),
                        })
                    })
                }
                .boxed()
                .shared()
            })
            .clone();

        pending.await
    }

    async fn targeted_rescan(&self, name: &str) -> Result<String, LookupError> {
        let candidates = self.candidate_zones();
        if candidates.is_empty() {
            return Err(LookupError::NotFound {
                name: name.to_string(),
                zones_scanned: 0,
            });
        }

        let outcome = self
            .inner
            .scanner
            .scan_zones(&candidates)
            .await
            .map_err(|e| LookupError::ProviderUnavailable {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let not_found = || LookupError::NotFound {
            name: name.to_string(),
            zones_scanned: candidates.len(),
        };

        if outcome.locations.is_empty() {
            tracing::warn!("VM {} not found in zones {:?}", name, candidates);
            return Err(not_found());
        }

        let found = to_records(outcome.locations, Utc::now());
        let merged = {
            let _commit = self.inner.commit.lock().await;
            let merged = Arc::new(self.snapshot().merged(found.into_values()));
            self.remember_zones(&merged);
            self.inner.current.send_replace(merged.clone());
            merged
        };

        match merged.find(name) {
            Some(record) => {
                tracing::info!("Found VM {} in zone {} after targeted scan", name, record.zone);
                Ok(record.zone.clone())
            }
            None => {
                tracing::warn!("VM {} not found in zones {:?}", name, candidates);
                Err(not_found())
            }
        }
    }

    pub fn status(&self) -> CacheStatusInfo {
        let snapshot = self.snapshot();
        let now = Utc::now();
        let next_refresh = *lock(&self.inner.next_refresh);

        CacheStatusInfo {
            last_update: snapshot.built_at(),
            record_count: snapshot.len(),
            age_minutes: snapshot.age(now).map(minutes),
            next_refresh_in_minutes: next_refresh.map(|at| minutes(at - now).max(0.0)),
            refresh_in_progress: self.inner.refreshing.load(Ordering::Acquire),
            fingerprint: snapshot.fingerprint().to_string(),
        }
    }

    fn spawn_scheduler(&self) -> Scheduler {
        self.schedule_next(Utc::now());
        let cancel = CancellationToken::new();
        let cache = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { cache.run_scheduler(token).await });

        tracing::info!(
            "Started periodic cache refresh task (interval: {:.2} hours)",
            self.inner.max_age.as_secs_f64() / 3600.0
        );
        Scheduler { cancel, handle }
    }

    /// Time until the current snapshot reaches `max_age`, but never less
    /// than `retry_delay`.
    fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        let due = match self.snapshot().age(now) {
            Some(age) => self
                .inner
                .max_age
                .saturating_sub(age.to_std().unwrap_or_default()),
            None => Duration::ZERO,
        };
        due.max(self.inner.retry_delay)
    }

    fn schedule_next(&self, now: DateTime<Utc>) -> Duration {
        let delay = self.next_delay(now);
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        *lock(&self.inner.next_refresh) = at;
        delay
    }

    async fn run_scheduler(self, cancel: CancellationToken) {
        loop {
            let delay = self.schedule_next(Utc::now());
            tracing::info!("Next cache refresh in {:.1} minutes", delay.as_secs_f64() / 60.0);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }

            tokio::select! {
                result = self.refresh() => match result {
                    Ok(snapshot) => tracing::info!("Scheduled refresh complete: {} VMs", snapshot.len()),
                    Err(RefreshError::InProgress) => {
                        tracing::info!("Scheduled refresh skipped: another refresh is in progress");
                    }
                    Err(e) => tracing::error!("Error during scheduled cache refresh: {}", e),
                },
                _ = cancel.cancelled() => {
                    tracing::warn!("Abandoning in-flight refresh for shutdown");
                    break;
                }
            }
        }

        *lock(&self.inner.next_refresh) = None;
        tracing::info!("Cache refresh task stopped");
    }

    /// Stop the scheduler and wait for its task to finish.
    pub async fn shutdown(&self) {
        let previous = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        if let Lifecycle::Running(scheduler) = previous {
            scheduler.cancel.cancel();
            if let Err(e) = scheduler.handle.await {
                tracing::error!("Cache refresh task ended abnormally: {}", e);
            }
        }
        *lock(&self.inner.next_refresh) = None;
    }
}

fn log_refresh_summary(outcome: &ScanOutcome, snapshot: &Snapshot, zones: usize) {
    let per_zone = outcome.per_zone();
    let non_empty = per_zone.values().filter(|&&n| n > 0).count();
    tracing::info!(
        "Cache update complete - total: {} VMs across {}/{} zones ({} failed)",
        snapshot.len(),
        non_empty,
        zones,
        outcome.zones_failed.len()
    );

    let mut by_count: Vec<_> = per_zone.into_iter().filter(|(_, n)| *n > 0).collect();
    by_count.sort_by(|a, b| b.1.cmp(&a.1));
    for (zone, count) in by_count {
        tracing::info!("  - {}: {} VMs", zone, count);
    }
}
