use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub names: NamesConfig,
    #[serde(default)]
    pub oplog: OpLogConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_gcloud_bin")]
    pub gcloud_bin: PathBuf,
    /// Passed as --project when set, otherwise gcloud's active project is used
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Refresh interval and maximum age of a persisted snapshot
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: f64,
    /// Seed zone for on-demand scans when no history exists
    #[serde(default = "default_zone")]
    pub default_zone: String,
    /// Zone name prefixes covered by a full refresh; empty means every zone
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
    /// Used when zone enumeration fails and nothing is cached
    #[serde(default = "default_fallback_zones")]
    pub fallback_zones: Vec<String>,
    #[serde(default = "default_zone_max_age_hours")]
    pub zone_max_age_hours: f64,
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Minimum wait between two scheduled refresh attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamesConfig {
    #[serde(default = "default_domain_suffixes")]
    pub domain_suffixes: Vec<String>,
    #[serde(default = "default_vanity_domain")]
    pub vanity_domain: String,
    /// Alias prefix -> real hostname
    #[serde(default = "default_vanity")]
    pub vanity: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpLogConfig {
    #[serde(default = "default_oplog_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_gcloud_bin() -> PathBuf {
    PathBuf::from("gcloud")
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/lib/vm-gateway/locations.json")
}

fn default_max_age_hours() -> f64 {
    1.0
}

fn default_zone() -> String {
    "us-east4-a".to_string()
}

fn default_regions() -> Vec<String> {
    vec!["us-".to_string(), "asia-".to_string()]
}

fn default_fallback_zones() -> Vec<String> {
    ["us-central1-a", "us-central1-b", "us-east1-b", "asia-east1-a", "asia-southeast1-a"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_zone_max_age_hours() -> f64 {
    24.0
}

fn default_scan_concurrency() -> usize {
    8
}

fn default_call_timeout() -> u64 {
    60
}

fn default_retry_delay() -> u64 {
    60
}

fn default_domain_suffixes() -> Vec<String> {
    [".dev.tibco.com", ".ibi.systems", ".tibco.com"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_vanity_domain() -> String {
    "ibi.systems".to_string()
}

fn default_vanity() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("nlq".to_string(), "guedfocnlq03".to_string()),
        ("py-server".to_string(), "guedfocdsml01".to_string()),
    ])
}

fn default_oplog_path() -> PathBuf {
    PathBuf::from("/var/lib/vm-gateway/operations.db")
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            gcloud_bin: default_gcloud_bin(),
            project: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            max_age_hours: default_max_age_hours(),
            default_zone: default_zone(),
            regions: default_regions(),
            fallback_zones: default_fallback_zones(),
            zone_max_age_hours: default_zone_max_age_hours(),
            scan_concurrency: default_scan_concurrency(),
            call_timeout_secs: default_call_timeout(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            domain_suffixes: default_domain_suffixes(),
            vanity_domain: default_vanity_domain(),
            vanity: default_vanity(),
        }
    }
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            db_path: default_oplog_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        hours(self.max_age_hours)
    }

    pub fn zone_max_age(&self) -> Duration {
        hours(self.zone_max_age_hours)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Longest interval accepted for the hour-based settings (one year)
const MAX_HOURS: f64 = 24.0 * 365.0;

fn hours(h: f64) -> Duration {
    Duration::try_from_secs_f64((h * 3600.0).max(0.0)).unwrap_or(Duration::MAX)
}

fn check_hours(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > MAX_HOURS {
        bail!("cache.{field} must be between 0 and {MAX_HOURS} hours, got {value}");
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("CACHE_MAX_AGE_HOURS") {
            self.cache.max_age_hours = v
                .trim()
                .parse()
                .with_context(|| format!("CACHE_MAX_AGE_HOURS is not a number: {v}"))?;
        }
        if let Some(v) = lookup("DEFAULT_ZONE") {
            self.cache.default_zone = v.trim().to_string();
        }
        if let Some(v) = lookup("SCAN_CONCURRENCY") {
            self.cache.scan_concurrency = v
                .trim()
                .parse()
                .with_context(|| format!("SCAN_CONCURRENCY is not an integer: {v}"))?;
        }
        if let Some(v) = lookup("CALL_TIMEOUT_SECS") {
            self.cache.call_timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("CALL_TIMEOUT_SECS is not an integer: {v}"))?;
        }
        if let Some(v) = lookup("GATEWAY_LISTEN") {
            self.api.listen = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_hours("max_age_hours", self.cache.max_age_hours)?;
        check_hours("zone_max_age_hours", self.cache.zone_max_age_hours)?;
        if self.cache.scan_concurrency == 0 {
            bail!("cache.scan_concurrency must be at least 1");
        }
        if self.cache.call_timeout_secs == 0 {
            bail!("cache.call_timeout_secs must be positive");
        }
        if self.cache.retry_delay_secs == 0 {
            bail!("cache.retry_delay_secs must be positive");
        }
        Ok(())
    }
}
