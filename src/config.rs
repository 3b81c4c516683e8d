//! Configuration for a mesh.
//!
//! Configuration is passed to [`NetMeshBase::new()`](crate::NetMeshBase::new)
//! through a [`MeshContext`](crate::MeshContext) and can be constructed
//! programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mesh_replication::config::MeshConfig;
//!
//! let config = MeshConfig {
//!     local_identifier: "http://node-1.example/".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MeshConfig
//! ├── local_identifier: String      # This mesh's NetworkIdentifier
//! └── settings: MeshSettings
//!     ├── endpoint: EndpointConfig  # ping-pong timing knobs
//!     ├── lease: LeaseConfig        # lease duration, fetch/lock timeouts
//!     └── probe: ProbeConfig        # shadow grace period, worker pool
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "local_identifier": "http://node-1.example/",
//!   "settings": {
//!     "endpoint": { "delta_respond_ms": 1000, "delta_recover_ms": 5000 },
//!     "lease": { "lease_duration": "5m", "fetch_timeout": "5s" },
//!     "probe": { "shadow_grace": "60s", "max_concurrent_runs": 4 }
//!   }
//! }
//! ```
//!
//! # Environment Overrides
//!
//! [`MeshConfig::apply_env_overrides`] reads `MESH_DELTA_RESPOND_MS`,
//! `MESH_DELTA_RESEND_MS`, `MESH_DELTA_RECOVER_MS`, `MESH_RANDOM_VARIATION`,
//! `MESH_LEASE_DURATION` and `MESH_SHADOW_GRACE`.

use crate::error::{MeshError, Result};
use crate::identifier::NetworkIdentifier;
use crate::probe::coherence::CoherenceSpecification;
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// The identity of the local mesh. Must parse as a [`NetworkIdentifier`].
    pub local_identifier: String,

    /// Timing and sizing knobs.
    #[serde(default)]
    pub settings: MeshSettings,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            local_identifier: "http://localhost.mesh/".to_string(),
            settings: MeshSettings::default(),
        }
    }
}

impl MeshConfig {
    /// Create a config with short timings for tests.
    pub fn for_testing(local_identifier: &str) -> Self {
        Self {
            local_identifier: local_identifier.to_string(),
            settings: MeshSettings {
                endpoint: EndpointConfig::for_testing(),
                lease: LeaseConfig::for_testing(),
                probe: ProbeConfig::for_testing(),
            },
        }
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MeshError::Config(e.to_string()))
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// The parsed local identifier.
    pub fn identifier(&self) -> Result<NetworkIdentifier> {
        NetworkIdentifier::parse(&self.local_identifier)
    }

    /// Check the whole config for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        self.identifier()?;
        self.settings.endpoint.validate()?;
        self.settings.lease.validate()?;
        self.settings.probe.validate()?;
        Ok(())
    }

    /// Apply `MESH_*` environment variables on top of this config.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment, test map).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_u64(key: &str, value: &str) -> Result<u64> {
            value
                .trim()
                .parse()
                .map_err(|_| MeshError::Config(format!("{} is not an integer: {}", key, value)))
        }
        fn check_duration(key: &str, value: &str) -> Result<String> {
            humantime::parse_duration(value.trim())
                .map_err(|e| MeshError::Config(format!("{}: {}", key, e)))?;
            Ok(value.trim().to_string())
        }

        let endpoint = &mut self.settings.endpoint;
        if let Some(v) = lookup("MESH_DELTA_RESPOND_MS") {
            endpoint.delta_respond_ms = parse_u64("MESH_DELTA_RESPOND_MS", &v)?;
        }
        if let Some(v) = lookup("MESH_DELTA_RESEND_MS") {
            endpoint.delta_resend_ms = parse_u64("MESH_DELTA_RESEND_MS", &v)?;
        }
        if let Some(v) = lookup("MESH_DELTA_RECOVER_MS") {
            endpoint.delta_recover_ms = parse_u64("MESH_DELTA_RECOVER_MS", &v)?;
        }
        if let Some(v) = lookup("MESH_RANDOM_VARIATION") {
            endpoint.random_variation = v.trim().parse().map_err(|_| {
                MeshError::Config(format!("MESH_RANDOM_VARIATION is not a number: {}", v))
            })?;
        }
        if let Some(v) = lookup("MESH_LEASE_DURATION") {
            self.settings.lease.lease_duration = check_duration("MESH_LEASE_DURATION", &v)?;
        }
        if let Some(v) = lookup("MESH_SHADOW_GRACE") {
            self.settings.probe.shadow_grace = check_duration("MESH_SHADOW_GRACE", &v)?;
        }
        Ok(())
    }
}

/// All tunable settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshSettings {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

fn parse_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

fn require_duration(field: &str, raw: &str) -> Result<Duration> {
    let parsed = humantime::parse_duration(raw)
        .map_err(|e| MeshError::Config(format!("{}: {} ({})", field, raw, e)))?;
    if parsed.is_zero() {
        return Err(MeshError::Config(format!("{} must be positive", field)));
    }
    Ok(parsed)
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// EndpointConfig: ping-pong timing
// ═══════════════════════════════════════════════════════════════════════════════

/// Timing knobs for the ping-pong endpoint.
///
/// All delays are jittered by `random_variation` at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Delay between receiving a token and sending the next one (ms).
    #[serde(default = "default_delta_respond_ms")]
    pub delta_respond_ms: u64,

    /// Delay before retrying a send that failed at the transport (ms).
    #[serde(default = "default_delta_resend_ms")]
    pub delta_resend_ms: u64,

    /// How long to wait for the partner's token before resending (ms).
    /// Should exceed 4 × `delta_respond_ms`.
    #[serde(default = "default_delta_recover_ms")]
    pub delta_recover_ms: u64,

    /// Relative jitter applied to every delay (0.02 = ±1%).
    #[serde(default = "default_random_variation")]
    pub random_variation: f64,
}

fn default_delta_respond_ms() -> u64 {
    1000
}

fn default_delta_resend_ms() -> u64 {
    500
}

fn default_delta_recover_ms() -> u64 {
    5000
}

fn default_random_variation() -> f64 {
    0.02
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            delta_respond_ms: 1000,
            delta_resend_ms: 500,
            delta_recover_ms: 5000,
            random_variation: 0.02,
        }
    }
}

impl EndpointConfig {
    /// Fast timings for tests.
    pub fn for_testing() -> Self {
        Self {
            delta_respond_ms: 20,
            delta_resend_ms: 10,
            delta_recover_ms: 100,
            random_variation: 0.02,
        }
    }

    pub fn delta_respond(&self) -> Duration {
        Duration::from_millis(self.delta_respond_ms)
    }

    pub fn delta_resend(&self) -> Duration {
        Duration::from_millis(self.delta_resend_ms)
    }

    pub fn delta_recover(&self) -> Duration {
        Duration::from_millis(self.delta_recover_ms)
    }

    /// Reject unusable timings; warn about risky ones.
    pub fn validate(&self) -> Result<()> {
        if self.delta_respond_ms == 0 || self.delta_resend_ms == 0 || self.delta_recover_ms == 0 {
            return Err(MeshError::Config("endpoint delays must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.random_variation) {
            return Err(MeshError::Config(format!(
                "random_variation must be in [0, 1): {}",
                self.random_variation
            )));
        }
        if self.delta_recover_ms <= self.delta_respond_ms.saturating_mul(4) {
            warn!(
                delta_respond_ms = self.delta_respond_ms,
                delta_recover_ms = self.delta_recover_ms,
                "delta_recover should exceed 4 x delta_respond; expect spurious resends"
            );
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LeaseConfig: replica lifetime and proxy request timeouts
// ═══════════════════════════════════════════════════════════════════════════════

/// Lease and proxy request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a fetched replica is trusted without re-fetch (e.g. "5m").
    #[serde(default = "default_lease_duration")]
    pub lease_duration: String,

    /// How long one fetch attempt waits for its response.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: String,

    /// Protocol-level fetch attempts before `ObjectAccess` is returned.
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: usize,

    /// How long `request_lock` waits for a grant.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: String,

    /// Drop replicas whose lease expired this long ago.
    #[serde(default = "default_replica_purge_after")]
    pub replica_purge_after: String,

    /// How often the housekeeping task looks for expired replicas.
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval: String,

    /// Whether to run the housekeeping task at all.
    #[serde(default = "default_false")]
    pub housekeeping_disabled: bool,
}

fn default_lease_duration() -> String {
    "5m".to_string()
}

fn default_fetch_timeout() -> String {
    "10s".to_string()
}

fn default_fetch_attempts() -> usize {
    3
}

fn default_lock_timeout() -> String {
    "10s".to_string()
}

fn default_replica_purge_after() -> String {
    "10m".to_string()
}

fn default_housekeeping_interval() -> String {
    "60s".to_string()
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            fetch_timeout: default_fetch_timeout(),
            fetch_attempts: default_fetch_attempts(),
            lock_timeout: default_lock_timeout(),
            replica_purge_after: default_replica_purge_after(),
            housekeeping_interval: default_housekeeping_interval(),
            housekeeping_disabled: false,
        }
    }
}

impl LeaseConfig {
    pub fn for_testing() -> Self {
        Self {
            lease_duration: "5m".to_string(),
            fetch_timeout: "1s".to_string(),
            fetch_attempts: 2,
            lock_timeout: "1s".to_string(),
            replica_purge_after: "10m".to_string(),
            housekeeping_interval: "1s".to_string(),
            housekeeping_disabled: true,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        parse_or(&self.lease_duration, Duration::from_secs(300))
    }

    pub fn fetch_timeout(&self) -> Duration {
        parse_or(&self.fetch_timeout, Duration::from_secs(10))
    }

    pub fn lock_timeout(&self) -> Duration {
        parse_or(&self.lock_timeout, Duration::from_secs(10))
    }

    pub fn replica_purge_after(&self) -> Duration {
        parse_or(&self.replica_purge_after, Duration::from_secs(600))
    }

    pub fn housekeeping_interval(&self) -> Duration {
        parse_or(&self.housekeeping_interval, Duration::from_secs(60))
    }

    /// Protocol-level retry schedule for fetches.
    ///
    /// Each attempt waits `fetch_timeout`; backoff between attempts is short
    /// because the endpoint already retries transport failures itself.
    pub fn fetch_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.fetch_attempts.max(1),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            connection_timeout: self.fetch_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_duration("lease_duration", &self.lease_duration)?;
        require_duration("fetch_timeout", &self.fetch_timeout)?;
        require_duration("lock_timeout", &self.lock_timeout)?;
        require_duration("replica_purge_after", &self.replica_purge_after)?;
        require_duration("housekeeping_interval", &self.housekeeping_interval)?;
        if self.fetch_attempts == 0 {
            return Err(MeshError::Config("fetch_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProbeConfig: shadow lifetime and probe worker pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Probe manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Grace period before an unneeded shadow is discarded
    /// (`timeNotNeededTillExpires`).
    #[serde(default = "default_shadow_grace")]
    pub shadow_grace: String,

    /// How often the eviction sweeper runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    /// Maximum probe runs executing at once across all shadows.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// A probe run taking longer than this is a failed run.
    #[serde(default = "default_run_timeout")]
    pub run_timeout: String,

    /// Coherence used when neither caller nor descriptor specify one,
    /// in text form (e.g. `"periodic(60000)"`). `None` = built-in default.
    #[serde(default)]
    pub default_coherence: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (thundering herd prevention)
    // ─────────────────────────────────────────────────────────────────────────
    /// Throttle probe runs across all shadows.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained probe runs per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst of probe runs allowed above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_shadow_grace() -> String {
    "60s".to_string()
}

fn default_sweep_interval() -> String {
    "30s".to_string()
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_run_timeout() -> String {
    "2m".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10
}

fn default_rate_limit_burst() -> u32 {
    20
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            shadow_grace: default_shadow_grace(),
            sweep_interval: default_sweep_interval(),
            max_concurrent_runs: default_max_concurrent_runs(),
            run_timeout: default_run_timeout(),
            default_coherence: None,
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ProbeConfig {
    pub fn for_testing() -> Self {
        Self {
            shadow_grace: "60s".to_string(),
            sweep_interval: "1s".to_string(),
            max_concurrent_runs: 2,
            run_timeout: "5s".to_string(),
            default_coherence: None,
            rate_limit_enabled: false,
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
        }
    }

    pub fn shadow_grace(&self) -> Duration {
        parse_or(&self.shadow_grace, Duration::from_secs(60))
    }

    pub fn sweep_interval(&self) -> Duration {
        parse_or(&self.sweep_interval, Duration::from_secs(30))
    }

    pub fn run_timeout(&self) -> Duration {
        parse_or(&self.run_timeout, Duration::from_secs(120))
    }

    /// The configured fallback coherence, or the built-in default.
    pub fn default_coherence(&self) -> CoherenceSpecification {
        self.default_coherence
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    /// Rate limiter settings, or `None` if disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_duration("shadow_grace", &self.shadow_grace)?;
        require_duration("sweep_interval", &self.sweep_interval)?;
        require_duration("run_timeout", &self.run_timeout)?;
        if self.max_concurrent_runs == 0 {
            return Err(MeshError::Config("max_concurrent_runs must be at least 1".to_string()));
        }
        if let Some(raw) = &self.default_coherence {
            raw.parse::<CoherenceSpecification>()?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
