//! Engine configuration.
//!
//! Defaults reproduce the production tuning; hosts override individual
//! fields from JSON (missing fields keep their defaults).

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// Default minimum interval between two scans by the same account.
pub const DEFAULT_MIN_SCAN_INTERVAL_MS: i64 = 5_000;

/// Configuration for the location filter and heading smoother.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocationConfig {
    /// Exponential moving average weight given to each new heading sample.
    /// Default: 0.3
    pub smoothing_alpha: f64,

    /// Emitted headings are rounded to a multiple of this many degrees.
    /// Default: 10.0
    pub heading_quantum_deg: f64,

    /// Minimum movement since the last emitted update, in meters.
    /// Default: 10.0
    pub min_distance_m: f64,

    /// Minimum quantized heading change since the last emitted update.
    /// Default: 10.0 (15.0 for scan-triggered consumers)
    pub min_heading_change_deg: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.3,
            heading_quantum_deg: 10.0,
            min_distance_m: 10.0,
            min_heading_change_deg: 10.0,
        }
    }
}

impl LocationConfig {
    /// Preset for consumers that trigger scans from heading changes.
    pub fn for_scan() -> Self {
        Self {
            min_heading_change_deg: 15.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(DiscoveryError::validation(format!(
                "smoothing_alpha must be in (0, 1], got {}",
                self.smoothing_alpha
            )));
        }
        if !(self.heading_quantum_deg >= 0.0 && self.heading_quantum_deg < 360.0) {
            return Err(DiscoveryError::validation(format!(
                "heading_quantum_deg must be in [0, 360), got {}",
                self.heading_quantum_deg
            )));
        }
        if !(self.min_distance_m >= 0.0) || !(self.min_heading_change_deg >= 0.0) {
            return Err(DiscoveryError::validation(
                "significance thresholds must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Configuration for the discovery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Minimum interval between scans by one account, in milliseconds.
    /// Default: 5000
    pub min_scan_interval_ms: i64,

    /// Persist a ScanEvent for throttled attempts as well (audit trail).
    /// Default: false
    pub audit_throttled_scans: bool,

    /// TTL for cached trail stats. None disables the cache.
    ///
    /// The cache is per process: new discoveries invalidate it only in the
    /// engine that committed them. Another engine over the same database
    /// may serve its own cached stats for up to this long.
    /// Default: None
    pub stats_cache_ttl_ms: Option<i64>,

    /// Maximum cached `(account, trail)` stats entries.
    /// Default: 256
    pub stats_cache_capacity: usize,

    /// Decimal places kept on preview clue coordinates (3 ≈ 110 m).
    /// Default: 3
    pub preview_precision_decimals: u32,

    /// Location filter settings for the continuous path.
    pub location: LocationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_scan_interval_ms: DEFAULT_MIN_SCAN_INTERVAL_MS,
            audit_throttled_scans: false,
            stats_cache_ttl_ms: None,
            stats_cache_capacity: 256,
            preview_precision_decimals: 3,
            location: LocationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_scan_interval_ms < 0 {
            return Err(DiscoveryError::validation(
                "min_scan_interval_ms must be non-negative",
            ));
        }
        if let Some(ttl) = self.stats_cache_ttl_ms {
            if ttl <= 0 {
                return Err(DiscoveryError::validation(
                    "stats_cache_ttl_ms must be positive when set",
                ));
            }
            if self.stats_cache_capacity == 0 {
                return Err(DiscoveryError::validation(
                    "stats_cache_capacity must be positive when caching is enabled",
                ));
            }
        }
        if self.preview_precision_decimals > 8 {
            return Err(DiscoveryError::validation(
                "preview_precision_decimals must be at most 8",
            ));
        }
        self.location.validate()
    }
}
