//! # Waymark
//!
//! Proximity and discovery engine for location-based trail games.
//!
//! Accounts walk a trail of geolocated spots. Device fixes and explicit scan
//! actions reveal clues and unlock discoveries; trail statistics are derived
//! from an append-only discovery ledger.
//!
//! This library provides:
//! - GPS fix filtering and heading smoothing ([`LocationStream`])
//! - Dual-radius proximity matching ([`match_spots`])
//! - A rate-limited, race-safe scan action ([`ScanEventRecorder`])
//! - Derived trail progress, rank and timing ([`TrailStatsAggregator`])
//! - Generic 1-5 ratings for spots and trails ([`RatingAggregator`])
//! - SQLite persistence behind the narrow [`Store`] trait
//!
//! ## Quick Start
//!
//! ```rust
//! use waymark::{
//!     AccountContext, DeviceUpdate, DiscoveryEngine, GpsPoint, Spot, SqliteStore, Trail,
//! };
//!
//! let store = SqliteStore::in_memory().unwrap();
//! store.put_trail(&Trail::new("old-town")).unwrap();
//! store
//!     .put_spot(&Spot::new("fountain", GpsPoint::new(51.5074, -0.1278), 10.0, 50.0))
//!     .unwrap();
//! store.link_spot("old-town", "fountain", 0).unwrap();
//!
//! let engine = DiscoveryEngine::new(store);
//! let ctx = AccountContext::new("acct-1", "player");
//! let update = DeviceUpdate::new(GpsPoint::new(51.5074, -0.1278), 0.0);
//!
//! let result = engine.process_location(&ctx, &update, "old-town").unwrap();
//! assert_eq!(result.discoveries.len(), 1);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{DiscoveryError, OptionExt, Result};

// Configuration
pub mod config;
pub use config::{EngineConfig, LocationConfig, DEFAULT_MIN_SCAN_INTERVAL_MS};

// Time source
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// Geographic utilities (distance, degree conversion, heading arithmetic)
pub mod geo_utils;

// Raw fix filtering and heading smoothing
pub mod location;
pub use location::{LocationStream, Subscription};

// Pure dual-radius proximity matching
pub mod proximity;
pub use proximity::{match_spots, ProximityMatch, RadiusOverride, SpotIndex};

// Storage interface and SQLite backend
pub mod store;
pub use store::{SqliteStore, Store};

// Append-only discovery ledger
pub mod ledger;
pub use ledger::{DiscoveryLedger, InsertOutcome};

// Per-account scan rate limiting
pub mod throttle;
pub use throttle::ScanThrottle;

// Scan orchestration
pub mod scan;
pub use scan::ScanEventRecorder;

// Derived trail statistics
pub mod stats;
pub mod stats_cache;
pub use stats::TrailStatsAggregator;

// Ratings for spots and trails
pub mod rating;
pub use rating::RatingAggregator;

// Composite read model
pub mod state;
pub use state::{DiscoveryState, DiscoveryStateComposite};

// Engine facade and process-wide singleton
pub mod engine;
pub use engine::{engine_init, with_engine, DiscoveryEngine, LocationResult, ENGINE};

/// Initialize logging for Android.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("waymark"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms; the host installs its own logger
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use waymark::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Exactly (0, 0): what most GPS stacks report before a fix.
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }

    /// Valid and not the null-island placeholder.
    pub fn is_usable(&self) -> bool {
        self.is_valid() && !self.is_null_island()
    }
}

/// A raw sensor fix as delivered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFix {
    pub location: GpsPoint,
    /// Compass heading in degrees, unsmoothed
    pub heading_raw: f64,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, heading_raw: f64, timestamp: i64) -> Self {
        Self {
            location: GpsPoint::new(latitude, longitude),
            heading_raw,
            timestamp,
        }
    }
}

/// A filtered, smoothed device position. Ephemeral, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub location: GpsPoint,
    /// Smoothed heading quantized to the configured step, in `[0, 360)`
    pub heading: f64,
}

impl DeviceUpdate {
    pub fn new(location: GpsPoint, heading: f64) -> Self {
        Self { location, heading }
    }
}

/// Caller identity supplied by the external session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountContext {
    pub account_id: String,
    pub account_type: String,
}

impl AccountContext {
    pub fn new(account_id: impl Into<String>, account_type: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            account_type: account_type.into(),
        }
    }

    /// Reject contexts without a usable account id.
    ///
    /// Blank ids and ids with surrounding whitespace are both rejected, so
    /// `" acct"` can never alias `"acct"`.
    pub fn require(&self) -> Result<&str> {
        let id = self.account_id.as_str();
        if id.trim().is_empty() || id.trim() != id {
            return Err(DiscoveryError::SessionNotFound);
        }
        Ok(id)
    }
}

/// Which proximity call site commits discoveries for a trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Continuous location updates and scans both commit discoveries
    #[default]
    Free,
    /// Only explicit scans commit; location updates yield clues only
    Scan,
}

impl DiscoveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMode::Free => "free",
            DiscoveryMode::Scan => "scan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(DiscoveryMode::Free),
            "scan" => Some(DiscoveryMode::Scan),
            _ => None,
        }
    }
}

/// Trail-level discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailOptions {
    pub discovery_mode: DiscoveryMode,
    /// Clue cutoff used by scans, in meters
    pub scanner_radius: f64,
    /// Discovery cutoff used by scans when set, in meters
    pub snap_radius: Option<f64>,
}

impl Default for TrailOptions {
    fn default() -> Self {
        Self {
            discovery_mode: DiscoveryMode::Free,
            scanner_radius: 150.0,
            snap_radius: None,
        }
    }
}

/// An ordered collection of spots sharing discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trail {
    pub id: String,
    pub options: TrailOptions,
}

impl Trail {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            options: TrailOptions::default(),
        }
    }

    pub fn with_options(id: impl Into<String>, options: TrailOptions) -> Self {
        Self {
            id: id.into(),
            options,
        }
    }
}

/// A discoverable point of interest with two proximity thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spot {
    pub id: String,
    pub location: GpsPoint,
    /// Auto-discovery distance, in meters
    pub discovery_radius: f64,
    /// Hint-only distance, in meters. Expected to exceed `discovery_radius`.
    pub clue_radius: f64,
}

impl Spot {
    pub fn new(
        id: impl Into<String>,
        location: GpsPoint,
        discovery_radius: f64,
        clue_radius: f64,
    ) -> Self {
        Self {
            id: id.into(),
            location,
            discovery_radius,
            clue_radius,
        }
    }
}

/// Ordered membership of a spot in a trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailSpot {
    pub trail_id: String,
    pub spot_id: String,
    pub order: i64,
}

/// A permanent record that an account has found a spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub id: String,
    pub account_id: String,
    pub spot_id: String,
    pub trail_id: String,
    /// Epoch milliseconds
    pub discovered_at: i64,
}

/// Where a clue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClueSource {
    Proximity,
    ScanEvent,
}

/// An ephemeral hint that an undiscovered spot is nearby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clue {
    pub spot_id: String,
    pub trail_id: String,
    pub location: GpsPoint,
    pub source: ClueSource,
}

/// One scan attempt, persisted append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEvent {
    pub id: String,
    pub account_id: String,
    pub trail_id: String,
    /// Epoch milliseconds
    pub scanned_at: i64,
    /// Clue cutoff applied to this scan, in meters
    pub radius_used: f64,
    /// At least one clue or discovery found
    pub successful: bool,
    pub clues: Vec<Clue>,
    /// Spots newly discovered by this scan
    pub discovered_spot_ids: Vec<String>,
    pub location: GpsPoint,
}

/// Progress state of an account on a trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    NotStarted,
    InProgress,
    Completed,
}

/// Derived per-account trail statistics. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailStats {
    pub trail_id: String,
    pub account_id: String,
    pub total_spots: u32,
    pub discovered_spots: u32,
    /// 0-100
    pub progress_percentage: u32,
    pub completion_status: CompletionStatus,
    /// 1-based leaderboard position, 0 when the account has no discoveries
    pub rank: u32,
    pub total_discoverers: u32,
    /// Mean seconds between consecutive discoveries, when at least two exist
    pub average_time_between_discoveries: Option<f64>,
}

/// A single 1-5 rating by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub target_id: String,
    pub account_id: String,
    pub value: u8,
}

/// Aggregate rating view for a spot or trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSummary {
    pub target_id: String,
    /// Mean rounded to one decimal, 0.0 when unrated
    pub average: f64,
    pub count: u32,
    pub user_rating: Option<u8>,
}

/// Generate a new record identifier.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
