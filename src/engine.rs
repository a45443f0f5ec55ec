//! # Discovery Engine
//!
//! Facade wiring the ledger, throttle, scan recorder, stats, ratings and the
//! composite read model over one shared [`Store`].
//!
//! ## Architecture
//!
//! Every operation takes the caller's [`AccountContext`] and rejects it with
//! `SESSION_NOT_FOUND` when it carries no account. The engine holds no
//! per-account state in memory: the throttle and the ledger live in the
//! store, so several engines over one database stay consistent.
//!
//! Two call sites can commit discoveries for a trail:
//! - `process_location`, fed by continuous [`DeviceUpdate`]s, using each
//!   spot's own radii
//! - `create_scan_event`, the explicit rate-limited scan, using the trail's
//!   scan radii
//!
//! The trail's [`DiscoveryMode`] picks which is authoritative. Under
//! `Scan`, location updates still reveal clues but never commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{DiscoveryError, OptionExt, Result};
use crate::ledger::DiscoveryLedger;
use crate::location::LocationStream;
use crate::proximity::{match_spots, RadiusOverride};
use crate::rating::RatingAggregator;
use crate::scan::ScanEventRecorder;
use crate::state::{DiscoveryState, DiscoveryStateComposite};
use crate::stats::TrailStatsAggregator;
use crate::store::{SqliteStore, Store};
use crate::throttle::ScanThrottle;
use crate::{
    AccountContext, Clue, ClueSource, DeviceUpdate, Discovery, DiscoveryMode, GpsPoint,
    RatingSummary, ScanEvent, TrailStats,
};

/// Outcome of one continuous location update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    /// Discoveries created by this update; spots already in the ledger are
    /// never re-reported
    pub discoveries: Vec<Discovery>,
    pub clues: Vec<Clue>,
}

pub struct DiscoveryEngine {
    store: Arc<dyn Store>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ledger: DiscoveryLedger,
    scans: ScanEventRecorder,
    stats: Arc<TrailStatsAggregator>,
    ratings: RatingAggregator,
    state: DiscoveryStateComposite,
}

impl DiscoveryEngine {
    /// Engine with default configuration and the system clock.
    pub fn new(store: impl Store + 'static) -> Self {
        Self::build(Arc::new(store), EngineConfig::default(), Arc::new(SystemClock))
    }

    /// Engine with an explicit configuration and clock.
    pub fn with_config(
        store: Arc<dyn Store>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(store, config, clock))
    }

    fn build(store: Arc<dyn Store>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let ledger = DiscoveryLedger::new(store.clone());
        let throttle = ScanThrottle::new(store.clone(), clock.clone(), config.min_scan_interval_ms);
        let scans = ScanEventRecorder::new(
            store.clone(),
            ledger.clone(),
            throttle,
            clock.clone(),
            config.audit_throttled_scans,
        );

        let mut stats = TrailStatsAggregator::new(store.clone(), clock.clone());
        if let Some(ttl) = config.stats_cache_ttl_ms {
            stats = stats.with_cache(config.stats_cache_capacity, ttl);
        }
        let stats = Arc::new(stats);

        let state = DiscoveryStateComposite::new(
            store.clone(),
            ledger.clone(),
            stats.clone(),
            config.preview_precision_decimals,
        );

        Self {
            ratings: RatingAggregator::new(store.clone()),
            store,
            config,
            clock,
            ledger,
            scans,
            stats,
            state,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A fresh client-side location filter using this engine's settings.
    pub fn location_stream(&self) -> LocationStream {
        LocationStream::new(self.config.location.clone())
    }

    /// Match a smoothed device position against a trail.
    ///
    /// Under [`DiscoveryMode::Free`] discovery candidates are committed to
    /// the ledger and the newly created records returned. Under
    /// [`DiscoveryMode::Scan`] they are reported as clues instead.
    pub fn process_location(
        &self,
        ctx: &AccountContext,
        update: &DeviceUpdate,
        trail_id: &str,
    ) -> Result<LocationResult> {
        let account_id = ctx.require()?;
        if !update.location.is_usable() {
            return Err(DiscoveryError::validation(format!(
                "invalid device location ({}, {})",
                update.location.latitude, update.location.longitude
            )));
        }
        let trail = self
            .store
            .get_trail(trail_id)?
            .ok_or_not_found("trail", trail_id)?;

        let spots = self.store.list_trail_spots(trail_id)?;
        let discovered = self.ledger.discovered_spot_ids(account_id, trail_id)?;
        let candidates = match_spots(
            update,
            trail_id,
            &spots,
            &discovered,
            &RadiusOverride::none(),
            ClueSource::Proximity,
        );

        if trail.options.discovery_mode == DiscoveryMode::Scan {
            let order: HashMap<&str, usize> = spots
                .iter()
                .enumerate()
                .map(|(i, s)| (s.id.as_str(), i))
                .collect();
            let mut clues = candidates.clues;
            for spot in spots.iter().filter(|s| candidates.discoveries.contains(&s.id)) {
                clues.push(Clue {
                    spot_id: spot.id.clone(),
                    trail_id: trail_id.to_string(),
                    location: spot.location,
                    source: ClueSource::Proximity,
                });
            }
            clues.sort_by_key(|c| order.get(c.spot_id.as_str()).copied().unwrap_or(usize::MAX));
            debug!(
                "[Engine] {} on scan-gated {}: {} clues",
                account_id,
                trail_id,
                clues.len()
            );
            return Ok(LocationResult {
                discoveries: Vec::new(),
                clues,
            });
        }

        let now = self.clock.now_ms();
        let mut created = Vec::new();
        for spot_id in &candidates.discoveries {
            let outcome = self.ledger.insert(account_id, spot_id, trail_id, now)?;
            if outcome.is_new() {
                created.push(outcome.into_discovery());
            }
        }
        if !created.is_empty() {
            self.stats.invalidate_trail(trail_id);
        }

        Ok(LocationResult {
            discoveries: created,
            clues: candidates.clues,
        })
    }

    /// Run an explicit scan. Fails with `THROTTLED` inside the scan interval.
    pub fn create_scan_event(
        &self,
        ctx: &AccountContext,
        location: GpsPoint,
        trail_id: &str,
    ) -> Result<ScanEvent> {
        let account_id = ctx.require()?;
        let event = self.scans.create_scan(account_id, trail_id, location)?;
        if !event.discovered_spot_ids.is_empty() {
            self.stats.invalidate_trail(trail_id);
        }
        Ok(event)
    }

    /// Whether the caller may scan right now.
    pub fn can_scan(&self, ctx: &AccountContext) -> Result<bool> {
        let account_id = ctx.require()?;
        self.scans.throttle().can_scan(account_id)
    }

    /// Milliseconds until the caller may scan again; 0 if now.
    pub fn scan_retry_after_ms(&self, ctx: &AccountContext) -> Result<i64> {
        let account_id = ctx.require()?;
        self.scans.throttle().retry_after_ms(account_id)
    }

    pub fn list_scan_events(&self, ctx: &AccountContext, trail_id: &str) -> Result<Vec<ScanEvent>> {
        let account_id = ctx.require()?;
        self.scans.list_scan_events(account_id, trail_id)
    }

    pub fn list_discoveries(&self, ctx: &AccountContext, trail_id: &str) -> Result<Vec<Discovery>> {
        let account_id = ctx.require()?;
        self.ledger.list_by_account_and_trail(account_id, trail_id)
    }

    /// The caller's discovery of one spot, if it has one.
    pub fn get_discovery(&self, ctx: &AccountContext, spot_id: &str) -> Result<Option<Discovery>> {
        let account_id = ctx.require()?;
        self.ledger.get(account_id, spot_id)
    }

    pub fn get_discovery_trail_stats(
        &self,
        ctx: &AccountContext,
        trail_id: &str,
    ) -> Result<TrailStats> {
        let account_id = ctx.require()?;
        self.stats.get_stats(account_id, trail_id)
    }

    pub fn rate_entity(
        &self,
        ctx: &AccountContext,
        target_id: &str,
        value: i32,
    ) -> Result<RatingSummary> {
        let account_id = ctx.require()?;
        self.ratings.rate(target_id, account_id, value)
    }

    pub fn remove_rating(&self, ctx: &AccountContext, target_id: &str) -> Result<()> {
        let account_id = ctx.require()?;
        self.ratings.remove_rating(target_id, account_id)
    }

    pub fn get_rating_summary(&self, ctx: &AccountContext, target_id: &str) -> Result<RatingSummary> {
        let account_id = ctx.require()?;
        self.ratings.get_summary(target_id, Some(account_id))
    }

    pub fn list_discovered_preview_clues(
        &self,
        ctx: &AccountContext,
        trail_id: &str,
    ) -> Result<Vec<Clue>> {
        let account_id = ctx.require()?;
        self.state.list_preview_clues(account_id, trail_id)
    }

    pub fn get_discovery_state(&self, ctx: &AccountContext, trail_id: &str) -> Result<DiscoveryState> {
        let account_id = ctx.require()?;
        self.state.get_state(account_id, trail_id)
    }
}

// ============================================================================
// Global Singleton
// ============================================================================

/// Process-wide engine for embedding hosts that cannot hold a handle.
pub static ENGINE: Lazy<Mutex<Option<DiscoveryEngine>>> = Lazy::new(|| Mutex::new(None));

/// Open (or create) the database at `db_path` and install the global engine.
///
/// Returns false if the database could not be opened; any previously
/// installed engine is left in place in that case.
pub fn engine_init(db_path: &str) -> bool {
    crate::init_logging();
    info!("[Engine] Initializing with db: {}", db_path);

    match SqliteStore::new(db_path) {
        Ok(store) => {
            let engine = DiscoveryEngine::new(store);
            match ENGINE.lock() {
                Ok(mut guard) => {
                    *guard = Some(engine);
                    info!("[Engine] Initialized successfully");
                    true
                }
                Err(_) => false,
            }
        }
        Err(e) => {
            info!("[Engine] Failed to initialize: {:?}", e);
            false
        }
    }
}

/// Run `f` against the global engine, or return None if it is not initialized.
pub fn with_engine<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&DiscoveryEngine) -> R,
{
    let guard = ENGINE.lock().ok()?;
    guard.as_ref().map(f)
}

pub fn engine_is_initialized() -> bool {
    ENGINE.lock().map(|guard| guard.is_some()).unwrap_or(false)
}

/// Drop the global engine and close its database.
pub fn engine_clear() {
    if let Ok(mut guard) = ENGINE.lock() {
        *guard = None;
        info!("[Engine] Cleared");
    }
}
