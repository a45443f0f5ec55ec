//! # Scan Events
//!
//! Orchestrates the explicit "scan" action:
//!
//! 1. Validate the position and resolve the trail
//! 2. Claim the account's scan slot (throttle)
//! 3. Match the trail's undiscovered spots with the trail's scan radii
//! 4. Commit each discovery candidate to the ledger (idempotent)
//! 5. Persist a [`ScanEvent`] snapshot of what was found
//!
//! Throttled attempts fail with `THROTTLED`; when auditing is enabled an
//! unsuccessful event is still written for them.

use std::sync::Arc;

use log::info;

use crate::clock::Clock;
use crate::error::{DiscoveryError, OptionExt, Result};
use crate::ledger::DiscoveryLedger;
use crate::proximity::{match_spots, RadiusOverride};
use crate::store::Store;
use crate::throttle::ScanThrottle;
use crate::{new_id, ClueSource, DeviceUpdate, GpsPoint, ScanEvent};

/// Executes and records scans.
#[derive(Clone)]
pub struct ScanEventRecorder {
    store: Arc<dyn Store>,
    ledger: DiscoveryLedger,
    throttle: ScanThrottle,
    clock: Arc<dyn Clock>,
    audit_throttled: bool,
}

impl ScanEventRecorder {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: DiscoveryLedger,
        throttle: ScanThrottle,
        clock: Arc<dyn Clock>,
        audit_throttled: bool,
    ) -> Self {
        Self {
            store,
            ledger,
            throttle,
            clock,
            audit_throttled,
        }
    }

    pub fn throttle(&self) -> &ScanThrottle {
        &self.throttle
    }

    /// Run one scan for `account_id` at `location` on `trail_id`.
    pub fn create_scan(
        &self,
        account_id: &str,
        trail_id: &str,
        location: GpsPoint,
    ) -> Result<ScanEvent> {
        if !location.is_usable() {
            return Err(DiscoveryError::validation(format!(
                "invalid scan location ({}, {})",
                location.latitude, location.longitude
            )));
        }
        let trail = self
            .store
            .get_trail(trail_id)?
            .ok_or_not_found("trail", trail_id)?;

        let scanned_at = match self.throttle.acquire(account_id) {
            Ok(at) => at,
            Err(err) => {
                if self.audit_throttled && matches!(err, DiscoveryError::Throttled { .. }) {
                    self.store.insert_scan_event(&ScanEvent {
                        id: new_id(),
                        account_id: account_id.to_string(),
                        trail_id: trail_id.to_string(),
                        scanned_at: self.clock.now_ms(),
                        radius_used: trail.options.scanner_radius,
                        successful: false,
                        clues: Vec::new(),
                        discovered_spot_ids: Vec::new(),
                        location,
                    })?;
                }
                return Err(err);
            }
        };

        let spots = self.store.list_trail_spots(trail_id)?;
        let discovered = self.ledger.discovered_spot_ids(account_id, trail_id)?;
        let candidates = match_spots(
            &DeviceUpdate::new(location, 0.0),
            trail_id,
            &spots,
            &discovered,
            &RadiusOverride::for_scan(&trail.options),
            ClueSource::ScanEvent,
        );

        let mut discovered_spot_ids = Vec::new();
        for spot_id in &candidates.discoveries {
            let outcome = self
                .ledger
                .insert(account_id, spot_id, trail_id, scanned_at)?;
            if outcome.is_new() {
                discovered_spot_ids.push(spot_id.clone());
            }
        }

        let event = ScanEvent {
            id: new_id(),
            account_id: account_id.to_string(),
            trail_id: trail_id.to_string(),
            scanned_at,
            radius_used: trail.options.scanner_radius,
            successful: !candidates.is_empty(),
            clues: candidates.clues,
            discovered_spot_ids,
            location,
        };
        self.store.insert_scan_event(&event)?;

        info!(
            "[Scan] {} on {}: {} clues, {} new discoveries",
            account_id,
            trail_id,
            event.clues.len(),
            event.discovered_spot_ids.len()
        );
        Ok(event)
    }

    /// An account's scan history on a trail, newest first.
    pub fn list_scan_events(&self, account_id: &str, trail_id: &str) -> Result<Vec<ScanEvent>> {
        self.store.list_scan_events(account_id, trail_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo_utils::haversine_distance;
    use crate::{SqliteStore, Spot, Trail};

    const LAT: f64 = 47.3769;
    const LNG: f64 = 8.5417;

    fn north(meters: f64) -> GpsPoint {
        let base = GpsPoint::new(LAT, LNG);
        let per_degree = haversine_distance(&base, &GpsPoint::new(LAT + 0.01, LNG)) / 0.01;
        GpsPoint::new(LAT + meters / per_degree, LNG)
    }

    fn recorder(audit: bool) -> (ScanEventRecorder, Arc<ManualClock>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.put_trail(&Trail::new("t")).unwrap();
        store.put_spot(&Spot::new("a", north(0.0), 10.0, 50.0)).unwrap();
        store.put_spot(&Spot::new("b", north(100.0), 10.0, 50.0)).unwrap();
        store.link_spot("t", "a", 0).unwrap();
        store.link_spot("t", "b", 1).unwrap();

        let clock = Arc::new(ManualClock::new(50_000));
        let dyn_store: Arc<dyn Store> = store.clone();
        let ledger = DiscoveryLedger::new(dyn_store.clone());
        let throttle = ScanThrottle::new(dyn_store.clone(), clock.clone(), 5_000);
        (
            ScanEventRecorder::new(dyn_store, ledger, throttle, clock.clone(), audit),
            clock,
            store,
        )
    }

    #[test]
    fn test_scan_discovers_and_clues() {
        let (recorder, _, _) = recorder(false);
        let event = recorder.create_scan("acct", "t", north(3.0)).unwrap();
        assert!(event.successful);
        assert_eq!(event.discovered_spot_ids, vec!["a".to_string()]);
        // b is 97 m away: beyond its own 50 m clue radius, inside the 150 m scanner radius
        assert_eq!(event.clues.len(), 1);
        assert_eq!(event.clues[0].spot_id, "b");
        assert_eq!(event.radius_used, 150.0);
        assert_eq!(event.scanned_at, 50_000);
    }

    #[test]
    fn test_scan_is_throttled() {
        let (recorder, clock, _) = recorder(false);
        recorder.create_scan("acct", "t", north(500.0)).unwrap();
        clock.advance(1_000);
        let err = recorder.create_scan("acct", "t", north(500.0)).unwrap_err();
        assert_eq!(err.code(), "THROTTLED");
        assert_eq!(recorder.list_scan_events("acct", "t").unwrap().len(), 1);

        clock.advance(4_000);
        assert!(recorder.create_scan("acct", "t", north(500.0)).is_ok());
    }

    #[test]
    fn test_throttled_attempt_audited_when_enabled() {
        let (recorder, clock, _) = recorder(true);
        recorder.create_scan("acct", "t", north(3.0)).unwrap();
        clock.advance(10);
        assert!(recorder.create_scan("acct", "t", north(3.0)).is_err());

        let events = recorder.list_scan_events("acct", "t").unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].successful);
        assert!(events[0].clues.is_empty());
        assert!(events[1].successful);
    }

    #[test]
    fn test_unsuccessful_scan_recorded() {
        let (recorder, _, _) = recorder(false);
        let event = recorder.create_scan("acct", "t", north(1_000.0)).unwrap();
        assert!(!event.successful);
        assert!(event.clues.is_empty());
        assert_eq!(recorder.list_scan_events("acct", "t").unwrap(), vec![event]);
    }

    #[test]
    fn test_rescan_over_discovered_spot() {
        let (recorder, clock, _) = recorder(false);
        recorder.create_scan("acct", "t", north(0.0)).unwrap();
        clock.advance(5_000);
        let again = recorder.create_scan("acct", "t", north(0.0)).unwrap();
        assert!(again.discovered_spot_ids.is_empty());
        // b is still clued by the wide scanner radius
        assert_eq!(again.clues.len(), 1);
    }

    #[test]
    fn test_unknown_trail_and_bad_location() {
        let (recorder, _, store) = recorder(false);
        let err = recorder.create_scan("acct", "nope", north(0.0)).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let err = recorder
            .create_scan("acct", "t", GpsPoint::new(0.0, 0.0))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        // Neither failure consumed the throttle slot
        assert!(store.last_scan_at("acct").unwrap().is_none());
    }
}
