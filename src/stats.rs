//! # Trail Statistics
//!
//! Per-account progress, rank, completion and timing on one trail, derived
//! entirely from the spot catalog and the discovery ledger on every read.
//!
//! ## Rank
//!
//! Every account with at least one discovery on the trail is ranked by
//! discovered count (descending). Ties go to the account whose latest
//! discovery is older, i.e. who reached that count first; account ID breaks
//! any remaining tie so the order is total. Accounts without discoveries
//! have rank 0.
//!
//! Reads racing a concurrent insert may reflect either state, but every
//! field stays in range: `discovered_spots <= total_spots` and
//! `progress_percentage` in `[0, 100]`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::clock::Clock;
use crate::error::{OptionExt, Result};
use crate::stats_cache::StatsCache;
use crate::store::Store;
use crate::{CompletionStatus, Discovery, TrailStats};

/// Per-account tally used for ranking.
#[derive(Debug, Clone, PartialEq)]
struct Tally {
    count: u32,
    last_discovered_at: i64,
}

/// Compute stats for `account_id` from the trail's spot count and every
/// account's discoveries on the trail.
pub fn compute_trail_stats(
    account_id: &str,
    trail_id: &str,
    total_spots: u32,
    trail_discoveries: &[Discovery],
) -> TrailStats {
    let mut tallies: HashMap<&str, Tally> = HashMap::new();
    for d in trail_discoveries {
        let tally = tallies.entry(d.account_id.as_str()).or_insert(Tally {
            count: 0,
            last_discovered_at: i64::MIN,
        });
        tally.count += 1;
        tally.last_discovered_at = tally.last_discovered_at.max(d.discovered_at);
    }

    let mut leaderboard: Vec<(&str, &Tally)> = tallies.iter().map(|(a, t)| (*a, t)).collect();
    leaderboard.sort_by(|(a_id, a), (b_id, b)| {
        b.count
            .cmp(&a.count)
            .then(a.last_discovered_at.cmp(&b.last_discovered_at))
            .then(a_id.cmp(b_id))
    });

    let rank = leaderboard
        .iter()
        .position(|(id, _)| *id == account_id)
        .map(|i| i as u32 + 1)
        .unwrap_or(0);

    let mut own: Vec<i64> = trail_discoveries
        .iter()
        .filter(|d| d.account_id == account_id)
        .map(|d| d.discovered_at)
        .collect();
    own.sort_unstable();

    let raw_discovered = own.len() as u32;
    if raw_discovered > total_spots {
        // Catalog shrank after discoveries were made
        debug!(
            "[Stats] {} has {} discoveries on {} with {} spots",
            account_id, raw_discovered, trail_id, total_spots
        );
    }
    let discovered_spots = raw_discovered.min(total_spots);

    let progress_percentage = if total_spots == 0 {
        0
    } else {
        (100.0 * discovered_spots as f64 / total_spots as f64).round() as u32
    };

    let completion_status = if discovered_spots == 0 {
        CompletionStatus::NotStarted
    } else if total_spots > 0 && discovered_spots == total_spots {
        CompletionStatus::Completed
    } else {
        CompletionStatus::InProgress
    };

    TrailStats {
        trail_id: trail_id.to_string(),
        account_id: account_id.to_string(),
        total_spots,
        discovered_spots,
        progress_percentage,
        completion_status,
        rank,
        total_discoverers: tallies.len() as u32,
        average_time_between_discoveries: average_gap_seconds(&own),
    }
}

/// Mean gap between consecutive timestamps (ms, sorted), in seconds.
fn average_gap_seconds(sorted_ms: &[i64]) -> Option<f64> {
    if sorted_ms.len() < 2 {
        return None;
    }
    let total: i64 = sorted_ms.windows(2).map(|w| w[1] - w[0]).sum();
    Some(total as f64 / (sorted_ms.len() - 1) as f64 / 1000.0)
}

/// Reads trail stats, optionally through a short-TTL cache.
pub struct TrailStatsAggregator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    cache: Option<Mutex<StatsCache>>,
}

impl TrailStatsAggregator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            cache: None,
        }
    }

    /// Enable caching with the given capacity and TTL.
    pub fn with_cache(mut self, capacity: usize, ttl_ms: i64) -> Self {
        self.cache = Some(Mutex::new(StatsCache::new(capacity, ttl_ms)));
        self
    }

    /// Stats for one account on one trail. Fails `NOT_FOUND` for unknown trails.
    pub fn get_stats(&self, account_id: &str, trail_id: &str) -> Result<TrailStats> {
        let now = self.clock.now_ms();
        let mut generation = 0;
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(stats) = cache.get(account_id, trail_id, now) {
                return Ok(stats);
            }
            generation = cache.generation(trail_id);
        }

        self.store
            .get_trail(trail_id)?
            .ok_or_not_found("trail", trail_id)?;
        let total_spots = self.store.count_trail_spots(trail_id)?;
        let discoveries = self.store.list_trail_discoveries(trail_id)?;
        let stats = compute_trail_stats(account_id, trail_id, total_spots, &discoveries);

        if let Some(cache) = &self.cache {
            let cached = cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(stats.clone(), generation, now);
            if !cached {
                debug!("[Stats] {} invalidated while computing, not caching", trail_id);
            }
        }
        Ok(stats)
    }

    /// Drop cached stats for a trail after its ledger changed.
    pub fn invalidate_trail(&self, trail_id: &str) {
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .invalidate_trail(trail_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::DiscoveryLedger;
    use crate::ledger::InsertOutcome;
    use crate::{GpsPoint, Rating, ScanEvent, SqliteStore, Spot, Trail};

    fn d(account: &str, spot: &str, at_secs: i64) -> Discovery {
        Discovery {
            id: format!("{}-{}", account, spot),
            account_id: account.to_string(),
            spot_id: spot.to_string(),
            trail_id: "t".to_string(),
            discovered_at: at_secs * 1000,
        }
    }

    #[test]
    fn test_not_started() {
        let stats = compute_trail_stats("me", "t", 5, &[d("other", "a", 1)]);
        assert_eq!(stats.discovered_spots, 0);
        assert_eq!(stats.progress_percentage, 0);
        assert_eq!(stats.completion_status, CompletionStatus::NotStarted);
        assert_eq!(stats.rank, 0);
        assert_eq!(stats.total_discoverers, 1);
        assert!(stats.average_time_between_discoveries.is_none());
    }

    #[test]
    fn test_progress_rounding_and_completion() {
        let one = compute_trail_stats("me", "t", 3, &[d("me", "a", 1)]);
        assert_eq!(one.progress_percentage, 33);
        assert_eq!(one.completion_status, CompletionStatus::InProgress);

        let two = compute_trail_stats("me", "t", 3, &[d("me", "a", 1), d("me", "b", 2)]);
        assert_eq!(two.progress_percentage, 67);

        let all = compute_trail_stats(
            "me",
            "t",
            3,
            &[d("me", "a", 1), d("me", "b", 2), d("me", "c", 3)],
        );
        assert_eq!(all.progress_percentage, 100);
        assert_eq!(all.completion_status, CompletionStatus::Completed);
    }

    #[test]
    fn test_empty_trail() {
        let stats = compute_trail_stats("me", "t", 0, &[]);
        assert_eq!(stats.total_spots, 0);
        assert_eq!(stats.progress_percentage, 0);
        assert_eq!(stats.completion_status, CompletionStatus::NotStarted);
    }

    #[test]
    fn test_discovered_clamped_to_total() {
        let stats = compute_trail_stats("me", "t", 1, &[d("me", "a", 1), d("me", "gone", 2)]);
        assert_eq!(stats.discovered_spots, 1);
        assert_eq!(stats.progress_percentage, 100);
        assert_eq!(stats.completion_status, CompletionStatus::Completed);
    }

    #[test]
    fn test_rank_by_count_then_earliest_finish() {
        let discoveries = vec![
            d("alice", "a", 10),
            d("alice", "b", 50),
            d("bob", "a", 5),
            d("bob", "b", 40),
            d("carol", "a", 1),
            d("carol", "b", 2),
            d("carol", "c", 90),
            d("dave", "a", 3),
        ];
        let rank = |who| compute_trail_stats(who, "t", 4, &discoveries).rank;
        assert_eq!(rank("carol"), 1);
        // bob reached 2 discoveries at 40s, alice at 50s
        assert_eq!(rank("bob"), 2);
        assert_eq!(rank("alice"), 3);
        assert_eq!(rank("dave"), 4);
        assert_eq!(rank("erin"), 0);
        assert_eq!(compute_trail_stats("carol", "t", 4, &discoveries).total_discoverers, 4);
    }

    #[test]
    fn test_average_time_between_discoveries() {
        let discoveries = vec![d("me", "c", 130), d("me", "a", 100), d("me", "b", 110)];
        let stats = compute_trail_stats("me", "t", 5, &discoveries);
        // gaps 10s and 20s
        assert_eq!(stats.average_time_between_discoveries, Some(15.0));
    }

    fn seeded_aggregator(cache: bool) -> (TrailStatsAggregator, DiscoveryLedger, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.put_trail(&Trail::new("t")).unwrap();
        for (i, id) in ["a", "b"].iter().enumerate() {
            store
                .put_spot(&Spot::new(*id, GpsPoint::new(47.0 + i as f64, 8.0), 10.0, 50.0))
                .unwrap();
            store.link_spot("t", id, i as i64).unwrap();
        }
        let clock = Arc::new(ManualClock::new(0));
        let dyn_store: Arc<dyn Store> = store;
        let mut aggregator = TrailStatsAggregator::new(dyn_store.clone(), clock.clone());
        if cache {
            aggregator = aggregator.with_cache(16, 1_000);
        }
        (aggregator, DiscoveryLedger::new(dyn_store), clock)
    }

    #[test]
    fn test_aggregator_reads_ledger() {
        let (aggregator, ledger, _) = seeded_aggregator(false);
        ledger.insert("me", "a", "t", 1_000).unwrap();
        let stats = aggregator.get_stats("me", "t").unwrap();
        assert_eq!(stats.total_spots, 2);
        assert_eq!(stats.discovered_spots, 1);
        assert_eq!(stats.progress_percentage, 50);
        assert_eq!(stats.rank, 1);

        let err = aggregator.get_stats("me", "missing").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_cache_serves_until_invalidated_or_expired() {
        let (aggregator, ledger, clock) = seeded_aggregator(true);
        assert_eq!(aggregator.get_stats("me", "t").unwrap().discovered_spots, 0);

        // Written behind the cache's back: stale until expiry
        ledger.insert("me", "a", "t", 1).unwrap();
        assert_eq!(aggregator.get_stats("me", "t").unwrap().discovered_spots, 0);
        clock.advance(1_000);
        assert_eq!(aggregator.get_stats("me", "t").unwrap().discovered_spots, 1);

        ledger.insert("me", "b", "t", 2).unwrap();
        aggregator.invalidate_trail("t");
        assert_eq!(aggregator.get_stats("me", "t").unwrap().discovered_spots, 2);
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// Store that runs a hook right after the first trail-discovery read,
    /// simulating a discovery committed while stats are being computed.
    struct InterleavingStore {
        inner: Arc<SqliteStore>,
        after_first_read: Mutex<Option<Hook>>,
    }

    impl Store for InterleavingStore {
        fn get_trail(&self, trail_id: &str) -> Result<Option<Trail>> {
            self.inner.get_trail(trail_id)
        }
        fn list_trail_spots(&self, trail_id: &str) -> Result<Vec<Spot>> {
            self.inner.list_trail_spots(trail_id)
        }
        fn count_trail_spots(&self, trail_id: &str) -> Result<u32> {
            self.inner.count_trail_spots(trail_id)
        }
        fn insert_discovery_if_absent(&self, discovery: &Discovery) -> Result<InsertOutcome> {
            self.inner.insert_discovery_if_absent(discovery)
        }
        fn get_discovery(&self, account_id: &str, spot_id: &str) -> Result<Option<Discovery>> {
            self.inner.get_discovery(account_id, spot_id)
        }
        fn list_discoveries(&self, account_id: &str, trail_id: &str) -> Result<Vec<Discovery>> {
            self.inner.list_discoveries(account_id, trail_id)
        }
        fn list_trail_discoveries(&self, trail_id: &str) -> Result<Vec<Discovery>> {
            let snapshot = self.inner.list_trail_discoveries(trail_id)?;
            let hook = self.after_first_read.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            Ok(snapshot)
        }
        fn last_scan_at(&self, account_id: &str) -> Result<Option<i64>> {
            self.inner.last_scan_at(account_id)
        }
        fn try_claim_scan(&self, account_id: &str, now_ms: i64, min_interval_ms: i64) -> Result<bool> {
            self.inner.try_claim_scan(account_id, now_ms, min_interval_ms)
        }
        fn insert_scan_event(&self, event: &ScanEvent) -> Result<()> {
            self.inner.insert_scan_event(event)
        }
        fn list_scan_events(&self, account_id: &str, trail_id: &str) -> Result<Vec<ScanEvent>> {
            self.inner.list_scan_events(account_id, trail_id)
        }
        fn upsert_rating(&self, rating: &Rating) -> Result<()> {
            self.inner.upsert_rating(rating)
        }
        fn delete_rating(&self, target_id: &str, account_id: &str) -> Result<bool> {
            self.inner.delete_rating(target_id, account_id)
        }
        fn list_ratings(&self, target_id: &str) -> Result<Vec<Rating>> {
            self.inner.list_ratings(target_id)
        }
    }

    #[test]
    fn test_insert_during_computation_is_not_cached() {
        let inner = Arc::new(SqliteStore::in_memory().unwrap());
        inner.put_trail(&Trail::new("t")).unwrap();
        inner
            .put_spot(&Spot::new("a", GpsPoint::new(47.0, 8.0), 10.0, 50.0))
            .unwrap();
        inner.link_spot("t", "a", 0).unwrap();

        let store = Arc::new(InterleavingStore {
            inner: inner.clone(),
            after_first_read: Mutex::new(None),
        });
        let clock = Arc::new(ManualClock::new(0));
        let aggregator = Arc::new(
            TrailStatsAggregator::new(store.clone(), clock.clone()).with_cache(16, 60_000),
        );

        let ledger = DiscoveryLedger::new(inner);
        let racing = aggregator.clone();
        *store.after_first_read.lock().unwrap() = Some(Box::new(move || {
            ledger.insert("me", "a", "t", 5).unwrap();
            racing.invalidate_trail("t");
        }));

        // Computed from the pre-insert snapshot
        assert_eq!(aggregator.get_stats("me", "t").unwrap().discovered_spots, 0);

        clock.advance(10);
        let stats = aggregator.get_stats("me", "t").unwrap();
        assert_eq!(stats.discovered_spots, 1);
        assert_eq!(stats.completion_status, CompletionStatus::Completed);
    }
}
