//! # Stats Cache
//!
//! Short-TTL LRU cache of computed [`TrailStats`], keyed by
//! `(account_id, trail_id)`. Never the source of truth: entries expire after
//! the TTL and a trail's entries are dropped whenever a new discovery lands
//! on it (a new discovery can change every discoverer's rank).
//!
//! Each trail carries a generation that [`StatsCache::invalidate_trail`]
//! bumps. Readers capture it before computing and [`StatsCache::insert`]
//! refuses results computed under an older generation, so stats read before
//! a concurrent insert are never cached after its invalidation.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::TrailStats;

type CacheKey = (String, String);

#[derive(Debug)]
struct CacheEntry {
    stats: TrailStats,
    stored_at: i64,
}

/// LRU cache with per-entry expiry. A capacity of zero disables it.
#[derive(Debug)]
pub struct StatsCache {
    ttl_ms: i64,
    entries: Option<LruCache<CacheKey, CacheEntry>>,
    generations: HashMap<String, u64>,
}

impl StatsCache {
    pub fn new(capacity: usize, ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            generations: HashMap::new(),
        }
    }

    /// Current generation of a trail; pass it back to [`StatsCache::insert`].
    pub fn generation(&self, trail_id: &str) -> u64 {
        self.generations.get(trail_id).copied().unwrap_or(0)
    }

    /// Fresh cached stats, or None if absent or expired at `now_ms`.
    pub fn get(&mut self, account_id: &str, trail_id: &str, now_ms: i64) -> Option<TrailStats> {
        let entries = self.entries.as_mut()?;
        let key = (account_id.to_string(), trail_id.to_string());
        let stored_at = entries.get(&key)?.stored_at;
        if now_ms - stored_at >= self.ttl_ms || now_ms < stored_at {
            entries.pop(&key);
            return None;
        }
        entries.peek(&key).map(|entry| entry.stats.clone())
    }

    /// Store stats computed at `now_ms` under `generation`.
    ///
    /// Returns false, storing nothing, if the trail was invalidated since
    /// `generation` was read.
    pub fn insert(&mut self, stats: TrailStats, generation: u64, now_ms: i64) -> bool {
        if self.generation(&stats.trail_id) != generation {
            return false;
        }
        let Some(entries) = self.entries.as_mut() else {
            return false;
        };
        entries.put(
            (stats.account_id.clone(), stats.trail_id.clone()),
            CacheEntry {
                stats,
                stored_at: now_ms,
            },
        );
        true
    }

    /// Drop every cached entry for a trail and advance its generation.
    pub fn invalidate_trail(&mut self, trail_id: &str) {
        *self.generations.entry(trail_id.to_string()).or_insert(0) += 1;
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|((_, trail), _)| trail == trail_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
