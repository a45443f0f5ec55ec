//! Single read model combining the ledger, preview clues and stats.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{OptionExt, Result};
use crate::geo_utils::round_coordinate;
use crate::ledger::DiscoveryLedger;
use crate::stats::TrailStatsAggregator;
use crate::store::Store;
use crate::{Clue, Discovery, GpsPoint, TrailStats};

/// Everything a client needs to render one account's view of a trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryState {
    pub trail_id: String,
    /// Ordered by `discovered_at` ascending
    pub discoveries: Vec<Discovery>,
    pub preview_clues: Vec<Clue>,
    pub stats: TrailStats,
}

#[derive(Clone)]
pub struct DiscoveryStateComposite {
    store: Arc<dyn Store>,
    ledger: DiscoveryLedger,
    stats: Arc<TrailStatsAggregator>,
    precision_decimals: u32,
}

impl DiscoveryStateComposite {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: DiscoveryLedger,
        stats: Arc<TrailStatsAggregator>,
        precision_decimals: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            stats,
            precision_decimals,
        }
    }

    /// Clues the account's scans have revealed for spots it has not yet
    /// discovered, one per spot in trail order.
    ///
    /// Each spot contributes its most recent scan clue. Coordinates are
    /// rounded so the preview hints at an area rather than the exact spot.
    pub fn list_preview_clues(&self, account_id: &str, trail_id: &str) -> Result<Vec<Clue>> {
        self.store
            .get_trail(trail_id)?
            .ok_or_not_found("trail", trail_id)?;

        let discovered = self.ledger.discovered_spot_ids(account_id, trail_id)?;
        let order: HashMap<String, usize> = self
            .store
            .list_trail_spots(trail_id)?
            .into_iter()
            .enumerate()
            .map(|(i, spot)| (spot.id, i))
            .collect();

        // Events arrive newest first, so the first clue seen per spot wins
        let mut latest: HashMap<String, Clue> = HashMap::new();
        for event in self.store.list_scan_events(account_id, trail_id)? {
            for clue in event.clues {
                if discovered.contains(&clue.spot_id) || !order.contains_key(&clue.spot_id) {
                    continue;
                }
                latest.entry(clue.spot_id.clone()).or_insert(clue);
            }
        }

        let mut previews: Vec<Clue> = latest
            .into_values()
            .map(|clue| self.sanitize(clue))
            .collect();
        previews.sort_by_key(|clue| order.get(&clue.spot_id).copied().unwrap_or(usize::MAX));
        Ok(previews)
    }

    pub fn get_state(&self, account_id: &str, trail_id: &str) -> Result<DiscoveryState> {
        let stats = self.stats.get_stats(account_id, trail_id)?;
        let discoveries = self.ledger.list_by_account_and_trail(account_id, trail_id)?;
        let preview_clues = self.list_preview_clues(account_id, trail_id)?;
        Ok(DiscoveryState {
            trail_id: trail_id.to_string(),
            discoveries,
            preview_clues,
            stats,
        })
    }

    fn sanitize(&self, clue: Clue) -> Clue {
        Clue {
            location: GpsPoint::new(
                round_coordinate(clue.location.latitude, self.precision_decimals),
                round_coordinate(clue.location.longitude, self.precision_decimals),
            ),
            ..clue
        }
    }
}
