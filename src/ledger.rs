//! Append-only discovery ledger.
//!
//! A discovery is created at most once per `(account, spot)` and never
//! updated or deleted. Both the continuous-location path and the scan path
//! write here and may race for the same spot; the store's insert-if-absent
//! settles the race and the loser receives the winner's record.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};

use crate::error::{DiscoveryError, Result};
use crate::store::Store;
use crate::{new_id, Discovery};

/// Result of a ledger insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// A new discovery was recorded
    Created(Discovery),
    /// The account had already discovered this spot; nothing was written
    Existing(Discovery),
}

impl InsertOutcome {
    pub fn discovery(&self) -> &Discovery {
        match self {
            InsertOutcome::Created(d) | InsertOutcome::Existing(d) => d,
        }
    }

    pub fn into_discovery(self) -> Discovery {
        match self {
            InsertOutcome::Created(d) | InsertOutcome::Existing(d) => d,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }

    /// Internal classification of a duplicate insert.
    pub fn as_error(&self) -> Option<DiscoveryError> {
        match self {
            InsertOutcome::Created(_) => None,
            InsertOutcome::Existing(d) => Some(DiscoveryError::AlreadyDiscovered {
                account_id: d.account_id.clone(),
                spot_id: d.spot_id.clone(),
            }),
        }
    }
}

/// Authoritative discovery record.
#[derive(Clone)]
pub struct DiscoveryLedger {
    store: Arc<dyn Store>,
}

impl DiscoveryLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a discovery, or return the existing one for this account and spot.
    pub fn insert(
        &self,
        account_id: &str,
        spot_id: &str,
        trail_id: &str,
        discovered_at: i64,
    ) -> Result<InsertOutcome> {
        let candidate = Discovery {
            id: new_id(),
            account_id: account_id.to_string(),
            spot_id: spot_id.to_string(),
            trail_id: trail_id.to_string(),
            discovered_at,
        };

        let outcome = self.store.insert_discovery_if_absent(&candidate)?;
        match &outcome {
            InsertOutcome::Created(d) => info!(
                "[Ledger] {} discovered spot {} on trail {}",
                d.account_id, d.spot_id, d.trail_id
            ),
            InsertOutcome::Existing(_) => {
                if let Some(err) = outcome.as_error() {
                    debug!("[Ledger] {}", err);
                }
            }
        }
        Ok(outcome)
    }

    /// An account's discoveries on a trail, ordered by `discovered_at` ascending.
    pub fn list_by_account_and_trail(
        &self,
        account_id: &str,
        trail_id: &str,
    ) -> Result<Vec<Discovery>> {
        self.store.list_discoveries(account_id, trail_id)
    }

    /// Spot IDs the account has discovered on a trail.
    pub fn discovered_spot_ids(&self, account_id: &str, trail_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .list_by_account_and_trail(account_id, trail_id)?
            .into_iter()
            .map(|d| d.spot_id)
            .collect())
    }

    pub fn get(&self, account_id: &str, spot_id: &str) -> Result<Option<Discovery>> {
        self.store.get_discovery(account_id, spot_id)
    }
}
