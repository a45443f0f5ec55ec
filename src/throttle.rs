//! Per-account scan rate limiting.
//!
//! `last_scan_at` lives in the shared store, not in process memory, so
//! every engine instance pointed at the same database agrees on it. The
//! check and the update are one conditional upsert: two near-simultaneous
//! scans by one account cannot both pass.

use std::sync::Arc;

use log::{debug, warn};

use crate::clock::Clock;
use crate::error::{DiscoveryError, Result};
use crate::store::Store;

/// Gate for the explicit scan action.
#[derive(Clone)]
pub struct ScanThrottle {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    min_interval_ms: i64,
}

impl ScanThrottle {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, min_interval_ms: i64) -> Self {
        Self {
            store,
            clock,
            min_interval_ms,
        }
    }

    pub fn min_interval_ms(&self) -> i64 {
        self.min_interval_ms
    }

    /// Milliseconds until the account may scan again; 0 if it may scan now.
    pub fn retry_after_ms(&self, account_id: &str) -> Result<i64> {
        let Some(last) = self.store.last_scan_at(account_id)? else {
            return Ok(0);
        };
        let elapsed = self.clock.now_ms() - last;
        Ok((self.min_interval_ms - elapsed).max(0))
    }

    /// Advisory check; does not reserve the slot.
    pub fn can_scan(&self, account_id: &str) -> Result<bool> {
        Ok(self.retry_after_ms(account_id)? == 0)
    }

    /// Claim the scan slot for `account_id`, returning the claim timestamp.
    ///
    /// Fails with [`DiscoveryError::Throttled`] when the interval has not
    /// elapsed; `last_scan_at` is left untouched in that case.
    pub fn acquire(&self, account_id: &str) -> Result<i64> {
        let now = self.clock.now_ms();
        if self
            .store
            .try_claim_scan(account_id, now, self.min_interval_ms)?
        {
            debug!("[ScanThrottle] {} claimed scan slot at {}", account_id, now);
            return Ok(now);
        }

        let retry_after_ms = self.retry_after_ms(account_id)?;
        warn!(
            "[ScanThrottle] {} throttled, retry in {}ms",
            account_id, retry_after_ms
        );
        Err(DiscoveryError::Throttled {
            account_id: account_id.to_string(),
            retry_after_ms,
        })
    }
}
