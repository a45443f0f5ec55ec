//! One-to-five ratings for any target (spot or trail), one per account.

use std::sync::Arc;

use log::debug;

use crate::error::{DiscoveryError, Result};
use crate::store::Store;
use crate::{Rating, RatingSummary};

pub const MIN_RATING: i32 = 1;
pub const MAX_RATING: i32 = 5;

#[derive(Clone)]
pub struct RatingAggregator {
    store: Arc<dyn Store>,
}

impl RatingAggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Set the account's rating for a target, replacing any previous value.
    pub fn rate(&self, target_id: &str, account_id: &str, value: i32) -> Result<RatingSummary> {
        if !(MIN_RATING..=MAX_RATING).contains(&value) {
            return Err(DiscoveryError::validation(format!(
                "rating must be between {} and {}, got {}",
                MIN_RATING, MAX_RATING, value
            )));
        }
        self.store.upsert_rating(&Rating {
            target_id: target_id.to_string(),
            account_id: account_id.to_string(),
            value: value as u8,
        })?;
        debug!("[Rating] {} rated {} = {}", account_id, target_id, value);
        self.get_summary(target_id, Some(account_id))
    }

    /// Delete the account's rating if it has one.
    pub fn remove_rating(&self, target_id: &str, account_id: &str) -> Result<()> {
        if self.store.delete_rating(target_id, account_id)? {
            debug!("[Rating] {} removed rating on {}", account_id, target_id);
        }
        Ok(())
    }

    pub fn get_summary(&self, target_id: &str, account_id: Option<&str>) -> Result<RatingSummary> {
        let ratings = self.store.list_ratings(target_id)?;
        Ok(summarize(target_id, &ratings, account_id))
    }
}

/// Mean rounded to one decimal plus the caller's own value.
pub fn summarize(target_id: &str, ratings: &[Rating], account_id: Option<&str>) -> RatingSummary {
    let count = ratings.len() as u32;
    let average = if ratings.is_empty() {
        0.0
    } else {
        let sum: u32 = ratings.iter().map(|r| r.value as u32).sum();
        round1(sum as f64 / count as f64)
    };
    let user_rating = account_id.and_then(|account| {
        ratings
            .iter()
            .find(|r| r.account_id == account)
            .map(|r| r.value)
    });

    RatingSummary {
        target_id: target_id.to_string(),
        average,
        count,
        user_rating,
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
