//! # Location Stream
//!
//! Turns the raw device fix stream into meaningful [`DeviceUpdate`]s.
//!
//! ## Pipeline
//!
//! 1. **Reject** fixes at (0, 0) or with non-finite values (GPS errors)
//! 2. **Smooth** the heading with a wraparound-aware exponential moving average
//! 3. **Quantize** the smoothed heading to the configured step
//! 4. **Emit** only when the device moved far enough or turned far enough
//!    relative to the last emitted update
//!
//! Sensor callbacks arrive serially; all state is mutated synchronously in
//! [`LocationStream::push`] and listeners are invoked in registration order
//! before `push` returns.

use log::{debug, warn};

use crate::config::LocationConfig;
use crate::geo_utils::{haversine_distance, heading_delta, normalize_heading, quantize_heading};
use crate::{DeviceUpdate, RawFix};

/// Token returned by [`LocationStream::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Listener = Box<dyn FnMut(&DeviceUpdate) + Send>;

/// Filter and smoother over raw device fixes.
pub struct LocationStream {
    config: LocationConfig,
    last_emitted: Option<DeviceUpdate>,
    smoothed_heading: Option<f64>,
    listeners: Vec<(Subscription, Listener)>,
    next_subscription: u64,
    rejected_fixes: u64,
}

impl LocationStream {
    pub fn new(config: LocationConfig) -> Self {
        Self {
            config,
            last_emitted: None,
            smoothed_heading: None,
            listeners: Vec::new(),
            next_subscription: 0,
            rejected_fixes: 0,
        }
    }

    /// Register a listener for emitted updates.
    pub fn subscribe<F>(&mut self, listener: F) -> Subscription
    where
        F: FnMut(&DeviceUpdate) + Send + 'static,
    {
        let token = Subscription(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((token, Box::new(listener)));
        token
    }

    /// Remove a listener. Returns false if the token was unknown.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(token, _)| *token != subscription);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Feed one raw fix. Returns the update if it was significant enough to emit.
    pub fn push(&mut self, fix: RawFix) -> Option<DeviceUpdate> {
        if !fix.location.is_usable() || !fix.heading_raw.is_finite() {
            self.rejected_fixes += 1;
            warn!(
                "[LocationStream] Rejected GPS fix at ({}, {}) heading {} t={}",
                fix.location.latitude, fix.location.longitude, fix.heading_raw, fix.timestamp
            );
            return None;
        }

        let smoothed = self.smooth_heading(fix.heading_raw);
        let update = DeviceUpdate::new(
            fix.location,
            quantize_heading(smoothed, self.config.heading_quantum_deg),
        );

        if !self.is_significant(&update) {
            return None;
        }

        debug!(
            "[LocationStream] Emitting ({:.6}, {:.6}) heading {}",
            update.location.latitude, update.location.longitude, update.heading
        );
        self.last_emitted = Some(update);
        for (_, listener) in self.listeners.iter_mut() {
            listener(&update);
        }
        Some(update)
    }

    /// Blend a raw heading into the running average along the shortest arc.
    fn smooth_heading(&mut self, raw: f64) -> f64 {
        let raw = normalize_heading(raw);
        let next = match self.smoothed_heading {
            None => raw,
            Some(prev) => {
                let delta = heading_delta(prev, raw);
                normalize_heading(prev + self.config.smoothing_alpha * delta)
            }
        };
        self.smoothed_heading = Some(next);
        next
    }

    fn is_significant(&self, update: &DeviceUpdate) -> bool {
        let Some(last) = &self.last_emitted else {
            return true;
        };
        let moved = haversine_distance(&last.location, &update.location);
        let turned = heading_delta(last.heading, update.heading).abs();
        moved >= self.config.min_distance_m || turned >= self.config.min_heading_change_deg
    }

    pub fn last_emitted(&self) -> Option<&DeviceUpdate> {
        self.last_emitted.as_ref()
    }

    /// Current unquantized smoothed heading.
    pub fn smoothed_heading(&self) -> Option<f64> {
        self.smoothed_heading
    }

    pub fn rejected_fixes(&self) -> u64 {
        self.rejected_fixes
    }

    /// Forget filter state; listeners stay registered.
    pub fn reset(&mut self) {
        self.last_emitted = None;
        self.smoothed_heading = None;
    }
}

impl Default for LocationStream {
    fn default() -> Self {
        Self::new(LocationConfig::default())
    }
}
