//! # Proximity Matching
//!
//! Maps a device position onto a trail's spot set. Each undiscovered spot
//! falls into exactly one band:
//!
//! - `d <= discovery radius` → discovery candidate
//! - `discovery radius < d <= clue radius` → clue candidate
//! - otherwise ignored
//!
//! [`match_spots`] is pure: no hidden state, same inputs give the same
//! output, and output order follows the trail's spot order. [`SpotIndex`]
//! answers the same question through an R-tree prefilter for large trails.

use std::collections::HashSet;

use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};

use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::{Clue, ClueSource, DeviceUpdate, GpsPoint, Spot, TrailOptions};

/// Widening applied to a spot's own radii. Overrides never shrink a radius.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RadiusOverride {
    pub discovery: Option<f64>,
    pub clue: Option<f64>,
}

impl RadiusOverride {
    /// Use each spot's own radii.
    pub fn none() -> Self {
        Self::default()
    }

    /// Radii applied by an explicit scan on a trail.
    pub fn for_scan(options: &TrailOptions) -> Self {
        Self {
            discovery: options.snap_radius,
            clue: Some(options.scanner_radius),
        }
    }

    /// Effective `(discovery, clue)` radii for a spot.
    pub fn effective(&self, spot: &Spot) -> (f64, f64) {
        let discovery = match self.discovery {
            Some(r) => spot.discovery_radius.max(r),
            None => spot.discovery_radius,
        };
        let clue = match self.clue {
            Some(r) => spot.clue_radius.max(r),
            None => spot.clue_radius,
        };
        (discovery, clue)
    }
}

/// Candidates produced by one match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProximityMatch {
    /// Spot IDs within the discovery radius, in trail order
    pub discoveries: Vec<String>,
    /// Clues for spots within the clue band, in trail order
    pub clues: Vec<Clue>,
}

impl ProximityMatch {
    pub fn is_empty(&self) -> bool {
        self.discoveries.is_empty() && self.clues.is_empty()
    }
}

/// Classification of a single spot against a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proximity {
    Discovery,
    Clue,
    Outside,
}

/// Classify one spot. Non-finite distances are treated as outside.
pub fn classify(location: &GpsPoint, spot: &Spot, radius: &RadiusOverride) -> Proximity {
    let d = haversine_distance(location, &spot.location);
    let (discovery_radius, clue_radius) = radius.effective(spot);
    if !d.is_finite() {
        Proximity::Outside
    } else if d <= discovery_radius {
        Proximity::Discovery
    } else if d <= clue_radius {
        Proximity::Clue
    } else {
        Proximity::Outside
    }
}

/// Match a device position against a trail's spots.
///
/// `spots` must be in trail order; spots in `already_discovered` are skipped.
pub fn match_spots(
    update: &DeviceUpdate,
    trail_id: &str,
    spots: &[Spot],
    already_discovered: &HashSet<String>,
    radius: &RadiusOverride,
    source: ClueSource,
) -> ProximityMatch {
    collect_matches(update, trail_id, spots.iter(), already_discovered, radius, source)
}

fn collect_matches<'a>(
    update: &DeviceUpdate,
    trail_id: &str,
    spots: impl Iterator<Item = &'a Spot>,
    already_discovered: &HashSet<String>,
    radius: &RadiusOverride,
    source: ClueSource,
) -> ProximityMatch {
    let mut result = ProximityMatch::default();
    for spot in spots {
        if already_discovered.contains(&spot.id) {
            continue;
        }
        match classify(&update.location, spot, radius) {
            Proximity::Discovery => result.discoveries.push(spot.id.clone()),
            Proximity::Clue => result.clues.push(Clue {
                spot_id: spot.id.clone(),
                trail_id: trail_id.to_string(),
                location: spot.location,
                source,
            }),
            Proximity::Outside => {}
        }
    }
    result
}

/// Spot position tagged with its trail-order index, for R-tree indexing.
type IndexedSpot = GeomWithData<[f64; 2], usize>;

/// R-tree over a trail's spots that narrows candidates before exact matching.
pub struct SpotIndex {
    trail_id: String,
    spots: Vec<Spot>,
    tree: RTree<IndexedSpot>,
    max_radius: f64,
}

impl SpotIndex {
    /// Build an index. `spots` must be in trail order.
    pub fn new(trail_id: impl Into<String>, spots: Vec<Spot>) -> Self {
        let entries: Vec<IndexedSpot> = spots
            .iter()
            .enumerate()
            .map(|(i, s)| GeomWithData::new([s.location.longitude, s.location.latitude], i))
            .collect();
        let max_radius = spots
            .iter()
            .map(|s| s.discovery_radius.max(s.clue_radius))
            .filter(|r| r.is_finite())
            .fold(0.0, f64::max);

        Self {
            trail_id: trail_id.into(),
            spots,
            tree: RTree::bulk_load(entries),
            max_radius,
        }
    }

    pub fn trail_id(&self) -> &str {
        &self.trail_id
    }

    pub fn spots(&self) -> &[Spot] {
        &self.spots
    }

    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    /// Same result as [`match_spots`] over the indexed spots.
    pub fn match_update(
        &self,
        update: &DeviceUpdate,
        already_discovered: &HashSet<String>,
        radius: &RadiusOverride,
        source: ClueSource,
    ) -> ProximityMatch {
        let reach = self
            .max_radius
            .max(radius.discovery.unwrap_or(0.0))
            .max(radius.clue.unwrap_or(0.0));

        let Some(envelope) = search_envelope(&update.location, reach) else {
            // Near a pole or the antimeridian the box is unreliable; check everything
            return match_spots(
                update,
                &self.trail_id,
                &self.spots,
                already_discovered,
                radius,
                source,
            );
        };

        let mut indices: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.data)
            .collect();
        indices.sort_unstable();

        collect_matches(
            update,
            &self.trail_id,
            indices.iter().map(|&i| &self.spots[i]),
            already_discovered,
            radius,
            source,
        )
    }
}

/// Bounding box in `[lng, lat]` covering every point within `meters`.
///
/// Padded so the degree approximation never excludes a spot the exact
/// haversine test would accept. Returns None when the box would wrap.
fn search_envelope(center: &GpsPoint, meters: f64) -> Option<AABB<[f64; 2]>> {
    if !center.is_valid() || !meters.is_finite() {
        return None;
    }
    let padded = meters * 1.05 + 1.0;
    let (lat_deg, _) = meters_to_degrees(padded, center.latitude);
    let min_lat = center.latitude - lat_deg;
    let max_lat = center.latitude + lat_deg;
    if min_lat < -89.0 || max_lat > 89.0 {
        return None;
    }

    // Longitude degrees are widest at the most poleward edge of the box
    let poleward = min_lat.abs().max(max_lat.abs());
    let (_, lng_deg) = meters_to_degrees(padded, poleward);
    let min_lng = center.longitude - lng_deg;
    let max_lng = center.longitude + lng_deg;
    if min_lng < -180.0 || max_lng > 180.0 {
        return None;
    }

    Some(AABB::from_corners([min_lng, min_lat], [max_lng, max_lat]))
}
