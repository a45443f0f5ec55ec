//! Geographic utilities: great-circle distance, degree conversions and
//! compass-heading arithmetic.

use geo::{Distance, Haversine, Point};

use crate::GpsPoint;

/// Meters per degree of latitude (approximately constant).
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Calculate haversine distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Convert a distance in meters to `(lat_degrees, lng_degrees)` at the given latitude.
///
/// Longitude degrees shrink toward the poles; the cosine is clamped so the
/// result stays finite near ±90°.
pub fn meters_to_degrees(meters: f64, latitude: f64) -> (f64, f64) {
    let lat_deg = meters / METERS_PER_DEGREE_LAT;
    let cos_lat = latitude.to_radians().cos().abs().max(0.01);
    let lng_deg = meters / (METERS_PER_DEGREE_LAT * cos_lat);
    (lat_deg, lng_deg)
}

/// Normalize a heading into `[0, 360)`.
pub fn normalize_heading(heading: f64) -> f64 {
    let h = heading % 360.0;
    if h < 0.0 {
        h + 360.0
    } else {
        h
    }
}

/// Signed shortest-arc delta from `from` to `to`, in `[-180, 180]`.
///
/// Crossing north yields a small delta (10° → 350° is -20°), never a swing
/// through south.
pub fn heading_delta(from: f64, to: f64) -> f64 {
    let mut delta = to - from;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    delta
}

/// Quantize a heading to the nearest multiple of `step` degrees, normalized.
pub fn quantize_heading(heading: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return normalize_heading(heading);
    }
    normalize_heading((heading / step).round() * step)
}

/// Round a coordinate to the given number of decimal places.
pub fn round_coordinate(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
