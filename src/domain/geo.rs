//! Great-circle geometry helpers

use crate::domain::types::{LatLng, Position};

/// Mean equatorial Earth radius in meters (WGS84 semi-major axis)
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Haversine great-circle distance in meters on a spherical Earth
pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0 for antipodal points
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Ground speed between two fixes in meters per second
///
/// None when the second fix is not strictly later than the first.
pub fn speed_mps(from: &Position, to: &Position) -> Option<f64> {
    if to.timestamp_ms <= from.timestamp_ms {
        return None;
    }
    let secs = (to.timestamp_ms - from.timestamp_ms) as f64 / 1000.0;
    Some(haversine_m(from.lat_lng(), to.lat_lng()) / secs)
}

/// "lat, lon" with six decimals
pub fn format_location(position: &Position) -> String {
    format!("{:.6}, {:.6}", position.latitude, position.longitude)
}

/// Map link included in outgoing contact messages
pub fn share_link(position: &Position) -> String {
    format!(
        "https://www.google.com/maps/search/?api=1&query={},{}",
        position.latitude, position.longitude
    )
}
