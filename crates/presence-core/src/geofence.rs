//! Point-in-circle zone check using great-circle (haversine) distance.

use crate::types::Zone;
use thiserror::Error;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeofenceError {
    #[error("invalid coordinates: ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error("zone {zone_id} has an invalid definition (radius {radius_meters} m)")]
    InvalidZone { zone_id: i64, radius_meters: f64 },
}

/// Result of checking a point against a zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceCheck {
    pub inside: bool,
    pub distance_meters: f64,
}

/// True if both values are finite and within the WGS84 latitude/longitude ranges.
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Great-circle distance in meters between two coordinates given in degrees.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    // atan2 form stays accurate near the antipode, where asin(sqrt(a)) loses precision.
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Decide whether a point lies inside `zone`.
///
/// The boundary is inclusive: a point exactly `radius_meters` away is inside.
pub fn is_within_zone(
    latitude: f64,
    longitude: f64,
    zone: &Zone,
) -> Result<GeofenceCheck, GeofenceError> {
    if !is_valid_coordinate(latitude, longitude) {
        return Err(GeofenceError::InvalidCoordinates {
            latitude,
            longitude,
        });
    }
    if !(zone.radius_meters.is_finite() && zone.radius_meters > 0.0)
        || !is_valid_coordinate(zone.center_latitude, zone.center_longitude)
    {
        return Err(GeofenceError::InvalidZone {
            zone_id: zone.id,
            radius_meters: zone.radius_meters,
        });
    }

    let distance_meters = haversine_distance(
        latitude,
        longitude,
        zone.center_latitude,
        zone.center_longitude,
    );

    Ok(GeofenceCheck {
        inside: distance_meters <= zone.radius_meters,
        distance_meters,
    })
}
