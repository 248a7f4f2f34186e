//! Geofences and service areas.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A circular area: centre (degrees) and radius (metres).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
}

impl Geofence {
    pub fn new(lat: f64, lon: f64, radius_m: f64) -> Self {
        Self { lat, lon, radius_m }
    }

    /// Whether the coordinates and radius are physically meaningful.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.radius_m.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
            && self.radius_m >= 0.0
    }

    /// Great-circle distance between the two centres, in metres.
    pub fn distance_m(&self, other: &Geofence) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    /// Whether a node serving `self` can reach some point of `task_area`.
    pub fn serves(&self, task_area: &Geofence) -> bool {
        self.distance_m(task_area) <= self.radius_m + task_area.radius_m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let g = Geofence::new(52.52, 13.405, 1_000.0);
        assert!(g.distance_m(&g) < 1e-6);
    }

    #[test]
    fn berlin_to_potsdam_is_about_27km() {
        let berlin = Geofence::new(52.52, 13.405, 0.0);
        let potsdam = Geofence::new(52.3906, 13.0645, 0.0);
        let d = berlin.distance_m(&potsdam);
        assert!((25_000.0..30_000.0).contains(&d), "got {d}");
    }

    #[test]
    fn overlapping_areas_are_served() {
        let node = Geofence::new(52.52, 13.405, 20_000.0);
        let task = Geofence::new(52.3906, 13.0645, 10_000.0);
        assert!(node.serves(&task));
        let small_node = Geofence::new(52.52, 13.405, 1_000.0);
        assert!(!small_node.serves(&Geofence::new(52.3906, 13.0645, 1_000.0)));
    }

    #[test]
    fn validity() {
        assert!(Geofence::new(0.0, 0.0, 10.0).is_valid());
        assert!(!Geofence::new(91.0, 0.0, 10.0).is_valid());
        assert!(!Geofence::new(0.0, 0.0, -1.0).is_valid());
        assert!(!Geofence::new(f64::NAN, 0.0, 1.0).is_valid());
    }
}
