//! Geographic and latency scoring

use mesh_api::Coordinates;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distance at which the geo score reaches zero
pub const GEO_SCORE_HORIZON_KM: f64 = 20_000.0;

/// Score used when coordinates or latency are unknown
pub const UNKNOWN_SCORE: f64 = 0.5;

/// Great-circle distance between two points
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Closeness of a region to the user, in [0, 1]
pub fn geo_score(
    user: Option<Coordinates>,
    region: Option<Coordinates>,
    same_region: bool,
) -> f64 {
    if same_region {
        return 1.0;
    }
    match (user, region) {
        (Some(user), Some(region)) => {
            (1.0 - haversine_km(user, region) / GEO_SCORE_HORIZON_KM).clamp(0.0, 1.0)
        }
        _ => UNKNOWN_SCORE,
    }
}

/// Step function over measured latency
pub fn latency_score(latency_ms: Option<f64>) -> f64 {
    match latency_ms {
        None => UNKNOWN_SCORE,
        Some(ms) if ms < 50.0 => 1.0,
        Some(ms) if ms < 100.0 => 0.9,
        Some(ms) if ms < 200.0 => 0.7,
        Some(ms) if ms < 500.0 => 0.5,
        Some(_) => 0.3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEW_YORK: Coordinates = Coordinates { lat: 40.7128, lon: -74.0060 };
    const LONDON: Coordinates = Coordinates { lat: 51.5074, lon: -0.1278 };

    #[test]
    fn test_haversine_new_york_london() {
        let distance = haversine_km(NEW_YORK, LONDON);
        assert!((distance - 5570.0).abs() < 20.0, "distance {}", distance);
        assert_eq!(haversine_km(LONDON, LONDON), 0.0);
    }

    #[test]
    fn test_geo_score() {
        assert_eq!(geo_score(Some(NEW_YORK), Some(LONDON), true), 1.0);
        let score = geo_score(Some(NEW_YORK), Some(LONDON), false);
        assert!((score - 0.72).abs() <= 0.02, "score {}", score);
        assert_eq!(geo_score(None, Some(LONDON), false), UNKNOWN_SCORE);
        assert_eq!(geo_score(Some(NEW_YORK), None, false), UNKNOWN_SCORE);
    }

    #[test]
    fn test_geo_score_clamped() {
        let antipode = Coordinates::new(-40.7128, 105.994);
        let score = geo_score(Some(NEW_YORK), Some(antipode), false);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_latency_score_steps() {
        assert_eq!(latency_score(Some(10.0)), 1.0);
        assert_eq!(latency_score(Some(50.0)), 0.9);
        assert_eq!(latency_score(Some(99.9)), 0.9);
        assert_eq!(latency_score(Some(150.0)), 0.7);
        assert_eq!(latency_score(Some(200.0)), 0.5);
        assert_eq!(latency_score(Some(500.0)), 0.3);
        assert_eq!(latency_score(None), 0.5);
    }
}
