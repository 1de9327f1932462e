/// Great-circle distance in meters between two WGS84 points
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_distance() {
        assert_eq!(haversine_distance(51.5, -0.1, 51.5, -0.1), 0.0);

        // one tenth of a degree of latitude is about 11.1 km
        let d = haversine_distance(51.5, -0.1, 51.6, -0.1);
        assert!((d - 11_119.5).abs() < 5.0, "got {}", d);

        // London to Paris
        let d = haversine_distance(51.4700, -0.4543, 49.0097, 2.5479);
        assert!((340_000.0..350_000.0).contains(&d), "got {}", d);
    }
}
