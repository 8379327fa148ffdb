//! Great-circle helpers
//!
//! Distances are in metres on a spherical earth. Point-to-path distance uses
//! a local equirectangular projection centred on the query point, which is
//! accurate to well under a metre at walking scales.

use crate::location::Coordinate;

/// Mean earth radius (IUGG) in metres
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two coordinates
#[must_use]
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Project `p` into metres east/north of `origin`
fn project(origin: Coordinate, p: Coordinate) -> (f64, f64) {
    let mut dlon = p.longitude - origin.longitude;
    if dlon > 180.0 {
        dlon -= 360.0;
    } else if dlon < -180.0 {
        dlon += 360.0;
    }
    let x = dlon.to_radians() * origin.latitude.to_radians().cos() * EARTH_RADIUS_M;
    let y = (p.latitude - origin.latitude).to_radians() * EARTH_RADIUS_M;
    (x, y)
}

/// Distance from `p` to the segment `a`-`b` and the fraction of the
/// segment, in `[0, 1]`, where the closest point lies
fn segment_projection(p: Coordinate, a: Coordinate, b: Coordinate) -> (f64, f64) {
    let (ax, ay) = project(p, a);
    let (bx, by) = project(p, b);
    let (dx, dy) = (bx - ax, by - ay);
    let len2 = dx * dx + dy * dy;

    if len2 == 0.0 {
        return (haversine_m(p, a), 0.0);
    }

    // p is the projection origin, so the query point is (0, 0)
    let t = (-(ax * dx + ay * dy) / len2).clamp(0.0, 1.0);
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    ((cx * cx + cy * cy).sqrt(), t)
}

/// Shortest distance from `p` to the segment `a`-`b`
#[must_use]
pub fn distance_to_segment_m(p: Coordinate, a: Coordinate, b: Coordinate) -> f64 {
    segment_projection(p, a, b).0
}

/// Shortest distance from `p` to a polyline; `None` for an empty path
#[must_use]
pub fn distance_to_path_m(p: Coordinate, path: &[Coordinate]) -> Option<f64> {
    match path {
        [] => None,
        [only] => Some(haversine_m(p, *only)),
        _ => path
            .windows(2)
            .map(|w| distance_to_segment_m(p, w[0], w[1]))
            .reduce(f64::min),
    }
}

/// How far along a polyline the point closest to `p` lies
///
/// Measured from the first vertex. `None` for a path with fewer than two
/// points.
#[must_use]
pub fn distance_along_path_m(p: Coordinate, path: &[Coordinate]) -> Option<f64> {
    let mut covered = 0.0;
    let mut best: Option<(f64, f64)> = None;
    for leg in path.windows(2) {
        let (distance, t) = segment_projection(p, leg[0], leg[1]);
        let length = haversine_m(leg[0], leg[1]);
        if !matches!(best, Some((nearest, _)) if nearest <= distance) {
            best = Some((distance, covered + t * length));
        }
        covered += length;
    }
    best.map(|(_, along)| along)
}

/// Total length of a polyline
#[must_use]
pub fn path_length_m(path: &[Coordinate]) -> f64 {
    path.windows(2).map(|w| haversine_m(w[0], w[1])).sum()
}

/// Coordinate `distance_m` along the initial bearing `bearing_deg` from `origin`
#[must_use]
pub fn destination_point(origin: Coordinate, bearing_deg: f64, distance_m: f64) -> Coordinate {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let lat1 = origin.latitude.to_radians();
    let lon1 = origin.longitude.to_radians();

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    Coordinate {
        latitude: lat2.to_degrees(),
        longitude: (lon2.to_degrees() + 540.0) % 360.0 - 180.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn c(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn haversine_matches_known_distance() {
        // One degree of latitude is ~111.2 km
        let d = haversine_m(c(0.0, 0.0), c(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn segment_distance_is_perpendicular_offset() {
        let a = c(51.5, -0.12);
        let b = destination_point(a, 90.0, 2_000.0);
        let mid = destination_point(a, 90.0, 1_000.0);
        let off = destination_point(mid, 0.0, 250.0);

        let d = distance_to_segment_m(off, a, b);
        assert!((d - 250.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn segment_distance_clamps_to_endpoints() {
        let a = c(10.0, 10.0);
        let b = destination_point(a, 0.0, 1_000.0);
        let behind = destination_point(a, 180.0, 300.0);

        let d = distance_to_segment_m(behind, a, b);
        assert!((d - 300.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn path_distance_picks_nearest_leg() {
        let a = c(0.0, 0.0);
        let b = destination_point(a, 90.0, 1_000.0);
        let d = destination_point(b, 0.0, 1_000.0);
        let near_second_leg = destination_point(destination_point(b, 0.0, 500.0), 90.0, 40.0);

        let dist = distance_to_path_m(near_second_leg, &[a, b, d]).unwrap();
        assert!((dist - 40.0).abs() < 1.0, "got {dist}");
        assert!(distance_to_path_m(a, &[]).is_none());
    }

    #[test]
    fn along_path_follows_the_bend() {
        let a = c(0.0, 0.0);
        let b = destination_point(a, 90.0, 1_000.0);
        let d = destination_point(b, 0.0, 1_000.0);
        let on_second_leg = destination_point(destination_point(b, 0.0, 400.0), 270.0, 30.0);

        let along = distance_along_path_m(on_second_leg, &[a, b, d]).unwrap();
        assert!((along - 1_400.0).abs() < 2.0, "got {along}");
        assert!(distance_along_path_m(a, &[a]).is_none());
    }

    #[test]
    fn path_length_sums_legs() {
        let a = c(0.0, 0.0);
        let b = destination_point(a, 90.0, 1_000.0);
        let d = destination_point(b, 0.0, 500.0);
        assert!((path_length_m(&[a, b, d]) - 1_500.0).abs() < 1.0);
    }

    proptest! {
        #[test]
        fn prop_haversine_is_symmetric(
            lat1 in -89.0f64..89.0, lon1 in -179.0f64..179.0,
            lat2 in -89.0f64..89.0, lon2 in -179.0f64..179.0,
        ) {
            let (a, b) = (c(lat1, lon1), c(lat2, lon2));
            prop_assert!((haversine_m(a, b) - haversine_m(b, a)).abs() < 1e-6);
        }

        #[test]
        fn prop_destination_point_round_trips_distance(
            lat in -60.0f64..60.0,
            lon in -170.0f64..170.0,
            bearing in 0.0f64..360.0,
            dist in 1.0f64..5_000.0,
        ) {
            let origin = c(lat, lon);
            let moved = destination_point(origin, bearing, dist);
            prop_assert!((haversine_m(origin, moved) - dist).abs() < 0.5);
        }
    }
}
