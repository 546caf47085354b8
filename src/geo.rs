use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};

/// Mean Earth radius in meters, shared by every distance operation.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        let coord = Coordinate { lat, lon };
        coord.validate()?;
        Ok(coord)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(ApiError::Validation(format!(
                "latitude {} out of range [-90, 90]",
                self.lat
            )));
        }
        if !self.lon.is_finite() || !(-180.0..=180.0).contains(&self.lon) {
            return Err(ApiError::Validation(format!(
                "longitude {} out of range [-180, 180]",
                self.lon
            )));
        }
        Ok(())
    }
}

/// A decoded route geometry together with its original encoded form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Polyline {
    pub encoded: String,
    pub points: Vec<Coordinate>,
}

impl Polyline {
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let points = decode_polyline(encoded)?;
        if points.len() < 2 {
            return Err(ApiError::Validation(
                "polyline must contain at least two points".to_string(),
            ));
        }
        Ok(Polyline {
            encoded: encoded.to_string(),
            points,
        })
    }

    pub fn from_points(points: Vec<Coordinate>) -> Result<Self> {
        if points.len() < 2 {
            return Err(ApiError::Validation(
                "polyline must contain at least two points".to_string(),
            ));
        }
        for p in &points {
            p.validate()?;
        }
        let encoded = encode_polyline(&points);
        Ok(Polyline { encoded, points })
    }
}

/// Great-circle distance in meters between two coordinates (haversine).
pub fn point_to_point(a: Coordinate, b: Coordinate) -> Result<f64> {
    a.validate()?;
    b.validate()?;

    if a == b {
        return Ok(0.0);
    }

    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    Ok(EARTH_RADIUS_M * c)
}

fn angular_distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

fn initial_bearing(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x)
}

/// Minimum distance in meters from a point to a polyline.
///
/// Projects the point onto each great-circle segment (cross-track /
/// along-track); when the projection falls outside a segment the closer
/// endpoint distance is used instead.
pub fn point_to_polyline(p: Coordinate, polyline: &[Coordinate]) -> Result<f64> {
    p.validate()?;
    if polyline.is_empty() {
        return Err(ApiError::Validation(
            "polyline must contain at least one point".to_string(),
        ));
    }
    for c in polyline {
        c.validate()?;
    }

    if polyline.len() == 1 {
        return point_to_point(p, polyline[0]);
    }

    let mut min_distance = f64::INFINITY;
    for segment in polyline.windows(2) {
        let d = point_to_segment(p, segment[0], segment[1]);
        if d < min_distance {
            min_distance = d;
        }
    }
    Ok(min_distance)
}

fn point_to_segment(p: Coordinate, start: Coordinate, end: Coordinate) -> f64 {
    let d13 = angular_distance(start, p);
    if d13 == 0.0 {
        return 0.0;
    }
    let d12 = angular_distance(start, end);
    if d12 == 0.0 {
        return d13 * EARTH_RADIUS_M;
    }

    let bearing_to_point = initial_bearing(start, p);
    let bearing_along = initial_bearing(start, end);

    let cross_track = (d13.sin() * (bearing_to_point - bearing_along).sin()).asin();
    let along_track = (d13.cos() / cross_track.cos()).acos();

    let endpoint_min = (d13 * EARTH_RADIUS_M).min(angular_distance(end, p) * EARTH_RADIUS_M);

    // Projection behind the start or past the end of the segment.
    if !along_track.is_finite()
        || (bearing_to_point - bearing_along).cos() < 0.0
        || along_track > d12
    {
        return endpoint_min;
    }

    (cross_track.abs() * EARTH_RADIUS_M).min(endpoint_min)
}

/// Intermediate point at `fraction` (0..=1) along the great circle a→b.
pub fn interpolate(a: Coordinate, b: Coordinate, fraction: f64) -> Coordinate {
    let d = angular_distance(a, b);
    if d < 1e-12 {
        return a;
    }

    let f = fraction.clamp(0.0, 1.0);
    let coef_a = ((1.0 - f) * d).sin() / d.sin();
    let coef_b = (f * d).sin() / d.sin();

    let lat1 = a.lat.to_radians();
    let lon1 = a.lon.to_radians();
    let lat2 = b.lat.to_radians();
    let lon2 = b.lon.to_radians();

    let x = coef_a * lat1.cos() * lon1.cos() + coef_b * lat2.cos() * lon2.cos();
    let y = coef_a * lat1.cos() * lon1.sin() + coef_b * lat2.cos() * lon2.sin();
    let z = coef_a * lat1.sin() + coef_b * lat2.sin();

    Coordinate {
        lat: z.atan2((x * x + y * y).sqrt()).to_degrees(),
        lon: y.atan2(x).to_degrees(),
    }
}

fn sample_segment(start: Coordinate, end: Coordinate, spacing_m: f64) -> Vec<Coordinate> {
    let length = angular_distance(start, end) * EARTH_RADIUS_M;
    let count = ((length / spacing_m).ceil() as usize + 1).max(3);
    (0..count)
        .map(|i| interpolate(start, end, i as f64 / (count - 1) as f64))
        .collect()
}

/// Whether two polylines run within `threshold_m` of each other anywhere,
/// together with the segments where they do.
///
/// Each segment of either polyline is sampled at min(50 m, threshold/2)
/// spacing with at least three samples; a sample counts as overlap when it
/// lies within the threshold of the opposite polyline.
pub fn polylines_overlap(
    a: &[Coordinate],
    b: &[Coordinate],
    threshold_m: f64,
) -> Result<(bool, Vec<(Coordinate, Coordinate)>)> {
    if a.len() < 2 || b.len() < 2 {
        return Err(ApiError::Validation(
            "overlap check requires polylines of at least two points".to_string(),
        ));
    }
    if threshold_m <= 0.0 {
        return Err(ApiError::Validation(
            "overlap threshold must be positive".to_string(),
        ));
    }

    let spacing = 50.0_f64.min(threshold_m / 2.0);
    let mut segments = Vec::new();

    for (line, other) in [(a, b), (b, a)] {
        for window in line.windows(2) {
            let samples = sample_segment(window[0], window[1], spacing);
            let mut hit = false;
            for sample in samples {
                if point_to_polyline(sample, other)? <= threshold_m {
                    hit = true;
                    break;
                }
            }
            if hit {
                segments.push((window[0], window[1]));
            }
        }
    }

    Ok((!segments.is_empty(), segments))
}

/// Percentage of polyline `a` (length-weighted) lying within `threshold_m`
/// of polyline `b`, sampled at 25 m resolution.
pub fn polyline_overlap_percentage(
    a: &[Coordinate],
    b: &[Coordinate],
    threshold_m: f64,
) -> Result<f64> {
    if a.len() < 2 || b.len() < 2 {
        return Err(ApiError::Validation(
            "overlap percentage requires polylines of at least two points".to_string(),
        ));
    }

    let mut total_length = 0.0;
    let mut covered_length = 0.0;

    for window in a.windows(2) {
        let length = angular_distance(window[0], window[1]) * EARTH_RADIUS_M;
        if length == 0.0 {
            continue;
        }
        let samples = sample_segment(window[0], window[1], 25.0);
        let mut within = 0usize;
        for sample in &samples {
            if point_to_polyline(*sample, b)? <= threshold_m {
                within += 1;
            }
        }
        total_length += length;
        covered_length += length * within as f64 / samples.len() as f64;
    }

    if total_length == 0.0 {
        return Ok(0.0);
    }
    Ok(covered_length / total_length * 100.0)
}

/// Decodes the standard encoded-polyline format into coordinates.
pub fn decode_polyline(encoded: &str) -> Result<Vec<Coordinate>> {
    if encoded.is_empty() {
        return Err(ApiError::Validation("empty encoded polyline".to_string()));
    }

    let bytes = encoded.as_bytes();
    let mut coords = Vec::new();
    let mut index = 0usize;
    let mut lat = 0i64;
    let mut lon = 0i64;

    while index < bytes.len() {
        lat += decode_varint(bytes, &mut index)?;
        lon += decode_varint(bytes, &mut index)?;

        let coord = Coordinate {
            lat: lat as f64 * 1e-5,
            lon: lon as f64 * 1e-5,
        };
        coord.validate()?;
        coords.push(coord);
    }

    Ok(coords)
}

fn decode_varint(bytes: &[u8], index: &mut usize) -> Result<i64> {
    let mut result = 0i64;
    let mut shift = 0u32;

    loop {
        if *index >= bytes.len() {
            return Err(ApiError::Validation(
                "truncated encoded polyline".to_string(),
            ));
        }
        let byte = bytes[*index] as i64 - 63;
        if byte < 0 {
            return Err(ApiError::Validation(format!(
                "invalid polyline character at offset {}",
                index
            )));
        }
        *index += 1;
        result |= (byte & 0x1f) << shift;
        shift += 5;
        if byte < 0x20 {
            break;
        }
    }

    // Sign-folded zigzag.
    if result & 1 != 0 {
        Ok(!(result >> 1))
    } else {
        Ok(result >> 1)
    }
}

/// Encodes coordinates into the standard encoded-polyline format.
pub fn encode_polyline(coords: &[Coordinate]) -> String {
    let mut out = String::new();
    let mut prev_lat = 0i64;
    let mut prev_lon = 0i64;

    for coord in coords {
        let lat = (coord.lat * 1e5).round() as i64;
        let lon = (coord.lon * 1e5).round() as i64;
        encode_varint(lat - prev_lat, &mut out);
        encode_varint(lon - prev_lon, &mut out);
        prev_lat = lat;
        prev_lon = lon;
    }

    out
}

fn encode_varint(value: i64, out: &mut String) {
    let mut v = if value < 0 { !(value << 1) } else { value << 1 };
    while v >= 0x20 {
        out.push((((0x20 | (v & 0x1f)) + 63) as u8) as char);
        v >>= 5;
    }
    out.push(((v + 63) as u8) as char);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate { lat, lon }
    }

    #[test]
    fn haversine_sf_to_la() {
        let sf = coord(37.7749, -122.4194);
        let la = coord(34.0522, -118.2437);
        let d = point_to_point(sf, la).unwrap();
        assert!((d - 559_120.0).abs() < 5_000.0, "got {}", d);
    }

    #[test]
    fn same_point_distance_is_exactly_zero() {
        let p = coord(38.0675, -120.5436);
        assert_eq!(point_to_point(p, p).unwrap(), 0.0);
    }

    #[test]
    fn invalid_coordinates_rejected() {
        assert!(Coordinate::new(91.0, 0.0).is_err());
        assert!(Coordinate::new(0.0, -181.0).is_err());
        assert!(point_to_point(coord(95.0, 0.0), coord(0.0, 0.0)).is_err());
    }

    #[test]
    fn empty_polyline_rejected() {
        assert!(point_to_polyline(coord(38.0, -120.0), &[]).is_err());
    }

    #[test]
    fn single_point_polyline_reduces_to_point_distance() {
        let p = coord(38.0675, -120.5436);
        let q = coord(38.1391, -120.4561);
        let direct = point_to_point(p, q).unwrap();
        let via_polyline = point_to_polyline(p, &[q]).unwrap();
        assert!((direct - via_polyline).abs() < 1e-6);
    }

    #[test]
    fn point_on_segment_endpoint_is_on_the_line() {
        let line = [coord(38.0675, -120.5436), coord(38.1391, -120.4561)];
        let d = point_to_polyline(line[0], &line).unwrap();
        assert!(d < 1.0, "got {}", d);
    }

    #[test]
    fn point_beside_segment_uses_cross_track() {
        // Point roughly midway but offset from the segment.
        let line = [coord(38.0, -120.5), coord(38.0, -120.3)];
        let p = coord(38.01, -120.4);
        let d = point_to_polyline(p, &line).unwrap();
        // ~1.11 km of latitude offset.
        assert!((d - 1_112.0).abs() < 60.0, "got {}", d);
    }

    #[test]
    fn projection_outside_segment_falls_back_to_endpoint() {
        let line = [coord(38.0, -120.5), coord(38.0, -120.4)];
        let p = coord(38.0, -120.6);
        let d = point_to_polyline(p, &line).unwrap();
        let endpoint = point_to_point(p, line[0]).unwrap();
        assert!((d - endpoint).abs() < 1.0, "got {} vs {}", d, endpoint);
    }

    #[test]
    fn decode_rejects_empty_input() {
        assert!(decode_polyline("").is_err());
    }

    #[test]
    fn decode_known_polyline() {
        // Reference example from the encoded-polyline format description.
        let coords = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
        assert_eq!(coords.len(), 3);
        assert!((coords[0].lat - 38.5).abs() < 1e-5);
        assert!((coords[0].lon - -120.2).abs() < 1e-5);
        assert!((coords[2].lat - 43.252).abs() < 1e-5);
        assert!((coords[2].lon - -126.453).abs() < 1e-5);
    }

    #[test]
    fn encode_decode_round_trip_within_tolerance() {
        let coords = vec![
            coord(38.0675, -120.5436),
            coord(38.1391, -120.4561),
            coord(38.2000, -120.3000),
        ];
        let decoded = decode_polyline(&encode_polyline(&coords)).unwrap();
        assert_eq!(decoded.len(), coords.len());
        for (a, b) in coords.iter().zip(decoded.iter()) {
            assert!((a.lat - b.lat).abs() < 1e-5);
            assert!((a.lon - b.lon).abs() < 1e-5);
        }
    }

    #[test]
    fn overlap_detects_shared_corridor() {
        let a = [coord(38.00, -120.50), coord(38.01, -120.50)];
        let b = [coord(38.00, -120.5001), coord(38.01, -120.5001)];
        let (overlaps, segments) = polylines_overlap(&a, &b, 100.0).unwrap();
        assert!(overlaps);
        assert!(!segments.is_empty());

        let far = [coord(39.0, -121.0), coord(39.01, -121.0)];
        let (overlaps, segments) = polylines_overlap(&a, &far, 100.0).unwrap();
        assert!(!overlaps);
        assert!(segments.is_empty());
    }

    #[test]
    fn overlap_percentage_full_and_none() {
        let a = [coord(38.00, -120.50), coord(38.005, -120.50)];
        let near = [coord(38.00, -120.5001), coord(38.005, -120.5001)];
        let pct = polyline_overlap_percentage(&a, &near, 100.0).unwrap();
        assert!(pct > 95.0, "got {}", pct);

        let far = [coord(39.0, -121.0), coord(39.01, -121.0)];
        let pct = polyline_overlap_percentage(&a, &far, 100.0).unwrap();
        assert!(pct < 5.0, "got {}", pct);
    }

    #[test]
    fn interpolate_midpoint_is_between_endpoints() {
        let a = coord(38.0, -120.5);
        let b = coord(38.1, -120.4);
        let mid = interpolate(a, b, 0.5);
        let da = point_to_point(a, mid).unwrap();
        let db = point_to_point(b, mid).unwrap();
        assert!((da - db).abs() < 1.0);
    }

    #[test]
    fn polyline_from_points_round_trips_encoded_form() {
        let points = vec![coord(38.0675, -120.5436), coord(38.1391, -120.4561)];
        let poly = Polyline::from_points(points.clone()).unwrap();
        let reparsed = Polyline::from_encoded(&poly.encoded).unwrap();
        for (a, b) in points.iter().zip(reparsed.points.iter()) {
            assert!((a.lat - b.lat).abs() < 1e-5);
            assert!((a.lon - b.lon).abs() < 1e-5);
        }
    }
}
