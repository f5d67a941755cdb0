// Spherical-earth geometry used by the plausibility gates.

/// Distance in meters between two points on a spherical earth.
/// Up to 0.5% error versus the ellipsoid, which is fine for range and
/// speed gating. Haversine is used for small separations where the law
/// of cosines loses precision.
pub fn greatcircle(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> f64 {
    let lat0 = lat0.to_radians();
    let lon0 = lon0.to_radians();
    let lat1 = lat1.to_radians();
    let lon1 = lon1.to_radians();

    let dlat = (lat1 - lat0).abs();
    let dlon = (lon1 - lon0).abs();

    if dlat < 0.001 && dlon < 0.001 {
        let a = (dlat / 2.0).sin().powi(2) + lat0.cos() * lat1.cos() * (dlon / 2.0).sin().powi(2);
        return 6371e3 * 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    }

    6371e3 * (lat0.sin() * lat1.sin() + lat0.cos() * lat1.cos() * dlon.cos()).acos()
}

/// Initial bearing from point 0 to point 1, degrees clockwise from true
/// north in [0, 360).
pub fn bearing(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> f64 {
    let lat0 = lat0.to_radians();
    let lon0 = lon0.to_radians();
    let lat1 = lat1.to_radians();
    let lon1 = lon1.to_radians();

    let y = (lon1 - lon0).sin() * lat1.cos();
    let x = lat0.cos() * lat1.sin() - lat0.sin() * lat1.cos() * (lon1 - lon0).cos();
    let mut res = y.atan2(x).to_degrees() + 360.0;
    while res >= 360.0 {
        res -= 360.0;
    }
    res
}

/// Normalize angle into [-shift, shift), e.g. shift=180 gives [-180, 180).
pub fn norm_diff(mut angle: f64, shift: f64) -> f64 {
    while angle < -shift {
        angle += 2.0 * shift;
    }
    while angle >= shift {
        angle -= 2.0 * shift;
    }
    angle
}

/// Normalize angle into [0, 2*shift), e.g. shift=180 gives [0, 360).
pub fn norm_angle(mut angle: f64, shift: f64) -> f64 {
    while angle < 0.0 {
        angle += 2.0 * shift;
    }
    while angle >= 2.0 * shift {
        angle -= 2.0 * shift;
    }
    angle
}

/// Obviously impossible coordinates, including the (0, 0) null island
/// that broken feeds like to emit.
pub fn bogus_lat_lon(lat: f64, lon: f64) -> bool {
    if !lat.is_finite() || !lon.is_finite() {
        return true;
    }
    if lat.abs() > 90.0 || lon.abs() > 180.0 {
        return true;
    }
    if lat.abs() < 0.01 && lon.abs() < 0.01 {
        return true;
    }
    false
}
