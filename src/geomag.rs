// Magnetic declination from a tilted-dipole field model.
//
// Only the declination reaches the tracker, and only to rotate magnetic
// headings to true with a 45-degree crab sanity gate behind it, so a
// dipole-order model (good to a few degrees away from the magnetic poles)
// is sufficient. Epoch drift of the pole is folded in linearly.

use crate::geodesy::norm_diff;

// IGRF-13 dipole coefficients, epoch 2020.0 (nT) with secular variation
// per year. g/h indices follow the usual Schmidt semi-normalized naming.
const G10: f64 = -29404.8;
const G11: f64 = -1450.9;
const H11: f64 = 4652.5;
const G10_SV: f64 = 5.7;
const G11_SV: f64 = 7.4;
const H11_SV: f64 = -25.9;
const EPOCH: f64 = 2020.0;

/// Declination in degrees east of true north at the given position and
/// decimal year. Returns None close to the geomagnetic poles where the
/// dipole approximation (and declination itself) degenerates.
pub fn declination(lat: f64, lon: f64, year: f64) -> Option<f64> {
    if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 {
        return None;
    }

    let dt = year - EPOCH;
    let g10 = G10 + G10_SV * dt;
    let g11 = G11 + G11_SV * dt;
    let h11 = H11 + H11_SV * dt;

    // geomagnetic north pole of the dipole
    let m = (g10 * g10 + g11 * g11 + h11 * h11).sqrt();
    let pole_lat = (-g10 / m).asin().to_degrees();
    let pole_lon = h11.atan2(g11).to_degrees() + 180.0;

    let colat = (90.0 - lat).to_radians();
    let pole_colat = (90.0 - pole_lat).to_radians();
    let dlon = norm_diff(pole_lon - lon, 180.0).to_radians();

    // angular distance to the geomagnetic pole
    let cos_p = colat.cos() * pole_colat.cos() + colat.sin() * pole_colat.sin() * dlon.cos();
    let p = cos_p.clamp(-1.0, 1.0).acos();
    if p < 0.05 || p > std::f64::consts::PI - 0.05 {
        return None;
    }

    // bearing from the site to the geomagnetic pole is the declination
    let y = dlon.sin() * pole_colat.sin();
    let x = colat.sin() * pole_colat.cos() - colat.cos() * pole_colat.sin() * dlon.cos();
    let dec = y.atan2(x).to_degrees();

    Some(norm_diff(dec, 180.0))
}

/// Decimal year from a millisecond timestamp.
pub fn decimal_year(now_ms: u64) -> f64 {
    1970.0 + now_ms as f64 / (365.25 * 24.0 * 3600.0 * 1000.0)
}
