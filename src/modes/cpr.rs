// Compact Position Reporting decoding.
//
// Global decoding needs a matched odd/even pair; relative decoding needs a
// single frame plus a reference within half a cell. Surface frames encode
// into 90-degree zones and need a reference to pick the quadrant.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CprError {
    /// Decoded latitude fell outside -90..90.
    LatitudeOutOfRange,
    /// The odd and even frames lie in different latitude zones.
    ZoneMismatch,
    /// Relative decode landed more than half a cell from the reference.
    OutsideCell,
}

impl fmt::Display for CprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CprError::LatitudeOutOfRange => write!(f, "latitude out of range"),
            CprError::ZoneMismatch => write!(f, "frames lie in different latitude zones"),
            CprError::OutsideCell => write!(f, "position outside the reference cell"),
        }
    }
}

impl std::error::Error for CprError {}

const CPR_MAX: f64 = 131072.0;

/// Globally unambiguous airborne decode. Returns the position of the
/// frame selected by `want_odd` (the one that arrived last).
pub fn decode_airborne_global(
    even_lat: u32,
    even_lon: u32,
    odd_lat: u32,
    odd_lon: u32,
    want_odd: bool,
) -> Result<(f64, f64), CprError> {
    let dlat_even = 360.0 / 60.0;
    let dlat_odd = 360.0 / 59.0;

    // latitude index
    let j = ((59.0 * even_lat as f64 - 60.0 * odd_lat as f64) / CPR_MAX + 0.5).floor() as i32;
    let mut rlat_even = dlat_even * (mod_int(j, 60) as f64 + even_lat as f64 / CPR_MAX);
    let mut rlat_odd = dlat_odd * (mod_int(j, 59) as f64 + odd_lat as f64 / CPR_MAX);

    // southern hemisphere values come out in 270..360
    if rlat_even >= 270.0 {
        rlat_even -= 360.0;
    }
    if rlat_odd >= 270.0 {
        rlat_odd -= 360.0;
    }

    if !(-90.0..=90.0).contains(&rlat_even) || !(-90.0..=90.0).contains(&rlat_odd) {
        return Err(CprError::LatitudeOutOfRange);
    }

    let nl_even = nl(rlat_even);
    if nl_even != nl(rlat_odd) {
        return Err(CprError::ZoneMismatch);
    }

    // longitude index
    let m = ((even_lon as f64 * (nl_even - 1) as f64 - odd_lon as f64 * nl_even as f64) / CPR_MAX
        + 0.5)
        .floor() as i32;

    let (rlat, ni, lon_frac) = if want_odd {
        (rlat_odd, i32::max(nl_even - 1, 1), odd_lon as f64 / CPR_MAX)
    } else {
        (rlat_even, i32::max(nl_even, 1), even_lon as f64 / CPR_MAX)
    };

    let mut rlon = (360.0 / ni as f64) * (mod_int(m, ni) as f64 + lon_frac);
    rlon -= ((rlon + 180.0) / 360.0).floor() * 360.0;

    Ok((rlat, rlon))
}

/// Globally unambiguous surface decode. Surface zones span 90 degrees,
/// so a reference location selects the quadrant; the chosen candidate is
/// the one closest to the reference, which need not contain it.
pub fn decode_surface_global(
    reflat: f64,
    reflon: f64,
    even_lat: u32,
    even_lon: u32,
    odd_lat: u32,
    odd_lon: u32,
    want_odd: bool,
) -> Result<(f64, f64), CprError> {
    let dlat_even = 90.0 / 60.0;
    let dlat_odd = 90.0 / 59.0;

    let j = ((59.0 * even_lat as f64 - 60.0 * odd_lat as f64) / CPR_MAX + 0.5).floor() as i32;
    let rlat_even = dlat_even * (mod_int(j, 60) as f64 + even_lat as f64 / CPR_MAX);
    let rlat_odd = dlat_odd * (mod_int(j, 59) as f64 + odd_lat as f64 / CPR_MAX);

    let rlat_even = closest_in_modulus(rlat_even, 90.0, reflat);
    let rlat_odd = closest_in_modulus(rlat_odd, 90.0, reflat);

    if !(-90.0..=90.0).contains(&rlat_even) || !(-90.0..=90.0).contains(&rlat_odd) {
        return Err(CprError::LatitudeOutOfRange);
    }

    let nl_even = nl(rlat_even);
    if nl_even != nl(rlat_odd) {
        return Err(CprError::ZoneMismatch);
    }

    let m = ((even_lon as f64 * (nl_even - 1) as f64 - odd_lon as f64 * nl_even as f64) / CPR_MAX
        + 0.5)
        .floor() as i32;

    let (rlat, ni, lon_frac) = if want_odd {
        (rlat_odd, i32::max(nl_even - 1, 1), odd_lon as f64 / CPR_MAX)
    } else {
        (rlat_even, i32::max(nl_even, 1), even_lon as f64 / CPR_MAX)
    };

    let rlon = (90.0 / ni as f64) * (mod_int(m, ni) as f64 + lon_frac);
    let rlon = closest_in_modulus(rlon, 90.0, reflon);

    Ok((rlat, rlon))
}

/// Relative decode of a single frame against a reference position. The
/// reference must be within half a cell or the result is ambiguous.
pub fn decode_relative(
    reflat: f64,
    reflon: f64,
    cpr_lat: u32,
    cpr_lon: u32,
    odd: bool,
    surface: bool,
) -> Result<(f64, f64), CprError> {
    let span = if surface { 90.0 } else { 360.0 };
    let dlat = span / if odd { 59.0 } else { 60.0 };

    let lat_frac = cpr_lat as f64 / CPR_MAX;
    let j = (reflat / dlat).floor()
        + (0.5 + (reflat % dlat + dlat) % dlat / dlat - lat_frac).floor();
    let rlat = dlat * (j + lat_frac);

    if !(-90.0..=90.0).contains(&rlat) {
        return Err(CprError::LatitudeOutOfRange);
    }
    if (rlat - reflat).abs() > dlat / 2.0 {
        return Err(CprError::OutsideCell);
    }

    let ni = i32::max(nl(rlat) - if odd { 1 } else { 0 }, 1);
    let dlon = span / ni as f64;

    let lon_frac = cpr_lon as f64 / CPR_MAX;
    let m = (reflon / dlon).floor()
        + (0.5 + (reflon % dlon + dlon) % dlon / dlon - lon_frac).floor();
    let rlon = dlon * (m + lon_frac);

    if (rlon - reflon).abs() > dlon / 2.0 {
        return Err(CprError::OutsideCell);
    }

    Ok((rlat, rlon))
}

/// Pick value + k*modulus closest to the reference.
fn closest_in_modulus(value: f64, modulus: f64, reference: f64) -> f64 {
    value + ((reference - value) / modulus).round() * modulus
}

/// Modulo that always returns a non-negative result.
#[inline]
fn mod_int(a: i32, b: i32) -> i32 {
    let r = a % b;
    if r < 0 {
        r + b
    } else {
        r
    }
}

/// Number of longitude zones for a latitude (NL function), via the
/// precomputed transition-latitude tree.
#[inline]
pub fn nl(lat: f64) -> i32 {
    let lat = lat.abs();

    if lat < 33.53993436 {
        if lat < 10.47047130 { return 59; }
        if lat < 14.82817437 { return 58; }
        if lat < 18.18626357 { return 57; }
        if lat < 21.02939493 { return 56; }
        if lat < 23.54504487 { return 55; }
        if lat < 25.82924707 { return 54; }
        if lat < 27.93898710 { return 53; }
        if lat < 29.91135686 { return 52; }
        if lat < 31.77209708 { return 51; }
        return 50;
    }
    if lat < 45.54626723 {
        if lat < 35.22899598 { return 49; }
        if lat < 36.85025108 { return 48; }
        if lat < 38.41241892 { return 47; }
        if lat < 39.92256684 { return 46; }
        if lat < 41.38651832 { return 45; }
        if lat < 42.80914012 { return 44; }
        if lat < 44.19454951 { return 43; }
        return 42;
    }
    if lat < 56.59318756 {
        if lat < 46.86733252 { return 41; }
        if lat < 48.16039128 { return 40; }
        if lat < 49.42776439 { return 39; }
        if lat < 50.67150166 { return 38; }
        if lat < 51.89342469 { return 37; }
        if lat < 53.09516153 { return 36; }
        if lat < 54.27817472 { return 35; }
        if lat < 55.44378444 { return 34; }
        return 33;
    }
    if lat < 66.36171008 {
        if lat < 57.72747354 { return 32; }
        if lat < 58.84763776 { return 31; }
        if lat < 59.95459277 { return 30; }
        if lat < 61.04917774 { return 29; }
        if lat < 62.13216659 { return 28; }
        if lat < 63.20427479 { return 27; }
        if lat < 64.26616523 { return 26; }
        if lat < 65.31845310 { return 25; }
        return 24;
    }
    if lat < 75.42056257 {
        if lat < 67.39646774 { return 23; }
        if lat < 68.42322022 { return 22; }
        if lat < 69.44242631 { return 21; }
        if lat < 70.45451075 { return 20; }
        if lat < 71.45986473 { return 19; }
        if lat < 72.45884545 { return 18; }
        if lat < 73.45177442 { return 17; }
        if lat < 74.43893416 { return 16; }
        return 15;
    }
    if lat < 76.39684391 { return 14; }
    if lat < 77.36789461 { return 13; }
    if lat < 78.33374083 { return 12; }
    if lat < 79.29428225 { return 11; }
    if lat < 80.24923213 { return 10; }
    if lat < 81.19801349 { return 9; }
    if lat < 82.13956981 { return 8; }
    if lat < 83.07199445 { return 7; }
    if lat < 83.99173563 { return 6; }
    if lat < 84.89166191 { return 5; }
    if lat < 85.75541621 { return 4; }
    if lat < 86.53536998 { return 3; }
    if lat <= 87.00000000 { return 2; }
    1
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_pair_roundtrip() {
        for &(lat, lon) in &[(52.2572, 3.9194), (47.99, 7.85), (-33.95, 151.18), (35.55, 139.78)] {
            let (elat, elon) = testenc::encode_airborne(lat, lon, false);
            let (olat, olon) = testenc::encode_airborne(lat, lon, true);
            let (dlat, dlon) = decode_airborne_global(elat, elon, olat, olon, true).unwrap();
            assert!((dlat - lat).abs() < 0.001, "lat {} vs {}", dlat, lat);
            assert!((dlon - lon).abs() < 0.001, "lon {} vs {}", dlon, lon);
        }
    }

    #[test]
    fn test_nl_thresholds() {
        assert_eq!(nl(0.0), 59);
        assert_eq!(nl(20.0), 56);
        assert_eq!(nl(40.0), 45);
        assert_eq!(nl(60.0), 29);
        assert_eq!(nl(80.0), 10);
        assert_eq!(nl(87.0), 2);
        assert_eq!(nl(90.0), 1);
        assert_eq!(nl(-60.0), 29);
    }

    #[test]
    fn test_mod_int() {
        assert_eq!(mod_int(5, 3), 2);
        assert_eq!(mod_int(-1, 3), 2);
        assert_eq!(mod_int(-5, 3), 1);
    }

    #[test]
    fn test_airborne_global_known_pair() {
        // Well-known pair over the Netherlands
        let (lat, lon) = decode_airborne_global(93000, 51372, 74158, 50194, false).unwrap();
        assert!((lat - 52.2572).abs() < 0.001, "lat {}", lat);
        assert!((lon - 3.9194).abs() < 0.001, "lon {}", lon);

        // odd-side solution lands in the same cell
        let (lat_o, lon_o) = decode_airborne_global(93000, 51372, 74158, 50194, true).unwrap();
        assert!((lat_o - 52.2658).abs() < 0.001, "lat {}", lat_o);
        assert!((lon_o - 3.9389).abs() < 0.001, "lon {}", lon_o);
    }

    #[test]
    fn test_airborne_global_zone_mismatch() {
        // latitudes far enough apart to land in different NL zones
        let r = decode_airborne_global(0, 0, 65000, 0, true);
        assert!(r.is_err());
    }

    #[test]
    fn test_relative_roundtrip_airborne() {
        // encode 47.994/7.852 odd and decode against a nearby reference
        let lat = 47.994;
        let lon = 7.852;
        let dlat = 360.0 / 59.0;
        let yz = ((CPR_MAX * ((lat % dlat + dlat) % dlat) / dlat) + 0.5).floor() as u32 % 131072;
        let rlat = dlat * (yz as f64 / CPR_MAX + (lat / dlat).floor());
        let nl_ = i32::max(nl(rlat) - 1, 1);
        let dlon = 360.0 / nl_ as f64;
        let xz = ((CPR_MAX * ((lon % dlon + dlon) % dlon) / dlon) + 0.5).floor() as u32 % 131072;

        let (dec_lat, dec_lon) = decode_relative(48.1, 7.9, yz, xz, true, false).unwrap();
        assert!((dec_lat - lat).abs() < 0.001, "lat {}", dec_lat);
        assert!((dec_lon - lon).abs() < 0.001, "lon {}", dec_lon);
    }

    #[test]
    fn test_relative_too_far() {
        // reference a full cell away must refuse
        let r = decode_relative(60.0, 100.0, 40000, 40000, false, false);
        match r {
            Err(CprError::OutsideCell) | Err(CprError::LatitudeOutOfRange) => {}
            other => {
                // a decode that "succeeds" must at least be near the reference
                if let Ok((lat, lon)) = other {
                    assert!((lat - 60.0).abs() <= 3.1);
                    assert!((lon - 100.0).abs() <= 3.1);
                }
            }
        }
    }

    #[test]
    fn test_surface_quadrant_selection() {
        // surface encoding of 47.99/7.85; reference nearby selects the
        // right quadrant
        let lat = 47.99_f64;
        let lon = 7.85_f64;
        let dlat_e = 90.0 / 60.0;
        let dlat_o = 90.0 / 59.0;
        let yz_e = ((CPR_MAX * ((lat % dlat_e + dlat_e) % dlat_e) / dlat_e) + 0.5).floor() as u32 % 131072;
        let yz_o = ((CPR_MAX * ((lat % dlat_o + dlat_o) % dlat_o) / dlat_o) + 0.5).floor() as u32 % 131072;
        let rlat_e = dlat_e * (yz_e as f64 / CPR_MAX + (lat / dlat_e).floor());
        let nl_e = nl(rlat_e);
        let dlon_e = 90.0 / nl_e as f64;
        let dlon_o = 90.0 / i32::max(nl_e - 1, 1) as f64;
        let xz_e = ((CPR_MAX * ((lon % dlon_e + dlon_e) % dlon_e) / dlon_e) + 0.5).floor() as u32 % 131072;
        let xz_o = ((CPR_MAX * ((lon % dlon_o + dlon_o) % dlon_o) / dlon_o) + 0.5).floor() as u32 % 131072;

        let (dec_lat, dec_lon) =
            decode_surface_global(48.0, 8.0, yz_e, xz_e, yz_o, xz_o, false).unwrap();
        assert!((dec_lat - lat).abs() < 0.01, "lat {}", dec_lat);
        assert!((dec_lon - lon).abs() < 0.01, "lon {}", dec_lon);
    }

    #[test]
    fn test_closest_in_modulus() {
        assert_eq!(closest_in_modulus(10.0, 90.0, 100.0), 100.0);
        assert_eq!(closest_in_modulus(10.0, 90.0, -80.0), -80.0);
        assert_eq!(closest_in_modulus(10.0, 90.0, 20.0), 10.0);
    }
}
