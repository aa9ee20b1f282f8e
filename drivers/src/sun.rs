//! Solar geometry
//!
//! Low-precision solar position (good to a tenth of a degree or so),
//! used for the sun-above-horizon interlock and for predicting the
//! next sunset when a run pauses for daylight. Elevation is measured
//! from the geometric horizon; the interlock fires at 0 degrees.

use chrono::{DateTime, Duration, Utc};

/// Days (fractional) since the J2000.0 epoch.
fn days_since_j2000(now: DateTime<Utc>) -> f64 {
    // 2000-01-01 12:00 UTC as a unix timestamp
    const J2000_UNIX: i64 = 946_728_000;
    let secs = now.timestamp() - J2000_UNIX;
    secs as f64 / 86_400.0 + now.timestamp_subsec_millis() as f64 / 86_400_000.0
}

fn normalize_degrees(mut deg: f64) -> f64 {
    deg %= 360.0;
    if deg < 0.0 {
        deg += 360.0;
    }
    deg
}

/// Geometric elevation of the sun in degrees at the given instant and
/// site.
pub fn sun_elevation_degrees(now: DateTime<Utc>, latitude: f64, longitude: f64) -> f64 {
    let n = days_since_j2000(now);

    // Solar coordinates, low-precision series
    let mean_longitude = normalize_degrees(280.460 + 0.985_647_4 * n);
    let mean_anomaly = normalize_degrees(357.528 + 0.985_600_3 * n).to_radians();
    let ecliptic_longitude = (mean_longitude
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.000_000_4 * n).to_radians();

    let declination = (obliquity.sin() * ecliptic_longitude.sin()).asin();
    let right_ascension = (obliquity.cos() * ecliptic_longitude.sin())
        .atan2(ecliptic_longitude.cos())
        .to_degrees();

    // Local hour angle from sidereal time
    let ut_hours = (now.timestamp() % 86_400) as f64 / 3_600.0;
    let gmst_hours = 6.697_375 + 0.065_709_824_2 * (n - ut_hours / 24.0) + 1.002_737_9 * ut_hours;
    let lmst_degrees = normalize_degrees(gmst_hours * 15.0 + longitude);
    let hour_angle = normalize_degrees(lmst_degrees - right_ascension).to_radians();

    let lat = latitude.to_radians();
    let elevation =
        (lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos()).asin();
    elevation.to_degrees()
}

/// Predict the next instant at which the sun drops below the horizon.
///
/// Coarse forward scan at one-minute resolution over the next 48
/// hours, refined to the second by bisection. Falls back to 12 hours
/// from now at a polar site where no crossing occurs.
pub fn next_sunset_utc(now: DateTime<Utc>, latitude: f64, longitude: f64) -> DateTime<Utc> {
    let step = Duration::minutes(1);
    let mut prev = now;
    let mut prev_elevation = sun_elevation_degrees(prev, latitude, longitude);

    let mut t = now;
    for _ in 0..(48 * 60) {
        t += step;
        let elevation = sun_elevation_degrees(t, latitude, longitude);
        if prev_elevation >= 0.0 && elevation < 0.0 {
            return bisect_crossing(prev, t, latitude, longitude);
        }
        prev = t;
        prev_elevation = elevation;
    }

    tracing::warn!("no sunset found within 48h (polar site?); retrying in 12h");
    now + Duration::hours(12)
}

fn bisect_crossing(
    mut above: DateTime<Utc>,
    mut below: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
) -> DateTime<Utc> {
    while (below - above).num_seconds() > 1 {
        let mid = above + (below - above) / 2;
        if sun_elevation_degrees(mid, latitude, longitude) >= 0.0 {
            above = mid;
        } else {
            below = mid;
        }
    }
    below
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // Equator, prime meridian, March equinox: the sun is nearly
    // overhead at 12:00 UTC and far below the horizon at midnight.
    #[test]
    fn test_elevation_equinox_noon_and_midnight() {
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();

        let high = sun_elevation_degrees(noon, 0.0, 0.0);
        let low = sun_elevation_degrees(midnight, 0.0, 0.0);

        assert!(high > 80.0, "expected near-zenith sun, got {high}");
        assert!(low < -80.0, "expected sun near nadir, got {low}");
    }

    #[test]
    fn test_next_sunset_is_in_the_future_and_below_horizon() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let lat = 38.83; // Fairfax, VA
        let lon = -77.31;

        let sunset = next_sunset_utc(now, lat, lon);
        assert!(sunset > now);
        assert!(sunset < now + Duration::hours(24));

        // Just after the predicted instant the sun is below the horizon
        let after = sun_elevation_degrees(sunset + Duration::minutes(5), lat, lon);
        assert!(after < 0.0, "sun still up after predicted sunset: {after}");
    }

    #[test]
    fn test_polar_fallback() {
        // Midsummer above the arctic circle: no sunset for weeks
        let now = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
        let sunset = next_sunset_utc(now, 78.0, 15.0);
        assert_eq!(sunset, now + Duration::hours(12));
    }
}
