//! Low-precision solar ephemeris.
//!
//! Accurate to a few hundredths of a degree over several decades around
//! J2000.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// Observer location. Longitude is east positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Site {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

impl Site {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
        }
    }
}

impl From<&crate::config::SiteConfig> for Site {
    fn from(config: &crate::config::SiteConfig) -> Self {
        Self::new(config.latitude, config.longitude, config.elevation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    pub altitude: f64,
    /// Degrees east of north, in `[0, 360)`.
    pub azimuth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Setting,
    Rising,
}

const MAX_SEARCH_HOURS: i64 = 36;
const SCAN_STEP_MINUTES: i64 = 10;

pub fn julian_day(time: DateTime<Utc>) -> f64 {
    let year = time.year();
    let month = time.month() as i32;
    let day = f64::from(time.day());
    let hours = f64::from(time.hour())
        + f64::from(time.minute()) / 60.0
        + (f64::from(time.second()) + f64::from(time.nanosecond()) * 1e-9) / 3600.0;

    let (y, m) = if month <= 2 { (year - 1, month + 12) } else { (year, month) };

    let a = (f64::from(y) / 100.0).floor();
    let b = 2.0 - a + (a / 4.0).floor();

    (365.25 * (f64::from(y) + 4716.0)).floor()
        + (30.6001 * (f64::from(m) + 1.0)).floor()
        + day
        + hours / 24.0
        + b
        - 1524.5
}

/// Sun altitude and azimuth for `site` at `time`.
pub fn sun_position(site: &Site, time: DateTime<Utc>) -> SunPosition {
    let n = julian_day(time) - 2_451_545.0;

    let mean_longitude = (280.460 + 0.985_647_4 * n).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.985_600_3 * n).rem_euclid(360.0).to_radians();
    let ecliptic_longitude = (mean_longitude
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.000_000_4 * n).to_radians();

    let right_ascension = (obliquity.cos() * ecliptic_longitude.sin()).atan2(ecliptic_longitude.cos());
    let declination = (obliquity.sin() * ecliptic_longitude.sin()).asin();

    let gmst_hours = (18.697_374_558 + 24.065_709_824_419_08 * n).rem_euclid(24.0);
    let local_sidereal = (gmst_hours * 15.0 + site.longitude).to_radians();
    let hour_angle = local_sidereal - right_ascension;

    let latitude = site.latitude.to_radians();
    let altitude = (latitude.sin() * declination.sin()
        + latitude.cos() * declination.cos() * hour_angle.cos())
    .asin();

    let azimuth = (-hour_angle.sin())
        .atan2(declination.tan() * latitude.cos() - latitude.sin() * hour_angle.cos());

    SunPosition {
        altitude: altitude.to_degrees(),
        azimuth: azimuth.to_degrees().rem_euclid(360.0),
    }
}

pub fn sun_altitude(site: &Site, time: DateTime<Utc>) -> f64 {
    sun_position(site, time).altitude
}

/// Next time after `start` at which the sun passes `altitude` in the given
/// direction, or `None` if it does not happen within 36 hours.
pub fn next_crossing(
    site: &Site,
    start: DateTime<Utc>,
    altitude: f64,
    direction: Crossing,
) -> Option<DateTime<Utc>> {
    let above = |t: DateTime<Utc>| sun_altitude(site, t) > altitude;
    let step = Duration::minutes(SCAN_STEP_MINUTES);
    let end = start + Duration::hours(MAX_SEARCH_HOURS);

    let mut lo = start;
    while lo < end {
        let hi = lo + step;
        let crossed = match direction {
            Crossing::Setting => above(lo) && !above(hi),
            Crossing::Rising => !above(lo) && above(hi),
        };
        if crossed {
            return Some(bisect(lo, hi, |t| above(t) == above(lo)));
        }
        lo = hi;
    }
    None
}

/// Narrow `[lo, hi]` to one second, where `same_as_lo` holds at `lo` and not
/// at `hi`.
fn bisect(
    mut lo: DateTime<Utc>,
    mut hi: DateTime<Utc>,
    same_as_lo: impl Fn(DateTime<Utc>) -> bool,
) -> DateTime<Utc> {
    while hi - lo > Duration::seconds(1) {
        let mid = lo + (hi - lo) / 2;
        if same_as_lo(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    hi
}

/// The reference moment a night's crossings are searched from: local solar
/// noon on the day the night begins, ahead of sunset in every season.
pub fn night_start(site: &Site, now: DateTime<Utc>) -> DateTime<Utc> {
    let date = night_date(site, now);
    date.and_hms_opt(12, 0, 0)
        .map_or(now, |local_noon| Utc.from_utc_datetime(&local_noon) - offset_from_longitude(site))
}

/// Local solar date of the evening on which the current night starts. The
/// night rolls over at 10:00 local solar time.
pub fn night_date(site: &Site, now: DateTime<Utc>) -> NaiveDate {
    let local = now + offset_from_longitude(site);
    if local.hour() < 10 {
        local.date_naive().pred_opt().unwrap_or_else(|| local.date_naive())
    } else {
        local.date_naive()
    }
}

/// Night label used for directories and the target list, `nYYYYMMDD`, dated
/// by the morning the night ends.
pub fn night_name(site: &Site, now: DateTime<Utc>) -> String {
    let evening = night_date(site, now);
    let morning = evening.succ_opt().unwrap_or(evening);
    format!("n{}", morning.format("%Y%m%d"))
}

fn offset_from_longitude(site: &Site) -> Duration {
    Duration::seconds((site.longitude / 15.0 * 3600.0).round() as i64)
}

/// Sunset, sunrise and flat-window times for one night.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NightTimes {
    pub sunset: DateTime<Utc>,
    pub sunrise: DateTime<Utc>,
}

impl NightTimes {
    pub fn compute(site: &Site, now: DateTime<Utc>) -> Option<Self> {
        let start = night_start(site, now);
        let sunset = next_crossing(site, start, 0.0, Crossing::Setting)?;
        let sunrise = next_crossing(site, sunset, 0.0, Crossing::Rising)?;
        Some(Self { sunset, sunrise })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hopkins() -> Site {
        Site::new(31.68, -110.88, 2316.0)
    }

    #[test]
    fn julian_day_of_j2000() {
        let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_day(j2000) - 2_451_545.0).abs() < 1e-6);
    }

    #[test]
    fn sun_is_high_at_local_noon_in_june() {
        // 19:23 UTC is close to local solar noon at -110.88 longitude.
        let noon = Utc.with_ymd_and_hms(2024, 6, 21, 19, 23, 0).unwrap();
        let position = sun_position(&hopkins(), noon);
        // 90 - 31.68 + 23.44
        assert!((position.altitude - 81.76).abs() < 1.0, "{position:?}");
    }

    #[test]
    fn sun_is_below_horizon_at_local_midnight() {
        let midnight = Utc.with_ymd_and_hms(2024, 6, 22, 7, 23, 0).unwrap();
        let position = sun_position(&hopkins(), midnight);
        assert!(position.altitude < -30.0, "{position:?}");
    }

    #[test]
    fn setting_sun_is_in_the_west() {
        let evening = Utc.with_ymd_and_hms(2024, 3, 20, 1, 0, 0).unwrap();
        let position = sun_position(&hopkins(), evening);
        assert!(position.azimuth > 240.0 && position.azimuth < 300.0, "{position:?}");
    }

    #[test]
    fn sunset_precedes_sunrise_and_brackets_the_night() {
        let afternoon = Utc.with_ymd_and_hms(2024, 3, 20, 21, 0, 0).unwrap();
        let times = NightTimes::compute(&hopkins(), afternoon).unwrap();

        assert!(times.sunset < times.sunrise);
        let length = times.sunrise - times.sunset;
        // Equinox: roughly twelve hours of night.
        assert!(length > Duration::hours(11) && length < Duration::hours(13));
        assert!(sun_altitude(&hopkins(), times.sunset).abs() < 0.1);
        assert!(sun_altitude(&hopkins(), times.sunrise).abs() < 0.1);
    }

    #[test]
    fn winter_sunset_is_the_same_evening() {
        // Sunset comes well before 17:00 local solar time in December.
        let afternoon = Utc.with_ymd_and_hms(2024, 12, 1, 21, 0, 0).unwrap();
        let times = NightTimes::compute(&hopkins(), afternoon).unwrap();

        let expected = Utc.with_ymd_and_hms(2024, 12, 2, 0, 16, 0).unwrap();
        assert!((times.sunset - expected).num_minutes().abs() <= 5, "{times:?}");
        assert!(times.sunrise - times.sunset > Duration::hours(13));
    }

    #[test]
    fn sunset_follows_the_afternoon_all_year() {
        let site = hopkins();
        let mut afternoon = Utc.with_ymd_and_hms(2024, 1, 1, 21, 0, 0).unwrap();
        for _ in 0..366 {
            let times = NightTimes::compute(&site, afternoon).unwrap();
            let until_sunset = times.sunset - afternoon;
            assert!(
                until_sunset > Duration::zero() && until_sunset < Duration::hours(12),
                "{afternoon}: {times:?}"
            );
            afternoon += Duration::days(1);
        }
    }

    #[test]
    fn crossing_search_gives_up_when_altitude_is_never_reached() {
        let start = Utc.with_ymd_and_hms(2024, 3, 20, 21, 0, 0).unwrap();
        assert!(next_crossing(&hopkins(), start, 89.9, Crossing::Rising).is_none());
    }

    #[test]
    fn night_name_rolls_over_at_ten_local() {
        let site = hopkins();
        // 09:00 local on 2024-03-21 still belongs to the night ending that morning.
        let before = Utc.with_ymd_and_hms(2024, 3, 21, 16, 23, 0).unwrap();
        // 11:00 local belongs to the coming night.
        let after = Utc.with_ymd_and_hms(2024, 3, 21, 18, 23, 0).unwrap();

        assert_eq!(night_name(&site, before), "n20240321");
        assert_eq!(night_name(&site, after), "n20240322");
    }
}
