//! GTFS time-of-day handling.
//!
//! Static arrival times are `HH:MM:SS` strings where the hour may exceed 24
//! for service that runs past midnight, so they cannot go through a plain
//! `NaiveTime` parse.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Parses `HH:MM:SS` into seconds since midnight. Hours above 24 are valid.
/// Returns `None` for anything that is not three numeric colon-separated
/// fields.
pub fn parse_gtfs_time(raw: &str) -> Option<i64> {
    let mut parts = raw.trim().split(':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let s: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || h < 0 || !(0..60).contains(&m) || !(0..60).contains(&s) {
        return None;
    }
    Some(h * 3600 + m * 60 + s)
}

/// Resolves a seconds-since-midnight offset against a service date in the
/// agency timezone. Offsets of 24h and beyond land on the following day.
/// Returns `None` if the wall-clock time does not exist (DST gap).
pub fn occurrence_on(date: NaiveDate, secs: i64, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)? + Duration::seconds(secs);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Today's occurrence of a scheduled `HH:MM:SS`, if it is still in the
/// future relative to `now`. "Today" is the current date in the agency
/// timezone.
pub fn next_future_occurrence(raw: &str, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let secs = parse_gtfs_time(raw)?;
    let today = now.with_timezone(&tz).date_naive();
    occurrence_on(today, secs, tz).filter(|t| *t > now)
}

/// Renders an instant as an agency-local 12-hour clock string, e.g. "3:45 PM".
pub fn format_clock(t: DateTime<Utc>, tz: Tz) -> String {
    t.with_timezone(&tz).format("%-I:%M %p").to_string()
}
