//! Date, time and timestamp conversions.
//!
//! Dates are stored as a Serial Day Number minus [`SDN_OFFSET`], so that
//! 0001-01-01 is day 1. Times are milliseconds since midnight. Timestamps
//! are `days * 86_400_000 + millis` held in a double.
//!
//! The Gregorian conversion has no year 0: 1 BC is year `-1`. The `chrono`
//! helpers translate to astronomical numbering where needed.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Serial Day Number of 0000-12-31 (proleptic Gregorian).
pub const SDN_OFFSET: i64 = 1_721_425;
pub const MILLIS_PER_DAY: i64 = 86_400_000;

const GREGOR_SDN_OFFSET: i64 = 32_045;
const DAYS_PER_5_MONTHS: i64 = 153;
const DAYS_PER_4_YEARS: i64 = 1_461;
const DAYS_PER_400_YEARS: i64 = 146_097;

/// Gregorian date to Serial Day Number. Returns 0 for invalid input.
pub fn gregorian_to_sdn(year: i32, month: u32, day: u32) -> i64 {
    if year == 0 || year < -4714 || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return 0;
    }
    if year == -4714 && (month < 11 || (month == 11 && day < 25)) {
        return 0;
    }
    let mut y = i64::from(year) + if year < 0 { 4801 } else { 4800 };
    let m = if month > 2 {
        i64::from(month) - 3
    } else {
        y -= 1;
        i64::from(month) + 9
    };
    ((y / 100) * DAYS_PER_400_YEARS) / 4
        + ((y % 100) * DAYS_PER_4_YEARS) / 4
        + (m * DAYS_PER_5_MONTHS + 2) / 5
        + i64::from(day)
        - GREGOR_SDN_OFFSET
}

/// Serial Day Number to Gregorian `(year, month, day)`.
pub fn sdn_to_gregorian(sdn: i64) -> Option<(i32, u32, u32)> {
    if sdn <= 0 || sdn > (i64::from(i32::MAX) - 4 * GREGOR_SDN_OFFSET) / 4 {
        return None;
    }
    let mut temp = (sdn + GREGOR_SDN_OFFSET) * 4 - 1;
    let century = temp / DAYS_PER_400_YEARS;
    temp = ((temp % DAYS_PER_400_YEARS) / 4) * 4 + 3;
    let mut year = century * 100 + temp / DAYS_PER_4_YEARS;
    let day_of_year = (temp % DAYS_PER_4_YEARS) / 4 + 1;
    temp = day_of_year * 5 - 3;
    let mut month = temp / DAYS_PER_5_MONTHS;
    let day = (temp % DAYS_PER_5_MONTHS) / 5 + 1;
    if month < 10 {
        month += 3;
    } else {
        year += 1;
        month -= 9;
    }
    year -= 4800;
    if year <= 0 {
        year -= 1;
    }
    Some((i32::try_from(year).ok()?, month as u32, day as u32))
}

/// Stored day count for a Gregorian date.
pub fn days_from_ymd(year: i32, month: u32, day: u32) -> Option<i32> {
    match gregorian_to_sdn(year, month, day) {
        0   => None,
        sdn => i32::try_from(sdn - SDN_OFFSET).ok(),
    }
}

pub fn ymd_from_days(days: i32) -> Option<(i32, u32, u32)> {
    sdn_to_gregorian(i64::from(days) + SDN_OFFSET)
}

// ── chrono bridges ───────────────────────────────────────────────────────────

pub fn date_from_days(days: i32) -> Option<NaiveDate> {
    let (y, m, d) = ymd_from_days(days)?;
    let astronomical = if y < 0 { y + 1 } else { y };
    NaiveDate::from_ymd_opt(astronomical, m, d)
}

pub fn days_from_date(date: NaiveDate) -> Option<i32> {
    let y = date.year();
    let historical = if y <= 0 { y - 1 } else { y };
    days_from_ymd(historical, date.month(), date.day())
}

pub fn time_from_millis(millis: i32) -> Option<NaiveTime> {
    if !(0..MILLIS_PER_DAY as i32).contains(&millis) {
        return None;
    }
    let secs = (millis / 1000) as u32;
    let nanos = (millis % 1000) as u32 * 1_000_000;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

/// Milliseconds since midnight. A leap second is folded into the last
/// millisecond of the preceding second.
pub fn millis_from_time(time: NaiveTime) -> i32 {
    let nanos = time.nanosecond().min(999_999_999);
    (time.num_seconds_from_midnight() * 1000 + nanos / 1_000_000) as i32
}

/// Split a stored timestamp into `(days, millis_of_day)`.
pub fn split_timestamp(ts: f64) -> (i64, i64) {
    let total = ts.round() as i64;
    (total.div_euclid(MILLIS_PER_DAY), total.rem_euclid(MILLIS_PER_DAY))
}

pub fn timestamp_from_parts(days: i32, millis: i32) -> f64 {
    (i64::from(days) * MILLIS_PER_DAY + i64::from(millis)) as f64
}

pub fn datetime_from_timestamp(ts: f64) -> Option<NaiveDateTime> {
    if !ts.is_finite() {
        return None;
    }
    let (days, millis) = split_timestamp(ts);
    let date = date_from_days(i32::try_from(days).ok()?)?;
    let time = time_from_millis(millis as i32)?;
    Some(NaiveDateTime::new(date, time))
}

pub fn timestamp_from_datetime(dt: NaiveDateTime) -> Option<f64> {
    let days = days_from_date(dt.date())?;
    Some(timestamp_from_parts(days, millis_from_time(dt.time())))
}
