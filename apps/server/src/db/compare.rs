//! Prefix comparison rules for number, quantity and date values.
//!
//! Stored ranges are half open, `[start, end)`. The Postgres clause builders
//! emit the same rules as SQL.

use chrono::{DateTime, Duration, Utc};
use meridian_search::{DateRange, Prefix};
use rust_decimal::Decimal;

/// Widen a date range by 10% of its length, at least one day each side.
pub fn approximate_date_range(start: DateTime<Utc>, end: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let duration = end - start;
    let min_delta = Duration::days(1);
    let approx = if duration > Duration::zero() {
        let ten_percent = Duration::microseconds(duration.num_microseconds().unwrap_or(0) / 10);
        ten_percent.max(min_delta)
    } else {
        min_delta
    };
    (start - approx, end + approx)
}

/// Match a stored date range against a query range.
pub fn date_matches(prefix: Prefix, start: DateTime<Utc>, end: DateTime<Utc>, query: &DateRange) -> bool {
    let (s, e) = (query.lower, query.upper);
    match prefix {
        // query range contains the stored range
        Prefix::Eq => start >= s && end <= e,
        Prefix::Ne => end <= s || start >= e,
        Prefix::Gt => end > e,
        Prefix::Ge => end > s,
        Prefix::Lt => start < s,
        Prefix::Le => start < e,
        Prefix::Sa => start >= e,
        Prefix::Eb => end <= s,
        Prefix::Ap => {
            let (a_start, a_end) = approximate_date_range(s, e);
            start < a_end && end > a_start
        }
    }
}

/// Match a single instant (`_lastUpdated`).
pub fn instant_matches(prefix: Prefix, at: DateTime<Utc>, query: &DateRange) -> bool {
    let (s, e) = (query.lower, query.upper);
    match prefix {
        Prefix::Eq => at >= s && at < e,
        Prefix::Ne => !(at >= s && at < e),
        Prefix::Gt | Prefix::Sa => at >= e,
        Prefix::Ge => at >= s,
        Prefix::Lt | Prefix::Eb => at < s,
        Prefix::Le => at < e,
        Prefix::Ap => {
            let (a_start, a_end) = approximate_date_range(s, e);
            at >= a_start && at < a_end
        }
    }
}

/// Tolerance of `ap` for numbers: 10% of the value, at least the implied
/// precision of the query.
pub fn approximate_delta(value: Decimal, low: Decimal, high: Decimal) -> Decimal {
    (value.abs() / Decimal::TEN).max(high - low)
}

/// Match a stored decimal against a query value with precision range
/// `[low, high)`.
pub fn number_matches(prefix: Prefix, stored: Decimal, value: Decimal, low: Decimal, high: Decimal) -> bool {
    match prefix {
        Prefix::Eq => stored >= low && stored < high,
        Prefix::Ne => stored < low || stored >= high,
        Prefix::Gt | Prefix::Sa => stored >= high,
        Prefix::Ge => stored >= low,
        Prefix::Lt | Prefix::Eb => stored < low,
        Prefix::Le => stored < high,
        Prefix::Ap => {
            let delta = approximate_delta(value, low, high);
            stored >= value - delta && stored <= value + delta
        }
    }
}

/// Great circle distance in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0088;
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}
