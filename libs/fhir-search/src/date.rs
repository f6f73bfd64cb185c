//! FHIR partial date/time values as half-open UTC ranges.
//!
//! A FHIR date carries implicit precision: `2020` covers the whole year,
//! `2020-03-01T10:15` covers one minute. Both query values and indexed
//! resource values are represented as `[lower, upper)`.

use crate::error::{Result, SearchError};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
    Minute,
    Second,
    /// Fractional seconds with the given number of digits (1-9).
    Fraction(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub lower: DateTime<Utc>,
    /// Exclusive.
    pub upper: DateTime<Utc>,
    pub precision: DatePrecision,
}

impl DateRange {
    pub fn new(lower: DateTime<Utc>, upper: DateTime<Utc>, precision: DatePrecision) -> Self {
        Self {
            lower,
            upper,
            precision,
        }
    }

    /// A single instant, treated as a range of one microsecond.
    pub fn instant(at: DateTime<Utc>) -> Self {
        Self {
            lower: at,
            upper: at + Duration::microseconds(1),
            precision: DatePrecision::Fraction(6),
        }
    }

    /// Parse a FHIR `date`, `dateTime` or `instant` literal.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let invalid = || SearchError::InvalidDate(value.to_string());

        let (date_part, time_part) = match value.split_once('T') {
            Some((d, t)) => (d, Some(t)),
            None => (value, None),
        };

        let mut pieces = date_part.split('-');
        let year: i32 = parse_fixed(pieces.next(), 4).ok_or_else(invalid)?;
        let month: Option<u32> = match pieces.next() {
            Some(m) => Some(parse_fixed(Some(m), 2).ok_or_else(invalid)?),
            None => None,
        };
        let day: Option<u32> = match pieces.next() {
            Some(d) => Some(parse_fixed(Some(d), 2).ok_or_else(invalid)?),
            None => None,
        };
        if pieces.next().is_some() {
            return Err(invalid());
        }

        match (month, day, time_part) {
            (None, None, None) => {
                let lower = ymd(year, 1, 1).ok_or_else(invalid)?;
                let upper = ymd(year + 1, 1, 1).ok_or_else(invalid)?;
                Ok(Self::new(utc(lower), utc(upper), DatePrecision::Year))
            }
            (Some(m), None, None) => {
                let lower = ymd(year, m, 1).ok_or_else(invalid)?;
                let upper = if m == 12 {
                    ymd(year + 1, 1, 1)
                } else {
                    ymd(year, m + 1, 1)
                }
                .ok_or_else(invalid)?;
                Ok(Self::new(utc(lower), utc(upper), DatePrecision::Month))
            }
            (Some(m), Some(d), None) => {
                let lower = ymd(year, m, d).ok_or_else(invalid)?;
                Ok(Self::new(
                    utc(lower),
                    utc(lower) + Duration::days(1),
                    DatePrecision::Day,
                ))
            }
            (Some(m), Some(d), Some(time)) => {
                let date = NaiveDate::from_ymd_opt(year, m, d).ok_or_else(invalid)?;
                parse_time(date, time).ok_or_else(invalid)
            }
            _ => Err(invalid()),
        }
    }

    pub fn contains(&self, other: &DateRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }

    /// Inclusive upper bound, as stored in the index tables.
    pub fn upper_inclusive(&self) -> DateTime<Utc> {
        self.upper - Duration::microseconds(1)
    }
}

fn parse_fixed<T: std::str::FromStr>(part: Option<&str>, width: usize) -> Option<T> {
    let part = part?;
    if part.len() != width || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)
}

fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

fn parse_time(date: NaiveDate, time: &str) -> Option<DateRange> {
    // Split off the zone designator.
    let (clock, offset) = if let Some(stripped) = time.strip_suffix('Z') {
        (stripped, Some(FixedOffset::east_opt(0)?))
    } else if let Some(idx) = time.rfind(['+', '-']) {
        let (clock, zone) = time.split_at(idx);
        let sign = if zone.starts_with('-') { -1 } else { 1 };
        let (hh, mm) = zone[1..].split_once(':')?;
        let secs = parse_fixed::<i32>(Some(hh), 2)? * 3600 + parse_fixed::<i32>(Some(mm), 2)? * 60;
        (clock, Some(FixedOffset::east_opt(sign * secs)?))
    } else {
        (time, None)
    };

    let mut parts = clock.split(':');
    let hour: u32 = parse_fixed(parts.next(), 2)?;
    let minute: u32 = parse_fixed(parts.next(), 2)?;
    let (second, nanos, precision, step) = match parts.next() {
        None => (0, 0, DatePrecision::Minute, Duration::minutes(1)),
        Some(sec) => match sec.split_once('.') {
            None => (
                parse_fixed(Some(sec), 2)?,
                0,
                DatePrecision::Second,
                Duration::seconds(1),
            ),
            Some((whole, frac)) => {
                if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let digits = frac.len() as u32;
                let nanos: u32 = frac.parse::<u32>().ok()? * 10u32.pow(9 - digits);
                let step = Duration::nanoseconds(10i64.pow(9 - digits));
                (
                    parse_fixed(Some(whole), 2)?,
                    nanos,
                    DatePrecision::Fraction(digits as u8),
                    step,
                )
            }
        },
    };
    if parts.next().is_some() {
        return None;
    }

    let naive = date.and_time(NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)?);
    let lower = match offset {
        Some(offset) => offset.from_local_datetime(&naive).single()?.with_timezone(&Utc),
        None => utc(naive),
    };
    Some(DateRange::new(lower, lower + step, precision))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn year_month_and_day_precision() {
        let y = DateRange::parse("2020").unwrap();
        assert_eq!(y.lower, ts("2020-01-01T00:00:00Z"));
        assert_eq!(y.upper, ts("2021-01-01T00:00:00Z"));

        let m = DateRange::parse("2020-12").unwrap();
        assert_eq!(m.upper, ts("2021-01-01T00:00:00Z"));

        let d = DateRange::parse("2020-02-29").unwrap();
        assert_eq!(d.upper, ts("2020-03-01T00:00:00Z"));
        assert_eq!(d.precision, DatePrecision::Day);
    }

    #[test]
    fn time_with_zone_is_normalized_to_utc() {
        let r = DateRange::parse("2020-01-01T10:00:00+02:00").unwrap();
        assert_eq!(r.lower, ts("2020-01-01T08:00:00Z"));
        assert_eq!(r.upper, ts("2020-01-01T08:00:01Z"));
    }

    #[test]
    fn minute_and_fraction_precision() {
        let r = DateRange::parse("2020-01-01T10:15").unwrap();
        assert_eq!(r.upper - r.lower, Duration::minutes(1));

        let f = DateRange::parse("2020-01-01T10:15:30.25Z").unwrap();
        assert_eq!(f.precision, DatePrecision::Fraction(2));
        assert_eq!(f.upper - f.lower, Duration::milliseconds(10));
    }

    #[test]
    fn invalid_dates_are_rejected() {
        for bad in ["20", "2020-13", "2020-02-30", "2020-1-1", "2020-01-01T25:00", "abc"] {
            assert!(DateRange::parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn contains_and_overlaps() {
        let year = DateRange::parse("2020").unwrap();
        let day = DateRange::parse("2020-06-01").unwrap();
        assert!(year.contains(&day));
        assert!(!day.contains(&year));
        assert!(day.overlaps(&year));
    }
}
