//! 5-field cron expressions with IANA-zone-aware next-fire computation.
//!
//! Format: `minute hour day-of-month month day-of-week`, supporting `*`,
//! `a`, `a-b`, `a,b,c`, `*/n`, and `a-b/n`. Day-of-week uses 0 = Sunday.
//! Malformed expressions are rejected at parse time; schedule writes go
//! through [`CronExpression::parse`] so a bad expression never reaches the
//! heap.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use tickvault_types::VaultError;

// Four years of minutes covers leap years and sparse dom/month combinations.
const MAX_SCAN_MINUTES: u32 = 4 * 366 * 24 * 60;

/// A parsed, validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
}

impl CronExpression {
    /// Parse and validate an expression.
    pub fn parse(source: &str) -> Result<Self, VaultError> {
        let fields: Vec<&str> = source.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(VaultError::invalid_arg(format!(
                "cron expression needs 5 fields, got {}: {source:?}",
                fields.len()
            )));
        }
        Ok(Self {
            source: source.to_string(),
            minutes: parse_field(fields[0], 0, 59, "minute")?,
            hours: parse_field(fields[1], 0, 23, "hour")?,
            days_of_month: parse_field(fields[2], 1, 31, "day-of-month")?,
            months: parse_field(fields[3], 1, 12, "month")?,
            days_of_week: parse_field(fields[4], 0, 6, "day-of-week")?,
        })
    }

    /// The original expression string.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether a local wall-clock minute matches.
    #[must_use]
    pub fn matches_local(&self, local: &NaiveDateTime) -> bool {
        self.minutes.contains(&local.minute())
            && self.hours.contains(&local.hour())
            && self.days_of_month.contains(&local.day())
            && self.months.contains(&local.month())
            && self
                .days_of_week
                .contains(&local.weekday().num_days_from_sunday())
    }

    /// Next fire strictly after `after`, evaluated in `tz` and returned in
    /// UTC.
    ///
    /// DST handling: candidate minutes are walked on the local wall clock;
    /// minutes that do not exist (spring-forward gap) are skipped, and
    /// ambiguous minutes (fall-back repeat) resolve to the earliest instant.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let mut local = after.with_timezone(&tz).naive_local();
        // Truncate to the minute and step once so the result is strictly later.
        local = local.with_second(0)?.with_nanosecond(0)?;
        local += Duration::minutes(1);

        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches_local(&local) {
                let resolved = match tz.from_local_datetime(&local) {
                    chrono::LocalResult::Single(t) => Some(t),
                    chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest),
                    chrono::LocalResult::None => None,
                };
                if let Some(t) = resolved {
                    let utc = t.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
            }
            local += Duration::minutes(1);
        }
        None
    }
}

/// Resolve an IANA zone id, surfacing unknown zones as validation errors.
pub(crate) fn resolve_tz(id: &str) -> Result<Tz, VaultError> {
    Tz::from_str(id).map_err(|_| VaultError::invalid_arg(format!("unknown time zone: {id}")))
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    name: &str,
) -> Result<BTreeSet<u32>, VaultError> {
    let bad = |detail: String| VaultError::invalid_arg(format!("cron {name} field: {detail}"));
    let mut values = BTreeSet::new();

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(bad("empty list entry".to_string()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| bad(format!("bad step {step_str:?}")))?;
                if step == 0 {
                    return Err(bad("step must be nonzero".to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| bad(format!("bad value {lo:?}")))?;
            let hi: u32 = hi.parse().map_err(|_| bad(format!("bad value {hi:?}")))?;
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| bad(format!("bad value {range:?}")))?;
            (v, v)
        };

        if start < min || end > max {
            return Err(bad(format!("{start}-{end} outside {min}-{max}")));
        }
        if start > end {
            return Err(bad(format!("inverted range {start}-{end}")));
        }
        values.extend((start..=end).step_by(step as usize));
    }

    if values.is_empty() {
        return Err(bad("no values".to_string()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_wildcards_steps_lists_and_ranges() {
        let e = CronExpression::parse("*/15 9-17 1,15 * 1-5").unwrap();
        assert_eq!(e.minutes, BTreeSet::from([0, 15, 30, 45]));
        assert_eq!(e.hours.len(), 9);
        assert_eq!(e.days_of_month, BTreeSet::from([1, 15]));
        assert_eq!(e.months.len(), 12);
        assert_eq!(e.days_of_week, BTreeSet::from([1, 2, 3, 4, 5]));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "* * * *",
            "60 * * * *",
            "* 24 * * *",
            "*/0 * * * *",
            "30-10 * * * *",
            "a * * * *",
            "* * * * * *",
        ] {
            assert!(CronExpression::parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn next_fire_in_utc() {
        let e = CronExpression::parse("0 3 * * *").unwrap();
        let next = e.next_after(utc(2026, 2, 5, 10, 30), chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2026, 2, 6, 3, 0));
    }

    #[test]
    fn next_fire_is_strictly_later() {
        let e = CronExpression::parse("30 14 * * *").unwrap();
        let at_fire = utc(2026, 2, 5, 14, 30);
        let next = e.next_after(at_fire, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2026, 2, 6, 14, 30));
    }

    #[test]
    fn dst_spring_forward_skips_missing_hour() {
        // US DST starts 2026-03-08 at 02:00 local; 02:xx does not exist.
        let e = CronExpression::parse("30 2 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        // 01:00 EST on the transition day.
        let next = e.next_after(utc(2026, 3, 8, 6, 0), tz).unwrap();
        // 02:30 local next exists on 2026-03-09 EDT = 06:30 UTC.
        assert_eq!(next, utc(2026, 3, 9, 6, 30));
    }

    #[test]
    fn dst_spring_forward_daily_3am() {
        let e = CronExpression::parse("0 3 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2026-03-08 01:30 EST (06:30 UTC), spring-forward day.
        let next = e.next_after(utc(2026, 3, 8, 6, 30), tz).unwrap();
        // 03:00 EDT = 07:00 UTC on the same day.
        assert_eq!(next, utc(2026, 3, 8, 7, 0));
    }

    #[test]
    fn dst_fall_back_takes_earliest_instant() {
        // US DST ends 2026-11-01 at 02:00 local; 01:30 happens twice.
        let e = CronExpression::parse("30 1 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        // 00:00 EDT = 04:00 UTC on the transition day.
        let next = e.next_after(utc(2026, 11, 1, 4, 0), tz).unwrap();
        // Earliest 01:30 local is still EDT: 05:30 UTC.
        assert_eq!(next, utc(2026, 11, 1, 5, 30));
    }

    #[test]
    fn weekday_filter_applies() {
        let e = CronExpression::parse("0 9 * * 1").unwrap(); // Mondays
        let next = e.next_after(utc(2026, 2, 5, 0, 0), chrono_tz::UTC).unwrap();
        // 2026-02-09 is a Monday.
        assert_eq!(next, utc(2026, 2, 9, 9, 0));
    }
}
