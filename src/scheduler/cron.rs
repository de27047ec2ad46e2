//! Five-field cron expression evaluation
//!
//! Supports the standard `minute hour day-of-month month day-of-week`
//! grammar with `*`, lists, ranges and steps. Expressions are evaluated in
//! a fixed UTC offset declared per schedule entry. When both day-of-month
//! and day-of-week are restricted, a date matches if either field matches
//! (standard cron behavior).

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

/// Parse failure for a cron expression
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid cron expression '{expr}': {reason}")]
pub struct CronParseError {
    pub expr: String,
    pub reason: String,
}

/// One cron field as a bitmask over its value range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FieldSet {
    mask: u64,
    /// True when the field was written `*` (relevant for dom/dow combination)
    wildcard: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.mask & (1u64 << value) != 0
    }
}

fn parse_field(spec: &str, min: u32, max: u32) -> Result<FieldSet, String> {
    let mut mask = 0u64;
    let mut wildcard = false;

    for part in spec.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| format!("bad step '{s}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            if part == "*" {
                wildcard = true;
            }
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo: u32 = a.parse().map_err(|_| format!("bad range start '{a}'"))?;
            let hi: u32 = b.parse().map_err(|_| format!("bad range end '{b}'"))?;
            (lo, hi)
        } else {
            let v: u32 = range_part.parse().map_err(|_| format!("bad value '{range_part}'"))?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!("value out of range {min}..={max}: '{part}'"));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }
    }

    if mask == 0 {
        return Err("empty field".to_string());
    }
    Ok(FieldSet { mask, wildcard })
}

/// A parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronExpr {
    source: String,
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }

        let err = |reason: String| CronParseError { expr: expr.to_string(), reason };
        Ok(Self {
            source: expr.to_string(),
            minute: parse_field(fields[0], 0, 59).map_err(err)?,
            hour: parse_field(fields[1], 0, 23).map_err(|r| CronParseError { expr: expr.to_string(), reason: r })?,
            day_of_month: parse_field(fields[2], 1, 31).map_err(|r| CronParseError { expr: expr.to_string(), reason: r })?,
            month: parse_field(fields[3], 1, 12).map_err(|r| CronParseError { expr: expr.to_string(), reason: r })?,
            day_of_week: parse_field(fields[4], 0, 7).map_err(|r| CronParseError { expr: expr.to_string(), reason: r })?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.month.contains(date.month()) {
            return false;
        }
        let dom_ok = self.day_of_month.contains(date.day());
        // Sunday is both 0 and 7
        let weekday = date.weekday().num_days_from_sunday();
        let dow_ok = self.day_of_week.contains(weekday) || (weekday == 0 && self.day_of_week.contains(7));

        match (self.day_of_month.wildcard, self.day_of_week.wildcard) {
            (true, true) => true,
            (false, true) => dom_ok,
            (true, false) => dow_ok,
            (false, false) => dom_ok || dow_ok,
        }
    }

    /// The first fire time strictly after `after`, in the given offset.
    /// Returns `None` only for expressions that can never fire again within
    /// a four-year search horizon (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let offset = *after.offset();
        let start = after + Duration::minutes(1);
        let mut date = start.date_naive();
        let horizon = date + Duration::days(366 * 4);

        while date <= horizon {
            if self.day_matches(date) {
                let (first_hour, first_minute) = if date == start.date_naive() {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };

                for hour in first_hour..24 {
                    if !self.hour.contains(hour) {
                        continue;
                    }
                    let minute_start = if hour == first_hour { first_minute } else { 0 };
                    for minute in minute_start..60 {
                        if self.minute.contains(minute) {
                            let naive = date.and_hms_opt(hour, minute, 0)?;
                            return offset.from_local_datetime(&naive).single();
                        }
                    }
                }
            }
            date += Duration::days(1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
    }

    #[test]
    fn parses_standard_forms() {
        assert!(CronExpr::parse("0 2 * * *").is_ok());
        assert!(CronExpr::parse("*/15 * * * *").is_ok());
        assert!(CronExpr::parse("0 0 1,15 * 1-5").is_ok());
        assert!(CronExpr::parse("bad").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
    }

    #[test]
    fn daily_at_two() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        let next = expr.next_after(at(2026, 3, 10, 1, 55)).unwrap();
        assert_eq!((next.hour(), next.minute(), next.day()), (2, 0, 10));

        let next = expr.next_after(at(2026, 3, 10, 2, 0)).unwrap();
        assert_eq!(next.day(), 11);
    }

    #[test]
    fn every_fifteen_minutes() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let next = expr.next_after(at(2026, 1, 1, 10, 16)).unwrap();
        assert_eq!((next.hour(), next.minute()), (10, 30));
    }

    #[test]
    fn dom_dow_or_semantics() {
        // The 13th or any Friday
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        // 2026-03-10 is a Tuesday; the next match is Friday the 13th
        let next = expr.next_after(at(2026, 3, 10, 0, 0)).unwrap();
        assert_eq!(next.day(), 13);

        // From the 14th, the next match is Friday the 20th
        let next = expr.next_after(at(2026, 3, 14, 0, 0)).unwrap();
        assert_eq!(next.day(), 20);
    }

    #[test]
    fn respects_fixed_offset() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let after = offset.with_ymd_and_hms(2026, 5, 1, 1, 0, 0).unwrap();
        let next = expr.next_after(after).unwrap();

        assert_eq!(next.hour(), 2);
        // 02:00 at +08:00 is 18:00 UTC the previous day
        assert_eq!(next.with_timezone(&Utc).hour(), 18);
    }
}
