//! Five-field cron expressions: minute, hour, day-of-month, month,
//! day-of-week.
//!
//! Supports `*`, lists, ranges, steps, three-letter month and weekday names,
//! Sunday as 0 or 7, and the `@hourly`-style shorthands. When both
//! day-of-month and day-of-week are restricted a day matches if either does.

use crate::errors::{LimiterError, Result};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Search horizon for the next fire time.
const SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of `names[0]`
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, names_base: 1 };
// 7 is accepted as a second spelling of Sunday and folded onto 0.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAY_NAMES, names_base: 0 };

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let source = expr.trim();
        let expanded = match source.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            _ => source.to_string(),
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(source, format!("expected 5 fields, found {}", fields.len())));
        }

        let field = |text: &str, spec: &FieldSpec| {
            parse_field(text, spec).map_err(|reason| invalid(source, reason))
        };

        let mut days_of_week = field(fields[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: source.to_string(),
            minutes: field(fields[0], &MINUTE)?,
            hours: field(fields[1], &HOUR)?,
            days_of_month: field(fields[2], &DAY_OF_MONTH)?,
            months: field(fields[3], &MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, evaluated on the wall clock
    /// of `offset`. `None` if nothing matches within five years (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&offset).naive_local();
        let mut t = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = NaiveDate::from_ymd_opt(t.year() + SEARCH_YEARS, 1, 1)?.and_time(NaiveTime::MIN);

        while t < horizon {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return offset
                .from_local_datetime(&t)
                .single()
                .map(|dt| dt.with_timezone(&Utc));
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn invalid(expr: &str, reason: String) -> LimiterError {
    LimiterError::InvalidCron {
        expr: expr.to_string(),
        reason,
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_time(NaiveTime::MIN))
}

fn parse_field(text: &str, spec: &FieldSpec) -> std::result::Result<u64, String> {
    let mut set = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, spec)?, parse_value(hi, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `5/15` means every 15 starting at 5
            (value, if step.is_some() { spec.max } else { value })
        };

        if start > end {
            return Err(format!("range {}-{} is reversed in {} field", start, end, spec.name));
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            set |= 1u64 << value;
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }
    Ok(set)
}

fn parse_value(token: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let value = match token.parse::<u32>() {
        Ok(n) => n,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|idx| idx as u32 + spec.names_base)
            .ok_or_else(|| format!("unknown value '{}' in {} field", token, spec.name))?,
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}
