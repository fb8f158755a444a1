//! Five-field cron expressions: minute, hour, day-of-month, month, day-of-week.
//!
//! Supports `*`, lists, ranges, steps, three-letter month and weekday names,
//! and `7` as an alias for Sunday. When both day fields are restricted a time
//! matches if either one does.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;

use crate::error::SchedulerError;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_from` searches before giving up.
const SEARCH_LIMIT_DAYS: i64 = 5 * 366;

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<&'static [&'static str]>,
    /// Offset added to a name's index to get its value.
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: None,
    name_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: None,
    name_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: None,
    name_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: Some(&MONTH_NAMES),
    name_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: Some(&WEEKDAY_NAMES),
    name_base: 0,
};

/// A parsed cron expression. Matches wall-clock times; the caller decides the zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let invalid = |message: String| SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            message,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }

        let minutes = parse_field(fields[0], &MINUTE).map_err(invalid)?;
        let hours = parse_field(fields[1], &HOUR).map_err(invalid)?;
        let days_of_month = parse_field(fields[2], &DAY_OF_MONTH).map_err(invalid)?;
        let months = parse_field(fields[3], &MONTH).map_err(invalid)?;
        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK).map_err(invalid)?;

        // 7 is Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the wall-clock minute `time` matches.
    pub fn matches(&self, time: &NaiveDateTime) -> bool {
        bit(self.minutes, time.minute())
            && bit(self.hours, time.hour())
            && bit(self.months, time.month())
            && self.day_matches(&time.date())
    }

    fn day_matches(&self, date: &NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// The first matching minute at or after `start`, searching at most five years ahead.
    pub fn next_from(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = start
            .date()
            .and_hms_opt(start.hour(), start.minute(), 0)?;
        if t < start {
            t += Duration::minutes(1);
        }
        let limit = t + Duration::days(SEARCH_LIMIT_DAYS);

        while t <= limit {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(&t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
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
            return Some(t);
        }
        None
    }
}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut set = 0u64;
    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (low, high) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let low = parse_value(range, spec)?;
            // `5/10` runs from 5 to the end of the field
            let high = if item.contains('/') { spec.max } else { low };
            (low, high)
        };

        if low > high {
            return Err(format!(
                "range {}-{} is reversed in {} field",
                low, high, spec.name
            ));
        }

        let mut value = low;
        while value <= high {
            set |= 1u64 << value;
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }
    Ok(set)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, String> {
    if let Some(names) = spec.names {
        let lower = token.to_ascii_lowercase();
        if let Some(index) = names.iter().position(|n| *n == lower) {
            return Ok(index as u32 + spec.name_base);
        }
    }
    let value: u32 = token
        .parse()
        .map_err(|_| format!("invalid value '{}' in {} field", token, spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}
