//! 5-field cron expressions: `MIN HOUR DOM MON DOW`.
//!
//! Each field is `*`, or a comma-separated list of values, `a-b` ranges and
//! `a-b/n`, `*/n`, `a/n` steps. Day-of-week runs 0-6 with Sunday = 0.
//! Expressions are evaluated in UTC.

use crate::core::{Error, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Search budget for [`CronExpression::next_execution`]: four years of
/// minutes.
pub const MAX_SEARCH_MINUTES: u32 = 4 * 366 * 24 * 60;

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 6 };

/// Allowed values per field, sorted ascending and free of duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronFields {
    pub minutes: Vec<u32>,
    pub hours: Vec<u32>,
    pub days_of_month: Vec<u32>,
    pub months: Vec<u32>,
    pub days_of_week: Vec<u32>,
}

/// A parsed cron expression.
///
/// # Example
///
/// ```
/// use cadence::CronExpression;
/// use chrono::{TimeZone, Utc};
///
/// let every_quarter: CronExpression = "*/15 * * * *".parse().unwrap();
/// assert_eq!(every_quarter.fields().minutes, vec![0, 15, 30, 45]);
///
/// let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 0).unwrap();
/// let next = every_quarter.next_execution(after).unwrap();
/// assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    fields: CronFields,
}

impl CronExpression {
    /// Parses an expression. Any malformed or out-of-range field is an
    /// `InvalidArgument`.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::invalid_argument(format!(
                "invalid cron expression '{}': expected 5 fields (MIN HOUR DOM MON DOW), got {}",
                expression,
                parts.len()
            )));
        }

        Ok(Self {
            source: parts.join(" "),
            fields: CronFields {
                minutes: parse_field(parts[0], MINUTE)?,
                hours: parse_field(parts[1], HOUR)?,
                days_of_month: parse_field(parts[2], DAY_OF_MONTH)?,
                months: parse_field(parts[3], MONTH)?,
                days_of_week: parse_field(parts[4], DAY_OF_WEEK)?,
            },
        })
    }

    /// The normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn fields(&self) -> &CronFields {
        &self.fields
    }

    /// True if every field of `at` (to the minute) is allowed.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.matches_naive(&at.naive_utc())
    }

    fn matches_naive(&self, at: &NaiveDateTime) -> bool {
        self.fields.minutes.contains(&at.minute())
            && self.fields.hours.contains(&at.hour())
            && self.day_matches(at.date())
            && self.fields.months.contains(&at.month())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        self.fields.days_of_month.contains(&date.day())
            && self
                .fields
                .days_of_week
                .contains(&date.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`.
    ///
    /// The candidate is rolled forward one field at a time (month, then
    /// day, then hour, then minute) and every roll restarts the checks.
    /// Returns `Runtime` if nothing matches within four years, which is what
    /// happens for expressions like `0 0 30 2 *`.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let start = after
            .naive_utc()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| Error::runtime("failed to truncate cron start time"))?
            + Duration::minutes(1);
        let horizon = start + Duration::minutes(i64::from(MAX_SEARCH_MINUTES));

        let mut candidate = start;
        for _ in 0..MAX_SEARCH_MINUTES {
            if candidate > horizon {
                break;
            }

            if !self.fields.months.contains(&candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }

            if !self.day_matches(candidate.date()) {
                candidate = start_of_day(candidate.date() + Duration::days(1))?;
                continue;
            }

            if !self.fields.hours.contains(&candidate.hour()) {
                candidate = candidate
                    .with_minute(0)
                    .ok_or_else(|| Error::runtime("failed to roll cron hour"))?
                    + Duration::hours(1);
                continue;
            }

            if !self.fields.minutes.contains(&candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }

            return Ok(Utc.from_utc_datetime(&candidate));
        }

        Err(Error::runtime(format!(
            "no execution time found for cron expression '{}' within 4 years after {}",
            self.source, after
        )))
    }
}

fn start_of_day(date: NaiveDate) -> Result<NaiveDateTime> {
    date.and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::runtime("failed to compute start of day"))
}

fn start_of_next_month(at: NaiveDateTime) -> Result<NaiveDateTime> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| Error::runtime("cron search ran past the supported date range"))?;
    start_of_day(date)
}

fn parse_field(field: &str, bounds: FieldSpec) -> Result<Vec<u32>> {
    let invalid = |reason: String| {
        Error::invalid_argument(format!(
            "invalid cron {} field '{}': {}",
            bounds.name, field, reason
        ))
    };
    let number = |text: &str| -> Result<u32> {
        text.parse::<u32>()
            .map_err(|_| invalid(format!("'{}' is not a number", text)))
    };

    let mut values = Vec::new();
    for part in field.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list entry".to_string()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = number(step)?;
                if step == 0 {
                    return Err(invalid("step must be at least 1".to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" {
            (bounds.min, bounds.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (number(low)?, number(high)?)
        } else {
            let value = number(range)?;
            // `a/n` runs from `a` to the end of the field.
            if step.is_some() {
                (value, bounds.max)
            } else {
                (value, value)
            }
        };

        for bound in [low, high] {
            if bound < bounds.min || bound > bounds.max {
                return Err(invalid(format!(
                    "{} is outside {}-{}",
                    bound, bounds.min, bounds.max
                )));
            }
        }
        if low > high {
            return Err(invalid(format!("range {}-{} is reversed", low, high)));
        }

        let step = step.unwrap_or(1) as usize;
        values.extend((low..=high).step_by(step));
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}

impl FromStr for CronExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CronExpression::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
