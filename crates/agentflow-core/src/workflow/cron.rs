//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field expanded into a
//! sorted set of integers:
//! - `*`, single values, ranges `a-b`, steps `*/n`, `a-b/n` and `a/n`
//! - lists `a,b,c` mixing any of the above
//! - `jan`..`dec` and `sun`..`sat` aliases (day-of-week is 0-6, Sunday = 0)
//!
//! When both day-of-month and day-of-week are restricted, a day must match
//! both. The expanded sets double as the `CalendarSpec` handed to the
//! durable substrate, so schedule triggers never re-parse cron syntax.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound of the forward scan in `next_run`.
pub const SEARCH_HORIZON_YEARS: u32 = 4;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

const MONTH_LABELS: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

const DAY_LABELS: [&str; 7] = [
    "Sunday", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday",
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CronError {
    #[error(
        "cron expression must have 5 fields (minute hour day_of_month month day_of_week), got {0}"
    )]
    FieldCount(usize),

    #[error("invalid {field} value '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("no run time matches within {0} years")]
    NoUpcomingRun(u32),
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl Field {
    const ALL: [Field; 5] = [
        Field::Minute,
        Field::Hour,
        Field::DayOfMonth,
        Field::Month,
        Field::DayOfWeek,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day_of_month",
            Self::Month => "month",
            Self::DayOfWeek => "day_of_week",
        }
    }

    fn bounds(self) -> (u8, u8) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 6),
        }
    }

    /// Resolve a 3-letter alias to its numeric value.
    fn alias(self, token: &str) -> Option<u8> {
        let token = token.to_ascii_lowercase();
        match self {
            Self::Month => MONTH_NAMES
                .iter()
                .position(|m| *m == token)
                .map(|i| i as u8 + 1),
            Self::DayOfWeek => DAY_NAMES.iter().position(|d| *d == token).map(|i| i as u8),
            _ => None,
        }
    }

    fn error(self, value: &str, reason: impl Into<String>) -> CronError {
        CronError::InvalidField {
            field: self.name(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

fn parse_value(field: Field, token: &str, part: &str) -> Result<u8, CronError> {
    let value = match token.parse::<u32>() {
        Ok(n) => n,
        Err(_) => match field.alias(token) {
            Some(v) => return Ok(v),
            None => return Err(field.error(part, format!("'{token}' is not a number"))),
        },
    };
    let (min, max) = field.bounds();
    if value < min as u32 || value > max as u32 {
        return Err(field.error(part, format!("{value} is out of range {min}-{max}")));
    }
    Ok(value as u8)
}

/// Expand one field into its sorted value set.
fn parse_field(field: Field, raw: &str) -> Result<Vec<u8>, CronError> {
    let (min, max) = field.bounds();
    let mut present = [false; 64];

    for part in raw.split(',') {
        if part.is_empty() {
            return Err(field.error(raw, "empty list item"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| field.error(part, format!("invalid step '{step}'")))?;
                if step == 0 {
                    return Err(field.error(part, "step must be at least 1"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(field, a, part)?;
            let hi = parse_value(field, b, part)?;
            if lo > hi {
                return Err(field.error(part, "range start is greater than range end"));
            }
            (lo, hi)
        } else {
            let v = parse_value(field, range, part)?;
            // `a/n` means "from a to the end, every n"
            if step.is_some() { (v, max) } else { (v, v) }
        };

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            present[v as usize] = true;
        }
    }

    Ok((min..=max).filter(|v| present[*v as usize]).collect())
}

// ---------------------------------------------------------------------------
// CalendarSpec
// ---------------------------------------------------------------------------

/// Per-field value sets of a parsed cron expression.
///
/// This is the schedule shape registered with the durable substrate. All
/// vectors are sorted ascending and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSpec {
    pub minutes: Vec<u8>,
    pub hours: Vec<u8>,
    pub days_of_month: Vec<u8>,
    pub months: Vec<u8>,
    /// 0 = Sunday.
    pub days_of_week: Vec<u8>,
}

impl CalendarSpec {
    fn date_matches(&self, date: NaiveDate) -> bool {
        contains(&self.months, date.month() as u8)
            && contains(&self.days_of_month, date.day() as u8)
            && contains(&self.days_of_week, date.weekday().num_days_from_sunday() as u8)
    }

    /// True if the wall-clock minute of `at` in `tz` is a fire time.
    pub fn matches(&self, at: DateTime<Utc>, tz: Tz) -> bool {
        let local = at.with_timezone(&tz).naive_local();
        self.date_matches(local.date())
            && contains(&self.hours, local.hour() as u8)
            && contains(&self.minutes, local.minute() as u8)
    }

    /// First fire time strictly after `after`, evaluated on the wall clock
    /// of `tz`.
    ///
    /// Scans minute by minute, skipping whole months, days and hours that
    /// cannot match. Local times that fall in a DST gap are skipped; for
    /// repeated local times the earliest instant after `after` is used.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let floor = local.date().and_hms_opt(local.hour(), local.minute(), 0)?;
        let mut candidate = floor + Duration::minutes(1);
        let horizon = candidate + Duration::days(366 * SEARCH_HORIZON_YEARS as i64);

        while candidate <= horizon {
            let date = candidate.date();
            if !contains(&self.months, date.month() as u8) {
                candidate = first_of_next_month(date)?;
                continue;
            }
            if !self.date_matches(date) {
                candidate = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !contains(&self.hours, candidate.hour() as u8) {
                candidate = next_hour(candidate)?;
                continue;
            }
            if !contains(&self.minutes, candidate.minute() as u8) {
                candidate += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(early, late) => {
                    let early = early.with_timezone(&Utc);
                    if early > after {
                        return Some(early);
                    }
                    let late = late.with_timezone(&Utc);
                    if late > after {
                        return Some(late);
                    }
                }
                LocalResult::None => {}
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn contains(set: &[u8], value: u8) -> bool {
    set.binary_search(&value).is_ok()
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn next_hour(at: NaiveDateTime) -> Option<NaiveDateTime> {
    let top = at.date().and_hms_opt(at.hour(), 0, 0)?;
    Some(top + Duration::hours(1))
}

// ---------------------------------------------------------------------------
// CronExpression
// ---------------------------------------------------------------------------

/// A validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    fields: [String; 5],
    spec: CalendarSpec,
}

impl CronExpression {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn calendar(&self) -> &CalendarSpec {
        &self.spec
    }

    pub fn next_run(&self, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, CronError> {
        self.spec
            .next_after(after, tz)
            .ok_or(CronError::NoUpcomingRun(SEARCH_HORIZON_YEARS))
    }

    /// The next `count` fire times after `after`.
    pub fn next_runs(
        &self,
        after: DateTime<Utc>,
        tz: Tz,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, CronError> {
        let mut runs = Vec::with_capacity(count);
        let mut cursor = after;
        for _ in 0..count {
            cursor = self.next_run(cursor, tz)?;
            runs.push(cursor);
        }
        Ok(runs)
    }

    /// Best-effort English phrase for the schedule.
    pub fn describe(&self) -> String {
        let spec = &self.spec;
        let [minute_raw, hour_raw, dom_raw, month_raw, dow_raw] = &self.fields;
        let every_hour = hour_raw == "*";

        let time = if minute_raw == "*" && every_hour {
            "every minute".to_string()
        } else if let (Some(step), true) = (minute_raw.strip_prefix("*/"), every_hour) {
            format!("every {step} minutes")
        } else if spec.minutes.len() == 1 && spec.hours.len() == 1 {
            format!("at {:02}:{:02}", spec.hours[0], spec.minutes[0])
        } else if spec.minutes.len() == 1 && every_hour {
            format!("at minute {} past every hour", spec.minutes[0])
        } else if spec.minutes.len() == 1 && spec.hours.len() <= 4 {
            let times: Vec<String> = spec
                .hours
                .iter()
                .map(|h| format!("{h:02}:{:02}", spec.minutes[0]))
                .collect();
            format!("at {}", times.join(", "))
        } else {
            format!(
                "at minutes {} past hours {}",
                join_numbers(&spec.minutes),
                join_numbers(&spec.hours)
            )
        };

        let mut parts = vec![time];
        if dow_raw != "*" {
            parts.push(match spec.days_of_week.as_slice() {
                [1, 2, 3, 4, 5] => "on weekdays".to_string(),
                [0, 6] => "on weekends".to_string(),
                days => {
                    let names: Vec<&str> = days.iter().map(|d| DAY_LABELS[*d as usize]).collect();
                    format!("on {}", names.join(", "))
                }
            });
        }
        if dom_raw != "*" {
            parts.push(format!(
                "on day {} of the month",
                join_numbers(&spec.days_of_month)
            ));
        }
        if month_raw != "*" {
            let names: Vec<&str> = spec
                .months
                .iter()
                .map(|m| MONTH_LABELS[*m as usize - 1])
                .collect();
            parts.push(format!("in {}", names.join(", ")));
        }
        parts.join(" ")
    }
}

fn join_numbers(values: &[u8]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Parse a 5-field cron expression.
pub fn parse(expr: &str) -> Result<CronExpression, CronError> {
    let raw: Vec<&str> = expr.split_whitespace().collect();
    if raw.len() != 5 {
        return Err(CronError::FieldCount(raw.len()));
    }

    let mut sets: Vec<Vec<u8>> = Vec::with_capacity(5);
    for (field, token) in Field::ALL.iter().zip(&raw) {
        sets.push(parse_field(*field, token)?);
    }
    let mut sets = sets.into_iter();
    let mut next = || sets.next().unwrap_or_default();
    let spec = CalendarSpec {
        minutes: next(),
        hours: next(),
        days_of_month: next(),
        months: next(),
        days_of_week: next(),
    };

    Ok(CronExpression {
        source: raw.join(" "),
        fields: [
            raw[0].to_string(),
            raw[1].to_string(),
            raw[2].to_string(),
            raw[3].to_string(),
            raw[4].to_string(),
        ],
        spec,
    })
}

/// Check an expression without keeping the result.
pub fn validate(expr: &str) -> Result<(), CronError> {
    parse(expr).map(|_| ())
}

/// Resolve an IANA timezone name such as `Europe/Berlin` or `UTC`.
pub fn parse_timezone(name: &str) -> Result<Tz, CronError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(name.to_string()))
}

/// Parse `expr` and compute its next fire time after `after` in `timezone`.
pub fn next_run(
    expr: &str,
    after: DateTime<Utc>,
    timezone: &str,
) -> Result<DateTime<Utc>, CronError> {
    parse(expr)?.next_run(after, parse_timezone(timezone)?)
}

pub fn describe(expr: &str) -> Result<String, CronError> {
    Ok(parse(expr)?.describe())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
