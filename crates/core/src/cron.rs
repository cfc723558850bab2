//! Five-field cron expressions (minute, hour, day-of-month, month, weekday).
//!
//! Each field is either a concrete value or `*` ("any"). There are no ranges,
//! lists or steps. Day-of-month and weekday are independent: when both are
//! concrete, both must match. Weekday 0 is Sunday. All matching is in UTC.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CronParseError;

/// Upper bound of the forward scan: one year of minutes.
pub const SCAN_LIMIT_MINUTES: u32 = 365 * 24 * 60;

/// One cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronField {
    Any,
    At(u32),
}

impl CronField {
    pub fn matches(self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::At(v) => v == value,
        }
    }

    fn parse(token: &str, field: &'static str, min: u32, max: u32) -> Result<Self, CronParseError> {
        if token == "*" {
            return Ok(CronField::Any);
        }
        let value: u32 = token.parse().map_err(|_| CronParseError::InvalidValue {
            field,
            value: token.to_string(),
        })?;
        if value < min || value > max {
            return Err(CronParseError::OutOfRange {
                field,
                value,
                min,
                max,
            });
        }
        Ok(CronField::At(value))
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronField::Any => f.write_str("*"),
            CronField::At(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CronExpression {
    pub minute: CronField,
    pub hour: CronField,
    pub day: CronField,
    pub month: CronField,
    pub weekday: CronField,
}

impl CronExpression {
    pub fn every_minute() -> Self {
        Self {
            minute: CronField::Any,
            hour: CronField::Any,
            day: CronField::Any,
            month: CronField::Any,
            weekday: CronField::Any,
        }
    }

    pub fn hourly(minute: u32) -> Self {
        Self {
            minute: CronField::At(minute),
            ..Self::every_minute()
        }
    }

    pub fn daily(hour: u32, minute: u32) -> Self {
        Self {
            hour: CronField::At(hour),
            ..Self::hourly(minute)
        }
    }

    /// `weekday` uses 0 = Sunday.
    pub fn weekly(weekday: u32, hour: u32, minute: u32) -> Self {
        Self {
            weekday: CronField::At(weekday),
            ..Self::daily(hour, minute)
        }
    }

    pub fn monthly(day: u32, hour: u32, minute: u32) -> Self {
        Self {
            day: CronField::At(day),
            ..Self::daily(hour, minute)
        }
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day.matches(at.day())
            && self.month.matches(at.month())
            && self.weekday.matches(at.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `from`, scanning at most one year.
    pub fn next_match(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let step = ChronoDuration::minutes(1);
        let mut candidate = from.duration_trunc(step).unwrap_or(from) + step;

        for _ in 0..SCAN_LIMIT_MINUTES {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += step;
        }
        None
    }

    /// Next run time after `from`; expressions that never match within a year
    /// fall back to one hour from `from`.
    pub fn next_run(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        self.next_match(from)
            .unwrap_or_else(|| from + ChronoDuration::hours(1))
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day, self.month, self.weekday
        )
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.len() != 5 {
            return Err(CronParseError::FieldCount(tokens.len()));
        }

        Ok(Self {
            minute: CronField::parse(tokens[0], "minute", 0, 59)?,
            hour: CronField::parse(tokens[1], "hour", 0, 23)?,
            day: CronField::parse(tokens[2], "day", 1, 31)?,
            month: CronField::parse(tokens[3], "month", 1, 12)?,
            weekday: CronField::parse(tokens[4], "weekday", 0, 6)?,
        })
    }
}
