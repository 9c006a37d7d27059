//! Cron schedules for pipeline triggers.
//!
//! Accepts standard 5-field cron, extended 6-field cron (with seconds) and the
//! usual shortcuts (`@monthly`, `@daily`, ...). Occurrences are computed in the
//! schedule's timezone and returned in UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A trigger schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    cron: Box<CronSchedule>,
}

impl Schedule {
    /// Create a schedule evaluated in UTC.
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a schedule evaluated in the named IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: impl AsRef<str>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone = timezone.as_ref();
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let cron = Self::parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone: tz,
            cron: Box::new(cron),
        })
    }

    fn parse_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            let expanded = match trimmed.to_lowercase().as_str() {
                "@yearly" | "@annually" => "0 0 1 1 *",
                "@monthly" => "0 0 1 * *",
                "@weekly" => "0 0 * * SUN",
                "@daily" | "@midnight" => "0 0 * * *",
                "@hourly" => "0 * * * *",
                _ => {
                    return Err(ScheduleError::InvalidCron(format!(
                        "unknown shortcut: {}",
                        trimmed
                    )));
                }
            };
            return Self::parse_cron(expanded);
        }
        Self::parse_cron(trimmed)
    }

    fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();

        let cron_expr = match fields.len() {
            // The cron crate wants a leading seconds field.
            5 => format!("0 {}", fields.join(" ")),
            6 => fields.join(" "),
            n => {
                return Err(ScheduleError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}",
                    n
                )));
            }
        };

        CronSchedule::from_str(&cron_expr).map_err(|e| ScheduleError::InvalidCron(e.to_string()))
    }

    /// The expression this schedule was created from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone name, e.g. `UTC` or `Europe/Paris`.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }

    /// Get the next occurrence strictly after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(ScheduleError::NoMoreOccurrences)
    }

    /// Get the next occurrence from now.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// Get the next `n` occurrences after the given time.
    pub fn next_n_after(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .after(&local)
            .take(n)
            .map(|dt| dt.with_timezone(&Utc))
            .collect()
    }

    /// Count occurrences in `(after, until]`, stopping at `limit`.
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> usize {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .after(&local)
            .take_while(|dt| dt.with_timezone(&Utc) <= until)
            .take(limit)
            .count()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.expression, self.timezone.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_monthly_pipeline_schedule() {
        // 02:00 on the 5th of every month
        let schedule = Schedule::new("0 2 5 * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        let next = schedule.next_after(after).unwrap();

        assert_eq!((next.month(), next.day(), next.hour()), (2, 5, 2));
    }

    #[test]
    fn test_six_field_cron() {
        let schedule = Schedule::new("30 0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        let next = schedule.next_after(after).unwrap();

        assert_eq!((next.hour(), next.minute(), next.second()), (10, 0, 30));
    }

    #[test]
    fn test_shortcuts() {
        let after = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();

        let monthly = Schedule::new("@monthly").unwrap().next_after(after).unwrap();
        assert_eq!((monthly.month(), monthly.day()), (4, 1));

        let daily = Schedule::new("@DAILY").unwrap().next_after(after).unwrap();
        assert_eq!((daily.day(), daily.hour()), (16, 0));
    }

    #[test]
    fn test_unknown_shortcut() {
        assert!(matches!(
            Schedule::new("@every 5m"),
            Err(ScheduleError::InvalidCron(_))
        ));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(Schedule::new("not a cron").is_err());
        assert!(Schedule::new("* * *").is_err());
        assert!(Schedule::new("99 * * * *").is_err());
    }

    #[test]
    fn test_timezone_shifts_occurrence() {
        let schedule = Schedule::with_timezone("0 2 * * *", "America/New_York").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        let next = schedule.next_after(after).unwrap();

        // 02:00 EST is 07:00 UTC
        assert_eq!(next.hour(), 7);
        assert_eq!(schedule.timezone(), "America/New_York");
    }

    #[test]
    fn test_invalid_timezone() {
        assert!(matches!(
            Schedule::with_timezone("@daily", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_next_n_after() {
        let schedule = Schedule::new("@hourly").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();

        let next = schedule.next_n_after(after, 3);

        let hours: Vec<u32> = next.iter().map(|d| d.hour()).collect();
        assert_eq!(hours, vec![1, 2, 3]);
    }

    #[test]
    fn test_occurrences_between_respects_bounds_and_limit() {
        let schedule = Schedule::new("@hourly").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap();

        assert_eq!(schedule.occurrences_between(from, to, 100), 5);
        assert_eq!(schedule.occurrences_between(from, to, 2), 2);
        assert_eq!(schedule.occurrences_between(to, from, 100), 0);
    }
}
