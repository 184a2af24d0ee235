//! Cron trigger validation and scheduling.
//!
//! Routine cron expressions are 5-field (minute precision) in an IANA
//! timezone. The minimum recurrence is 5 minutes, observed by sampling
//! several successive firings and taking the smallest delta, which also
//! catches expressions that are only occasionally too fast.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

pub const MIN_RECURRENCE_SECONDS: i64 = 300;

/// How many successive firings the cadence check samples.
const CADENCE_SAMPLE: usize = 8;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidExpression { expr: String, message: String },
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),
    #[error("cron must not run more than once every 5 minutes")]
    TooFrequent,
}

/// Parse a 5-field cron expression (a seconds field of `0` is prepended for
/// the underlying parser; 6/7-field input is passed through).
pub fn parse_schedule(expr: &str) -> Result<Schedule, CronError> {
    let normalized = normalize_expression(expr);
    Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

fn normalize_expression(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_timezone(timezone: &str) -> Result<Tz, CronError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))
}

/// Validate expression + timezone and enforce the minimum recurrence.
pub fn validate_cron(expr: &str, timezone: &str) -> Result<(), CronError> {
    let schedule = parse_schedule(expr)?;
    let tz = parse_timezone(timezone)?;

    let firings: Vec<DateTime<Tz>> = schedule
        .after(&Utc::now().with_timezone(&tz))
        .take(CADENCE_SAMPLE)
        .collect();
    for pair in firings.windows(2) {
        let delta = (pair[1] - pair[0]).num_seconds();
        if delta < MIN_RECURRENCE_SECONDS {
            return Err(CronError::TooFrequent);
        }
    }
    Ok(())
}

/// Next firing strictly after `after`, as UTC.
pub fn next_fire_after(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CronError> {
    let schedule = parse_schedule(expr)?;
    let tz = parse_timezone(timezone)?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn every_minute_is_rejected() {
        let err = validate_cron("* * * * *", "UTC").unwrap_err();
        assert!(matches!(err, CronError::TooFrequent));
        assert!(err
            .to_string()
            .contains("must not run more than once every 5 minutes"));
    }

    #[test]
    fn every_five_minutes_is_accepted() {
        validate_cron("*/5 * * * *", "UTC").unwrap();
    }

    #[test]
    fn hourly_and_daily_are_accepted() {
        validate_cron("0 * * * *", "UTC").unwrap();
        validate_cron("30 9 * * MON-FRI", "America/Chicago").unwrap();
    }

    #[test]
    fn uneven_minute_lists_that_dip_below_the_floor_are_rejected() {
        // 58 -> 59 is a one-minute gap even though most gaps are wide.
        let err = validate_cron("0,58,59 * * * *", "UTC").unwrap_err();
        assert!(matches!(err, CronError::TooFrequent));
    }

    #[test]
    fn garbage_expression_is_rejected() {
        assert!(matches!(
            validate_cron("not a cron", "UTC"),
            Err(CronError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(matches!(
            validate_cron("*/5 * * * *", "Mars/Olympus_Mons"),
            Err(CronError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn next_fire_lands_on_a_five_minute_boundary() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 2, 11).unwrap();
        let next = next_fire_after("*/5 * * * *", "UTC", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn next_fire_respects_the_timezone() {
        // 09:00 in Chicago is 14:00 or 15:00 UTC depending on DST; either
        // way the local hour is 9.
        let after = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let next = next_fire_after("0 9 * * *", "America/Chicago", after)
            .unwrap()
            .unwrap();
        let local = next.with_timezone(&parse_timezone("America/Chicago").unwrap());
        assert_eq!(local.hour(), 9);
        assert_eq!(local.minute(), 0);
    }
}
