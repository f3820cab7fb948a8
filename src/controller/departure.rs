//! Next departure from a weekday set and a time of day.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DepartureError {
    #[error("no departure days configured")]
    NoDays,
    #[error("invalid departure day {0:?}, expected digits 1-7")]
    InvalidDay(char),
    #[error("invalid departure time {0:?}, expected HH:MM[:SS]")]
    InvalidTime(String),
}

/// Parses a weekday digit string ("135" = Monday, Wednesday, Friday) into sorted, unique days.
pub fn parse_days(days: &str) -> Result<Vec<u32>, DepartureError> {
    let mut parsed = days
        .chars()
        .map(|c| match c.to_digit(10) {
            Some(d @ 1..=7) => Ok(d),
            _ => Err(DepartureError::InvalidDay(c)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    parsed.sort_unstable();
    parsed.dedup();
    if parsed.is_empty() {
        return Err(DepartureError::NoDays);
    }
    Ok(parsed)
}

pub fn parse_time(time: &str) -> Result<NaiveTime, DepartureError> {
    NaiveTime::parse_from_str(time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
        .map_err(|_| DepartureError::InvalidTime(time.to_string()))
}

/// Next departure strictly after `now`, in UTC.
///
/// Today counts when its departure time is still ahead; otherwise the next
/// configured weekday this week, otherwise the first one next week.
pub fn next_departure(
    depart_days: &str,
    depart_time: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, DepartureError> {
    let days = parse_days(depart_days)?;
    let time = parse_time(depart_time)?;
    let today = now.weekday().number_from_monday();
    let today_at = now.date_naive().and_time(time).and_utc();

    if days.contains(&today) && today_at > now {
        return Ok(today_at);
    }
    let offset = match days.iter().find(|&&d| d > today) {
        Some(&next) => next - today,
        None => 7 - today + days[0],
    };
    Ok(today_at + Duration::days(i64::from(offset)))
}
