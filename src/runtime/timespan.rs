//! Parsing of host-supplied durations in .NET `TimeSpan` constant format:
//! `[-][d.]hh:mm:ss[.fffffff]`.

use chrono::Duration;

use crate::errors::ReplayError;

pub fn parse_timespan(text: &str) -> Result<Duration, ReplayError> {
    let invalid = || ReplayError::Configuration(format!("'{text}' is not a valid TimeSpan"));
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let mut parts = body.split(':');
    let (Some(head), Some(minutes), Some(seconds), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let (days, hours) = match head.split_once('.') {
        Some((d, h)) => (parse_component(d).ok_or_else(invalid)?, parse_component(h).ok_or_else(invalid)?),
        None => (0, parse_component(head).ok_or_else(invalid)?),
    };
    let minutes = parse_component(minutes).ok_or_else(invalid)?;
    let (whole_seconds, fraction) = match seconds.split_once('.') {
        Some((s, f)) => (parse_component(s).ok_or_else(invalid)?, Some(f)),
        None => (parse_component(seconds).ok_or_else(invalid)?, None),
    };
    if hours > 23 || minutes > 59 || whole_seconds > 59 {
        return Err(invalid());
    }

    // TimeSpan fractions have 100ns resolution (at most seven digits).
    let nanos = match fraction {
        Some(f) if !f.is_empty() && f.len() <= 7 && f.bytes().all(|b| b.is_ascii_digit()) => {
            let padded = format!("{f:0<9}");
            padded.parse::<i64>().map_err(|_| invalid())?
        }
        Some(_) => return Err(invalid()),
        None => 0,
    };

    let total = Duration::try_days(days)
        .and_then(|d| d.checked_add(&Duration::hours(hours)))
        .and_then(|d| d.checked_add(&Duration::minutes(minutes)))
        .and_then(|d| d.checked_add(&Duration::seconds(whole_seconds)))
        .and_then(|d| d.checked_add(&Duration::nanoseconds(nanos)))
        .ok_or_else(invalid)?;
    Ok(if negative { -total } else { total })
}

fn parse_component(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
