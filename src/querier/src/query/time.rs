//! Time window resolution and step alignment

use std::time::Duration;

use chrono::{DateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::OnceCell;

use super::error::{QuerierError, Result};

const FALLBACK_STEP: Duration = Duration::from_secs(60);

static DEFAULT_STEP: OnceCell<Duration> = OnceCell::new();

/// Install the process-wide default step. Only the first call wins.
pub fn set_default_step(step: Duration) {
    if DEFAULT_STEP.set(step).is_err() {
        log::debug!("Default step already initialised, ignoring {step:?}");
    }
}

pub fn default_step() -> Duration {
    DEFAULT_STEP.get().copied().unwrap_or(FALLBACK_STEP)
}

/// A resolved query window, start aligned to the step in `timezone`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub interval: Duration,
    pub timezone: String,
}

/// A resolved query window, start aligned to the step in UTC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeInfo {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub interval: Duration,
}

/// Parse a Prometheus style duration such as `1m`, `90s` or `1h30m`
pub fn parse_duration(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    promql_parser::util::parse_duration(trimmed).map_err(|reason| QuerierError::InvalidDuration {
        value: value.to_string(),
        reason,
    })
}

fn parse_step(step: &str) -> Result<Duration> {
    if step.is_empty() {
        return Ok(default_step());
    }
    let interval = parse_duration(step)?;
    if interval.is_zero() {
        return Err(QuerierError::InvalidDuration {
            value: step.to_string(),
            reason: "step must be greater than zero".to_string(),
        });
    }
    Ok(interval)
}

/// Decimal unix seconds
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = value
        .trim()
        .parse()
        .map_err(|_| QuerierError::InvalidTimestamp(value.to_string()))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| QuerierError::InvalidTimestamp(value.to_string()))
}

fn parse_window(start: &str, end: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if start.is_empty() {
        return Err(QuerierError::InvalidInput(
            "start time cannot be empty".to_string(),
        ));
    }
    let start = parse_timestamp(start)?;
    let stop = if end.is_empty() {
        Utc::now()
    } else {
        parse_timestamp(end)?
    };
    Ok((start, stop))
}

/// Unknown or empty names resolve to UTC
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        if !name.is_empty() {
            log::debug!("Unknown timezone '{name}', falling back to UTC");
        }
        Tz::UTC
    })
}

fn floor_to_step(secs: i64, interval: Duration) -> i64 {
    let step = interval.as_secs_f64();
    ((secs as f64 / step).floor() * step) as i64
}

fn align(start: DateTime<Utc>, tz: Tz, interval: Duration) -> Result<DateTime<Utc>> {
    let offset = i64::from(start.with_timezone(&tz).offset().fix().local_minus_utc());
    let aligned = floor_to_step(start.timestamp() + offset, interval) - offset;
    Utc.timestamp_opt(aligned, 0)
        .single()
        .ok_or_else(|| QuerierError::InvalidTimestamp(aligned.to_string()))
}

/// Resolve a request window, aligning `start` to `step` boundaries in local time.
///
/// Empty `end` means now and empty `step` means the default step.
pub fn to_time(start: &str, end: &str, step: &str, timezone: &str) -> Result<TimeRange> {
    let (start, stop) = parse_window(start, end)?;
    let interval = parse_step(step)?;
    let tz = resolve_timezone(timezone);
    let start = align(start, tz, interval)?;

    Ok(TimeRange {
        start,
        stop,
        interval,
        timezone: tz.name().to_string(),
    })
}

/// Direct path variant: `start` aligned to UTC step boundaries
pub fn time_info(start: &str, end: &str, step: &str) -> Result<TimeInfo> {
    let (start, stop) = parse_window(start, end)?;
    let interval = parse_step(step)?;
    let aligned = floor_to_step(start.timestamp(), interval);
    let start = Utc
        .timestamp_opt(aligned, 0)
        .single()
        .ok_or_else(|| QuerierError::InvalidTimestamp(aligned.to_string()))?;

    Ok(TimeInfo {
        start,
        stop,
        interval,
    })
}
