use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Derived election state. Always recomputed from the current instant and the
/// voting boundary, never carried over from a previous value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// The voting window has not yet opened.
    NotStarted,
    /// The current instant lies within the voting window.
    Active,
    /// The voting window has closed.
    Ended,
}

/// The pair of instants delimiting the voting window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Boundary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Boundary {
    /// Construct a boundary, rejecting an inverted window outright.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(Error::MalformedTimeInput(format!(
                "voting window ends ({end}) before it starts ({start})"
            )));
        }
        Ok(Self { start, end })
    }
}

/// Combine a calendar date and a time-of-day into an absolute instant in the
/// institution's fixed reference zone.
pub fn parse_boundary(date: &str, time: &str, zone: FixedOffset) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| Error::MalformedTimeInput(format!("bad date \"{date}\"")))?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
        .map_err(|_| Error::MalformedTimeInput(format!("bad time \"{time}\"")))?;
    let local = zone
        .from_local_datetime(&date.and_time(time))
        .single()
        .ok_or_else(|| Error::MalformedTimeInput(format!("ambiguous instant {date} {time}")))?;
    Ok(local.with_timezone(&Utc))
}

/// Derive the election phase from the current instant.
/// Comparison is by absolute instant; the end of the window is exclusive.
pub fn derive_phase(now: DateTime<Utc>, boundary: Boundary) -> Phase {
    if now >= boundary.end {
        Phase::Ended
    } else if now >= boundary.start {
        Phase::Active
    } else {
        Phase::NotStarted
    }
}

/// Render a remaining duration as a compact countdown, e.g. "1d 0h 4m 7s".
/// Leading zero-valued units are omitted; seconds are always shown.
/// Negative durations are a caller contract violation (the phase should have
/// flipped at the boundary already).
pub fn format_remaining(delta: Duration) -> String {
    debug_assert!(delta >= Duration::zero(), "negative remaining duration");
    let total = delta.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if days > 0 || hours > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m "));
    }
    out.push_str(&format!("{seconds}s"));
    out
}
