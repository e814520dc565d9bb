//! Local wall-clock time at minute resolution.
//!
//! Schedules only ever compare `HH:MM`, so everything here works on a
//! [`LocalMinute`] rather than a full timestamp.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use time::{OffsetDateTime, UtcOffset};

// ---------------------------------------------------------------------------
// LocalMinute
// ---------------------------------------------------------------------------

/// A minute of the local day, rendered as `HH:MM` (24h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalMinute {
    hour: u8,
    minute: u8,
}

impl LocalMinute {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn of(t: OffsetDateTime) -> Self {
        Self {
            hour: t.hour(),
            minute: t.minute(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time {0:?} (expected HH:MM)")]
pub struct ParseMinuteError(String);

impl FromStr for LocalMinute {
    type Err = ParseMinuteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMinuteError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;

        let digits = |part: &str, max_len: usize| {
            !part.is_empty() && part.len() <= max_len && part.bytes().all(|b| b.is_ascii_digit())
        };
        if !digits(h, 2) || !digits(m, 2) || m.len() != 2 {
            return Err(err());
        }

        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl fmt::Display for LocalMinute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for LocalMinute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Clock port
// ---------------------------------------------------------------------------

/// Source of the current local minute.
pub trait Clock {
    fn now_minute(&self) -> LocalMinute;
}

/// System clock shifted by a fixed UTC offset. The device has no zone
/// database, so the offset comes from configuration.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(utc_offset_minutes: i32) -> Result<Self> {
        let seconds = utc_offset_minutes
            .checked_mul(60)
            .with_context(|| format!("invalid utc offset: {utc_offset_minutes} minutes"))?;
        let offset = UtcOffset::from_whole_seconds(seconds)
            .with_context(|| format!("invalid utc offset: {utc_offset_minutes} minutes"))?;
        Ok(Self { offset })
    }
}

impl Clock for SystemClock {
    fn now_minute(&self) -> LocalMinute {
        LocalMinute::of(OffsetDateTime::now_utc().to_offset(self.offset))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
