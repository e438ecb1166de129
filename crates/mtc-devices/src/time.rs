//! Observation timestamp resolution.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use tracing::warn;

use mtc_core::DeviceSettings;

/// Format a wall clock time the way observations carry it.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an adapter calendar timestamp. Zone-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    let trimmed = raw.trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Reported {
    /// Millisecond tick counter.
    Ticks(f64),
    Calendar(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Base {
    wall: DateTime<Utc>,
    reported: Reported,
}

/// Per-device clock state for relative timestamps.
///
/// The first timestamp seen pins a base pair of (agent clock, reported
/// value); later timestamps are placed at the same offset from the agent
/// clock base as they are from the reported base.
#[derive(Debug, Clone, Default)]
pub struct TimeResolver {
    base: Option<Base>,
}

impl TimeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the timestamp for a line.
    pub fn resolve(
        &mut self,
        raw: Option<&str>,
        settings: &DeviceSettings,
        now: DateTime<Utc>,
    ) -> String {
        let raw = match raw.map(str::trim) {
            Some(raw) if !raw.is_empty() && !settings.ignore_timestamps => raw,
            _ => return format_timestamp(now),
        };
        if !settings.relative_time {
            return raw.to_string();
        }

        match self.base {
            None => match Self::reported(raw) {
                Some(reported) => {
                    self.base = Some(Base { wall: now, reported });
                    format_timestamp(now)
                }
                None => {
                    warn!(category = "time", "Unusable relative timestamp: {}", raw);
                    format_timestamp(now)
                }
            },
            Some(base) => {
                let offset_ms = match (base.reported, Self::reported(raw)) {
                    (Reported::Ticks(start), Some(Reported::Ticks(ticks))) => ticks - start,
                    (Reported::Calendar(start), Some(Reported::Calendar(time))) => {
                        (time - start).num_milliseconds() as f64
                    }
                    _ => {
                        warn!(category = "time", "Timestamp does not match base: {}", raw);
                        return format_timestamp(now);
                    }
                };
                let shifted = Some(offset_ms * 1000.0)
                    .filter(|micros| micros.is_finite() && micros.abs() < i64::MAX as f64)
                    .and_then(|micros| {
                        base.wall
                            .checked_add_signed(chrono::Duration::microseconds(micros.round() as i64))
                    });
                match shifted {
                    Some(time) => format_timestamp(time),
                    None => {
                        warn!(category = "time", "Timestamp offset out of range: {}", raw);
                        format_timestamp(now)
                    }
                }
            }
        }
    }

    /// Forget the base pair, e.g. when the adapter reconnects.
    pub fn reset(&mut self) {
        self.base = None;
    }

    fn reported(raw: &str) -> Option<Reported> {
        if raw.contains('T') {
            parse_timestamp(raw).map(Reported::Calendar)
        } else {
            raw.parse::<f64>()
                .ok()
                .filter(|ticks| ticks.is_finite())
                .map(Reported::Ticks)
        }
    }
}
