//! Idle-decision policy over log-derived activity signals.
//!
//! Log timestamps carry only a time of day, so every comparison combines
//! them with today's date. This assumes all relevant events fall within one
//! calendar day.

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use tracing::debug;

/// Shape of the log timestamp column.
pub const LOG_TIME_FORMAT: &str = "%H:%M:%S";

/// Connect/disconnect marks read from a container's log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityWindow {
    /// Most recent "connection established" mark.
    pub connect: Option<NaiveTime>,
    /// Most recent "client disconnected" mark.
    pub disconnect: Option<NaiveTime>,
}

/// Parse one log timestamp, brackets and all.
///
/// Malformed input counts as "no signal" rather than an error, so one bad
/// log line cannot wedge the monitor.
pub fn parse_log_time(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim().trim_matches(['[', ']']);
    if trimmed.is_empty() {
        return None;
    }
    match NaiveTime::parse_from_str(trimmed, LOG_TIME_FORMAT) {
        Ok(time) => Some(time),
        Err(err) => {
            debug!(raw = %trimmed, error = %err, "unparseable log timestamp");
            None
        }
    }
}

/// Decide whether a container counts as active.
///
/// - No marks at all: active while the container is within the grace
///   period after its own start.
/// - No disconnect mark: a client is connected, always active.
/// - Connect after disconnect: the client reconnected, active.
/// - Disconnect after connect: active until the idle offset has elapsed
///   since the disconnect.
pub fn is_active(
    now: NaiveDateTime,
    window: ActivityWindow,
    container_start: NaiveTime,
    idle_offset: TimeDelta,
) -> bool {
    let today = now.date();

    match (window.connect, window.disconnect) {
        (None, None) => now - today.and_time(container_start) <= idle_offset,
        (_, None) => true,
        (connect, Some(disconnect)) => {
            let start = connect.unwrap_or(container_start);
            if start > disconnect {
                return true;
            }
            now - today.and_time(disconnect) <= idle_offset
        }
    }
}

/// Elapsed session time when the window is well-formed.
///
/// Non-positive durations are discarded as non-meaningful.
pub fn session_duration(window: ActivityWindow) -> Option<TimeDelta> {
    let duration = window.disconnect? - window.connect?;
    (duration > TimeDelta::zero()).then_some(duration)
}
