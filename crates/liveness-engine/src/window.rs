//! Active windows: local occurrence times → UTC intervals.
//!
//! Local wall-clock times are resolved against an IANA timezone, so DST
//! transitions and fractional offsets (e.g. `Asia/Kolkata`, UTC+05:30) are
//! handled by `chrono-tz` rather than by fixed offsets.
//!
//! # DST edge cases
//!
//! - A local time inside a spring-forward gap does not exist. It is read
//!   with the offset in force just before the gap, which moves it forward
//!   by the size of the gap (02:30 becomes 03:30 for a one-hour jump).
//! - A local time inside a fall-back overlap happens twice. The earlier
//!   instant is used.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{EngineError, Result};

/// The UTC interval during which an occurrence is live, buffers included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveWindow {
    /// Occurrence start minus the before-buffer.
    pub start: DateTime<Utc>,
    /// Occurrence end plus the after-buffer.
    pub end: DateTime<Utc>,
    /// The occurrence's own start, without buffers.
    pub occurrence_start: DateTime<Utc>,
    /// The occurrence's own end, without buffers.
    pub occurrence_end: DateTime<Utc>,
}

impl ActiveWindow {
    /// Half-open containment: `start <= instant < end`.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whether the occurrence itself (without buffers) overlaps `[from, to)`.
    #[must_use]
    pub fn occurrence_overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.occurrence_start < to && from < self.occurrence_end
    }
}

/// Compute the active window of one occurrence.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`] if `timezone` is not a valid IANA
/// identifier, or if `end` is not after `start`. The caller skips the entity
/// (bad timezone) or the occurrence (bad times) for this pass.
pub fn window(
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    timezone: &str,
    buffer_before_minutes: i64,
    buffer_after_minutes: i64,
) -> Result<ActiveWindow> {
    let tz = parse_timezone(timezone)?;
    window_in(
        date,
        start,
        end,
        tz,
        buffer_before_minutes,
        buffer_after_minutes,
    )
}

/// Like [`window`] with an already-resolved timezone.
pub fn window_in(
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
    buffer_before_minutes: i64,
    buffer_after_minutes: i64,
) -> Result<ActiveWindow> {
    if start >= end {
        return Err(EngineError::Configuration(format!(
            "occurrence on {date} ends at {} before or at its start {}",
            end.format("%H:%M"),
            start.format("%H:%M")
        )));
    }
    let occurrence_start = resolve_local(tz, date.and_time(start));
    let occurrence_end = resolve_local(tz, date.and_time(end));
    Ok(ActiveWindow {
        start: occurrence_start - Duration::minutes(buffer_before_minutes),
        end: occurrence_end + Duration::minutes(buffer_after_minutes),
        occurrence_start,
        occurrence_end,
    })
}

/// Parse an IANA timezone string into `Tz`.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`] for unknown identifiers.
pub fn parse_timezone(s: &str) -> Result<Tz> {
    s.parse::<Tz>()
        .map_err(|_| EngineError::Configuration(format!("invalid timezone '{s}'")))
}

/// Resolve a local wall-clock time to a UTC instant.
#[must_use]
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt.with_timezone(&Utc);
    }
    // Inside a gap: use the offset in force before the transition. No
    // zone has a gap longer than a day, so a day earlier is always clear.
    let before = naive - Duration::days(1);
    let offset = tz.offset_from_local_datetime(&before).earliest().map_or_else(
        || tz.offset_from_utc_datetime(&before).fix(),
        |o| o.fix(),
    );
    Utc.from_utc_datetime(&(naive - Duration::seconds(i64::from(offset.local_minus_utc()))))
}

/// Format the UTC offset of an instant in `tz` (e.g. "-05:00", "+05:30").
#[must_use]
pub fn format_utc_offset(instant: DateTime<Utc>, tz: Tz) -> String {
    let offset_secs = instant.with_timezone(&tz).offset().fix().local_minus_utc();
    let sign = if offset_secs >= 0 { "+" } else { "-" };
    let abs_secs = offset_secs.unsigned_abs();
    let hours = abs_secs / 3600;
    let minutes = (abs_secs % 3600) / 60;
    format!("{sign}{hours:02}:{minutes:02}")
}

/// Whether DST is in effect at `instant` in `tz`.
#[must_use]
pub fn is_dst_active(instant: DateTime<Utc>, tz: Tz) -> bool {
    // Compare against the offset on January 1 (standard time north of the
    // equator) and July 1 (standard time south of it): DST is active when the
    // current offset is the larger of the two and they differ.
    let year = instant.year();
    let offset_at = |month: u32| {
        Utc.with_ymd_and_hms(year, month, 1, 12, 0, 0)
            .single()
            .map(|dt| dt.with_timezone(&tz).offset().fix().local_minus_utc())
    };
    let current = instant.with_timezone(&tz).offset().fix().local_minus_utc();
    match (offset_at(1), offset_at(7)) {
        (Some(jan), Some(jul)) if jan != jul => current == jan.max(jul),
        _ => false,
    }
}
