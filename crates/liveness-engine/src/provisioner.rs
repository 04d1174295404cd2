//! Ahead-of-time occurrence provisioning from an entity's schedule rules.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::Result;
use crate::generator;
use crate::model::{Entity, Occurrence};
use crate::window::{parse_timezone, window_in};

/// Occurrences that should exist within the auto-create horizon but don't yet.
///
/// Generates every scheduled occurrence whose own interval overlaps
/// `[now, now + auto_create_horizon_hours)` and drops any whose
/// `(date, start, end)` already appears in `existing`. Cancelled records
/// count as existing, so a cancelled occurrence is never re-created.
/// Calling this again with the returned records added to `existing`
/// yields nothing.
///
/// Returns an empty list when auto-create is disabled or the entity is terminated.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`](crate::EngineError::Configuration)
/// for an unknown timezone or a horizon outside 1..=168 hours.
pub fn provision(
    entity: &Entity,
    existing: &[Occurrence],
    now: DateTime<Utc>,
) -> Result<Vec<Occurrence>> {
    let Some(horizon_end) = horizon_end(entity, now)? else {
        return Ok(Vec::new());
    };
    let tz = parse_timezone(&entity.timezone)?;

    // Local dates covering the horizon, widened by a day on each side for
    // offsets far from UTC.
    let from = now.with_timezone(&tz).date_naive() - Duration::days(1);
    let to = horizon_end.with_timezone(&tz).date_naive() + Duration::days(1);

    let mut taken: HashSet<_> = existing
        .iter()
        .filter(|o| o.entity_id == entity.id)
        .map(Occurrence::slot)
        .collect();

    let mut created = Vec::new();
    for planned in generator::union(entity.recurrence.schedules(), from, to) {
        let window = window_in(planned.date, planned.start_time, planned.end_time, tz, 0, 0)?;
        if !window.occurrence_overlaps(now, horizon_end) {
            continue;
        }
        if !taken.insert((planned.date, planned.start_time, planned.end_time)) {
            continue;
        }
        let occurrence = Occurrence::new(entity.id, planned.date, planned.start_time, planned.end_time);
        debug!(entity_id = %entity.id, occurrence_id = %occurrence.id, date = %occurrence.date, "provision");
        created.push(occurrence);
    }
    Ok(created)
}

/// End of the auto-create horizon starting at `now`, or `None` when the
/// entity does not provision (auto-create disabled or entity terminated).
///
/// # Errors
///
/// Returns [`EngineError::Configuration`](crate::EngineError::Configuration)
/// for a horizon outside 1..=168 hours.
pub fn horizon_end(entity: &Entity, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if !entity.auto_create_enabled || entity.terminated {
        return Ok(None);
    }
    entity.validate_horizon()?;
    Ok(Some(now + Duration::hours(entity.auto_create_horizon_hours)))
}
