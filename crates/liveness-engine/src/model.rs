//! Records this crate reads and writes: entities, occurrences, check-ins and
//! attendee assignments.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::id::{EntityId, OccurrenceId, PersonId};
use crate::recurrence::{hhmm, Recurrence};

pub const DEFAULT_BUFFER_MINUTES: i64 = 60;
pub const MAX_BUFFER_MINUTES: i64 = 24 * 60;
pub const DEFAULT_HORIZON_HOURS: i64 = 24;
pub const MAX_HORIZON_HOURS: i64 = 168;

/// Overlap policy of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// At most one occurrence is active at any instant.
    #[default]
    Regular,
    /// Any number of occurrences may be active at once.
    Festival,
}

/// Where an entity takes place, used for co-location queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub city: String,
}

impl Location {
    /// Trimmed, case-insensitive comparison of country and city.
    #[must_use]
    pub fn same_place(&self, other: &Location) -> bool {
        fn norm(s: &str) -> String {
            s.trim().to_lowercase()
        }
        norm(&self.country) == norm(&other.country) && norm(&self.city) == norm(&other.city)
    }
}

/// A recurring session definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    /// IANA timezone identifier, e.g. `"America/Chicago"`.
    pub timezone: String,
    pub recurrence: Recurrence,
    #[serde(default = "default_buffer")]
    pub buffer_before_minutes: i64,
    #[serde(default = "default_buffer")]
    pub buffer_after_minutes: i64,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub auto_create_enabled: bool,
    #[serde(default = "default_horizon")]
    pub auto_create_horizon_hours: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Terminated entities are skipped by periodic passes.
    #[serde(default)]
    pub terminated: bool,
}

fn default_buffer() -> i64 {
    DEFAULT_BUFFER_MINUTES
}

fn default_horizon() -> i64 {
    DEFAULT_HORIZON_HOURS
}

impl Entity {
    /// A regular entity with default buffers and auto-create disabled.
    #[must_use]
    pub fn new(timezone: impl Into<String>, recurrence: Recurrence) -> Self {
        Self {
            id: EntityId::new(),
            name: String::new(),
            timezone: timezone.into(),
            recurrence,
            buffer_before_minutes: DEFAULT_BUFFER_MINUTES,
            buffer_after_minutes: DEFAULT_BUFFER_MINUTES,
            kind: EntityKind::Regular,
            auto_create_enabled: false,
            auto_create_horizon_hours: DEFAULT_HORIZON_HOURS,
            location: None,
            terminated: false,
        }
    }

    /// Check the buffer settings.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when either buffer is negative
    /// or longer than a day.
    pub fn validate_buffers(&self) -> Result<()> {
        for (name, value) in [
            ("buffer_before_minutes", self.buffer_before_minutes),
            ("buffer_after_minutes", self.buffer_after_minutes),
        ] {
            if !(0..=MAX_BUFFER_MINUTES).contains(&value) {
                return Err(EngineError::Configuration(format!(
                    "entity {}: {name} {value} outside 0..={MAX_BUFFER_MINUTES}",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Check the auto-create horizon.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when the horizon is outside 1..=168 hours.
    pub fn validate_horizon(&self) -> Result<()> {
        if !(1..=MAX_HORIZON_HOURS).contains(&self.auto_create_horizon_hours) {
            return Err(EngineError::Configuration(format!(
                "entity {}: auto_create_horizon_hours {} outside 1..={MAX_HORIZON_HOURS}",
                self.id, self.auto_create_horizon_hours
            )));
        }
        Ok(())
    }
}

/// One dated materialisation of an entity.
///
/// `is_active` is written only by reconciliation; `is_cancelled` only by
/// external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: OccurrenceId,
    pub entity_id: EntityId,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_cancelled: bool,
}

impl Occurrence {
    /// A new, inactive, non-cancelled occurrence.
    #[must_use]
    pub fn new(entity_id: EntityId, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            id: OccurrenceId::new(),
            entity_id,
            date,
            start_time: start,
            end_time: end,
            is_active: false,
            is_cancelled: false,
        }
    }

    /// The `(date, start, end)` identity used to detect duplicates.
    #[must_use]
    pub fn slot(&self) -> (NaiveDate, NaiveTime, NaiveTime) {
        (self.date, self.start_time, self.end_time)
    }
}

/// A person's answer to "are you attending?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attendance {
    Yes,
    Maybe,
    No,
}

/// A check-in record, owned by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIn {
    pub person_id: PersonId,
    pub occurrence_id: OccurrenceId,
    pub attendance: Attendance,
    pub checked_in_at: DateTime<Utc>,
}

impl CheckIn {
    #[must_use]
    pub fn is_yes(&self) -> bool {
        self.attendance == Attendance::Yes
    }
}

/// The per-person "currently at" pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendeeAssignment {
    pub person_id: PersonId,
    pub active_occurrence_id: Option<OccurrenceId>,
}
