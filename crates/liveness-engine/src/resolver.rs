//! Person assignment tie-breaks and the co-location query.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::{OccurrenceId, PersonId};
use crate::model::{CheckIn, Location, Occurrence};

/// A simultaneously active occurrence a person could be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub occurrence_id: OccurrenceId,
    /// The occurrence's own UTC start, without buffers.
    pub starts_at: DateTime<Utc>,
}

/// Choose the occurrence `person_id` should be assigned to.
///
/// Only candidates the person has a "yes" check-in for are considered. The
/// earliest-starting one wins; on an exact tie the most recent check-in
/// wins, and after that the lower occurrence id, so the result never depends
/// on input order.
///
/// Returns `None` when the person has no "yes" check-in on any candidate.
#[must_use]
pub fn resolve(
    person_id: PersonId,
    candidates: &[Candidate],
    checkins: &[CheckIn],
) -> Option<OccurrenceId> {
    candidates
        .iter()
        .filter_map(|c| {
            latest_yes(person_id, c.occurrence_id, checkins).map(|checked_in_at| (c, checked_in_at))
        })
        .min_by(|(a, a_at), (b, b_at)| {
            a.starts_at
                .cmp(&b.starts_at)
                .then_with(|| b_at.cmp(a_at))
                .then_with(|| a.occurrence_id.cmp(&b.occurrence_id))
        })
        .map(|(c, _)| c.occurrence_id)
}

fn latest_yes(
    person_id: PersonId,
    occurrence_id: OccurrenceId,
    checkins: &[CheckIn],
) -> Option<DateTime<Utc>> {
    checkins
        .iter()
        .filter(|c| c.person_id == person_id && c.occurrence_id == occurrence_id && c.is_yes())
        .map(|c| c.checked_in_at)
        .max()
}

/// A currently active occurrence together with where its entity takes place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveListing {
    pub occurrence: Occurrence,
    pub location: Option<Location>,
}

/// Other active occurrences at the same (country, city) as `current`.
///
/// Read-only: this answers "where else could this person check in right
/// now" and never changes an assignment. Returns nothing when `current` is
/// not among `active` or its entity has no location.
#[must_use]
pub fn co_located_alternatives(
    current: OccurrenceId,
    active: &[ActiveListing],
) -> Vec<&ActiveListing> {
    let Some(here) = active
        .iter()
        .find(|l| l.occurrence.id == current)
        .and_then(|l| l.location.as_ref())
    else {
        return Vec::new();
    };
    let mut found: Vec<&ActiveListing> = active
        .iter()
        .filter(|l| l.occurrence.id != current && l.occurrence.is_active)
        .filter(|l| l.location.as_ref().is_some_and(|loc| loc.same_place(here)))
        .collect();
    found.sort_by_key(|l| (l.occurrence.date, l.occurrence.start_time, l.occurrence.id));
    found
}
