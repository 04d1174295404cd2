//! The reconciliation step: which occurrences of one entity should be live at
//! `now`, and where each affected person's "currently at" pointer should go.
//!
//! [`reconcile`] is a pure function. It never reads the clock or the store;
//! the caller supplies persisted state and applies the returned diff in one
//! transaction. Both the periodic pass and the event hooks go through it.
//!
//! Activation is derived, not patched: every call recomputes the full desired
//! state from the occurrence windows and reports only the difference from
//! what is persisted, so calling it again after applying the result yields an
//! empty diff.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::id::{EntityId, OccurrenceId, PersonId};
use crate::model::{CheckIn, Entity, EntityKind, Occurrence};
use crate::resolver::{self, Candidate};
use crate::window::{parse_timezone, window_in};

/// A person's current pointer as seen by one entity's reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentView {
    pub person_id: PersonId,
    pub active_occurrence_id: Option<OccurrenceId>,
    /// Persisted `is_active` of the occurrence the pointer refers to. Only
    /// consulted when that occurrence belongs to another entity.
    pub pointer_active: bool,
}

/// Check-ins on an entity's occurrences and the pointers of the people involved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttendanceView {
    pub checkins: Vec<CheckIn>,
    pub assignments: Vec<AssignmentView>,
}

/// New value for one person's pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AssignmentUpdate {
    pub person_id: PersonId,
    pub active_occurrence_id: Option<OccurrenceId>,
}

/// An occurrence left out of a pass because its times are unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedOccurrence {
    pub occurrence_id: OccurrenceId,
    pub reason: String,
}

/// The minimal set of transitions for one entity at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub entity_id: EntityId,
    pub evaluated_at: DateTime<Utc>,
    pub activate: Vec<OccurrenceId>,
    pub deactivate: Vec<OccurrenceId>,
    pub assignment_updates: Vec<AssignmentUpdate>,
    pub skipped: Vec<SkippedOccurrence>,
}

impl Reconciliation {
    /// True when nothing needs to be written.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.activate.is_empty() && self.deactivate.is_empty() && self.assignment_updates.is_empty()
    }
}

/// Compute the transitions that bring `entity` in line with `now`.
///
/// `occurrences` are the persisted occurrences near `now` plus any currently
/// flagged active; records of other entities are ignored. Cancelled
/// occurrences never become active, and any that are still flagged active
/// are deactivated. A terminated entity has no live occurrences.
///
/// For [`EntityKind::Regular`] entities only the earliest-starting live
/// occurrence is kept; [`EntityKind::Festival`] entities keep every live one.
///
/// # Errors
///
/// Returns [`EngineError::Configuration`](crate::EngineError::Configuration)
/// for an unknown timezone or out-of-range buffers. Occurrences whose end is
/// not after their start are skipped and reported in
/// [`Reconciliation::skipped`] instead of failing the entity.
pub fn reconcile(
    entity: &Entity,
    occurrences: &[Occurrence],
    attendance: &AttendanceView,
    now: DateTime<Utc>,
) -> Result<Reconciliation> {
    let tz = parse_timezone(&entity.timezone)?;
    entity.validate_buffers()?;

    let own: Vec<&Occurrence> = occurrences
        .iter()
        .filter(|o| o.entity_id == entity.id)
        .collect();

    // 1-2. Window every participating occurrence and keep those containing now.
    let mut skipped = Vec::new();
    let mut live: Vec<Candidate> = Vec::new();
    for occurrence in own.iter().filter(|o| !o.is_cancelled && !entity.terminated) {
        match window_in(
            occurrence.date,
            occurrence.start_time,
            occurrence.end_time,
            tz,
            entity.buffer_before_minutes,
            entity.buffer_after_minutes,
        ) {
            Ok(window) if window.contains(now) => live.push(Candidate {
                occurrence_id: occurrence.id,
                starts_at: window.occurrence_start,
            }),
            Ok(_) => {}
            Err(e) => {
                warn!(entity_id = %entity.id, occurrence_id = %occurrence.id, "skipping occurrence: {e}");
                skipped.push(SkippedOccurrence {
                    occurrence_id: occurrence.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    // 3. Overlap policy.
    live.sort_by_key(|c| (c.starts_at, c.occurrence_id));
    if entity.kind == EntityKind::Regular {
        live.truncate(1);
    }
    let desired: BTreeSet<OccurrenceId> = live.iter().map(|c| c.occurrence_id).collect();

    // 4. Diff against persisted flags.
    let persisted: BTreeSet<OccurrenceId> =
        own.iter().filter(|o| o.is_active).map(|o| o.id).collect();
    let activate: Vec<OccurrenceId> = live
        .iter()
        .map(|c| c.occurrence_id)
        .filter(|id| !persisted.contains(id))
        .collect();
    let deactivate: Vec<OccurrenceId> = persisted.difference(&desired).copied().collect();

    // 5-6. Pointers, computed as final values so deactivation and a
    // continuing activation land in the same write.
    let own_ids: HashSet<OccurrenceId> = own.iter().map(|o| o.id).collect();
    let assignment_updates = resolve_assignments(&own_ids, &desired, &live, attendance);

    for id in &activate {
        debug!(entity_id = %entity.id, occurrence_id = %id, "activate");
    }
    for id in &deactivate {
        debug!(entity_id = %entity.id, occurrence_id = %id, "deactivate");
    }
    for update in &assignment_updates {
        debug!(
            entity_id = %entity.id,
            person_id = %update.person_id,
            occurrence = ?update.active_occurrence_id.map(|id| id.to_string()),
            "assign"
        );
    }

    Ok(Reconciliation {
        entity_id: entity.id,
        evaluated_at: now,
        activate,
        deactivate,
        assignment_updates,
        skipped,
    })
}

fn resolve_assignments(
    own_ids: &HashSet<OccurrenceId>,
    desired: &BTreeSet<OccurrenceId>,
    live: &[Candidate],
    attendance: &AttendanceView,
) -> Vec<AssignmentUpdate> {
    let checkins: Vec<CheckIn> = attendance
        .checkins
        .iter()
        .filter(|c| own_ids.contains(&c.occurrence_id))
        .cloned()
        .collect();

    // Everyone who points at this entity or said yes to one of its live occurrences.
    let mut people: BTreeMap<PersonId, (Option<OccurrenceId>, bool)> = attendance
        .assignments
        .iter()
        .map(|a| (a.person_id, (a.active_occurrence_id, a.pointer_active)))
        .collect();
    for checkin in checkins.iter().filter(|c| c.is_yes() && desired.contains(&c.occurrence_id)) {
        people.entry(checkin.person_id).or_insert((None, false));
    }

    let mut updates = Vec::new();
    for (person_id, (current, pointer_active)) in people {
        let points_here = current.is_some_and(|id| own_ids.contains(&id));
        let still_active = match current {
            None => false,
            Some(id) if points_here => {
                desired.contains(&id) && said_yes(person_id, id, &checkins)
            }
            Some(_) => pointer_active,
        };
        if still_active {
            continue;
        }
        let next = resolver::resolve(person_id, live, &checkins);
        let changed = match next {
            Some(id) => current != Some(id),
            // Pointers into other entities belong to their own reconciliation.
            None => points_here,
        };
        if changed {
            updates.push(AssignmentUpdate {
                person_id,
                active_occurrence_id: next,
            });
        }
    }
    updates
}

fn said_yes(person_id: PersonId, occurrence_id: OccurrenceId, checkins: &[CheckIn]) -> bool {
    checkins
        .iter()
        .any(|c| c.person_id == person_id && c.occurrence_id == occurrence_id && c.is_yes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::model::Attendance;
    use crate::recurrence::Recurrence;
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn entity(timezone: &str, kind: EntityKind, buffers: i64) -> Entity {
        let recurrence = Recurrence::from_json(
            r#"{"schedules":[{"type":"weekly","weekday":"thursday","start_time":"19:00","end_time":"22:30","every_n_weeks":1}]}"#,
        )
        .unwrap();
        let mut entity = Entity::new(timezone, recurrence);
        entity.kind = kind;
        entity.buffer_before_minutes = buffers;
        entity.buffer_after_minutes = buffers;
        entity
    }

    fn occurrence(entity: &Entity, start: NaiveTime, end: NaiveTime) -> Occurrence {
        Occurrence::new(entity.id, NaiveDate::from_ymd_opt(2024, 1, 18).unwrap(), start, end)
    }

    fn yes(person: PersonId, occ: &Occurrence, at: DateTime<Utc>) -> CheckIn {
        CheckIn {
            person_id: person,
            occurrence_id: occ.id,
            attendance: Attendance::Yes,
            checked_in_at: at,
        }
    }

    /// Apply a reconciliation the way a store would.
    fn apply(rec: &Reconciliation, occurrences: &mut [Occurrence], attendance: &mut AttendanceView) {
        for occ in occurrences.iter_mut() {
            if rec.activate.contains(&occ.id) {
                occ.is_active = true;
            }
            if rec.deactivate.contains(&occ.id) {
                occ.is_active = false;
            }
        }
        for update in &rec.assignment_updates {
            let pointer_active = update
                .active_occurrence_id
                .is_some_and(|id| occurrences.iter().any(|o| o.id == id && o.is_active));
            match attendance
                .assignments
                .iter_mut()
                .find(|a| a.person_id == update.person_id)
            {
                Some(a) => {
                    a.active_occurrence_id = update.active_occurrence_id;
                    a.pointer_active = pointer_active;
                }
                None => attendance.assignments.push(AssignmentView {
                    person_id: update.person_id,
                    active_occurrence_id: update.active_occurrence_id,
                    pointer_active,
                }),
            }
        }
    }

    #[test]
    fn test_activation_follows_chicago_window() {
        let e = entity("America/Chicago", EntityKind::Regular, 60);
        let occ = occurrence(&e, t(19, 0), t(22, 30));
        let view = AttendanceView::default();

        // 18:05 CST
        let rec = reconcile(&e, &[occ.clone()], &view, utc(2024, 1, 19, 0, 5)).unwrap();
        assert_eq!(rec.activate, vec![occ.id]);

        // 17:55 CST
        let rec = reconcile(&e, &[occ.clone()], &view, utc(2024, 1, 18, 23, 55)).unwrap();
        assert!(rec.is_noop());
    }

    #[test]
    fn test_second_pass_is_noop() {
        let e = entity("America/Chicago", EntityKind::Regular, 60);
        let person = PersonId::new();
        let mut occurrences = vec![occurrence(&e, t(19, 0), t(22, 30))];
        let mut view = AttendanceView {
            checkins: vec![yes(person, &occurrences[0], utc(2024, 1, 18, 12, 0))],
            assignments: vec![],
        };
        let now = utc(2024, 1, 19, 1, 30);

        let first = reconcile(&e, &occurrences, &view, now).unwrap();
        assert_eq!(first.activate.len(), 1);
        assert_eq!(
            first.assignment_updates,
            vec![AssignmentUpdate {
                person_id: person,
                active_occurrence_id: Some(occurrences[0].id)
            }]
        );
        apply(&first, &mut occurrences, &mut view);

        let second = reconcile(&e, &occurrences, &view, now).unwrap();
        assert!(second.is_noop(), "{second:?}");
    }

    #[test]
    fn test_deactivation_nulls_pointer() {
        let e = entity("UTC", EntityKind::Regular, 0);
        let person = PersonId::new();
        let mut occ = occurrence(&e, t(19, 0), t(22, 0));
        occ.is_active = true;
        let view = AttendanceView {
            checkins: vec![yes(person, &occ, utc(2024, 1, 18, 12, 0))],
            assignments: vec![AssignmentView {
                person_id: person,
                active_occurrence_id: Some(occ.id),
                pointer_active: true,
            }],
        };

        let rec = reconcile(&e, &[occ.clone()], &view, utc(2024, 1, 18, 22, 0)).unwrap();
        assert_eq!(rec.deactivate, vec![occ.id]);
        assert_eq!(
            rec.assignment_updates,
            vec![AssignmentUpdate {
                person_id: person,
                active_occurrence_id: None
            }]
        );
    }

    #[test]
    fn test_withdrawn_yes_releases_pointer() {
        let e = entity("UTC", EntityKind::Regular, 0);
        let person = PersonId::new();
        let mut occ = occurrence(&e, t(19, 0), t(22, 0));
        occ.is_active = true;
        let mut declined = yes(person, &occ, utc(2024, 1, 18, 19, 30));
        declined.attendance = Attendance::No;
        let view = AttendanceView {
            checkins: vec![declined],
            assignments: vec![AssignmentView {
                person_id: person,
                active_occurrence_id: Some(occ.id),
                pointer_active: true,
            }],
        };

        let rec = reconcile(&e, &[occ.clone()], &view, utc(2024, 1, 18, 20, 0)).unwrap();
        assert!(rec.activate.is_empty() && rec.deactivate.is_empty());
        assert_eq!(
            rec.assignment_updates,
            vec![AssignmentUpdate {
                person_id: person,
                active_occurrence_id: None
            }]
        );
    }

    #[test]
    fn test_regular_overlap_keeps_earliest() {
        let e = entity("UTC", EntityKind::Regular, 60);
        let early = occurrence(&e, t(19, 0), t(22, 0));
        let mut late = occurrence(&e, t(20, 0), t(23, 0));
        late.is_active = true;

        let rec = reconcile(&e, &[late.clone(), early.clone()], &AttendanceView::default(), utc(2024, 1, 18, 20, 30))
            .unwrap();
        assert_eq!(rec.activate, vec![early.id]);
        assert_eq!(rec.deactivate, vec![late.id]);
    }

    #[test]
    fn test_festival_activates_every_live_occurrence() {
        let e = entity("UTC", EntityKind::Festival, 0);
        let a = occurrence(&e, t(19, 0), t(22, 0));
        let b = occurrence(&e, t(20, 0), t(23, 0));
        let person = PersonId::new();
        let view = AttendanceView {
            checkins: vec![
                yes(person, &a, utc(2024, 1, 18, 9, 0)),
                yes(person, &b, utc(2024, 1, 18, 10, 0)),
            ],
            assignments: vec![],
        };

        let rec = reconcile(&e, &[b.clone(), a.clone()], &view, utc(2024, 1, 18, 20, 30)).unwrap();
        assert_eq!(rec.activate, vec![a.id, b.id]);
        assert_eq!(
            rec.assignment_updates,
            vec![AssignmentUpdate {
                person_id: person,
                active_occurrence_id: Some(a.id)
            }]
        );
    }

    #[test]
    fn test_cancelled_occurrence_is_deactivated() {
        let e = entity("UTC", EntityKind::Regular, 60);
        let mut occ = occurrence(&e, t(19, 0), t(22, 0));
        occ.is_active = true;
        occ.is_cancelled = true;
        let rec = reconcile(&e, &[occ.clone()], &AttendanceView::default(), utc(2024, 1, 18, 20, 0)).unwrap();
        assert!(rec.activate.is_empty());
        assert_eq!(rec.deactivate, vec![occ.id]);
    }

    #[test]
    fn test_terminated_entity_has_nothing_live() {
        let mut e = entity("UTC", EntityKind::Regular, 60);
        e.terminated = true;
        let mut occ = occurrence(&e, t(19, 0), t(22, 0));
        occ.is_active = true;
        let rec = reconcile(&e, &[occ.clone()], &AttendanceView::default(), utc(2024, 1, 18, 20, 0)).unwrap();
        assert_eq!(rec.deactivate, vec![occ.id]);
    }

    #[test]
    fn test_abutting_occurrences_hand_over_without_null() {
        let e = entity("UTC", EntityKind::Regular, 0);
        let person = PersonId::new();
        let mut first = occurrence(&e, t(19, 0), t(22, 0));
        first.is_active = true;
        let second = occurrence(&e, t(22, 0), t(23, 0));
        let view = AttendanceView {
            checkins: vec![
                yes(person, &first, utc(2024, 1, 18, 9, 0)),
                yes(person, &second, utc(2024, 1, 18, 9, 5)),
            ],
            assignments: vec![AssignmentView {
                person_id: person,
                active_occurrence_id: Some(first.id),
                pointer_active: true,
            }],
        };

        let rec = reconcile(&e, &[first.clone(), second.clone()], &view, utc(2024, 1, 18, 22, 0)).unwrap();
        assert_eq!(rec.deactivate, vec![first.id]);
        assert_eq!(rec.activate, vec![second.id]);
        // One final value per person: never an intermediate null.
        assert_eq!(
            rec.assignment_updates,
            vec![AssignmentUpdate {
                person_id: person,
                active_occurrence_id: Some(second.id)
            }]
        );
    }

    #[test]
    fn test_pointer_to_other_active_occurrence_is_kept() {
        let e = entity("UTC", EntityKind::Regular, 0);
        let person = PersonId::new();
        let occ = occurrence(&e, t(19, 0), t(22, 0));
        let elsewhere = OccurrenceId::new();
        let view = AttendanceView {
            checkins: vec![yes(person, &occ, utc(2024, 1, 18, 9, 0))],
            assignments: vec![AssignmentView {
                person_id: person,
                active_occurrence_id: Some(elsewhere),
                pointer_active: true,
            }],
        };
        let rec = reconcile(&e, &[occ.clone()], &view, utc(2024, 1, 18, 20, 0)).unwrap();
        assert_eq!(rec.activate, vec![occ.id]);
        assert!(rec.assignment_updates.is_empty());
    }

    #[test]
    fn test_pointer_to_stale_occurrence_elsewhere_is_replaced() {
        let e = entity("UTC", EntityKind::Regular, 0);
        let person = PersonId::new();
        let occ = occurrence(&e, t(19, 0), t(22, 0));
        let view = AttendanceView {
            checkins: vec![yes(person, &occ, utc(2024, 1, 18, 9, 0))],
            assignments: vec![AssignmentView {
                person_id: person,
                active_occurrence_id: Some(OccurrenceId::new()),
                pointer_active: false,
            }],
        };
        let rec = reconcile(&e, &[occ.clone()], &view, utc(2024, 1, 18, 20, 0)).unwrap();
        assert_eq!(rec.assignment_updates[0].active_occurrence_id, Some(occ.id));
    }

    #[test]
    fn test_invalid_timezone_fails_entity() {
        let e = entity("Nowhere/Special", EntityKind::Regular, 60);
        let occ = occurrence(&e, t(19, 0), t(22, 0));
        let err = reconcile(&e, &[occ], &AttendanceView::default(), utc(2024, 1, 18, 20, 0)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_malformed_occurrence_is_skipped() {
        let e = entity("UTC", EntityKind::Festival, 0);
        let broken = occurrence(&e, t(23, 0), t(1, 0));
        let fine = occurrence(&e, t(19, 0), t(22, 0));
        let rec = reconcile(&e, &[broken.clone(), fine.clone()], &AttendanceView::default(), utc(2024, 1, 18, 20, 0))
            .unwrap();
        assert_eq!(rec.activate, vec![fine.id]);
        assert_eq!(rec.skipped.len(), 1);
        assert_eq!(rec.skipped[0].occurrence_id, broken.id);
    }

    #[test]
    fn test_other_entities_records_are_ignored() {
        let e = entity("UTC", EntityKind::Regular, 0);
        let other = entity("UTC", EntityKind::Regular, 0);
        let foreign = occurrence(&other, t(19, 0), t(22, 0));
        let rec = reconcile(&e, &[foreign], &AttendanceView::default(), utc(2024, 1, 18, 20, 0)).unwrap();
        assert!(rec.is_noop());
    }
}
