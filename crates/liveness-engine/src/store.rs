//! The storage seam and an in-memory implementation.
//!
//! Reconciliation and provisioning only ever touch storage through
//! [`OccurrenceStore`]: one [`snapshot`](OccurrenceStore::snapshot) read and
//! one atomic [`commit`](OccurrenceStore::commit) per entity unit of work.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::id::{EntityId, OccurrenceId, PersonId};
use crate::model::{AttendeeAssignment, CheckIn, Entity, Occurrence};
use crate::reconciler::{AssignmentUpdate, AssignmentView, AttendanceView, Reconciliation};
use crate::recurrence::Recurrence;
use crate::resolver::ActiveListing;

/// Everything one entity's unit of work reads.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub entity: Entity,
    pub occurrences: Vec<Occurrence>,
    pub attendance: AttendanceView,
}

/// Writes produced by one entity's unit of work, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub activate: Vec<OccurrenceId>,
    pub deactivate: Vec<OccurrenceId>,
    pub assignments: Vec<AssignmentUpdate>,
    pub created: Vec<Occurrence>,
}

impl ChangeSet {
    #[must_use]
    pub fn creating(occurrences: Vec<Occurrence>) -> Self {
        Self {
            created: occurrences,
            ..Self::default()
        }
    }
}

impl From<&Reconciliation> for ChangeSet {
    fn from(rec: &Reconciliation) -> Self {
        Self {
            activate: rec.activate.clone(),
            deactivate: rec.deactivate.clone(),
            assignments: rec.assignment_updates.clone(),
            created: Vec::new(),
        }
    }
}

/// Synchronous access to entity, occurrence, check-in and assignment records.
///
/// Implementations report read/write failures as
/// [`EngineError::TransientStorage`] and missing records as
/// [`EngineError::NotFound`].
pub trait OccurrenceStore: Send + Sync {
    /// Ids of every non-terminated entity.
    fn entity_ids(&self) -> Result<Vec<EntityId>>;

    fn entity(&self, id: EntityId) -> Result<Entity>;

    fn occurrence(&self, id: OccurrenceId) -> Result<Occurrence>;

    /// The entity, its occurrences dated within `[from, to]` plus any of its
    /// occurrences flagged active regardless of date, the check-ins on those
    /// occurrences, and the pointer of everyone who checked in to or points
    /// at one of them.
    fn snapshot(&self, entity_id: EntityId, from: NaiveDate, to: NaiveDate)
        -> Result<EntitySnapshot>;

    /// Apply `changes` atomically: either every write lands or none does.
    fn commit(&self, entity_id: EntityId, changes: &ChangeSet) -> Result<()>;

    /// Every active occurrence with its entity's location.
    fn active_listings(&self) -> Result<Vec<ActiveListing>>;

    fn assignment(&self, person_id: PersonId) -> Result<Option<OccurrenceId>>;

    /// Every check-in `person_id` has recorded, across all entities.
    fn checkins_for(&self, person_id: PersonId) -> Result<Vec<CheckIn>>;
}

/// Serialisable contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub occurrences: Vec<Occurrence>,
    #[serde(default)]
    pub checkins: Vec<CheckIn>,
    #[serde(default)]
    pub assignments: Vec<AttendeeAssignment>,
}

#[derive(Debug, Default)]
struct Tables {
    entities: BTreeMap<EntityId, Entity>,
    occurrences: BTreeMap<OccurrenceId, Occurrence>,
    checkins: Vec<CheckIn>,
    assignments: BTreeMap<PersonId, Option<OccurrenceId>>,
}

/// Thread-safe in-memory store.
///
/// Besides the [`OccurrenceStore`] operations it exposes the writes external
/// collaborators perform (entity edits, manual occurrences, cancellations,
/// check-ins), so tests and the CLI can stand in for them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_state(state: StoreState) -> Self {
        let tables = Tables {
            entities: state.entities.into_iter().map(|e| (e.id, e)).collect(),
            occurrences: state.occurrences.into_iter().map(|o| (o.id, o)).collect(),
            checkins: state.checkins,
            assignments: state
                .assignments
                .into_iter()
                .map(|a| (a.person_id, a.active_occurrence_id))
                .collect(),
        };
        Self {
            tables: Mutex::new(tables),
        }
    }

    pub fn to_state(&self) -> Result<StoreState> {
        let tables = self.lock()?;
        Ok(StoreState {
            entities: tables.entities.values().cloned().collect(),
            occurrences: tables.occurrences.values().cloned().collect(),
            checkins: tables.checkins.clone(),
            assignments: tables
                .assignments
                .iter()
                .map(|(person_id, active_occurrence_id)| AttendeeAssignment {
                    person_id: *person_id,
                    active_occurrence_id: *active_occurrence_id,
                })
                .collect(),
        })
    }

    pub fn insert_entity(&self, entity: Entity) -> Result<EntityId> {
        let id = entity.id;
        self.lock()?.entities.insert(id, entity);
        Ok(id)
    }

    /// Replace an entity's schedule rules, as a "schedule saved" edit would.
    pub fn update_recurrence(&self, entity_id: EntityId, recurrence: Recurrence) -> Result<()> {
        let mut tables = self.lock()?;
        let entity = tables
            .entities
            .get_mut(&entity_id)
            .ok_or_else(|| EngineError::NotFound(format!("entity {entity_id}")))?;
        entity.recurrence = recurrence;
        Ok(())
    }

    pub fn insert_occurrence(&self, occurrence: Occurrence) -> Result<OccurrenceId> {
        let mut tables = self.lock()?;
        if !tables.entities.contains_key(&occurrence.entity_id) {
            return Err(EngineError::NotFound(format!(
                "entity {}",
                occurrence.entity_id
            )));
        }
        let id = occurrence.id;
        tables.occurrences.insert(id, occurrence);
        Ok(id)
    }

    /// Mark an occurrence cancelled and return its entity.
    pub fn cancel_occurrence(&self, id: OccurrenceId) -> Result<EntityId> {
        let mut tables = self.lock()?;
        let occurrence = tables
            .occurrences
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("occurrence {id}")))?;
        occurrence.is_cancelled = true;
        Ok(occurrence.entity_id)
    }

    /// Record or replace a person's check-in on an occurrence.
    pub fn record_checkin(&self, checkin: CheckIn) -> Result<EntityId> {
        let mut tables = self.lock()?;
        let entity_id = tables
            .occurrences
            .get(&checkin.occurrence_id)
            .map(|o| o.entity_id)
            .ok_or_else(|| EngineError::NotFound(format!("occurrence {}", checkin.occurrence_id)))?;
        tables.checkins.retain(|c| {
            !(c.person_id == checkin.person_id && c.occurrence_id == checkin.occurrence_id)
        });
        tables.checkins.push(checkin);
        Ok(entity_id)
    }

    /// All occurrences of one entity, ordered by date and start time.
    pub fn occurrences_for(&self, entity_id: EntityId) -> Result<Vec<Occurrence>> {
        let tables = self.lock()?;
        let mut found: Vec<Occurrence> = tables
            .occurrences
            .values()
            .filter(|o| o.entity_id == entity_id)
            .cloned()
            .collect();
        found.sort_by_key(|o| (o.date, o.start_time, o.id));
        Ok(found)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| EngineError::Fatal("memory store lock poisoned".to_string()))
    }
}

impl OccurrenceStore for MemoryStore {
    fn entity_ids(&self) -> Result<Vec<EntityId>> {
        Ok(self
            .lock()?
            .entities
            .values()
            .filter(|e| !e.terminated)
            .map(|e| e.id)
            .collect())
    }

    fn entity(&self, id: EntityId) -> Result<Entity> {
        self.lock()?
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("entity {id}")))
    }

    fn occurrence(&self, id: OccurrenceId) -> Result<Occurrence> {
        self.lock()?
            .occurrences
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("occurrence {id}")))
    }

    fn snapshot(
        &self,
        entity_id: EntityId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<EntitySnapshot> {
        let tables = self.lock()?;
        let entity = tables
            .entities
            .get(&entity_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("entity {entity_id}")))?;

        let occurrences: Vec<Occurrence> = tables
            .occurrences
            .values()
            .filter(|o| o.entity_id == entity_id && (o.is_active || (from..=to).contains(&o.date)))
            .cloned()
            .collect();
        let ids: BTreeSet<OccurrenceId> = occurrences.iter().map(|o| o.id).collect();

        let checkins: Vec<CheckIn> = tables
            .checkins
            .iter()
            .filter(|c| ids.contains(&c.occurrence_id))
            .cloned()
            .collect();

        let mut people: BTreeSet<PersonId> = checkins.iter().map(|c| c.person_id).collect();
        people.extend(
            tables
                .assignments
                .iter()
                .filter(|(_, pointer)| pointer.is_some_and(|id| ids.contains(&id)))
                .map(|(person, _)| *person),
        );
        let assignments = people
            .into_iter()
            .map(|person_id| {
                let active_occurrence_id = tables.assignments.get(&person_id).copied().flatten();
                let pointer_active = active_occurrence_id
                    .and_then(|id| tables.occurrences.get(&id))
                    .is_some_and(|o| o.is_active);
                AssignmentView {
                    person_id,
                    active_occurrence_id,
                    pointer_active,
                }
            })
            .collect();

        Ok(EntitySnapshot {
            entity,
            occurrences,
            attendance: AttendanceView {
                checkins,
                assignments,
            },
        })
    }

    fn commit(&self, entity_id: EntityId, changes: &ChangeSet) -> Result<()> {
        let mut tables = self.lock()?;

        // Validate everything before touching anything.
        for id in changes.activate.iter().chain(&changes.deactivate) {
            match tables.occurrences.get(id) {
                Some(o) if o.entity_id == entity_id => {}
                Some(_) => {
                    return Err(EngineError::TransientStorage(format!(
                        "occurrence {id} does not belong to entity {entity_id}"
                    )))
                }
                None => {
                    return Err(EngineError::TransientStorage(format!(
                        "occurrence {id} disappeared"
                    )))
                }
            }
        }
        for update in &changes.assignments {
            if let Some(id) = update.active_occurrence_id {
                let known = tables.occurrences.contains_key(&id)
                    || changes.created.iter().any(|o| o.id == id);
                if !known {
                    return Err(EngineError::TransientStorage(format!(
                        "assignment for {} references unknown occurrence {id}",
                        update.person_id
                    )));
                }
            }
        }
        let mut slots: BTreeSet<_> = tables
            .occurrences
            .values()
            .filter(|o| o.entity_id == entity_id)
            .map(Occurrence::slot)
            .collect();
        for occurrence in &changes.created {
            if occurrence.entity_id != entity_id
                || tables.occurrences.contains_key(&occurrence.id)
                || !slots.insert(occurrence.slot())
            {
                return Err(EngineError::TransientStorage(format!(
                    "occurrence {} conflicts with an existing record",
                    occurrence.id
                )));
            }
        }

        for occurrence in &changes.created {
            tables.occurrences.insert(occurrence.id, occurrence.clone());
        }
        for id in &changes.deactivate {
            if let Some(o) = tables.occurrences.get_mut(id) {
                o.is_active = false;
            }
        }
        for id in &changes.activate {
            if let Some(o) = tables.occurrences.get_mut(id) {
                o.is_active = true;
            }
        }
        for update in &changes.assignments {
            tables
                .assignments
                .insert(update.person_id, update.active_occurrence_id);
        }
        Ok(())
    }

    fn active_listings(&self) -> Result<Vec<ActiveListing>> {
        let tables = self.lock()?;
        Ok(tables
            .occurrences
            .values()
            .filter(|o| o.is_active)
            .map(|o| ActiveListing {
                occurrence: o.clone(),
                location: tables
                    .entities
                    .get(&o.entity_id)
                    .and_then(|e| e.location.clone()),
            })
            .collect())
    }

    fn assignment(&self, person_id: PersonId) -> Result<Option<OccurrenceId>> {
        Ok(self.lock()?.assignments.get(&person_id).copied().flatten())
    }

    fn checkins_for(&self, person_id: PersonId) -> Result<Vec<CheckIn>> {
        Ok(self
            .lock()?
            .checkins
            .iter()
            .filter(|c| c.person_id == person_id)
            .cloned()
            .collect())
    }
}
