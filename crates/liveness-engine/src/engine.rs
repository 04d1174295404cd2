//! Orchestration: periodic passes, event hooks and per-entity serialisation.
//!
//! The engine wraps the pure [`reconcile`] and [`provision`] functions with
//! storage I/O. Each entity's unit of work (snapshot, compute, commit) runs
//! under that entity's lock, so an event-driven pass and a periodic pass can
//! never interleave writes for the same entity. Entities are independent:
//! one entity's failure is recorded in the [`PassSummary`] and the pass moves on.
//!
//! Reconciliation only sees one entity at a time, so people whose pointer
//! changed are settled afterwards against every active occurrence they said
//! yes to, whichever entity it belongs to.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::id::{EntityId, OccurrenceId, PersonId};
use crate::model::Occurrence;
use crate::provisioner::{horizon_end, provision};
use crate::reconciler::{reconcile, AssignmentUpdate, Reconciliation};
use crate::resolver::{co_located_alternatives, resolve, ActiveListing, Candidate};
use crate::store::{ChangeSet, OccurrenceStore};
use crate::window::{parse_timezone, window_in};

/// Which stage of a periodic pass an entity failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reconcile,
    Provision,
}

/// One entity excluded from a stage of a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub entity_id: EntityId,
    pub stage: Stage,
    pub kind: &'static str,
    pub message: String,
}

/// Structured result of a periodic pass, for the external caller to log or alert on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub evaluated_at: DateTime<Utc>,
    pub activated: usize,
    pub deactivated: usize,
    pub auto_created: usize,
    pub assignments_updated: usize,
    pub errors: Vec<EntityFailure>,
}

impl PassSummary {
    fn new(evaluated_at: DateTime<Utc>) -> Self {
        Self {
            evaluated_at,
            activated: 0,
            deactivated: 0,
            auto_created: 0,
            assignments_updated: 0,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, rec: &Reconciliation) {
        self.activated += rec.activate.len();
        self.deactivated += rec.deactivate.len();
        self.assignments_updated += rec.assignment_updates.len();
    }

    fn fail(&mut self, entity_id: EntityId, stage: Stage, err: &EngineError) {
        warn!(entity_id = %entity_id, ?stage, kind = err.kind(), "entity excluded from pass: {err}");
        self.errors.push(EntityFailure {
            entity_id,
            stage,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// True when no entity failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Default)]
struct EntityLocks {
    table: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    fn get(&self, id: EntityId) -> Result<Arc<Mutex<()>>> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| EngineError::Fatal("entity lock table poisoned".to_string()))?;
        Ok(Arc::clone(table.entry(id).or_default()))
    }
}

/// The liveness engine over a storage collaborator.
#[derive(Debug)]
pub struct Engine<S> {
    store: S,
    config: EngineConfig,
    locks: EntityLocks,
}

impl<S: OccurrenceStore> Engine<S> {
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if `config` is invalid.
    pub fn new(store: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            locks: EntityLocks::default(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one periodic pass: reconcile every entity, settle reassigned
    /// people across entities, then provision.
    ///
    /// Evaluates at `current_utc` plus the configured lookahead.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Fatal`] when entities cannot be enumerated or a
    /// lock is poisoned. Per-entity failures are reported in
    /// [`PassSummary::errors`] instead.
    pub fn run_periodic(&self, current_utc: DateTime<Utc>) -> Result<PassSummary> {
        let now = current_utc + self.config.lookahead();
        let ids = self.store.entity_ids().map_err(|e| {
            error!("cannot enumerate entities: {e}");
            EngineError::Fatal(format!("cannot enumerate entities: {e}"))
        })?;
        let mut summary = PassSummary::new(now);
        let mut reassigned = BTreeSet::new();

        for &id in &ids {
            match self.with_entity_lock(id, || self.reconcile_unlocked(id, now)) {
                Ok(rec) => {
                    summary.record(&rec);
                    reassigned.extend(rec.assignment_updates.iter().map(|u| u.person_id));
                }
                Err(e) if e.is_fatal() => return Err(fatal(e)),
                Err(e) => summary.fail(id, Stage::Reconcile, &e),
            }
        }
        summary.assignments_updated += self.settle(&reassigned).map_err(fatal)?;
        for &id in &ids {
            match self.with_entity_lock(id, || self.provision_unlocked(id, now)) {
                Ok(created) => summary.auto_created += created.len(),
                Err(e) if e.is_fatal() => return Err(fatal(e)),
                Err(e) => summary.fail(id, Stage::Provision, &e),
            }
        }

        info!(
            evaluated_at = %now,
            entities = ids.len(),
            activated = summary.activated,
            deactivated = summary.deactivated,
            auto_created = summary.auto_created,
            assignments_updated = summary.assignments_updated,
            errors = summary.errors.len(),
            "periodic pass complete"
        );
        Ok(summary)
    }

    /// Reconcile one entity at `now`, without lookahead.
    ///
    /// # Errors
    ///
    /// Any error from the entity's unit of work; nothing is written on failure.
    pub fn reconcile_entity(&self, entity_id: EntityId, now: DateTime<Utc>) -> Result<Reconciliation> {
        let rec = self.with_entity_lock(entity_id, || self.reconcile_unlocked(entity_id, now))?;
        let reassigned: BTreeSet<PersonId> =
            rec.assignment_updates.iter().map(|u| u.person_id).collect();
        self.settle(&reassigned)?;
        Ok(rec)
    }

    /// Hook for "schedule saved": correct the entity immediately.
    pub fn on_schedule_saved(&self, entity_id: EntityId, now: DateTime<Utc>) -> Result<Reconciliation> {
        self.reconcile_entity(entity_id, now)
    }

    /// Hook for "occurrence cancelled".
    pub fn on_occurrence_cancelled(
        &self,
        occurrence_id: OccurrenceId,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation> {
        let entity_id = self.store.occurrence(occurrence_id)?.entity_id;
        self.reconcile_entity(entity_id, now)
    }

    /// Hook for check-in writes. Check-in owners call this instead of
    /// touching assignments themselves.
    pub fn on_checkin_recorded(
        &self,
        occurrence_id: OccurrenceId,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation> {
        let entity_id = self.store.occurrence(occurrence_id)?.entity_id;
        self.reconcile_entity(entity_id, now)
    }

    /// Provision one entity on demand.
    pub fn provision_entity(&self, entity_id: EntityId, now: DateTime<Utc>) -> Result<Vec<Occurrence>> {
        self.with_entity_lock(entity_id, || self.provision_unlocked(entity_id, now))
    }

    /// Other active occurrences in the same city as the one `person_id` is at.
    pub fn checkin_alternatives(&self, person_id: PersonId) -> Result<Vec<ActiveListing>> {
        let Some(current) = self.store.assignment(person_id)? else {
            return Ok(Vec::new());
        };
        let listings = self.store.active_listings()?;
        Ok(co_located_alternatives(current, &listings)
            .into_iter()
            .cloned()
            .collect())
    }

    // ── Cross-entity settle ──

    /// Point each of `people` at the best active occurrence they said yes
    /// to, across all entities. Returns how many pointers moved.
    ///
    /// Only people reassigned earlier in the same pass are settled, so a
    /// pointer that was live before the pass is never taken away. A failure
    /// for one person is logged and left for the next pass.
    fn settle(&self, people: &BTreeSet<PersonId>) -> Result<usize> {
        let mut moved = 0;
        for &person_id in people {
            match self.settle_person(person_id) {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(person_id = %person_id, kind = e.kind(), "assignment not settled: {e}");
                }
            }
        }
        Ok(moved)
    }

    fn settle_person(&self, person_id: PersonId) -> Result<bool> {
        let checkins = self.store.checkins_for(person_id)?;
        let mut seen = BTreeSet::new();
        let mut candidates = Vec::new();
        for checkin in checkins.iter().filter(|c| c.is_yes()) {
            if !seen.insert(checkin.occurrence_id) {
                continue;
            }
            if let Some(candidate) = self.active_candidate(checkin.occurrence_id)? {
                candidates.push(candidate);
            }
        }
        let Some(best) = resolve(person_id, &candidates, &checkins) else {
            return Ok(false);
        };
        if self.store.assignment(person_id)? == Some(best) {
            return Ok(false);
        }

        let entity_id = self.store.occurrence(best)?.entity_id;
        self.with_entity_lock(entity_id, || {
            // Re-read under the lock: the entity may have moved on since.
            if !self.store.occurrence(best)?.is_active
                || self.store.assignment(person_id)? == Some(best)
            {
                return Ok(false);
            }
            let changes = ChangeSet {
                assignments: vec![AssignmentUpdate {
                    person_id,
                    active_occurrence_id: Some(best),
                }],
                ..ChangeSet::default()
            };
            self.store.commit(entity_id, &changes)?;
            debug!(person_id = %person_id, occurrence_id = %best, "settled assignment");
            Ok(true)
        })
    }

    fn active_candidate(&self, occurrence_id: OccurrenceId) -> Result<Option<Candidate>> {
        let occurrence = match self.store.occurrence(occurrence_id) {
            Ok(o) => o,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !occurrence.is_active || occurrence.is_cancelled {
            return Ok(None);
        }
        let entity = self.store.entity(occurrence.entity_id)?;
        let window = parse_timezone(&entity.timezone).and_then(|tz| {
            window_in(occurrence.date, occurrence.start_time, occurrence.end_time, tz, 0, 0)
        });
        match window {
            Ok(w) => Ok(Some(Candidate {
                occurrence_id,
                starts_at: w.occurrence_start,
            })),
            Err(e) => {
                warn!(occurrence_id = %occurrence_id, "ignoring candidate: {e}");
                Ok(None)
            }
        }
    }

    fn with_entity_lock<T>(&self, entity_id: EntityId, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.locks.get(entity_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| EngineError::Fatal(format!("lock for entity {entity_id} poisoned")))?;
        work()
    }

    fn reconcile_unlocked(&self, entity_id: EntityId, now: DateTime<Utc>) -> Result<Reconciliation> {
        let radius = self.config.candidate_radius();
        let snapshot = self.store.snapshot(
            entity_id,
            (now - radius).date_naive(),
            (now + radius).date_naive(),
        )?;
        let rec = reconcile(&snapshot.entity, &snapshot.occurrences, &snapshot.attendance, now)?;
        if !rec.is_noop() {
            self.store.commit(entity_id, &ChangeSet::from(&rec))?;
        }
        Ok(rec)
    }

    fn provision_unlocked(&self, entity_id: EntityId, now: DateTime<Utc>) -> Result<Vec<Occurrence>> {
        let entity = self.store.entity(entity_id)?;
        let Some(horizon_end) = horizon_end(&entity, now)? else {
            return Ok(Vec::new());
        };
        let snapshot = self.store.snapshot(
            entity_id,
            (now - chrono::Duration::days(2)).date_naive(),
            (horizon_end + chrono::Duration::days(2)).date_naive(),
        )?;
        let created = provision(&snapshot.entity, &snapshot.occurrences, now)?;
        if !created.is_empty() {
            self.store.commit(entity_id, &ChangeSet::creating(created.clone()))?;
            info!(entity_id = %entity_id, created = created.len(), "provisioned occurrences");
        }
        Ok(created)
    }
}

fn fatal(err: EngineError) -> EngineError {
    error!("periodic pass aborted: {err}");
    err
}
