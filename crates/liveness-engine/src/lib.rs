//! # liveness-engine
//!
//! Deterministic liveness reconciliation for recurring, timezone-bound sessions.
//!
//! An entity declares weekly and monthly schedule rules in its own local
//! time. The engine expands those rules into dated occurrences, computes each
//! occurrence's buffered active window in UTC, keeps every occurrence's
//! `is_active` flag in line with the clock, and moves attendees' "currently
//! at" pointers as sessions open and close. Optionally it pre-creates
//! occurrences ahead of time.
//!
//! ## Modules
//!
//! - [`recurrence`]: schedule rule parsing, validation and RRULE export
//! - [`generator`]: schedule rules to concrete local dates
//! - [`window`]: local occurrence times to buffered UTC windows, DST handling
//! - [`reconciler`]: desired activation state and assignment diff for one entity
//! - [`resolver`]: assignment tie-breaks and co-location queries
//! - [`provisioner`]: ahead-of-time occurrence creation
//! - [`store`]: the storage seam and an in-memory store
//! - [`engine`]: periodic passes, event hooks, per-entity locking
//! - [`config`]: engine settings
//! - [`model`], [`id`], [`error`]: records, identifiers and error types

pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod id;
pub mod model;
pub mod provisioner;
pub mod reconciler;
pub mod recurrence;
pub mod resolver;
pub mod store;
pub mod window;

pub use config::EngineConfig;
pub use engine::{Engine, EntityFailure, PassSummary, Stage};
pub use error::{EngineError, ValidationError};
pub use generator::{occurrences, union, ScheduledOccurrence};
pub use id::{EntityId, OccurrenceId, ParseIdError, PersonId};
pub use model::{
    Attendance, AttendeeAssignment, CheckIn, Entity, EntityKind, Location, Occurrence,
};
pub use provisioner::provision;
pub use reconciler::{
    reconcile, AssignmentUpdate, AssignmentView, AttendanceView, Reconciliation,
    SkippedOccurrence,
};
pub use recurrence::{
    parse, Pattern, Recurrence, RecurrenceDefinition, Schedule, ScheduleSpec, WeekOrdinal,
};
pub use resolver::{co_located_alternatives, resolve, ActiveListing, Candidate};
pub use store::{ChangeSet, EntitySnapshot, MemoryStore, OccurrenceStore, StoreState};
pub use window::{window, window_in, ActiveWindow};
