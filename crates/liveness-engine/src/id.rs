//! Strongly-typed identifiers for entities, occurrences and people.
//!
//! All identifiers wrap a ULID, so they sort by creation time and serialise
//! as plain ULID strings. `Display` adds a short type prefix; parsing accepts
//! the identifier with or without it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    pub id_type: &'static str,
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new identifier from a freshly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ulid::from_str(raw).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }
    };
}

define_id!(
    /// Identifies a recurring session definition.
    EntityId,
    "ent"
);

define_id!(
    /// Identifies one dated materialisation of an entity.
    OccurrenceId,
    "occ"
);

define_id!(
    /// Identifies a person who checks in to occurrences.
    PersonId,
    "per"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_has_prefix() {
        assert!(EntityId::new().to_string().starts_with("ent_"));
        assert!(OccurrenceId::new().to_string().starts_with("occ_"));
        assert!(PersonId::new().to_string().starts_with("per_"));
    }

    #[test]
    fn test_parse_with_and_without_prefix() {
        let id = OccurrenceId::new();
        let with: OccurrenceId = id.to_string().parse().unwrap();
        let without: OccurrenceId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(with, id);
        assert_eq!(without, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = "ent_not-a-ulid".parse::<EntityId>().unwrap_err();
        assert_eq!(err.id_type, "EntityId");
    }

    #[test]
    fn test_serializes_as_bare_ulid() {
        let id = PersonId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));
    }
}
