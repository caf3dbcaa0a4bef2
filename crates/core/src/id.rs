//! Identifiers of the entities notifications refer to.
//!
//! All are UUIDv7 so ids sort by creation time; their string form doubles as the
//! outbox key for events with a natural 1:1 entity.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! entity_id {
    ($(#[$doc:meta])* $t:ident) => {
        $(#[$doc])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(self.0.as_hyphenated(), f)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| DomainError::InvalidId {
                        kind: stringify!($t),
                        reason: e.to_string(),
                    })
            }
        }
    };
}

entity_id!(
    /// A registered user.
    UserId
);
entity_id!(
    /// A user volunteering for a task.
    SignupId
);
entity_id!(TaskId);
