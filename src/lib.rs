//! Shared types for the sw3 project.
//!
//! This library defines the domain entities exchanged between the daemon
//! and its data-store collaborators.

use serde::{Deserialize, Serialize};

/// Default TCP port the daemon listens on.
///
/// Shared by the daemon's bootstrap configuration and its tests to avoid
/// drift.
pub const DEFAULT_SERVER_PORT: u16 = 2093;

/// Default port of the backing `MySQL` data store.
pub const DEFAULT_DB_PORT: u16 = 3306;

/// A profile stored by the data-store collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Store-assigned identifier.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Age in years.
    pub age: i32,
}

impl Profile {
    /// Build a profile from its parts.
    pub fn new(id: i64, name: impl Into<String>, age: i32) -> Self {
        Self {
            id,
            name: name.into(),
            age,
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}): {}, {}", self.id, self.name, self.age)
    }
}
