//! Core identifier types for the edge store

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque node identifier: a type name plus a time-orderable unique token.
///
/// Two ids are equal only when both the type and the token match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Id {
    id_type: String,
    uuid: Uuid,
}

impl Id {
    pub fn new(id_type: impl Into<String>, uuid: Uuid) -> Self {
        Id {
            id_type: id_type.into(),
            uuid,
        }
    }

    /// Generate a fresh id whose token sorts by creation time (UUID v7)
    pub fn generate(id_type: impl Into<String>) -> Self {
        Id::new(id_type, Uuid::now_v7())
    }

    pub fn id_type(&self) -> &str {
        &self.id_type
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id_type, self.uuid)
    }
}

/// Multi-tenancy boundary. Every row the engine touches is prefixed by its scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    application: Id,
}

impl Scope {
    pub fn new(application: Id) -> Self {
        Scope { application }
    }

    pub fn application(&self) -> &Id {
        &self.application
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self.application)
    }
}

impl From<Id> for Scope {
    fn from(application: Id) -> Self {
        Scope::new(application)
    }
}
