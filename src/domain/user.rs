//! User references.
//!
//! The user store is an external collaborator: this subsystem only validates
//! that referenced users exist, it never mutates them beyond registration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::UserId;

/// A registered user, as far as admission control cares about one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub created_on: DateTime<Utc>,
}
