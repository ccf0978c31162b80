// 🧑 User Entity - A remote profile, keyed by its stable remote id
//
// "Identity persists. Values change." The profile values live in the
// UserDetail history; the User row only carries identity and the temporal
// bounds of what we know about it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Storage identity (UUID)
    pub object_id: String,

    /// Stable remote identifier. Duplicates share this value.
    pub id: Option<String>,

    /// When this record was first created on any device
    pub creation_date: DateTime<Utc>,

    /// Bounds of the most recent remote refresh
    pub last_update_start_date: Option<DateTime<Utc>>,
    pub last_update_end_date: Option<DateTime<Utc>>,

    /// When the profile last changed
    pub modification_date: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: &str, creation_date: DateTime<Utc>) -> Self {
        User {
            object_id: uuid::Uuid::new_v4().to_string(),
            id: Some(id.to_string()),
            creation_date,
            last_update_start_date: None,
            last_update_end_date: None,
            modification_date: None,
        }
    }

    /// Record a completed refresh window
    pub fn with_last_update(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.last_update_start_date = Some(start);
        self.last_update_end_date = Some(end);
        self
    }

    pub fn with_modification_date(mut self, modification_date: DateTime<Utc>) -> Self {
        self.modification_date = Some(modification_date);
        self
    }
}
