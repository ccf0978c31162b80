// 📸 UserDetail Entity - One snapshot in a User's profile history
//
// Snapshots are never deduplicated by key. Two snapshots are only redundant
// when they are temporal neighbours with the same content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// SNAPSHOT CONTENT
// ============================================================================

/// The semantically meaningful part of a snapshot.
///
/// Everything that describes the profile lives here; bookkeeping fields
/// (identity, owner, creation date) live on `UserDetail`. Content
/// equivalence is plain equality of this struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub name: Option<String>,
    pub username: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub user_description: Option<String>,
    pub profile_image_url: Option<String>,
    pub profile_header_image_url: Option<String>,

    pub is_protected: bool,
    pub is_verified: bool,

    pub followers_count: i64,
    pub followings_count: i64,
    pub listed_count: i64,
    pub tweets_count: i64,

    /// When the remote account itself was created
    pub user_creation_date: Option<DateTime<Utc>>,

    pub following_user_ids: Option<Vec<String>>,
    pub follower_user_ids: Option<Vec<String>>,
    pub blocking_user_ids: Option<Vec<String>>,
    pub muting_user_ids: Option<Vec<String>>,
}

// ============================================================================
// USER DETAIL ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDetail {
    /// Storage identity (UUID)
    pub object_id: String,

    /// Owning User (storage identity). Detached snapshots have none.
    pub user_object_id: Option<String>,

    /// When this snapshot was taken. Defines history order.
    pub creation_date: DateTime<Utc>,

    pub snapshot: ProfileSnapshot,
}

impl UserDetail {
    pub fn new(user_object_id: &str, creation_date: DateTime<Utc>, snapshot: ProfileSnapshot) -> Self {
        UserDetail {
            object_id: uuid::Uuid::new_v4().to_string(),
            user_object_id: Some(user_object_id.to_string()),
            creation_date,
            snapshot,
        }
    }

    /// Content equivalence: same profile, regardless of when it was taken
    /// or which User row holds it
    pub fn is_equivalent(&self, other: &UserDetail) -> bool {
        self.snapshot == other.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(name: &str, followers: i64) -> ProfileSnapshot {
        ProfileSnapshot {
            name: Some(name.to_string()),
            username: Some("nest".to_string()),
            followers_count: followers,
            following_user_ids: Some(vec!["1".to_string(), "2".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_equivalence_ignores_bookkeeping_fields() {
        let now = Utc::now();
        let a = UserDetail::new("user-a", now, snapshot("Nest", 10));
        let b = UserDetail::new("user-b", now + Duration::hours(3), snapshot("Nest", 10));

        assert_ne!(a.object_id, b.object_id);
        assert!(a.is_equivalent(&b));
    }

    #[test]
    fn test_equivalence_sees_every_content_field() {
        let now = Utc::now();
        let base = UserDetail::new("user", now, snapshot("Nest", 10));

        let renamed = UserDetail::new("user", now, snapshot("Nested", 10));
        assert!(!base.is_equivalent(&renamed));

        let more_followers = UserDetail::new("user", now, snapshot("Nest", 11));
        assert!(!base.is_equivalent(&more_followers));

        let mut reordered = base.clone();
        reordered.snapshot.following_user_ids = Some(vec!["2".to_string(), "1".to_string()]);
        assert!(!base.is_equivalent(&reordered));

        let mut unknown_list = base.clone();
        unknown_list.snapshot.following_user_ids = None;
        assert!(!base.is_equivalent(&unknown_list));
    }
}
