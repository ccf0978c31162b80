// 👤 Account Entity - A signed-in identity, keyed by its credentials
//
// Several devices can sign in with the same credentials and each one writes
// its own Account row through sync. The credential pair is the identity key;
// the row's object_id is only a storage handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ACCOUNT PREFERENCES
// ============================================================================

/// Per-account feature flags. Merging ORs every flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPreferences {
    #[serde(default)]
    pub fetch_blocking_users: bool,

    #[serde(default)]
    pub fetch_muting_users: bool,
}

impl AccountPreferences {
    /// Flag-wise OR: an opt-in on any device survives the merge
    pub fn merged_with(self, other: AccountPreferences) -> AccountPreferences {
        AccountPreferences {
            fetch_blocking_users: self.fetch_blocking_users || other.fetch_blocking_users,
            fetch_muting_users: self.fetch_muting_users || other.fetch_muting_users,
        }
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Storage identity (UUID)
    pub object_id: String,

    pub creation_date: DateTime<Utc>,

    /// Position in the account list as chosen by the user
    pub sort_order: i64,

    /// Remote id of the User this account is signed in as (ownership edge)
    pub user_id: Option<String>,

    pub preferences: AccountPreferences,

    pub token: Option<String>,
    pub token_secret: Option<String>,
}

/// Identity key of an Account: (token, token secret)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub token: String,
    pub token_secret: String,
}

impl Account {
    pub fn new(token: &str, token_secret: &str, creation_date: DateTime<Utc>) -> Self {
        Account {
            object_id: uuid::Uuid::new_v4().to_string(),
            creation_date,
            sort_order: 0,
            user_id: None,
            preferences: AccountPreferences::default(),
            token: Some(token.to_string()),
            token_secret: Some(token_secret.to_string()),
        }
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_sort_order(mut self, sort_order: i64) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn with_preferences(mut self, preferences: AccountPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Credential key, or None while either half is still missing
    pub fn credential_key(&self) -> Option<CredentialKey> {
        match (&self.token, &self.token_secret) {
            (Some(token), Some(token_secret)) => Some(CredentialKey {
                token: token.clone(),
                token_secret: token_secret.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_merge_is_flag_wise_or() {
        let blocking = AccountPreferences { fetch_blocking_users: true, fetch_muting_users: false };
        let muting = AccountPreferences { fetch_blocking_users: false, fetch_muting_users: true };

        let merged = blocking.merged_with(muting);
        assert!(merged.fetch_blocking_users);
        assert!(merged.fetch_muting_users);

        let none = AccountPreferences::default().merged_with(AccountPreferences::default());
        assert_eq!(none, AccountPreferences::default());
    }

    #[test]
    fn test_credential_key_requires_both_halves() {
        let mut account = Account::new("token", "secret", Utc::now());
        assert_eq!(
            account.credential_key(),
            Some(CredentialKey { token: "token".to_string(), token_secret: "secret".to_string() })
        );

        account.token_secret = None;
        assert_eq!(account.credential_key(), None);
    }

    #[test]
    fn test_preferences_deserialize_missing_flags_as_false() {
        let prefs: AccountPreferences = serde_json::from_str(r#"{"fetch_blocking_users":true}"#).unwrap();
        assert!(prefs.fetch_blocking_users);
        assert!(!prefs.fetch_muting_users);
    }
}
