// 🗄️ Entity Store - SQLite adapter for the four synced entity kinds
//
// The rest of the crate talks to the store through:
// - `Store::perform`  → a scoped context on the blocking pool
// - free functions    → predicate fetches, saves, batch deletes over &Connection
// - `Store::reclaim`  → online space reclaim, where the store type supports it
//
// Timestamps are fixed-width RFC 3339 UTC strings, so ORDER BY on the text
// column is chronological. Ties fall back to rowid (fetch order).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::deduplication::{AccountMerge, DataAssetPrune, MergeSummary, UserMerge};
use crate::entities::{
    Account, AccountPreferences, AssetKey, CredentialKey, DataAsset, ProfileSnapshot, User, UserDetail,
};
use crate::error::{CleansingError, Result};

/// Actor recorded on every audit event written by the engine
pub const RECONCILER_ACTOR: &str = "reconciler";

const LAST_CLEANSED_KEY: &str = "last_cleansed_date";

// ============================================================================
// STORE HANDLE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StoreKind {
    /// On-disk SQLite database (supports reclaim)
    File(PathBuf),

    /// Private in-memory database (no reclaim)
    Memory,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::File(_) => "file",
            StoreKind::Memory => "in-memory",
        }
    }
}

/// Cheap, cloneable handle to the backing store.
///
/// File stores open a fresh connection per context, so concurrent units never
/// share a connection and SQLite serializes their writes. Memory stores only
/// exist while their single connection lives, so contexts take turns on it.
#[derive(Clone)]
pub struct Store {
    kind: StoreKind,
    busy_timeout: Duration,
    memory: Option<Arc<Mutex<Connection>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("kind", &self.kind)
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl Store {
    /// Open (creating if needed) an on-disk store and ensure its schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Store {
            kind: StoreKind::File(path.as_ref().to_path_buf()),
            busy_timeout: Duration::from_secs(5),
            memory: None,
        };

        store.with_connection(|conn| setup_database(conn))?;

        Ok(store)
    }

    /// Create a private in-memory store. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_unavailable)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        setup_database(&conn)?;

        Ok(Store {
            kind: StoreKind::Memory,
            busy_timeout: Duration::from_secs(5),
            memory: Some(Arc::new(Mutex::new(conn))),
        })
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn kind(&self) -> &StoreKind {
        &self.kind
    }

    /// Run `f` in a scoped context on the calling thread
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        if let Some(memory) = &self.memory {
            let mut conn = memory
                .lock()
                .map_err(|_| CleansingError::StoreUnavailable("in-memory store poisoned".to_string()))?;
            return f(&mut *conn);
        }

        let mut conn = self.connect_file()?;
        f(&mut conn)
    }

    fn connect_file(&self) -> Result<Connection> {
        let path = match &self.kind {
            StoreKind::File(path) => path,
            StoreKind::Memory => {
                return Err(CleansingError::StoreUnavailable("in-memory store has no file".to_string()))
            }
        };

        let conn = Connection::open(path).map_err(store_unavailable)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(conn)
    }

    /// Run `f` in its own context on the blocking pool.
    ///
    /// This is the unit of suspension: the caller's task yields until the
    /// context is closed again.
    pub async fn perform<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_connection(f)).await?
    }

    /// Reclaim free pages and refresh planner statistics.
    ///
    /// Runs on a second, temporary connection so contexts already open on the
    /// store are left alone; readers keep reading during the VACUUM thanks to
    /// WAL. Only on-disk stores support this.
    pub fn reclaim(&self) -> Result<ReclaimStats> {
        let path = match &self.kind {
            StoreKind::File(path) => path,
            other => return Err(CleansingError::MaintenanceUnsupported(other.as_str())),
        };

        // No foreign-key enforcement: this connection only maintains
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(store_unavailable)?;
        conn.busy_timeout(self.busy_timeout)?;

        let bytes_before = database_size(&conn)?;
        conn.execute_batch("VACUUM; ANALYZE;")?;
        let bytes_after = database_size(&conn)?;

        conn.close().map_err(|(_, e)| CleansingError::from(e))?;

        Ok(ReclaimStats { bytes_before, bytes_after })
    }
}

/// Size accounting of one reclaim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReclaimStats {
    pub bytes_before: i64,
    pub bytes_after: i64,
}

impl ReclaimStats {
    pub fn reclaimed(&self) -> i64 {
        (self.bytes_before - self.bytes_after).max(0)
    }
}

fn database_size(conn: &Connection) -> Result<i64> {
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok(page_count * page_size)
}

fn store_unavailable(err: rusqlite::Error) -> CleansingError {
    CleansingError::StoreUnavailable(err.to_string())
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL lets readers continue while a reconciliation writes or vacuums.
    // In-memory databases silently stay on their own journal mode.
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            object_id TEXT PRIMARY KEY,
            creation_date TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            user_id TEXT,
            preferences TEXT NOT NULL DEFAULT '{}',
            token TEXT,
            token_secret TEXT
        );

        CREATE TABLE IF NOT EXISTS users (
            object_id TEXT PRIMARY KEY,
            id TEXT,
            creation_date TEXT NOT NULL,
            last_update_start_date TEXT,
            last_update_end_date TEXT,
            modification_date TEXT
        );

        CREATE TABLE IF NOT EXISTS user_details (
            object_id TEXT PRIMARY KEY,
            user_object_id TEXT REFERENCES users(object_id) ON DELETE CASCADE,
            creation_date TEXT NOT NULL,
            name TEXT,
            username TEXT,
            location TEXT,
            url TEXT,
            user_description TEXT,
            profile_image_url TEXT,
            profile_header_image_url TEXT,
            is_protected INTEGER NOT NULL DEFAULT 0,
            is_verified INTEGER NOT NULL DEFAULT 0,
            followers_count INTEGER NOT NULL DEFAULT 0,
            followings_count INTEGER NOT NULL DEFAULT 0,
            listed_count INTEGER NOT NULL DEFAULT 0,
            tweets_count INTEGER NOT NULL DEFAULT 0,
            user_creation_date TEXT,
            following_user_ids TEXT,
            follower_user_ids TEXT,
            blocking_user_ids TEXT,
            muting_user_ids TEXT
        );

        CREATE TABLE IF NOT EXISTS data_assets (
            object_id TEXT PRIMARY KEY,
            url TEXT,
            data_sha512 BLOB,
            data BLOB,
            content_type TEXT,
            creation_date TEXT NOT NULL
        );

        -- Audit trail: every merge the engine applies is an event
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_accounts_credentials ON accounts(token, token_secret);
        CREATE INDEX IF NOT EXISTS idx_accounts_creation ON accounts(creation_date);
        CREATE INDEX IF NOT EXISTS idx_users_id ON users(id);
        CREATE INDEX IF NOT EXISTS idx_users_creation ON users(creation_date);
        CREATE INDEX IF NOT EXISTS idx_user_details_owner ON user_details(user_object_id, creation_date);
        CREATE INDEX IF NOT EXISTS idx_data_assets_key ON data_assets(url, data_sha512);
        CREATE INDEX IF NOT EXISTS idx_data_assets_creation ON data_assets(creation_date);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);",
    )?;

    Ok(())
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(idx, &text)
}

fn get_opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(idx, &t)).transpose()
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        serde_json::from_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn to_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

/// "?, ?, ?" for an IN (...) list
fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn query_ids(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ============================================================================
// ACCOUNTS
// ============================================================================

const ACCOUNT_COLUMNS: &str =
    "object_id, creation_date, sort_order, user_id, preferences, token, token_secret";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        object_id: row.get(0)?,
        creation_date: get_timestamp(row, 1)?,
        sort_order: row.get(2)?,
        user_id: row.get(3)?,
        preferences: get_json::<AccountPreferences>(row, 4)?.unwrap_or_default(),
        token: row.get(5)?,
        token_secret: row.get(6)?,
    })
}

pub fn insert_account(conn: &Connection, account: &Account) -> Result<()> {
    conn.execute(
        "INSERT INTO accounts (object_id, creation_date, sort_order, user_id, preferences, token, token_secret)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            account.object_id,
            format_timestamp(&account.creation_date),
            account.sort_order,
            account.user_id,
            serde_json::to_string(&account.preferences)?,
            account.token,
            account.token_secret,
        ],
    )?;
    Ok(())
}

pub fn get_account(conn: &Connection, object_id: &str) -> Result<Option<Account>> {
    let sql = format!("SELECT {} FROM accounts WHERE object_id = ?1", ACCOUNT_COLUMNS);
    Ok(conn.query_row(&sql, [object_id], account_from_row).optional()?)
}

/// Every account id, oldest first
pub fn get_account_ids(conn: &Connection) -> Result<Vec<String>> {
    query_ids(conn, "SELECT object_id FROM accounts ORDER BY creation_date ASC, rowid ASC")
}

/// Every account sharing a credential pair, oldest first
pub fn get_accounts_by_credentials(conn: &Connection, key: &CredentialKey) -> Result<Vec<Account>> {
    let sql = format!(
        "SELECT {} FROM accounts WHERE token = ?1 AND token_secret = ?2
         ORDER BY creation_date ASC, rowid ASC",
        ACCOUNT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let accounts = stmt
        .query_map(params![key.token, key.token_secret], account_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(accounts)
}

/// Save the merged survivor, then delete the losers. Returns rows deleted.
pub fn apply_account_merge(conn: &Connection, merge: &AccountMerge) -> Result<usize> {
    let survivor = &merge.survivor;

    conn.execute(
        "UPDATE accounts
         SET creation_date = ?2, sort_order = ?3, user_id = ?4, preferences = ?5
         WHERE object_id = ?1",
        params![
            survivor.object_id,
            format_timestamp(&survivor.creation_date),
            survivor.sort_order,
            survivor.user_id,
            serde_json::to_string(&survivor.preferences)?,
        ],
    )?;

    let deleted = delete_by_ids(conn, "accounts", &merge.losers)?;

    insert_event(
        conn,
        &Event::merge("account_merged", "account", &survivor.object_id, &MergeSummary::from(merge))?,
    )?;

    Ok(deleted)
}

// ============================================================================
// USERS
// ============================================================================

const USER_COLUMNS: &str =
    "object_id, id, creation_date, last_update_start_date, last_update_end_date, modification_date";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        object_id: row.get(0)?,
        id: row.get(1)?,
        creation_date: get_timestamp(row, 2)?,
        last_update_start_date: get_opt_timestamp(row, 3)?,
        last_update_end_date: get_opt_timestamp(row, 4)?,
        modification_date: get_opt_timestamp(row, 5)?,
    })
}

pub fn insert_user(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        "INSERT INTO users (object_id, id, creation_date, last_update_start_date, last_update_end_date, modification_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user.object_id,
            user.id,
            format_timestamp(&user.creation_date),
            user.last_update_start_date.as_ref().map(format_timestamp),
            user.last_update_end_date.as_ref().map(format_timestamp),
            user.modification_date.as_ref().map(format_timestamp),
        ],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, object_id: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE object_id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [object_id], user_from_row).optional()?)
}

/// Every user id, oldest first
pub fn get_user_ids(conn: &Connection) -> Result<Vec<String>> {
    query_ids(conn, "SELECT object_id FROM users ORDER BY creation_date ASC, rowid ASC")
}

/// Every user sharing a remote id, oldest first (ties in insertion order)
pub fn get_users_by_remote_id(conn: &Connection, remote_id: &str) -> Result<Vec<User>> {
    let sql = format!(
        "SELECT {} FROM users WHERE id = ?1 ORDER BY creation_date ASC, rowid ASC",
        USER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map([remote_id], user_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Move the planned history onto the survivor, save its merged bounds, then
/// delete the now childless losers. Returns users deleted.
pub fn apply_user_merge(conn: &Connection, merge: &UserMerge) -> Result<usize> {
    let survivor = &merge.survivor;

    {
        let mut reparent = conn.prepare(
            "UPDATE user_details SET user_object_id = ?1 WHERE object_id = ?2",
        )?;
        for detail_id in &merge.moved_details {
            reparent.execute(params![survivor.object_id, detail_id])?;
        }
    }

    conn.execute(
        "UPDATE users
         SET creation_date = ?2, last_update_start_date = ?3, last_update_end_date = ?4, modification_date = ?5
         WHERE object_id = ?1",
        params![
            survivor.object_id,
            format_timestamp(&survivor.creation_date),
            survivor.last_update_start_date.as_ref().map(format_timestamp),
            survivor.last_update_end_date.as_ref().map(format_timestamp),
            survivor.modification_date.as_ref().map(format_timestamp),
        ],
    )?;

    let deleted = delete_by_ids(conn, "users", &merge.losers)?;

    insert_event(
        conn,
        &Event::merge("user_merged", "user", &survivor.object_id, &MergeSummary::from(merge))?,
    )?;

    Ok(deleted)
}

// ============================================================================
// USER DETAILS
// ============================================================================

const USER_DETAIL_COLUMNS: &str = "object_id, user_object_id, creation_date, name, username, location, url,
    user_description, profile_image_url, profile_header_image_url, is_protected, is_verified,
    followers_count, followings_count, listed_count, tweets_count, user_creation_date,
    following_user_ids, follower_user_ids, blocking_user_ids, muting_user_ids";

fn user_detail_from_row(row: &Row<'_>) -> rusqlite::Result<UserDetail> {
    Ok(UserDetail {
        object_id: row.get(0)?,
        user_object_id: row.get(1)?,
        creation_date: get_timestamp(row, 2)?,
        snapshot: ProfileSnapshot {
            name: row.get(3)?,
            username: row.get(4)?,
            location: row.get(5)?,
            url: row.get(6)?,
            user_description: row.get(7)?,
            profile_image_url: row.get(8)?,
            profile_header_image_url: row.get(9)?,
            is_protected: row.get(10)?,
            is_verified: row.get(11)?,
            followers_count: row.get(12)?,
            followings_count: row.get(13)?,
            listed_count: row.get(14)?,
            tweets_count: row.get(15)?,
            user_creation_date: get_opt_timestamp(row, 16)?,
            following_user_ids: get_json(row, 17)?,
            follower_user_ids: get_json(row, 18)?,
            blocking_user_ids: get_json(row, 19)?,
            muting_user_ids: get_json(row, 20)?,
        },
    })
}

pub fn insert_user_detail(conn: &Connection, detail: &UserDetail) -> Result<()> {
    let s = &detail.snapshot;

    conn.execute(
        "INSERT INTO user_details (
            object_id, user_object_id, creation_date, name, username, location, url,
            user_description, profile_image_url, profile_header_image_url, is_protected, is_verified,
            followers_count, followings_count, listed_count, tweets_count, user_creation_date,
            following_user_ids, follower_user_ids, blocking_user_ids, muting_user_ids
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        params![
            detail.object_id,
            detail.user_object_id,
            format_timestamp(&detail.creation_date),
            s.name,
            s.username,
            s.location,
            s.url,
            s.user_description,
            s.profile_image_url,
            s.profile_header_image_url,
            s.is_protected,
            s.is_verified,
            s.followers_count,
            s.followings_count,
            s.listed_count,
            s.tweets_count,
            s.user_creation_date.as_ref().map(format_timestamp),
            to_json(&s.following_user_ids)?,
            to_json(&s.follower_user_ids)?,
            to_json(&s.blocking_user_ids)?,
            to_json(&s.muting_user_ids)?,
        ],
    )?;
    Ok(())
}

/// A user's history, oldest first (ties in insertion order)
pub fn get_user_details(conn: &Connection, user_object_id: &str) -> Result<Vec<UserDetail>> {
    let sql = format!(
        "SELECT {} FROM user_details WHERE user_object_id = ?1
         ORDER BY creation_date ASC, rowid ASC",
        USER_DETAIL_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let details = stmt
        .query_map([user_object_id], user_detail_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(details)
}

/// History held by any of the given users, oldest first
pub fn get_user_details_for_users(conn: &Connection, user_object_ids: &[String]) -> Result<Vec<UserDetail>> {
    if user_object_ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {} FROM user_details WHERE user_object_id IN ({})
         ORDER BY creation_date ASC, rowid ASC",
        USER_DETAIL_COLUMNS,
        placeholders(user_object_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let details = stmt
        .query_map(params_from_iter(user_object_ids.iter()), user_detail_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(details)
}

/// Detach snapshots from their user, then delete them. Returns rows deleted.
pub fn remove_user_details(conn: &Connection, user_object_id: &str, detail_ids: &[String]) -> Result<usize> {
    if detail_ids.is_empty() {
        return Ok(0);
    }

    let in_list = placeholders(detail_ids.len());
    conn.execute(
        &format!("UPDATE user_details SET user_object_id = NULL WHERE object_id IN ({})", in_list),
        params_from_iter(detail_ids.iter()),
    )?;
    let deleted = delete_by_ids(conn, "user_details", detail_ids)?;

    insert_event(
        conn,
        &Event::new(
            "user_history_compacted",
            "user",
            user_object_id,
            serde_json::json!({ "removed": detail_ids }),
            RECONCILER_ACTOR,
        ),
    )?;

    Ok(deleted)
}

// ============================================================================
// DATA ASSETS
// ============================================================================

const DATA_ASSET_COLUMNS: &str = "object_id, url, data_sha512, data, content_type, creation_date";

fn data_asset_from_row(row: &Row<'_>) -> rusqlite::Result<DataAsset> {
    Ok(DataAsset {
        object_id: row.get(0)?,
        url: row.get(1)?,
        data_sha512: row.get(2)?,
        data: row.get(3)?,
        content_type: row.get(4)?,
        creation_date: get_timestamp(row, 5)?,
    })
}

pub fn insert_data_asset(conn: &Connection, asset: &DataAsset) -> Result<()> {
    conn.execute(
        "INSERT INTO data_assets (object_id, url, data_sha512, data, content_type, creation_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            asset.object_id,
            asset.url,
            asset.data_sha512,
            asset.data,
            asset.content_type,
            format_timestamp(&asset.creation_date),
        ],
    )?;
    Ok(())
}

pub fn get_data_asset(conn: &Connection, object_id: &str) -> Result<Option<DataAsset>> {
    let sql = format!("SELECT {} FROM data_assets WHERE object_id = ?1", DATA_ASSET_COLUMNS);
    Ok(conn.query_row(&sql, [object_id], data_asset_from_row).optional()?)
}

/// Every asset id, oldest first
pub fn get_data_asset_ids(conn: &Connection) -> Result<Vec<String>> {
    query_ids(conn, "SELECT object_id FROM data_assets ORDER BY creation_date ASC, rowid ASC")
}

/// Ids of every asset with the given (url, hash), oldest first
pub fn get_data_asset_ids_by_key(conn: &Connection, key: &AssetKey) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT object_id FROM data_assets WHERE url = ?1 AND data_sha512 = ?2
         ORDER BY creation_date ASC, rowid ASC",
    )?;
    let ids = stmt
        .query_map(params![key.url, key.data_sha512], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Delete the losers of one asset group in a single statement
pub fn apply_data_asset_prune(conn: &Connection, prune: &DataAssetPrune) -> Result<usize> {
    let deleted = delete_by_ids(conn, "data_assets", &prune.losers)?;

    insert_event(
        conn,
        &Event::merge("data_assets_pruned", "data_asset", &prune.survivor, &MergeSummary::from(prune))?,
    )?;

    Ok(deleted)
}

fn delete_by_ids(conn: &Connection, table: &str, ids: &[String]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let sql = format!("DELETE FROM {} WHERE object_id IN ({})", table, placeholders(ids.len()));
    Ok(conn.execute(&sql, params_from_iter(ids.iter()))?)
}

// ============================================================================
// SETTINGS (gate state)
// ============================================================================

pub fn get_last_cleansed_date(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", [LAST_CLEANSED_KEY], |row| row.get(0))
        .optional()?;

    Ok(value
        .map(|v| parse_timestamp(0, &v))
        .transpose()?)
}

pub fn set_last_cleansed_date(conn: &Connection, date: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![LAST_CLEANSED_KEY, format_timestamp(date)],
    )?;
    Ok(())
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Row counts plus how many duplicate groups are still waiting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub accounts: i64,
    pub users: i64,
    /// Users no account is signed in as
    pub orphan_users: i64,
    pub user_details: i64,
    pub data_assets: i64,

    pub duplicate_account_groups: i64,
    pub duplicate_user_groups: i64,
    pub duplicate_data_asset_groups: i64,
}

impl EntityCounts {
    pub fn has_duplicates(&self) -> bool {
        self.duplicate_account_groups > 0
            || self.duplicate_user_groups > 0
            || self.duplicate_data_asset_groups > 0
    }
}

pub fn entity_counts(conn: &Connection) -> Result<EntityCounts> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

    Ok(EntityCounts {
        accounts: count("SELECT COUNT(*) FROM accounts")?,
        users: count("SELECT COUNT(*) FROM users")?,
        orphan_users: count(
            "SELECT COUNT(*) FROM users u
             WHERE u.id IS NULL OR NOT EXISTS (SELECT 1 FROM accounts a WHERE a.user_id = u.id)",
        )?,
        user_details: count("SELECT COUNT(*) FROM user_details")?,
        data_assets: count("SELECT COUNT(*) FROM data_assets")?,
        duplicate_account_groups: count(
            "SELECT COUNT(*) FROM (SELECT 1 FROM accounts
             WHERE token IS NOT NULL AND token_secret IS NOT NULL
             GROUP BY token, token_secret HAVING COUNT(*) > 1)",
        )?,
        duplicate_user_groups: count(
            "SELECT COUNT(*) FROM (SELECT 1 FROM users WHERE id IS NOT NULL
             GROUP BY id HAVING COUNT(*) > 1)",
        )?,
        duplicate_data_asset_groups: count(
            "SELECT COUNT(*) FROM (SELECT 1 FROM data_assets
             WHERE url IS NOT NULL AND data_sha512 IS NOT NULL
             GROUP BY url, data_sha512 HAVING COUNT(*) > 1)",
        )?,
    })
}

// ============================================================================
// EVENTS (audit trail)
// ============================================================================

/// Event for audit trail ("Every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    fn merge(event_type: &str, entity_type: &str, survivor: &str, summary: &MergeSummary) -> Result<Self> {
        Ok(Self::new(
            event_type,
            entity_type,
            survivor,
            serde_json::to_value(summary)?,
            RECONCILER_ACTOR,
        ))
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            format_timestamp(&event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            serde_json::to_string(&event.data)?,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok(Event {
                event_id: row.get(0)?,
                timestamp: get_timestamp(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: get_json(row, 5)?.unwrap_or(serde_json::Value::Null),
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================
