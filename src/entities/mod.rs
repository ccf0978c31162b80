// Entity Models - the four kinds the sync layer writes
// "Identity persists, values change"
//
// Each entity has:
// - A storage identity (UUID object_id) assigned on creation
// - An identity key shared by duplicates written on different devices
// - Temporal bounds the merger must never lose

pub mod account;
pub mod user;
pub mod user_detail;
pub mod data_asset;

pub use account::{Account, AccountPreferences, CredentialKey};
pub use user::User;
pub use user_detail::{ProfileSnapshot, UserDetail};
pub use data_asset::{AssetKey, DataAsset};
