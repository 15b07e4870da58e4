pub mod error;
pub mod schema;
mod sqlite_store;

pub use error::{Result, StoreError};
pub use sqlite_store::Store;

/// Setting key written once first-sync has fully completed.
pub const SETTING_FIRST_LOGIN_COMPLETE: &str = "first_login_complete";
/// Setting key holding the epoch-millis timestamp of the last sync pass.
pub const SETTING_LAST_SYNC_TS: &str = "last_sync_ts";
