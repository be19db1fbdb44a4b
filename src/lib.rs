pub mod config;
pub mod db;
pub mod fingerprint;
pub mod models;
pub mod notifications;
pub mod parsers;
pub mod store;
pub mod sync;

/// Current version of the sync logic. Increment to suggest a full
/// resync after parser or schema changes.
pub const SYNC_VERSION: i32 = 1;
