//! Durable catalog of ingested artifacts and supporting tables.
//!
//! The [`VaultStore`] trait is the single persistence seam: settings, users,
//! sessions, media rows, albums, the hash-chained audit log, and the geocode
//! cache all live behind it. [`SqliteVaultStore`] is the production
//! implementation; tests build it on temp files or in memory.

mod filter;
mod models;
mod sqlite;

pub use filter::{build_media_where, escape_like_pattern, MediaFilter};
pub use models::*;
pub use sqlite::SqliteVaultStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the row. The ingest pipeline treats this
    /// as a dedup outcome, not a failure.
    #[error("duplicate row violates a unique constraint")]
    Duplicate,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Grouping level for location rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationLevel {
    State,
    County,
    City,
    Road,
}

impl LocationLevel {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "state" => Ok(Self::State),
            "county" => Ok(Self::County),
            "city" => Ok(Self::City),
            "road" => Ok(Self::Road),
            other => Err(StoreError::InvalidInput(format!("invalid level: {other}"))),
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::State => "loc_state",
            Self::County => "loc_county",
            Self::City => "loc_city",
            Self::Road => "loc_road",
        }
    }
}

pub trait VaultStore: Send + Sync {
    // Settings
    fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> StoreResult<()>;

    // Users
    fn has_users(&self) -> StoreResult<bool>;
    fn create_user(&self, username: &str, hash: &[u8], salt: &[u8]) -> StoreResult<i64>;
    fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    // Sessions, keyed by SHA-256 of the token
    fn create_session(
        &self,
        token_hash: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    fn delete_session(&self, token_hash: &str) -> StoreResult<()>;
    fn delete_expired_sessions(&self) -> StoreResult<usize>;
    fn lookup_session(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>>;

    // Media
    fn media_exists(&self, crc32: &str, size_bytes: i64, capture_time: &str) -> StoreResult<bool>;
    fn insert_media(&self, rec: &MediaRecord) -> StoreResult<i64>;
    fn get_media_by_id(&self, id: i64) -> StoreResult<Option<MediaRecord>>;
    fn list_media_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<MediaRecord>>;
    fn delete_media_by_id(&self, id: i64) -> StoreResult<()>;
    fn list_media_filtered(
        &self,
        sort_by: &str,
        order: &str,
        limit: i64,
        offset: i64,
        filter: &MediaFilter,
    ) -> StoreResult<Vec<MediaRecord>>;

    // Catalog projections
    fn list_map_points_filtered(
        &self,
        limit: i64,
        filter: &MediaFilter,
    ) -> StoreResult<Vec<MapPoint>>;
    fn list_location_groups(
        &self,
        level: LocationLevel,
        filter: &MediaFilter,
        limit: i64,
    ) -> StoreResult<Vec<LocationGroup>>;
    fn list_device_groups(&self, filter: &MediaFilter, limit: i64)
        -> StoreResult<Vec<DeviceGroup>>;

    // Geocode backfill
    fn list_geo_todos(&self, limit: i64) -> StoreResult<Vec<GeoTodo>>;
    fn update_media_location(&self, id: i64, loc: &MediaLocation) -> StoreResult<()>;

    // Audit chain
    fn insert_audit(
        &self,
        ts: &str,
        actor: &str,
        action: &str,
        details_json: &str,
        prev_hash: &str,
        entry_hash: &str,
    ) -> StoreResult<()>;
    fn last_audit_hash(&self) -> StoreResult<String>;
    fn list_audit(&self, limit: i64) -> StoreResult<Vec<AuditRecord>>;
    fn list_audit_chain(&self) -> StoreResult<Vec<AuditChainRow>>;

    // Geocode cache
    fn get_geocode_cache(
        &self,
        provider: &str,
        geocode_key: &str,
    ) -> StoreResult<Option<GeocodeCacheEntry>>;
    fn upsert_geocode_cache(&self, entry: &GeocodeCacheEntry) -> StoreResult<()>;

    // Albums
    fn create_album(&self, name: &str) -> StoreResult<Album>;
    fn list_albums(&self, limit: i64) -> StoreResult<Vec<Album>>;
    fn get_album_by_id(&self, id: i64) -> StoreResult<Option<Album>>;
    fn add_media_to_album(&self, album_id: i64, ids: &[i64]) -> StoreResult<(usize, usize)>;
    fn remove_media_from_album(&self, album_id: i64, ids: &[i64]) -> StoreResult<(usize, usize)>;
}
