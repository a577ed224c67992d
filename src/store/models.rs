//! Row types for the vault catalog.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One ingested media file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaRecord {
    pub id: i64,
    pub kind: String,
    pub file_name: String,
    pub extension: String,
    pub source_mount: String,
    pub source_path: String,
    pub dest_path: String,
    pub size_bytes: i64,
    pub crc32: String,
    pub sha256: String,
    pub capture_time: String,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub camera_yaw: Option<f64>,
    pub camera_pitch: Option<f64>,
    pub camera_roll: Option<f64>,
    pub loc_provider: Option<String>,
    pub loc_country: Option<String>,
    pub loc_state: Option<String>,
    pub loc_county: Option<String>,
    pub loc_city: Option<String>,
    pub loc_road: Option<String>,
    pub loc_house_number: Option<String>,
    pub loc_postcode: Option<String>,
    pub loc_display_name: Option<String>,
    pub metadata_json: String,
    pub source_mtime: String,
    pub ingested_at: String,
}

/// Reverse-geocoded fields, written at ingest or by the backfill job.
#[derive(Debug, Clone, Default)]
pub struct MediaLocation {
    pub provider: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub county: Option<String>,
    pub city: Option<String>,
    pub road: Option<String>,
    pub house_number: Option<String>,
    pub postcode: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user_id: i64,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapPoint {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub capture_time: String,
    pub file_name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub ts: String,
    pub actor: String,
    pub action: String,
    pub details: String,
    pub hash: String,
}

/// Full audit row including the previous-entry hash, used by the verifier.
#[derive(Debug, Clone)]
pub struct AuditChainRow {
    pub id: i64,
    pub ts: String,
    pub actor: String,
    pub action: String,
    pub details_json: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct GeocodeCacheEntry {
    pub provider: String,
    pub geocode_key: String,
    pub country: String,
    pub state: String,
    pub county: String,
    pub city: String,
    pub road: String,
    pub house_number: String,
    pub postcode: String,
    pub display_name: String,
    pub raw_json: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Album {
    pub id: i64,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
    pub item_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationGroup {
    pub name: String,
    pub count: i64,
    pub min_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lat: Option<f64>,
    pub max_lon: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceGroup {
    pub make: String,
    pub model: String,
    pub label: String,
    pub count: i64,
    pub unset: bool,
}

/// Row missing reverse-geocode fields, queued for the backfill job.
#[derive(Debug, Clone)]
pub struct GeoTodo {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}
