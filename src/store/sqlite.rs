//! SQLite implementation of the vault store.
//!
//! One connection behind a mutex: SQLite serializes writers anyway and the
//! catalog's write volume (one row per ingested file) never justifies a pool.
//! WAL keeps readers unblocked. Legacy databases are upgraded in place by
//! adding any missing media columns.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::info;

use super::filter::{build_media_where, sort_expression, sort_order, MediaFilter};
use super::models::*;
use super::{LocationLevel, StoreError, StoreResult, VaultStore};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash BLOB NOT NULL,
        salt BLOB NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        token_hash TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS media_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        file_name TEXT NOT NULL,
        extension TEXT NOT NULL,
        source_mount TEXT NOT NULL,
        source_path TEXT NOT NULL,
        dest_path TEXT NOT NULL UNIQUE,
        size_bytes INTEGER NOT NULL,
        crc32 TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        capture_time TEXT NOT NULL,
        gps_lat REAL,
        gps_lon REAL,
        make TEXT,
        model TEXT,
        camera_yaw REAL,
        camera_pitch REAL,
        camera_roll REAL,
        loc_provider TEXT,
        loc_country TEXT,
        loc_state TEXT,
        loc_county TEXT,
        loc_city TEXT,
        loc_road TEXT,
        loc_house_number TEXT,
        loc_postcode TEXT,
        loc_display_name TEXT,
        metadata_json TEXT NOT NULL,
        source_mtime TEXT NOT NULL,
        ingested_at TEXT NOT NULL,
        UNIQUE (crc32, size_bytes, capture_time)
    )",
    "CREATE INDEX IF NOT EXISTS idx_media_capture_time ON media_files(capture_time)",
    "CREATE INDEX IF NOT EXISTS idx_media_gps ON media_files(gps_lat, gps_lon)",
    "CREATE TABLE IF NOT EXISTS albums (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS album_items (
        album_id INTEGER NOT NULL,
        media_id INTEGER NOT NULL,
        added_at TEXT NOT NULL,
        PRIMARY KEY (album_id, media_id),
        FOREIGN KEY (album_id) REFERENCES albums(id) ON DELETE CASCADE,
        FOREIGN KEY (media_id) REFERENCES media_files(id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_album_items_media_id ON album_items(media_id)",
    "CREATE TABLE IF NOT EXISTS audit_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        details_json TEXT NOT NULL,
        prev_hash TEXT NOT NULL,
        entry_hash TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS geocode_cache (
        provider TEXT NOT NULL,
        geocode_key TEXT NOT NULL,
        country TEXT,
        state TEXT,
        county TEXT,
        city TEXT,
        road TEXT,
        house_number TEXT,
        postcode TEXT,
        display_name TEXT,
        raw_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (provider, geocode_key)
    )",
];

/// Columns added after the first release; older databases gain them on open.
const UPGRADE_COLUMNS: &[(&str, &str)] = &[
    ("loc_provider", "TEXT"),
    ("loc_country", "TEXT"),
    ("loc_state", "TEXT"),
    ("loc_county", "TEXT"),
    ("loc_city", "TEXT"),
    ("loc_road", "TEXT"),
    ("loc_house_number", "TEXT"),
    ("loc_postcode", "TEXT"),
    ("loc_display_name", "TEXT"),
];

const MEDIA_COLUMNS: &str = "id, kind, file_name, extension, source_mount, source_path, dest_path, \
    size_bytes, crc32, sha256, capture_time, gps_lat, gps_lon, make, model, \
    camera_yaw, camera_pitch, camera_roll, \
    loc_provider, loc_country, loc_state, loc_county, loc_city, loc_road, \
    loc_house_number, loc_postcode, loc_display_name, \
    metadata_json, source_mtime, ingested_at";

pub struct SqliteVaultStore {
    conn: Mutex<Connection>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaRecord> {
    Ok(MediaRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        file_name: row.get(2)?,
        extension: row.get(3)?,
        source_mount: row.get(4)?,
        source_path: row.get(5)?,
        dest_path: row.get(6)?,
        size_bytes: row.get(7)?,
        crc32: row.get(8)?,
        sha256: row.get(9)?,
        capture_time: row.get(10)?,
        gps_lat: row.get(11)?,
        gps_lon: row.get(12)?,
        make: row.get(13)?,
        model: row.get(14)?,
        camera_yaw: row.get(15)?,
        camera_pitch: row.get(16)?,
        camera_roll: row.get(17)?,
        loc_provider: row.get(18)?,
        loc_country: row.get(19)?,
        loc_state: row.get(20)?,
        loc_county: row.get(21)?,
        loc_city: row.get(22)?,
        loc_road: row.get(23)?,
        loc_house_number: row.get(24)?,
        loc_postcode: row.get(25)?,
        loc_display_name: row.get(26)?,
        metadata_json: row.get(27)?,
        source_mtime: row.get(28)?,
        ingested_at: row.get(29)?,
    })
}

fn none_if_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn blank_to_null(v: &str) -> Option<&str> {
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SqliteVaultStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidInput(format!("create data dir {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        for stmt in SCHEMA {
            conn.execute(stmt, [])?;
        }

        let mut existing = std::collections::HashSet::new();
        {
            let mut stmt = conn.prepare("PRAGMA table_info(media_files)")?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            for name in names {
                existing.insert(name?);
            }
        }
        for (name, type_def) in UPGRADE_COLUMNS {
            if existing.contains(*name) {
                continue;
            }
            info!(column = name, "upgrading media_files schema");
            conn.execute(
                &format!("ALTER TABLE media_files ADD COLUMN {name} {type_def}"),
                [],
            )?;
        }

        for idx in [
            "CREATE INDEX IF NOT EXISTS idx_media_loc_state ON media_files(loc_state)",
            "CREATE INDEX IF NOT EXISTS idx_media_loc_county ON media_files(loc_county)",
            "CREATE INDEX IF NOT EXISTS idx_media_loc_city ON media_files(loc_city)",
        ] {
            conn.execute(idx, [])?;
        }
        Ok(())
    }
}

impl VaultStore for SqliteVaultStore {
    fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }

    fn has_users(&self) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM users", [], |r| r.get(0))?;
        Ok(count > 0)
    }

    fn create_user(&self, username: &str, hash: &[u8], salt: &[u8]) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (username, password_hash, salt, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, hash, salt, now_rfc3339()],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate
            } else {
                e.into()
            }
        })?;
        Ok(conn.last_insert_rowid())
    }

    fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, salt FROM users WHERE username = ?1",
                [username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        salt: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn create_session(
        &self,
        token_hash: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (token_hash, user_id, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                token_hash,
                user_id,
                expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn delete_session(&self, token_hash: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE token_hash = ?1", [token_hash])?;
        Ok(())
    }

    fn delete_expired_sessions(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            [now_rfc3339()],
        )?;
        Ok(n)
    }

    fn lookup_session(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT s.user_id, u.username, s.expires_at
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1",
                [token_hash],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((user_id, username, expires_raw)) = row else {
            return Ok(None);
        };
        let expires_at = DateTime::parse_from_rfc3339(&expires_raw)
            .map_err(|e| StoreError::InvalidInput(format!("bad session expiry: {e}")))?
            .with_timezone(&Utc);
        if Utc::now() > expires_at {
            self.delete_session(token_hash)?;
            return Ok(None);
        }
        Ok(Some(SessionRecord {
            user_id,
            username,
            expires_at,
        }))
    }

    fn media_exists(&self, crc32: &str, size_bytes: i64, capture_time: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM media_files WHERE crc32 = ?1 AND size_bytes = ?2 AND capture_time = ?3 LIMIT 1",
                params![crc32, size_bytes, capture_time],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    fn insert_media(&self, rec: &MediaRecord) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO media_files (
                kind, file_name, extension, source_mount, source_path, dest_path,
                size_bytes, crc32, sha256, capture_time, gps_lat, gps_lon, make, model,
                camera_yaw, camera_pitch, camera_roll,
                loc_provider, loc_country, loc_state, loc_county, loc_city, loc_road,
                loc_house_number, loc_postcode, loc_display_name,
                metadata_json, source_mtime, ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)",
            params![
                rec.kind,
                rec.file_name,
                rec.extension,
                rec.source_mount,
                rec.source_path,
                rec.dest_path,
                rec.size_bytes,
                rec.crc32,
                rec.sha256,
                rec.capture_time,
                rec.gps_lat,
                rec.gps_lon,
                none_if_blank(&rec.make),
                none_if_blank(&rec.model),
                rec.camera_yaw,
                rec.camera_pitch,
                rec.camera_roll,
                none_if_blank(&rec.loc_provider),
                none_if_blank(&rec.loc_country),
                none_if_blank(&rec.loc_state),
                none_if_blank(&rec.loc_county),
                none_if_blank(&rec.loc_city),
                none_if_blank(&rec.loc_road),
                none_if_blank(&rec.loc_house_number),
                none_if_blank(&rec.loc_postcode),
                none_if_blank(&rec.loc_display_name),
                rec.metadata_json,
                rec.source_mtime,
                rec.ingested_at,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate
            } else {
                e.into()
            }
        })?;
        Ok(conn.last_insert_rowid())
    }

    fn get_media_by_id(&self, id: i64) -> StoreResult<Option<MediaRecord>> {
        let conn = self.conn.lock().unwrap();
        let rec = conn
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media_files WHERE id = ?1"),
                [id],
                media_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    fn list_media_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<MediaRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media_files WHERE id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), media_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_media_by_id(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM media_files WHERE id = ?1", [id])?;
        Ok(())
    }

    fn list_media_filtered(
        &self,
        sort_by: &str,
        order: &str,
        limit: i64,
        offset: i64,
        filter: &MediaFilter,
    ) -> StoreResult<Vec<MediaRecord>> {
        let (where_sql, mut args) = build_media_where(filter);
        let (sort_expr, sort_args) = sort_expression(sort_by, filter);
        let order_sql = sort_order(sort_by, order);

        let query = format!(
            "SELECT {MEDIA_COLUMNS} FROM media_files WHERE {where_sql} \
             ORDER BY {sort_expr} {order_sql} LIMIT ? OFFSET ?"
        );
        args.extend(sort_args);
        args.push(SqlValue::Integer(limit));
        args.push(SqlValue::Integer(offset));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(args), media_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_map_points_filtered(
        &self,
        limit: i64,
        filter: &MediaFilter,
    ) -> StoreResult<Vec<MapPoint>> {
        let limit = if limit <= 0 {
            10_000
        } else {
            limit.min(50_000)
        };
        let (where_sql, mut args) = build_media_where(filter);
        let query = format!(
            "SELECT id, gps_lat, gps_lon, capture_time, file_name, kind
             FROM media_files
             WHERE gps_lat IS NOT NULL AND gps_lon IS NOT NULL AND {where_sql}
             ORDER BY capture_time DESC
             LIMIT ?"
        );
        args.push(SqlValue::Integer(limit));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(MapPoint {
                id: row.get(0)?,
                lat: row.get(1)?,
                lon: row.get(2)?,
                capture_time: row.get(3)?,
                file_name: row.get(4)?,
                kind: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_location_groups(
        &self,
        level: LocationLevel,
        filter: &MediaFilter,
        limit: i64,
    ) -> StoreResult<Vec<LocationGroup>> {
        let limit = if limit <= 0 || limit > 500 { 200 } else { limit };
        let col = level.column();
        let (where_sql, mut args) = build_media_where(filter);
        let query = format!(
            "SELECT COALESCE(NULLIF(TRIM({col}), ''), 'Unknown') AS name,
                    COUNT(1) AS count,
                    MIN(gps_lat) AS min_lat, MIN(gps_lon) AS min_lon,
                    MAX(gps_lat) AS max_lat, MAX(gps_lon) AS max_lon
             FROM media_files
             WHERE {where_sql}
             GROUP BY name
             ORDER BY count DESC, name ASC
             LIMIT ?"
        );
        args.push(SqlValue::Integer(limit));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(LocationGroup {
                name: row.get(0)?,
                count: row.get(1)?,
                min_lat: row.get(2)?,
                min_lon: row.get(3)?,
                max_lat: row.get(4)?,
                max_lon: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_device_groups(
        &self,
        filter: &MediaFilter,
        limit: i64,
    ) -> StoreResult<Vec<DeviceGroup>> {
        let limit = if limit <= 0 || limit > 500 { 200 } else { limit };
        let (where_sql, mut args) = build_media_where(filter);
        let query = format!(
            "SELECT COALESCE(NULLIF(TRIM(make), ''), '') AS make_norm,
                    COALESCE(NULLIF(TRIM(model), ''), '') AS model_norm,
                    COUNT(1) AS count
             FROM media_files
             WHERE {where_sql}
             GROUP BY make_norm, model_norm
             ORDER BY count DESC, make_norm ASC, model_norm ASC
             LIMIT ?"
        );
        args.push(SqlValue::Integer(limit));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            let make: String = row.get(0)?;
            let model: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            let unset = make.is_empty() && model.is_empty();
            let label = if unset {
                "Unknown device".to_string()
            } else if make.is_empty() {
                model.clone()
            } else if model.is_empty() {
                make.clone()
            } else {
                format!("{make} {model}")
            };
            Ok(DeviceGroup {
                make,
                model,
                label,
                count,
                unset,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_geo_todos(&self, limit: i64) -> StoreResult<Vec<GeoTodo>> {
        let limit = if limit <= 0 || limit > 500 { 50 } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, gps_lat, gps_lon
             FROM media_files
             WHERE gps_lat IS NOT NULL AND gps_lon IS NOT NULL
               AND loc_state IS NULL AND loc_county IS NULL
               AND loc_city IS NULL AND loc_display_name IS NULL
             ORDER BY capture_time DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(GeoTodo {
                id: row.get(0)?,
                lat: row.get(1)?,
                lon: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_media_location(&self, id: i64, loc: &MediaLocation) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media_files SET
                loc_provider = ?1, loc_country = ?2, loc_state = ?3, loc_county = ?4,
                loc_city = ?5, loc_road = ?6, loc_house_number = ?7, loc_postcode = ?8,
                loc_display_name = ?9
             WHERE id = ?10",
            params![
                none_if_blank(&loc.provider),
                none_if_blank(&loc.country),
                none_if_blank(&loc.state),
                none_if_blank(&loc.county),
                none_if_blank(&loc.city),
                none_if_blank(&loc.road),
                none_if_blank(&loc.house_number),
                none_if_blank(&loc.postcode),
                none_if_blank(&loc.display_name),
                id,
            ],
        )?;
        Ok(())
    }

    fn insert_audit(
        &self,
        ts: &str,
        actor: &str,
        action: &str,
        details_json: &str,
        prev_hash: &str,
        entry_hash: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_logs (ts, actor, action, details_json, prev_hash, entry_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![ts, actor, action, details_json, prev_hash, entry_hash],
        )?;
        Ok(())
    }

    fn last_audit_hash(&self) -> StoreResult<String> {
        let conn = self.conn.lock().unwrap();
        let hash = conn
            .query_row(
                "SELECT entry_hash FROM audit_logs ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hash.unwrap_or_default())
    }

    fn list_audit(&self, limit: i64) -> StoreResult<Vec<AuditRecord>> {
        let limit = if limit <= 0 || limit > 2000 { 200 } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts, actor, action, details_json, entry_hash
             FROM audit_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                ts: row.get(1)?,
                actor: row.get(2)?,
                action: row.get(3)?,
                details: row.get(4)?,
                hash: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_audit_chain(&self) -> StoreResult<Vec<AuditChainRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts, actor, action, details_json, prev_hash, entry_hash
             FROM audit_logs ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AuditChainRow {
                id: row.get(0)?,
                ts: row.get(1)?,
                actor: row.get(2)?,
                action: row.get(3)?,
                details_json: row.get(4)?,
                prev_hash: row.get(5)?,
                entry_hash: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_geocode_cache(
        &self,
        provider: &str,
        geocode_key: &str,
    ) -> StoreResult<Option<GeocodeCacheEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                "SELECT provider, geocode_key, country, state, county, city, road,
                        house_number, postcode, display_name, raw_json, updated_at
                 FROM geocode_cache WHERE provider = ?1 AND geocode_key = ?2",
                params![provider, geocode_key],
                |row| {
                    Ok(GeocodeCacheEntry {
                        provider: row.get(0)?,
                        geocode_key: row.get(1)?,
                        country: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        state: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        county: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        city: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        road: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                        house_number: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                        postcode: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                        display_name: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                        raw_json: row.get(10)?,
                        updated_at: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn upsert_geocode_cache(&self, entry: &GeocodeCacheEntry) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO geocode_cache (
                provider, geocode_key, country, state, county, city, road,
                house_number, postcode, display_name, raw_json, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(provider, geocode_key) DO UPDATE SET
                country = excluded.country, state = excluded.state,
                county = excluded.county, city = excluded.city,
                road = excluded.road, house_number = excluded.house_number,
                postcode = excluded.postcode, display_name = excluded.display_name,
                raw_json = excluded.raw_json, updated_at = excluded.updated_at",
            params![
                entry.provider,
                entry.geocode_key,
                blank_to_null(&entry.country),
                blank_to_null(&entry.state),
                blank_to_null(&entry.county),
                blank_to_null(&entry.city),
                blank_to_null(&entry.road),
                blank_to_null(&entry.house_number),
                blank_to_null(&entry.postcode),
                blank_to_null(&entry.display_name),
                entry.raw_json,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn create_album(&self, name: &str) -> StoreResult<Album> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("album name is required".into()));
        }
        if name.len() > 120 {
            return Err(StoreError::InvalidInput("album name too long".into()));
        }
        let id = {
            let conn = self.conn.lock().unwrap();
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO albums (name, created_at, updated_at) VALUES (?1, ?2, ?3)",
                params![name, now, now],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Duplicate
                } else {
                    e.into()
                }
            })?;
            conn.last_insert_rowid()
        };
        self.get_album_by_id(id)?
            .ok_or_else(|| StoreError::InvalidInput("album vanished after insert".into()))
    }

    fn list_albums(&self, limit: i64) -> StoreResult<Vec<Album>> {
        let limit = if limit <= 0 || limit > 2000 { 500 } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.name, a.created_at, a.updated_at, COUNT(ai.media_id) AS item_count
             FROM albums a
             LEFT JOIN album_items ai ON ai.album_id = a.id
             GROUP BY a.id, a.name, a.created_at, a.updated_at
             ORDER BY LOWER(a.name) ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(Album {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                item_count: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_album_by_id(&self, id: i64) -> StoreResult<Option<Album>> {
        let conn = self.conn.lock().unwrap();
        let album = conn
            .query_row(
                "SELECT a.id, a.name, a.created_at, a.updated_at, COUNT(ai.media_id) AS item_count
                 FROM albums a
                 LEFT JOIN album_items ai ON ai.album_id = a.id
                 WHERE a.id = ?1
                 GROUP BY a.id, a.name, a.created_at, a.updated_at",
                [id],
                |row| {
                    Ok(Album {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                        item_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(album)
    }

    fn add_media_to_album(&self, album_id: i64, ids: &[i64]) -> StoreResult<(usize, usize)> {
        if album_id <= 0 {
            return Err(StoreError::InvalidInput("invalid album_id".into()));
        }
        if ids.is_empty() {
            return Ok((0, 0));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let mut added = 0;
        let mut skipped = 0;
        for &id in ids {
            if id <= 0 {
                skipped += 1;
                continue;
            }
            match tx.execute(
                "INSERT OR IGNORE INTO album_items (album_id, media_id, added_at) VALUES (?1, ?2, ?3)",
                params![album_id, id, now],
            ) {
                Ok(n) if n > 0 => added += 1,
                _ => skipped += 1,
            }
        }
        tx.execute(
            "UPDATE albums SET updated_at = ?1 WHERE id = ?2",
            params![now, album_id],
        )?;
        tx.commit()?;
        Ok((added, skipped))
    }

    fn remove_media_from_album(&self, album_id: i64, ids: &[i64]) -> StoreResult<(usize, usize)> {
        if album_id <= 0 {
            return Err(StoreError::InvalidInput("invalid album_id".into()));
        }
        if ids.is_empty() {
            return Ok((0, 0));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let mut removed = 0;
        let mut skipped = 0;
        for &id in ids {
            if id <= 0 {
                skipped += 1;
                continue;
            }
            match tx.execute(
                "DELETE FROM album_items WHERE album_id = ?1 AND media_id = ?2",
                params![album_id, id],
            ) {
                Ok(n) if n > 0 => removed += 1,
                _ => skipped += 1,
            }
        }
        tx.execute(
            "UPDATE albums SET updated_at = ?1 WHERE id = ?2",
            params![now, album_id],
        )?;
        tx.commit()?;
        Ok((removed, skipped))
    }
}
