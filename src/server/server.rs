//! Router construction and the non-media API handlers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

use super::filters::media_filter_from_query;
use super::http_layers::{log_requests, security_headers};
use super::media_routes;
use super::session::{Session, SESSION_COOKIE};
use super::state::ServerState;
use crate::backup::{BackupError, BackupRequest};
use crate::config::pathpolicy::{clean_path, encode_path_list, is_within, normalize_absolute_paths, parse_path_list};
use crate::config::{BASE_STORAGE_SETTING, CLOUD_SYNC_SETTING, EXCLUDED_MOUNTS_SETTING};
use crate::security;
use crate::store::LocationLevel;

const MAX_EXCLUDED_MOUNTS: usize = 256;

pub(super) fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

pub(super) fn internal_error(err: impl std::fmt::Display, public: &str) -> Response {
    warn!("{public}: {err}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, public)
}

pub fn build_router(state: ServerState) -> Router {
    let index = ServeFile::new(state.web_dir.join("index.html"));
    let web = ServeDir::new(state.web_dir.clone());

    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/setup", post(handle_setup))
        .route("/api/login", post(handle_login))
        .route("/api/logout", post(handle_logout))
        .route("/api/ingest-status", get(handle_ingest_status))
        .route("/api/backup-status", get(handle_backup_status))
        .route("/api/media", get(media_routes::handle_media_list))
        .route(
            "/api/media/{id}/content",
            get(media_routes::handle_media_content),
        )
        .route(
            "/api/media/{id}/download",
            get(media_routes::handle_media_download),
        )
        .route(
            "/api/media/download-zip",
            post(media_routes::handle_media_download_zip),
        )
        .route("/api/media/delete", post(media_routes::handle_media_delete))
        .route("/api/map", get(handle_map))
        .route("/api/location-groups", get(handle_location_groups))
        .route("/api/device-groups", get(handle_device_groups))
        .route("/api/albums", get(handle_albums_list).post(handle_album_create))
        .route("/api/albums/{id}/items", post(handle_album_add_items))
        .route(
            "/api/albums/{id}/items/delete",
            post(handle_album_remove_items),
        )
        .route("/api/audit", get(handle_audit))
        .route("/api/backup", post(handle_backup_start))
        .route("/api/mount-policy", get(handle_mount_policy))
        .route("/api/excluded-mounts", post(handle_excluded_mounts_set))
        .route("/api/storage", post(handle_set_storage))
        .route("/api/rescan", post(handle_rescan))
        .route(
            "/api/cloud-sync",
            get(handle_cloud_sync_get).post(handle_cloud_sync_set),
        )
        .route_service("/", index)
        .nest_service("/web", web)
        .layer(DefaultBodyLimit::max(1 << 20))
        .layer(middleware::from_fn(log_requests))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn run_server(state: ServerState, bind: &str, port: u16) -> anyhow::Result<()> {
    let cancel = state.cancel.clone();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("USB Vault listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn handle_status(
    State(state): State<ServerState>,
    session: Option<Session>,
) -> Response {
    let has_users = match state.store.has_users() {
        Ok(v) => v,
        Err(err) => return internal_error(err, "database unavailable"),
    };
    let storage_dir = match state.store.get_setting(BASE_STORAGE_SETTING) {
        Ok(v) => v,
        Err(err) => return internal_error(err, "database unavailable"),
    };
    Json(json!({
        "has_users": has_users,
        "has_storage": storage_dir.is_some(),
        "storage_dir": storage_dir.unwrap_or_default(),
        "authenticated": session.is_some(),
    }))
    .into_response()
}

async fn handle_ingest_status(State(state): State<ServerState>, _session: Session) -> Response {
    Json(state.ingestor.get_status()).into_response()
}

async fn handle_backup_status(State(state): State<ServerState>, _session: Session) -> Response {
    Json(state.backuper.get_status()).into_response()
}

#[derive(Deserialize)]
struct SetupRequest {
    username: String,
    password: String,
    base_storage_dir: String,
}

fn issue_session(
    state: &ServerState,
    jar: CookieJar,
    user_id: i64,
) -> Result<CookieJar, crate::store::StoreError> {
    let token = security::new_session_token();
    let expires = Utc::now() + ChronoDuration::hours(state.session_ttl_hours);
    state
        .store
        .create_session(&security::token_hash(&token), user_id, expires)?;

    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build();
    Ok(jar.add(cookie))
}

async fn handle_setup(
    State(state): State<ServerState>,
    jar: CookieJar,
    Json(req): Json<SetupRequest>,
) -> Response {
    match state.store.has_users() {
        Ok(true) => return json_error(StatusCode::CONFLICT, "setup already completed"),
        Ok(false) => {}
        Err(err) => return internal_error(err, "database unavailable"),
    }

    if !security::validate_username(&req.username) {
        return json_error(
            StatusCode::BAD_REQUEST,
            "username must be 3-64 chars [a-zA-Z0-9._-]",
        );
    }
    if let Err(err) = security::validate_password(&req.password) {
        return json_error(StatusCode::BAD_REQUEST, err.to_string());
    }

    let base = req.base_storage_dir.trim();
    if base.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "base_storage_dir is required");
    }
    let base = PathBuf::from(base);
    if !base.is_absolute() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "base_storage_dir must be an absolute path",
        );
    }
    let base = clean_path(&base);
    if create_storage_dir(&base).is_err() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "unable to create base storage directory",
        );
    }

    let (hash, salt) = match security::hash_password(&req.password) {
        Ok(v) => v,
        Err(err) => return internal_error(err, "failed to hash password"),
    };
    let user_id = match state.store.create_user(&req.username, &hash, &salt) {
        Ok(id) => id,
        Err(err) => return internal_error(err, "failed to create user"),
    };

    if let Err(err) = state
        .store
        .set_setting(BASE_STORAGE_SETTING, &base.display().to_string())
    {
        return internal_error(err, "failed to save storage path");
    }

    if let Err(err) = state.audit.log(
        &req.username,
        "setup_completed",
        json!({"storage_dir": base.display().to_string()}),
    ) {
        warn!(%err, "audit error");
    }

    match issue_session(&state, jar, user_id) {
        Ok(jar) => (StatusCode::CREATED, jar, Json(json!({"ok": true}))).into_response(),
        Err(err) => internal_error(err, "failed to create session"),
    }
}

fn create_storage_dir(base: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(base)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(base)
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn handle_login(
    State(state): State<ServerState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Response {
    let _ = state.store.delete_expired_sessions();

    let user = match state.store.get_user_by_username(&req.username) {
        Ok(u) => u,
        Err(err) => return internal_error(err, "database unavailable"),
    };
    let Some(user) = user else {
        return json_error(StatusCode::UNAUTHORIZED, "invalid credentials");
    };
    if !security::verify_password(&req.password, &user.password_hash, &user.salt) {
        return json_error(StatusCode::UNAUTHORIZED, "invalid credentials");
    }

    match issue_session(&state, jar, user.id) {
        Ok(jar) => {
            if let Err(err) = state.audit.log(&user.username, "login", json!({})) {
                warn!(%err, "audit error");
            }
            (jar, Json(json!({"ok": true}))).into_response()
        }
        Err(err) => internal_error(err, "failed to create session"),
    }
}

async fn handle_logout(State(state): State<ServerState>, jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        let _ = state
            .store
            .delete_session(&security::token_hash(cookie.value()));
    }
    let removal = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build();
    (jar.remove(removal), Json(json!({"ok": true}))).into_response()
}

async fn handle_map(
    State(state): State<ServerState>,
    _session: Session,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filter = match media_filter_from_query(&params) {
        Ok(f) => f,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err),
    };
    match state.store.list_map_points_filtered(2000, &filter) {
        Ok(points) => Json(json!({"points": points})).into_response(),
        Err(err) => internal_error(err, "query failed"),
    }
}

async fn handle_location_groups(
    State(state): State<ServerState>,
    _session: Session,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let level_raw = params.get("level").map(String::as_str).unwrap_or("");
    let level = match LocationLevel::parse(level_raw) {
        Ok(level) => level,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let filter = match media_filter_from_query(&params) {
        Ok(f) => f,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err),
    };
    match state.store.list_location_groups(level, &filter, 200) {
        Ok(groups) => Json(json!({"level": level_raw, "groups": groups})).into_response(),
        Err(err) => internal_error(err, "query failed"),
    }
}

async fn handle_device_groups(
    State(state): State<ServerState>,
    _session: Session,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filter = match media_filter_from_query(&params) {
        Ok(f) => f,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err),
    };
    match state.store.list_device_groups(&filter, 200) {
        Ok(groups) => Json(json!({"groups": groups})).into_response(),
        Err(err) => internal_error(err, "query failed"),
    }
}

#[derive(Deserialize)]
struct AlbumCreateRequest {
    name: String,
}

async fn handle_albums_list(State(state): State<ServerState>, _session: Session) -> Response {
    match state.store.list_albums(500) {
        Ok(albums) => Json(json!({"albums": albums})).into_response(),
        Err(err) => internal_error(err, "query failed"),
    }
}

async fn handle_album_create(
    State(state): State<ServerState>,
    session: Session,
    Json(req): Json<AlbumCreateRequest>,
) -> Response {
    match state.store.create_album(&req.name) {
        Ok(album) => {
            if let Err(err) = state.audit.log(
                &session.username,
                "album_created",
                json!({"album_id": album.id, "name": album.name}),
            ) {
                warn!(%err, "audit error");
            }
            (StatusCode::CREATED, Json(album)).into_response()
        }
        Err(crate::store::StoreError::Duplicate) => {
            json_error(StatusCode::CONFLICT, "album name already exists")
        }
        Err(crate::store::StoreError::InvalidInput(msg)) => {
            json_error(StatusCode::BAD_REQUEST, msg)
        }
        Err(err) => internal_error(err, "failed to create album"),
    }
}

#[derive(Deserialize)]
struct AlbumItemsRequest {
    ids: Vec<i64>,
}

async fn handle_album_add_items(
    State(state): State<ServerState>,
    session: Session,
    axum::extract::Path(album_id): axum::extract::Path<i64>,
    Json(req): Json<AlbumItemsRequest>,
) -> Response {
    let ids = media_routes::normalize_ids(&req.ids, 5000);
    match state.store.add_media_to_album(album_id, &ids) {
        Ok((added, skipped)) => {
            if let Err(err) = state.audit.log(
                &session.username,
                "album_items_added",
                json!({"album_id": album_id, "added": added, "skipped": skipped}),
            ) {
                warn!(%err, "audit error");
            }
            Json(json!({"ok": true, "added": added, "skipped": skipped})).into_response()
        }
        Err(crate::store::StoreError::InvalidInput(msg)) => {
            json_error(StatusCode::BAD_REQUEST, msg)
        }
        Err(err) => internal_error(err, "failed to update album"),
    }
}

async fn handle_album_remove_items(
    State(state): State<ServerState>,
    session: Session,
    axum::extract::Path(album_id): axum::extract::Path<i64>,
    Json(req): Json<AlbumItemsRequest>,
) -> Response {
    let ids = media_routes::normalize_ids(&req.ids, 5000);
    match state.store.remove_media_from_album(album_id, &ids) {
        Ok((removed, skipped)) => {
            if let Err(err) = state.audit.log(
                &session.username,
                "album_items_removed",
                json!({"album_id": album_id, "removed": removed, "skipped": skipped}),
            ) {
                warn!(%err, "audit error");
            }
            Json(json!({"ok": true, "removed": removed, "skipped": skipped})).into_response()
        }
        Err(crate::store::StoreError::InvalidInput(msg)) => {
            json_error(StatusCode::BAD_REQUEST, msg)
        }
        Err(err) => internal_error(err, "failed to update album"),
    }
}

async fn handle_audit(State(state): State<ServerState>, session: Session) -> Response {
    match state.store.list_audit(300) {
        Ok(items) => Json(json!({"items": items, "viewer": session.username})).into_response(),
        Err(err) => internal_error(err, "query failed"),
    }
}

async fn handle_backup_start(
    State(state): State<ServerState>,
    session: Session,
    Json(req): Json<BackupRequest>,
) -> Response {
    let mode = req.mode.clone();
    let destination = req.destination.clone();
    match state.backuper.start(&session.username, req) {
        Ok(()) => {
            if let Err(err) = state.audit.log(
                &session.username,
                "backup_started",
                json!({"mode": mode, "destination": destination}),
            ) {
                warn!(%err, "audit error");
            }
            (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response()
        }
        Err(BackupError::Busy) => {
            json_error(StatusCode::CONFLICT, BackupError::Busy.to_string())
        }
        Err(err @ BackupError::InvalidRequest(_)) => {
            json_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        Err(err) => internal_error(err, "failed to start backup"),
    }
}

async fn handle_mount_policy(State(state): State<ServerState>, _session: Session) -> Response {
    let excluded = match state.store.get_setting(EXCLUDED_MOUNTS_SETTING) {
        Ok(raw) => parse_path_list(&raw.unwrap_or_default()),
        Err(err) => return internal_error(err, "database unavailable"),
    };
    let storage = match state.store.get_setting(BASE_STORAGE_SETTING) {
        Ok(v) => v.map(|s| clean_path(Path::new(s.trim()))),
        Err(err) => return internal_error(err, "database unavailable"),
    };

    let mounts: Vec<String> = state
        .watcher
        .current_mounts()
        .iter()
        .map(|m| m.display().to_string())
        .collect();
    let auto_excluded: Vec<String> = match &storage {
        Some(base) => mounts
            .iter()
            .filter(|m| is_within(base, Path::new(m)))
            .cloned()
            .collect(),
        None => Vec::new(),
    };

    Json(json!({
        "mounts": mounts,
        "excluded_mounts": excluded,
        "auto_excluded_mounts": auto_excluded,
        "storage_dir": storage.map(|p| p.display().to_string()).unwrap_or_default(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct ExcludedMountsRequest {
    mounts: Vec<String>,
}

async fn handle_excluded_mounts_set(
    State(state): State<ServerState>,
    session: Session,
    Json(req): Json<ExcludedMountsRequest>,
) -> Response {
    let normalized = normalize_absolute_paths(&req.mounts);
    if normalized.len() > MAX_EXCLUDED_MOUNTS {
        return json_error(StatusCode::BAD_REQUEST, "too many excluded mounts");
    }
    if let Err(err) = state
        .store
        .set_setting(EXCLUDED_MOUNTS_SETTING, &encode_path_list(&normalized))
    {
        return internal_error(err, "failed to update excluded mounts");
    }
    if let Err(err) = state.audit.log(
        &session.username,
        "excluded_mounts_updated",
        json!({"count": normalized.len()}),
    ) {
        warn!(%err, "audit error");
    }
    Json(json!({"ok": true, "excluded_mounts": normalized})).into_response()
}

#[derive(Deserialize)]
struct StorageRequest {
    base_storage_dir: String,
}

async fn handle_set_storage(
    State(state): State<ServerState>,
    session: Session,
    Json(req): Json<StorageRequest>,
) -> Response {
    let base = req.base_storage_dir.trim();
    if base.is_empty() || !Path::new(base).is_absolute() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "base_storage_dir must be an absolute path",
        );
    }
    let base = clean_path(Path::new(base));
    if create_storage_dir(&base).is_err() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "unable to create base storage directory",
        );
    }
    if let Err(err) = state
        .store
        .set_setting(BASE_STORAGE_SETTING, &base.display().to_string())
    {
        return internal_error(err, "failed to update storage");
    }
    if let Err(err) = state.audit.log(
        &session.username,
        "storage_updated",
        json!({"storage_dir": base.display().to_string()}),
    ) {
        warn!(%err, "audit error");
    }
    Json(json!({"ok": true})).into_response()
}

#[derive(Deserialize)]
struct RescanRequest {
    mount_path: String,
}

async fn handle_rescan(
    State(state): State<ServerState>,
    session: Session,
    Json(req): Json<RescanRequest>,
) -> Response {
    let mount = req.mount_path.trim();
    if mount.is_empty() || !Path::new(mount).is_absolute() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "mount_path must be an absolute path",
        );
    }

    match state
        .ingestor
        .process_mount(&state.cancel, Path::new(mount), &session.username)
        .await
    {
        Ok(result) => Json(json!({"ok": true, "result": result})).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn handle_cloud_sync_get(State(state): State<ServerState>, _session: Session) -> Response {
    let raw = match state.store.get_setting(CLOUD_SYNC_SETTING) {
        Ok(v) => v,
        Err(err) => return internal_error(err, "database unavailable"),
    };
    let payload: JsonValue = raw
        .and_then(|v| serde_json::from_str(&v).ok())
        .unwrap_or_else(|| json!({"enabled": false, "provider": "none", "rules": []}));
    Json(payload).into_response()
}

async fn handle_cloud_sync_set(
    State(state): State<ServerState>,
    session: Session,
    Json(payload): Json<JsonValue>,
) -> Response {
    let raw = payload.to_string();
    if let Err(err) = state.store.set_setting(CLOUD_SYNC_SETTING, &raw) {
        return internal_error(err, "failed to update cloud sync settings");
    }
    if let Err(err) = state.audit.log(
        &session.username,
        "cloud_sync_config_updated",
        json!({"length": raw.len()}),
    ) {
        warn!(%err, "audit error");
    }
    Json(json!({"ok": true})).into_response()
}
