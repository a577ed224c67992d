//! Media catalog endpoints: listing, streaming, bulk zip export, deletion.

use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use super::filters::media_filter_from_query;
use super::server::{internal_error, json_error};
use super::session::Session;
use super::state::ServerState;
use crate::config::pathpolicy::{clean_path, is_within, path_key};
use crate::config::{is_truthy, BASE_STORAGE_SETTING};
use crate::store::MediaRecord;

const MAX_BULK_IDS: usize = 5000;
const MAX_PAGE_SIZE: i64 = 500;

/// Drop non-positive and duplicate ids, capping the batch size.
pub(super) fn normalize_ids(ids: &[i64], max: usize) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut out = Vec::with_capacity(ids.len().min(max));
    for &id in ids {
        if id <= 0 || !seen.insert(id) {
            continue;
        }
        out.push(id);
        if out.len() >= max {
            break;
        }
    }
    out
}

fn parse_positive(raw: Option<&String>, fallback: i64) -> i64 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn location_path(rec: &MediaRecord) -> String {
    let parts: Vec<&str> = [&rec.loc_state, &rec.loc_county, &rec.loc_city, &rec.loc_road]
        .into_iter()
        .filter_map(|v| v.as_deref())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    if parts.is_empty() {
        "Unknown".to_string()
    } else {
        parts.join(" / ")
    }
}

fn media_item_json(rec: &MediaRecord) -> serde_json::Value {
    json!({
        "id": rec.id,
        "kind": rec.kind,
        "file_name": rec.file_name,
        "extension": rec.extension,
        "size_bytes": rec.size_bytes,
        "capture_time": rec.capture_time,
        "ingested_at": rec.ingested_at,
        "gps_lat": rec.gps_lat,
        "gps_lon": rec.gps_lon,
        "make": rec.make,
        "model": rec.model,
        "camera_yaw": rec.camera_yaw,
        "camera_pitch": rec.camera_pitch,
        "camera_roll": rec.camera_roll,
        "state": rec.loc_state,
        "county": rec.loc_county,
        "city": rec.loc_city,
        "road": rec.loc_road,
        "display_name": rec.loc_display_name,
        "location": location_path(rec),
        "metadata": rec.metadata_json,
        "preview_url": format!("/api/media/{}/content", rec.id),
    })
}

pub(super) async fn handle_media_list(
    State(state): State<ServerState>,
    _session: Session,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let page = parse_positive(params.get("page"), 1);
    let size = parse_positive(params.get("size"), 120).min(MAX_PAGE_SIZE);
    let offset = (page - 1) * size;

    let filter = match media_filter_from_query(&params) {
        Ok(f) => f,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err),
    };
    let sort = params.get("sort").map(String::as_str).unwrap_or("");
    if sort.eq_ignore_ascii_case("distance") && !filter.has_near {
        return json_error(
            StatusCode::BAD_REQUEST,
            "distance sort requires near_lat and near_lon",
        );
    }
    let order = params.get("order").map(String::as_str).unwrap_or("");

    let records = match state
        .store
        .list_media_filtered(sort, order, size, offset, &filter)
    {
        Ok(r) => r,
        Err(err) => return internal_error(err, "query failed"),
    };

    let items: Vec<_> = records.iter().map(media_item_json).collect();
    Json(json!({"items": items, "page": page, "size": size})).into_response()
}

fn content_type_for_extension(ext: &str) -> &'static str {
    match ext {
        ".jpg" | ".jpeg" | ".jpe" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".bmp" => "image/bmp",
        ".tif" | ".tiff" => "image/tiff",
        ".heic" | ".heif" => "image/heic",
        ".mp4" | ".m4v" => "video/mp4",
        ".mov" => "video/quicktime",
        ".mkv" => "video/x-matroska",
        ".webm" => "video/webm",
        ".avi" => "video/x-msvideo",
        ".mpeg" | ".mpg" => "video/mpeg",
        _ => "application/octet-stream",
    }
}

pub(super) fn sanitize_download_filename(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return "media.bin".to_string();
    }
    name.chars()
        .map(|c| match c {
            '\\' | '/' | '"' | '\r' | '\n' => '_',
            other => other,
        })
        .collect()
}

async fn serve_media_by_id(state: &ServerState, id: i64, force_download: bool) -> Response {
    let rec = match state.store.get_media_by_id(id) {
        Ok(Some(rec)) => rec,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not found"),
        Err(err) => return internal_error(err, "query failed"),
    };

    let file = match tokio::fs::File::open(&rec.dest_path).await {
        Ok(f) => f,
        Err(_) => return json_error(StatusCode::NOT_FOUND, "not found"),
    };
    let len = match file.metadata().await {
        Ok(m) => m.len(),
        Err(err) => return internal_error(err, "stat failed"),
    };

    let mut response = Response::builder()
        .header(
            header::CONTENT_TYPE,
            content_type_for_extension(&rec.extension),
        )
        .header(header::CONTENT_LENGTH, len);
    if force_download {
        let file_name = sanitize_download_filename(&rec.file_name);
        response = response
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            )
            .header(header::CACHE_CONTROL, "private, no-store");
    } else {
        response = response.header(header::CACHE_CONTROL, "private, max-age=3600");
    }

    response
        .body(Body::from_stream(ReaderStream::new(file)))
        .unwrap_or_else(|err| internal_error(err, "response build failed"))
}

pub(super) async fn handle_media_content(
    State(state): State<ServerState>,
    _session: Session,
    UrlPath(id): UrlPath<i64>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let download = params
        .get("download")
        .map(|v| is_truthy(v) && !v.trim().is_empty())
        .unwrap_or(false);
    serve_media_by_id(&state, id, download).await
}

pub(super) async fn handle_media_download(
    State(state): State<ServerState>,
    _session: Session,
    UrlPath(id): UrlPath<i64>,
) -> Response {
    serve_media_by_id(&state, id, true).await
}

#[derive(Deserialize)]
pub(super) struct IdsRequest {
    ids: Vec<i64>,
}

fn archive_segment(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let replaced: String = trimmed
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | ' ' => c,
            _ => '_',
        })
        .collect();
    let mut out = replaced
        .trim_matches(|c| c == '_' || c == '.' || c == ' ')
        .to_string();
    out.truncate(80);
    out
}

/// Archive entry path: location segments, capture date, then an id-prefixed
/// filename, deduplicated against names already written.
fn archive_entry_name(rec: &MediaRecord, used: &mut HashSet<String>) -> String {
    let mut parts: Vec<String> = [&rec.loc_state, &rec.loc_county, &rec.loc_city, &rec.loc_road]
        .into_iter()
        .filter_map(|v| v.as_deref())
        .map(archive_segment)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        parts.push("Unknown".to_string());
    }
    if let Ok(tm) = DateTime::parse_from_rfc3339(&rec.capture_time) {
        let tm = tm.with_timezone(&Utc);
        parts.push(format!("{:04}", tm.year()));
        parts.push(format!("{:02}", tm.month()));
        parts.push(format!("{:02}", tm.day()));
    }

    let mut base_name = sanitize_download_filename(&rec.file_name);
    if base_name.is_empty() {
        base_name = format!("media_{}{}", rec.id, rec.extension);
    }
    let base_name = format!("{:06}_{}", rec.id, base_name);

    let dir = parts.join("/");
    let candidate = format!("{dir}/{base_name}");
    if used.insert(candidate.clone()) {
        return candidate;
    }

    let stem = Path::new(&base_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| base_name.clone());
    let ext = base_name[stem.len()..].to_string();
    for i in 1..=10_000 {
        let alt = format!("{dir}/{stem}_{i}{ext}");
        if used.insert(alt.clone()) {
            return alt;
        }
    }
    let fallback = format!("{dir}/{}_{}{ext}", rec.id, used.len());
    used.insert(fallback.clone());
    fallback
}

pub(super) async fn handle_media_download_zip(
    State(state): State<ServerState>,
    session: Session,
    Json(req): Json<IdsRequest>,
) -> Response {
    let ids = normalize_ids(&req.ids, MAX_BULK_IDS);
    if ids.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "ids must contain at least one positive id",
        );
    }

    let records = match state.store.list_media_by_ids(&ids) {
        Ok(r) => r,
        Err(err) => return internal_error(err, "query failed"),
    };
    if records.is_empty() {
        return json_error(StatusCode::NOT_FOUND, "no matching media records");
    }
    let mut record_by_id: HashMap<i64, MediaRecord> =
        records.into_iter().map(|r| (r.id, r)).collect();

    let base_storage = state
        .store
        .get_setting(BASE_STORAGE_SETTING)
        .ok()
        .flatten()
        .map(|raw| clean_path(Path::new(raw.trim())));

    // Build the archive on a blocking thread into an unlinked temp file,
    // then stream it out.
    let ordered: Vec<MediaRecord> = ids
        .iter()
        .filter_map(|id| record_by_id.remove(id))
        .collect();
    let requested = ids.len();
    let build = tokio::task::spawn_blocking(move || -> std::io::Result<(std::fs::File, usize, usize)> {
        let mut file = tempfile::tempfile()?;
        let mut written = 0usize;
        let mut skipped = requested - ordered.len();
        {
            let mut zip = zip::ZipWriter::new(&mut file);
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            let mut used = HashSet::new();
            for rec in &ordered {
                let dest = clean_path(Path::new(&rec.dest_path));
                if let Some(base) = &base_storage {
                    if !is_within(&dest, base) {
                        skipped += 1;
                        continue;
                    }
                }
                let Ok(mut src) = std::fs::File::open(&dest) else {
                    skipped += 1;
                    continue;
                };
                let entry = archive_entry_name(rec, &mut used);
                if zip.start_file(entry, options).is_err() {
                    skipped += 1;
                    continue;
                }
                if std::io::copy(&mut src, &mut zip).is_err() {
                    skipped += 1;
                    continue;
                }
                written += 1;
            }
            zip.finish().map_err(std::io::Error::other)?;
        }
        file.seek(SeekFrom::Start(0))?;
        Ok((file, written, skipped))
    })
    .await;

    let (file, written, skipped) = match build {
        Ok(Ok(out)) => out,
        Ok(Err(err)) => return internal_error(err, "zip build failed"),
        Err(err) => return internal_error(err, "zip build failed"),
    };

    if let Err(err) = state.audit.log(
        &session.username,
        "media_download_zip",
        json!({"requested": requested, "written": written, "skipped": skipped}),
    ) {
        warn!(%err, "audit error");
    }

    let zip_name = format!(
        "usbvault_export_{}.zip",
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let stream = ReaderStream::new(tokio::fs::File::from_std(file));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename=\"{zip_name}\""))
                .unwrap_or(HeaderValue::from_static("attachment")),
        )
        .header(header::CACHE_CONTROL, "private, no-store")
        .header(header::CONTENT_LENGTH, len)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|err| internal_error(err, "response build failed"))
}

/// Remove now-empty ancestors of a deleted file, stopping at the library
/// root. `remove_dir` refuses non-empty directories, which ends the walk.
fn cleanup_empty_parents(file_path: &Path, stop_dir: &Path) {
    let mut dir = match file_path.parent() {
        Some(d) => d.to_path_buf(),
        None => return,
    };
    loop {
        if !is_within(&dir, stop_dir) || path_key(&dir) == path_key(stop_dir) {
            return;
        }
        if std::fs::remove_dir(&dir).is_err() {
            return;
        }
        dir = match dir.parent() {
            Some(d) => d.to_path_buf(),
            None => return,
        };
    }
}

pub(super) async fn handle_media_delete(
    State(state): State<ServerState>,
    session: Session,
    Json(req): Json<IdsRequest>,
) -> Response {
    let ids = normalize_ids(&req.ids, MAX_BULK_IDS);
    if ids.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "ids must contain at least one positive id",
        );
    }

    let records = match state.store.list_media_by_ids(&ids) {
        Ok(r) => r,
        Err(err) => return internal_error(err, "query failed"),
    };
    let record_by_id: HashMap<i64, MediaRecord> =
        records.into_iter().map(|r| (r.id, r)).collect();

    let base_storage = state
        .store
        .get_setting(BASE_STORAGE_SETTING)
        .ok()
        .flatten()
        .map(|raw| clean_path(Path::new(raw.trim())));

    let mut deleted = 0;
    let mut not_found = 0;
    let mut failed = 0;
    for id in &ids {
        let Some(rec) = record_by_id.get(id) else {
            not_found += 1;
            continue;
        };

        let dest = clean_path(Path::new(&rec.dest_path));
        if let Some(base) = &base_storage {
            if !is_within(&dest, base) {
                failed += 1;
                continue;
            }
        }

        match tokio::fs::remove_file(&dest).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => {
                failed += 1;
                continue;
            }
        }
        if state.store.delete_media_by_id(*id).is_err() {
            failed += 1;
            continue;
        }
        if let Some(base) = &base_storage {
            cleanup_empty_parents(&dest, base);
        }
        deleted += 1;
    }

    if let Err(err) = state.audit.log(
        &session.username,
        "media_deleted",
        json!({
            "requested": ids.len(),
            "deleted": deleted,
            "not_found": not_found,
            "failed": failed,
        }),
    ) {
        warn!(%err, "audit error");
    }

    Json(json!({
        "ok": true,
        "requested": ids.len(),
        "deleted": deleted,
        "not_found": not_found,
        "failed": failed,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ids_dedupes_and_caps() {
        assert_eq!(normalize_ids(&[3, 1, 3, -2, 0, 2], 10), vec![3, 1, 2]);
        let many: Vec<i64> = (1..=6000).collect();
        assert_eq!(normalize_ids(&many, MAX_BULK_IDS).len(), MAX_BULK_IDS);
        assert!(normalize_ids(&[], 10).is_empty());
    }

    #[test]
    fn download_filename_is_header_safe() {
        assert_eq!(sanitize_download_filename("a/b\\c\"d\n.jpg"), "a_b_c_d_.jpg");
        assert_eq!(sanitize_download_filename("  "), "media.bin");
    }

    #[test]
    fn archive_entry_names_are_grouped_and_deduped() {
        let mut used = HashSet::new();
        let rec = MediaRecord {
            id: 7,
            file_name: "A.JPG".to_string(),
            extension: ".jpg".to_string(),
            capture_time: "2024-03-01T10:00:00Z".to_string(),
            loc_state: Some("Colorado".to_string()),
            loc_city: Some("Denver".to_string()),
            ..Default::default()
        };
        let first = archive_entry_name(&rec, &mut used);
        assert_eq!(first, "Colorado/Denver/2024/03/01/000007_A.JPG");
        let second = archive_entry_name(&rec, &mut used);
        assert_eq!(second, "Colorado/Denver/2024/03/01/000007_A_1.JPG");
    }

    #[test]
    fn archive_entry_without_location_or_date_still_names_cleanly() {
        let mut used = HashSet::new();
        let rec = MediaRecord {
            id: 1,
            file_name: "B.MP4".to_string(),
            extension: ".mp4".to_string(),
            capture_time: "bogus".to_string(),
            ..Default::default()
        };
        assert_eq!(archive_entry_name(&rec, &mut used), "Unknown/000001_B.MP4");
    }

    #[test]
    fn location_path_joins_non_empty_parts() {
        let rec = MediaRecord {
            loc_state: Some("Colorado".to_string()),
            loc_county: Some("  ".to_string()),
            loc_city: Some("Denver".to_string()),
            ..Default::default()
        };
        assert_eq!(location_path(&rec), "Colorado / Denver");
        assert_eq!(location_path(&MediaRecord::default()), "Unknown");
    }

    #[test]
    fn cleanup_stops_at_library_root() {
        let base = tempfile::tempdir().unwrap();
        let nested = base.path().join("Colorado/2024/03/01");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("a.jpg");

        cleanup_empty_parents(&file, base.path());
        assert!(!base.path().join("Colorado").exists());
        assert!(base.path().exists());

        // A sibling file keeps the tree alive.
        let nested = base.path().join("Utah/2024/03/01");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("keep.jpg"), b"x").unwrap();
        cleanup_empty_parents(&nested.join("gone.jpg"), base.path());
        assert!(nested.exists());
    }
}
