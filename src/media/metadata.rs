//! Technical metadata extraction.
//!
//! Images get their EXIF datetime, GPS pair, and Make/Model tags; any file is
//! additionally scanned (first 5 MiB) for the XMP-style DJI gimbal triplet
//! that drones embed in both stills and footage. Absent metadata is never an
//! error: capture time falls back to the source mtime and then to the clock,
//! and the record keeps a diagnostics blob explaining what happened.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use exif::{In, Tag, Value};
use regex::bytes::Regex;
use serde_json::{json, Map};

use crate::config::MediaKind;

const DJI_SCAN_LIMIT: usize = 5 * 1024 * 1024;

static REGEX_YAW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)GimbalYawDegree\s*=\s*"([\-0-9.]+)""#).unwrap());
static REGEX_PITCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)GimbalPitchDegree\s*=\s*"([\-0-9.]+)""#).unwrap());
static REGEX_ROLL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)GimbalRollDegree\s*=\s*"([\-0-9.]+)""#).unwrap());

#[derive(Debug, Clone, Default)]
pub struct ExtractedMetadata {
    /// RFC3339 UTC; always set via the EXIF → mtime → now fallback chain.
    pub capture_time: String,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub camera_yaw: Option<f64>,
    pub camera_pitch: Option<f64>,
    pub camera_roll: Option<f64>,
    /// Compact JSON of extractor diagnostics.
    pub raw_json: String,
}

fn rfc3339_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Extract metadata from `path`. Runs blocking file I/O; call from a worker
/// thread when on the async runtime.
pub fn extract_metadata(path: &Path, kind: MediaKind) -> std::io::Result<ExtractedMetadata> {
    let mut meta = ExtractedMetadata::default();
    let mut raw = Map::new();

    if kind == MediaKind::Image {
        match parse_image_exif(path) {
            Ok(exif_meta) => meta = exif_meta,
            Err(ExifReadError::Absent) => {}
            Err(ExifReadError::Other(msg)) => {
                raw.insert("exif_error".into(), json!(msg));
            }
        }
    }

    let head = read_head(path, DJI_SCAN_LIMIT)?;
    if let Some(yaw) = parse_dji_value(&head, &REGEX_YAW) {
        meta.camera_yaw = Some(yaw);
        raw.insert("dji_gimbal_yaw".into(), json!(yaw));
    }
    if let Some(pitch) = parse_dji_value(&head, &REGEX_PITCH) {
        meta.camera_pitch = Some(pitch);
        raw.insert("dji_gimbal_pitch".into(), json!(pitch));
    }
    if let Some(roll) = parse_dji_value(&head, &REGEX_ROLL) {
        meta.camera_roll = Some(roll);
        raw.insert("dji_gimbal_roll".into(), json!(roll));
    }

    if meta.capture_time.is_empty() {
        if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
            meta.capture_time = rfc3339_utc(DateTime::<Utc>::from(mtime));
            raw.insert("capture_time_fallback".into(), json!("source_mod_time"));
        }
    }
    if meta.capture_time.is_empty() {
        meta.capture_time = rfc3339_utc(Utc::now());
        raw.insert("capture_time_fallback".into(), json!("ingest_time"));
    }

    meta.raw_json = serde_json::Value::Object(raw).to_string();
    Ok(meta)
}

enum ExifReadError {
    /// The file simply carries no EXIF; not worth a diagnostic.
    Absent,
    Other(String),
}

fn parse_image_exif(path: &Path) -> Result<ExtractedMetadata, ExifReadError> {
    let file = File::open(path).map_err(|e| ExifReadError::Other(e.to_string()))?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new()
        .read_from_container(&mut reader)
        .map_err(|e| match e {
            exif::Error::NotFound(_) | exif::Error::BlankValue(_) => ExifReadError::Absent,
            exif::Error::InvalidFormat(_) => ExifReadError::Absent,
            other => ExifReadError::Other(other.to_string()),
        })?;

    let mut out = ExtractedMetadata::default();

    let datetime = exif
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY));
    if let Some(field) = datetime {
        if let Some(ts) = parse_exif_datetime(&field.display_value().to_string()) {
            out.capture_time = rfc3339_utc(ts);
        }
    }

    if let (Some(lat), Some(lon)) = (
        read_gps_coord(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S"),
        read_gps_coord(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W"),
    ) {
        out.gps_lat = Some(lat);
        out.gps_lon = Some(lon);
    }

    out.make = read_trimmed_string(&exif, Tag::Make);
    out.model = read_trimmed_string(&exif, Tag::Model);
    Ok(out)
}

/// EXIF datetimes are `YYYY:MM:DD HH:MM:SS` with no zone; treated as UTC.
fn parse_exif_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().trim_matches('"');
    let naive = NaiveDateTime::parse_from_str(raw, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn read_trimmed_string(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let value = field
        .display_value()
        .to_string()
        .trim_matches('"')
        .trim()
        .to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn read_gps_coord(exif: &exif::Exif, value_tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let field = exif.get_field(value_tag, In::PRIMARY)?;
    let dms = match &field.value {
        Value::Rational(parts) if parts.len() >= 3 => parts,
        _ => return None,
    };
    let mut decimal = dms_to_decimal(
        dms[0].to_f64(),
        dms[1].to_f64(),
        dms[2].to_f64(),
    );
    if let Some(r) = exif.get_field(ref_tag, In::PRIMARY) {
        let r = r.display_value().to_string();
        if r.trim_matches('"').trim().eq_ignore_ascii_case(negative_ref) {
            decimal = -decimal;
        }
    }
    Some(decimal)
}

fn dms_to_decimal(deg: f64, min: f64, sec: f64) -> f64 {
    deg + min / 60.0 + sec / 3600.0
}

fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buf = Vec::new();
    file.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn parse_dji_value(head: &[u8], rx: &Regex) -> Option<f64> {
    let caps = rx.captures(head)?;
    let raw = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
    raw.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dji_gimbal_triplet_is_scanned_from_xmp_text() {
        let body = br#"<x:xmpmeta xmlns:drone-dji="http://www.dji.com/drone-dji/1.0/">
            drone-dji:GimbalYawDegree="-12.5"
            drone-dji:GimbalPitchDegree="-90.0"
            drone-dji:GimbalRollDegree="0.0"
        </x:xmpmeta>"#;
        assert_eq!(parse_dji_value(body, &REGEX_YAW), Some(-12.5));
        assert_eq!(parse_dji_value(body, &REGEX_PITCH), Some(-90.0));
        assert_eq!(parse_dji_value(body, &REGEX_ROLL), Some(0.0));
    }

    #[test]
    fn dji_scan_ignores_unquoted_or_missing_fields() {
        assert_eq!(parse_dji_value(b"GimbalYawDegree=12.5", &REGEX_YAW), None);
        assert_eq!(parse_dji_value(b"no gimbal here", &REGEX_PITCH), None);
    }

    #[test]
    fn exif_datetime_parsing() {
        let ts = parse_exif_datetime("2024:03:01 10:00:00").unwrap();
        assert_eq!(rfc3339_utc(ts), "2024-03-01T10:00:00Z");
        assert!(parse_exif_datetime("garbage").is_none());
    }

    #[test]
    fn dms_conversion() {
        let lat = dms_to_decimal(39.0, 44.0, 21.12);
        assert!((lat - 39.7392).abs() < 1e-4);
    }

    #[test]
    fn capture_time_falls_back_to_source_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not really a video").unwrap();

        let meta = extract_metadata(&path, MediaKind::Video).unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(meta.capture_time, rfc3339_utc(DateTime::<Utc>::from(mtime)));
        assert!(meta.raw_json.contains("source_mod_time"));
        assert!(meta.gps_lat.is_none());
    }

    #[test]
    fn gimbal_values_land_in_metadata_and_raw_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DJI_0001.MP4");
        std::fs::write(&path, br#"ftyp...GimbalYawDegree="33.20" GimbalPitchDegree="-45.10""#)
            .unwrap();

        let meta = extract_metadata(&path, MediaKind::Video).unwrap();
        assert_eq!(meta.camera_yaw, Some(33.2));
        assert_eq!(meta.camera_pitch, Some(-45.1));
        assert_eq!(meta.camera_roll, None);
        assert!(meta.raw_json.contains("dji_gimbal_yaw"));
    }
}
