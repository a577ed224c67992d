//! Query-string → catalog filter translation.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::store::MediaFilter;

fn q<'a>(params: &'a HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or("").trim()
}

/// Normalize the `kind` filter. Accepts singular/plural and the obvious
/// extension aliases; anything else is a client error.
pub fn normalize_kind_filter_value(raw: &str) -> Result<String, String> {
    let value = raw.trim().to_lowercase();
    match value.as_str() {
        "" => Ok(String::new()),
        "image" | "images" | "photo" | "photos" | "jpg" | "jpeg" | "png" | "heic" | "raw" => {
            Ok("image".to_string())
        }
        "video" | "videos" | "mp4" | "mov" | "clip" | "clips" => Ok("video".to_string()),
        _ => Err("invalid kind filter".to_string()),
    }
}

/// Accept RFC3339 (with or without fractional seconds), a bare datetime, or
/// a bare date. Bare `to` dates expand to the end of the day.
pub fn normalize_filter_time(raw: &str, end_of_day: bool) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(String::new());
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc
            .from_utc_datetime(&naive)
            .to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        }
        .expect("valid wall-clock time");
        return Ok(Utc
            .from_utc_datetime(&time)
            .to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    Err("invalid datetime".to_string())
}

/// Build a [`MediaFilter`] from request query parameters.
pub fn media_filter_from_query(params: &HashMap<String, String>) -> Result<MediaFilter, String> {
    let mut filter = MediaFilter {
        state: q(params, "state").to_string(),
        county: q(params, "county").to_string(),
        city: q(params, "city").to_string(),
        road: q(params, "road").to_string(),
        kind: normalize_kind_filter_value(q(params, "kind"))?,
        query: q(params, "q").to_string(),
        has_gps: q(params, "gps").to_lowercase(),
        ..Default::default()
    };

    if !filter.has_gps.is_empty() && filter.has_gps != "yes" && filter.has_gps != "no" {
        return Err("invalid gps filter".to_string());
    }

    let from = normalize_filter_time(q(params, "from"), false).map_err(|_| "invalid from date")?;
    let to = normalize_filter_time(q(params, "to"), true).map_err(|_| "invalid to date")?;
    if !from.is_empty() && !to.is_empty() && from > to {
        return Err("from date must be before to date".to_string());
    }
    filter.capture_from = from;
    filter.capture_to = to;

    let album_raw = q(params, "album");
    if !album_raw.is_empty() {
        filter.album_id = album_raw
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or("invalid album filter")?;
    }

    let near_lat = q(params, "near_lat");
    let near_lon = q(params, "near_lon");
    if !near_lat.is_empty() || !near_lon.is_empty() {
        let lat = near_lat.parse::<f64>().map_err(|_| "invalid near_lat")?;
        let lon = near_lon.parse::<f64>().map_err(|_| "invalid near_lon")?;
        filter.near_lat = lat;
        filter.near_lon = lon;
        filter.has_near = true;
    }

    if q(params, "device").eq_ignore_ascii_case("unset") {
        filter.device_unset = true;
    } else {
        filter.device_make = q(params, "device_make").to_string();
        filter.device_model = q(params, "device_model").to_string();
    }

    Ok(filter)
}
