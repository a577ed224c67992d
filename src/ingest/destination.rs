//! Library destination paths.
//!
//! Layout is `<base>/[<state>/<county>/<city>/<road>/]YYYY/MM/DD/` (the
//! location prefix collapses to `Unknown` when nothing resolved, or is
//! omitted entirely under the plain `date` layout). Filenames carry the first
//! eight SHA-256 characters so two different files with the same camera name
//! never fight over a slot.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;

use crate::config::lower_extension;
use crate::store::MediaRecord;

const MAX_COLLISION_SUFFIX: u32 = 10_000;
const MAX_SEGMENT_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("create destination folder {path}: {source}")]
    CreateFolder {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to allocate destination filename")]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLayout {
    Date,
    LocationDate,
}

impl StorageLayout {
    /// Lenient parse; anything unrecognized gets the default layout.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "date" => Self::Date,
            _ => Self::LocationDate,
        }
    }
}

/// Keep ASCII letters, digits, `.`, `-`, `_`; everything else becomes `_`.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    replaced.trim_matches(|c| c == '_' || c == '.').to_string()
}

/// Folder segments additionally allow spaces (collapsed to `_`) and are
/// capped at 64 characters.
pub fn sanitize_folder_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let replaced: String = trimmed
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            ' ' => '_',
            _ => '_',
        })
        .collect();
    let mut out = replaced.trim_matches(|c| c == '_' || c == '.').to_string();
    out.truncate(MAX_SEGMENT_LEN);
    out
}

/// Non-empty sanitized location segments, most to least significant.
pub fn location_folder_parts(rec: &MediaRecord) -> Vec<String> {
    [
        &rec.loc_state,
        &rec.loc_county,
        &rec.loc_city,
        &rec.loc_road,
    ]
    .into_iter()
    .filter_map(|field| field.as_deref())
    .map(sanitize_folder_name)
    .filter(|s| !s.is_empty())
    .collect()
}

fn capture_date_segments(capture_time: &str) -> (String, String, String) {
    let tm = DateTime::parse_from_rfc3339(capture_time)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    (
        format!("{:04}", tm.year()),
        format!("{:02}", tm.month()),
        format!("{:02}", tm.day()),
    )
}

/// Create a directory tree with library permissions.
pub(crate) fn ensure_dir_0750(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

fn create_folder(folder: &Path) -> Result<(), DestinationError> {
    ensure_dir_0750(folder).map_err(|source| DestinationError::CreateFolder {
        path: folder.display().to_string(),
        source,
    })
}

/// Derive (and create the folder for) the library path of a new artifact.
pub fn build_destination_path(
    base_storage: &Path,
    layout: StorageLayout,
    capture_time: &str,
    source_path: &Path,
    sha256_hex: &str,
    rec: &MediaRecord,
) -> Result<PathBuf, DestinationError> {
    let (year, month, day) = capture_date_segments(capture_time);

    let mut folder = base_storage.to_path_buf();
    if layout == StorageLayout::LocationDate {
        let loc_parts = location_folder_parts(rec);
        if loc_parts.is_empty() {
            folder.push("Unknown");
        } else {
            for part in loc_parts {
                folder.push(part);
            }
        }
    }
    folder.push(year);
    folder.push(month);
    folder.push(day);
    create_folder(&folder)?;

    let ext = lower_extension(source_path);
    let mut stem = source_path
        .file_stem()
        .map(|s| sanitize_filename(&s.to_string_lossy()))
        .unwrap_or_default();
    if stem.is_empty() {
        stem = "media".to_string();
    }

    let short_hash = if sha256_hex.len() >= 8 {
        &sha256_hex[..8]
    } else {
        "unknown"
    };

    let candidate = folder.join(format!("{stem}_{short_hash}{ext}"));
    if !candidate.exists() {
        return Ok(candidate);
    }
    for i in 1..=MAX_COLLISION_SUFFIX {
        let alt = folder.join(format!("{stem}_{short_hash}_{i}{ext}"));
        if !alt.exists() {
            return Ok(alt);
        }
    }
    Err(DestinationError::Exhausted)
}
