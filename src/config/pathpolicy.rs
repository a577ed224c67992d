//! Path normalization and containment rules.
//!
//! Mount paths arrive from several sources (watcher enumeration, user input,
//! persisted settings) and are compared constantly: the processing set, the
//! exclusion policy, and the self-ingest guard all hinge on two paths meaning
//! the same filesystem location. `path_key` is the canonical comparison form;
//! `is_within` is the only containment test used anywhere in the daemon.

use std::path::{Component, Path, PathBuf};

/// Lexically clean a path: collapse `.`, resolve `..` against prior
/// components, drop redundant separators. No filesystem access.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(seg) => {
                out.push(seg);
                depth += 1;
            }
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Canonical comparison form of a path. Cleaned always; lowercased only where
/// the host filesystem is case-insensitive.
pub fn path_key(path: &Path) -> String {
    let cleaned = clean_path(path);
    let s = cleaned.to_string_lossy().into_owned();
    if cfg!(windows) {
        s.to_lowercase()
    } else {
        s
    }
}

fn key_without_trailing_sep(path: &Path) -> String {
    let key = path_key(path);
    let sep = std::path::MAIN_SEPARATOR;
    if key.len() > 1 && key.ends_with(sep) {
        key.trim_end_matches(sep).to_string()
    } else {
        key
    }
}

/// True iff `path` equals `parent` or lies strictly beneath it. Both sides
/// are cleaned first, so `..` tricks cannot escape the comparison.
pub fn is_within(path: &Path, parent: &Path) -> bool {
    let p = key_without_trailing_sep(path);
    let par = key_without_trailing_sep(parent);
    if p.is_empty() || par.is_empty() {
        return false;
    }
    if p == par {
        return true;
    }
    let sep = std::path::MAIN_SEPARATOR.to_string();
    if par == sep {
        return p.starts_with(&sep);
    }
    p.starts_with(&format!("{par}{sep}"))
}

/// Drop blanks and relative paths, clean, dedupe by path-key, sort.
pub fn normalize_absolute_paths<I, S>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::BTreeMap::new();
    for raw in paths {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        let p = Path::new(trimmed);
        if !p.is_absolute() {
            continue;
        }
        let cleaned = clean_path(p);
        seen.insert(path_key(&cleaned), cleaned.to_string_lossy().into_owned());
    }
    let mut out: Vec<String> = seen.into_values().collect();
    out.sort();
    out
}

/// Parse a persisted path list. Primary format is a JSON array; older
/// settings rows used newline/comma separated text, accepted one-way.
pub fn parse_path_list(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if raw.starts_with('[') && raw.ends_with(']') {
        if let Ok(arr) = serde_json::from_str::<Vec<String>>(raw) {
            return normalize_absolute_paths(arr);
        }
    }
    let parts = raw.split(|c| c == '\n' || c == '\r' || c == ',');
    normalize_absolute_paths(parts)
}

/// Encode a path list as a JSON array of normalized absolute paths.
pub fn encode_path_list<I, S>(paths: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let norm = normalize_absolute_paths(paths);
    serde_json::to_string(&norm).unwrap_or_else(|_| "[]".to_string())
}
