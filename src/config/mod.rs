//! Runtime configuration and media support policy.
//!
//! Everything the daemon reads from its environment lives here: the CLI/env
//! settings, the extension tables deciding which files count as media, and
//! the platform mount roots the watcher polls.

pub mod pathpolicy;

use std::path::{Path, PathBuf};

use clap::Parser;

pub const DEFAULT_PORT: u16 = 4987;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;
pub const MIN_SCAN_INTERVAL_SECS: u64 = 2;
pub const SESSION_TTL_HOURS: i64 = 12;

pub const BASE_STORAGE_SETTING: &str = "base_storage_dir";
pub const STORAGE_LAYOUT_SETTING: &str = "storage_layout";
pub const EXCLUDED_MOUNTS_SETTING: &str = "excluded_mounts";
pub const CLOUD_SYNC_SETTING: &str = "cloud_sync_config";

/// Media kind as classified by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".jpe", ".png", ".tif", ".tiff", ".bmp", ".webp", ".gif", ".heic", ".heif",
    ".dng", ".arw", ".cr2", ".cr3", ".nef", ".orf", ".raf", ".rw2", ".srw", ".x3f", ".3fr",
    ".iiq", ".pef", ".hdr", ".exr", ".jp2",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mov", ".m4v", ".ts", ".m2ts", ".mts", ".mpeg", ".mpg", ".avi", ".mkv", ".mxf",
    ".wmv", ".webm", ".lrv", ".insv", ".flv", ".3gp",
];

/// Lowercased extension of `path`, including the leading dot.
pub fn lower_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!(".{}", ext.to_lowercase()),
        None => String::new(),
    }
}

/// Classify a path by extension. Content is never sniffed.
pub fn supported_media_kind(path: &Path) -> Option<MediaKind> {
    let ext = lower_extension(path);
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return Some(MediaKind::Image);
    }
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        return Some(MediaKind::Video);
    }
    None
}

/// Source of candidate mount roots, injected so tests can point the watcher
/// at scratch directories.
pub trait MountRootSource: Send + Sync {
    fn roots(&self) -> Vec<PathBuf>;
}

/// Mount roots of the host platform.
pub struct PlatformMountRoots;

impl MountRootSource for PlatformMountRoots {
    fn roots(&self) -> Vec<PathBuf> {
        if cfg!(target_os = "macos") {
            vec![PathBuf::from("/Volumes")]
        } else if cfg!(windows) {
            ('A'..='Z').map(|c| PathBuf::from(format!("{c}:\\"))).collect()
        } else {
            ["/media", "/run/media", "/mnt", "/Volumes"]
                .iter()
                .map(PathBuf::from)
                .collect()
        }
    }
}

/// Fixed roots, used by tests and the rescan endpoint plumbing.
pub struct FixedMountRoots(pub Vec<PathBuf>);

impl MountRootSource for FixedMountRoots {
    fn roots(&self) -> Vec<PathBuf> {
        self.0.clone()
    }
}

fn parse_scan_interval(raw: &str) -> Result<u64, String> {
    let secs: u64 = raw.parse().map_err(|_| format!("invalid interval: {raw}"))?;
    if secs < MIN_SCAN_INTERVAL_SECS {
        return Err(format!(
            "scan interval must be at least {MIN_SCAN_INTERVAL_SECS} seconds"
        ));
    }
    Ok(secs)
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "usbvault-server", about = "Local-first media vault daemon")]
pub struct Config {
    /// Port the HTTP API listens on.
    #[clap(long, env = "USBVAULT_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Bind address for the HTTP API.
    #[clap(long, env = "USBVAULT_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    /// Directory holding the SQLite database.
    #[clap(long, env = "USBVAULT_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory of static web assets.
    #[clap(long, env = "USBVAULT_WEB_DIR", default_value = "web")]
    pub web_dir: PathBuf,

    /// Seconds between mount-root polls (minimum 2).
    #[clap(
        long,
        env = "USBVAULT_SCAN_INTERVAL_SECONDS",
        default_value_t = DEFAULT_SCAN_INTERVAL_SECS,
        value_parser = parse_scan_interval
    )]
    pub scan_interval_seconds: u64,

    /// Enable the reverse geocoder ("1", "true", "yes", "on" or their
    /// negations; defaults to enabled).
    #[clap(long, env = "USBVAULT_REVERSE_GEOCODE", default_value = "true")]
    pub reverse_geocode: String,

    /// User-Agent sent to the geocode provider.
    #[clap(
        long,
        env = "USBVAULT_GEOCODE_UA",
        default_value = "USBVault/0.2 (local reverse geocoder)"
    )]
    pub geocode_user_agent: String,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("usbvault.db")
    }

    pub fn geocode_enabled(&self) -> bool {
        is_truthy(&self.reverse_geocode)
    }
}

pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | ""
    )
}
