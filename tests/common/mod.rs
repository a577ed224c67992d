//! Shared harness for the end-to-end tests: a fully wired router over temp
//! directories, a canned geocode transport, and a minimal TIFF writer so
//! EXIF-bearing fixtures can be generated without binary blobs in the repo.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use usbvault_server::audit::AuditLogger;
use usbvault_server::backup::BackupManager;
use usbvault_server::config::FixedMountRoots;
use usbvault_server::geocode::{GeocodeError, GeocodeTransport, ReverseGeocoder};
use usbvault_server::ingest::IngestManager;
use usbvault_server::server::{build_router, ServerState};
use usbvault_server::store::{SqliteVaultStore, VaultStore};
use usbvault_server::usb::MountWatcher;

pub struct CountingTransport {
    pub calls: AtomicUsize,
}

#[async_trait]
impl GeocodeTransport for CountingTransport {
    async fn get_json(&self, _url: &str, _user_agent: &str) -> Result<(u16, String), GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((
            200,
            serde_json::json!({
                "display_name": "Colfax Avenue, Denver, Colorado, United States",
                "address": {
                    "country": "United States",
                    "state": "Colorado",
                    "county": "Denver County",
                    "city": "Denver",
                    "road": "Colfax Avenue",
                    "postcode": "80202",
                }
            })
            .to_string(),
        ))
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<SqliteVaultStore>,
    pub transport: Arc<CountingTransport>,
    pub base: PathBuf,
    pub mount: PathBuf,
    _root: tempfile::TempDir,
}

impl TestApp {
    pub fn spawn(geocode_enabled: bool) -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("library");
        let mount = root.path().join("mount");
        std::fs::create_dir_all(&mount).unwrap();

        let store = Arc::new(SqliteVaultStore::in_memory().unwrap());
        let store_dyn: Arc<dyn VaultStore> = store.clone();
        let audit = Arc::new(AuditLogger::new(store_dyn.clone()));
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
        });
        let geocoder = Arc::new(ReverseGeocoder::new(
            store_dyn.clone(),
            transport.clone(),
            geocode_enabled,
            "usbvault-tests".to_string(),
        ));
        let ingestor = IngestManager::new(store_dyn.clone(), audit.clone(), geocoder);
        let backuper = BackupManager::new(store_dyn.clone(), root.path().join("vault.db"));
        let watcher = MountWatcher::new(
            Arc::new(FixedMountRoots(vec![root.path().join("mounts-root")])),
            std::time::Duration::from_secs(3600),
            Arc::new(|_: &Path| {}),
        );

        let cancel = CancellationToken::new();
        let state = ServerState {
            store: store_dyn,
            audit,
            ingestor,
            backuper,
            watcher,
            cancel: cancel.clone(),
            web_dir: root.path().join("web"),
            session_ttl_hours: 12,
        };
        let router = build_router(state);
        Self {
            router,
            store,
            transport,
            base,
            mount,
            _root: root,
        }
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        cookie: Option<&str>,
    ) -> (StatusCode, HashMap<String, String>, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, json)
    }

    /// Run first-time setup and return the session cookie pair.
    pub async fn setup(&self) -> String {
        let (status, headers, _) = self
            .request(
                "POST",
                "/api/setup",
                Some(serde_json::json!({
                    "username": "operator",
                    "password": "a long enough password",
                    "base_storage_dir": self.base.display().to_string(),
                })),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "setup failed");
        session_cookie(&headers)
    }

    pub async fn rescan(&self, cookie: &str) -> Value {
        let (status, _, body) = self
            .request(
                "POST",
                "/api/rescan",
                Some(serde_json::json!({"mount_path": self.mount.display().to_string()})),
                Some(cookie),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "rescan failed: {body}");
        body["result"].clone()
    }

    pub fn library_files(&self) -> Vec<PathBuf> {
        if !self.base.exists() {
            return Vec::new();
        }
        walkdir::WalkDir::new(&self.base)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }
}

pub fn session_cookie(headers: &HashMap<String, String>) -> String {
    let set_cookie = headers
        .get("set-cookie")
        .expect("set-cookie header missing");
    set_cookie
        .split(';')
        .next()
        .expect("cookie pair")
        .to_string()
}

// --- Minimal little-endian TIFF writer -------------------------------------

const TYPE_ASCII: u16 = 2;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

struct IfdEntry {
    tag: u16,
    typ: u16,
    count: u32,
    data: Vec<u8>,
}

fn ascii_entry(tag: u16, value: &str) -> IfdEntry {
    let mut data = value.as_bytes().to_vec();
    data.push(0);
    IfdEntry {
        tag,
        typ: TYPE_ASCII,
        count: data.len() as u32,
        data,
    }
}

fn rational_triplet_entry(tag: u16, value: f64) -> IfdEntry {
    let value = value.abs();
    let degrees = value.trunc();
    let minutes_f = (value - degrees) * 60.0;
    let minutes = minutes_f.trunc();
    let seconds = (minutes_f - minutes) * 60.0;

    let mut data = Vec::with_capacity(24);
    for (num, den) in [
        (degrees as u32, 1u32),
        (minutes as u32, 1u32),
        ((seconds * 10_000.0).round() as u32, 10_000u32),
    ] {
        data.extend_from_slice(&num.to_le_bytes());
        data.extend_from_slice(&den.to_le_bytes());
    }
    IfdEntry {
        tag,
        typ: TYPE_RATIONAL,
        count: 3,
        data,
    }
}

fn ifd_len(entries: &[IfdEntry]) -> usize {
    2 + entries.len() * 12 + 4
}

fn serialize_ifd(
    out: &mut Vec<u8>,
    entries: &[IfdEntry],
    data_area: &mut Vec<u8>,
    data_base: u32,
) {
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.typ.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());
        if entry.data.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..entry.data.len()].copy_from_slice(&entry.data);
            out.extend_from_slice(&inline);
        } else {
            let offset = data_base + data_area.len() as u32;
            out.extend_from_slice(&offset.to_le_bytes());
            data_area.extend_from_slice(&entry.data);
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes()); // no next IFD
}

/// Write a tiny TIFF carrying EXIF DateTime, Make/Model, and optionally a
/// GPS IFD, followed by `padding` bytes of filler to control size/hashes.
pub fn write_tiff_with_exif(
    path: &Path,
    datetime: &str,
    gps: Option<(f64, f64)>,
    make: &str,
    model: &str,
    padding: &[u8],
) {
    let mut ifd0 = vec![
        ascii_entry(0x010F, make),
        ascii_entry(0x0110, model),
        ascii_entry(0x0132, datetime),
    ];

    let gps_entries = gps.map(|(lat, lon)| {
        vec![
            ascii_entry(0x0001, if lat < 0.0 { "S" } else { "N" }),
            rational_triplet_entry(0x0002, lat),
            ascii_entry(0x0003, if lon < 0.0 { "W" } else { "E" }),
            rational_triplet_entry(0x0004, lon),
        ]
    });

    let ifd0_offset = 8u32;
    let mut data_base = ifd0_offset + ifd_len(&ifd0) as u32;
    if let Some(gps_entries) = &gps_entries {
        // GPS IFD pointer entry joins IFD0 before layout is final.
        ifd0.push(IfdEntry {
            tag: 0x8825,
            typ: TYPE_LONG,
            count: 1,
            data: Vec::new(), // placeholder, patched below
        });
        data_base = ifd0_offset + (ifd_len(&ifd0) + ifd_len(gps_entries)) as u32;
        let gps_offset = ifd0_offset + ifd_len(&ifd0) as u32;
        ifd0.last_mut().unwrap().data = gps_offset.to_le_bytes().to_vec();
    }
    ifd0.sort_by_key(|e| e.tag);

    let mut out = Vec::new();
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&ifd0_offset.to_le_bytes());

    let mut data_area = Vec::new();
    serialize_ifd(&mut out, &ifd0, &mut data_area, data_base);
    if let Some(gps_entries) = &gps_entries {
        serialize_ifd(&mut out, gps_entries, &mut data_area, data_base);
    }
    out.extend_from_slice(&data_area);
    out.extend_from_slice(padding);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, out).unwrap();
}
