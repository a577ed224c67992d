//! Library export.
//!
//! One backup runs at a time. Archive modes (`ssh`, `s3`, `api`) stream a
//! tar.gz of the library, the SQLite files, and a manifest straight into the
//! transport without staging it on disk; `rsync` mode hands the trees to the
//! host rsync binary. Progress is published as a status snapshot the HTTP
//! layer polls.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::BASE_STORAGE_SETTING;
use crate::store::VaultStore;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup already running")]
    Busy,
    #[error("invalid backup request: {0}")]
    InvalidRequest(String),
    #[error("base storage is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Ssh,
    Rsync,
    S3,
    Api,
}

impl BackupMode {
    fn parse(raw: &str) -> Result<Self, BackupError> {
        match raw.trim().to_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "rsync" => Ok(Self::Rsync),
            "s3" => Ok(Self::S3),
            "api" => Ok(Self::Api),
            other => Err(BackupError::InvalidRequest(format!(
                "mode must be ssh, rsync, s3, or api (got {other:?})"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupRequest {
    pub mode: String,
    pub destination: String,
    #[serde(default)]
    pub ssh_port: u16,
    #[serde(default)]
    pub api_method: String,
    #[serde(default)]
    pub api_token: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStatus {
    /// idle, running, success, or error.
    pub state: String,
    pub mode: String,
    pub destination: String,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: String,
    pub files: u64,
    pub bytes: u64,
    pub current_path: String,
    pub message: String,
}

pub struct BackupManager {
    store: Arc<dyn VaultStore>,
    db_path: PathBuf,
    status: Mutex<BackupStatus>,
}

fn now_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl BackupManager {
    pub fn new(store: Arc<dyn VaultStore>, db_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            store,
            db_path,
            status: Mutex::new(BackupStatus {
                state: "idle".to_string(),
                message: "No backup running.".to_string(),
                ..Default::default()
            }),
        })
    }

    pub fn get_status(&self) -> BackupStatus {
        self.status.lock().unwrap().clone()
    }

    /// Validate and launch a backup; refuses while one is already running.
    pub fn start(self: &Arc<Self>, actor: &str, req: BackupRequest) -> Result<(), BackupError> {
        let mode = BackupMode::parse(&req.mode)?;
        let destination = req.destination.trim().to_string();
        if destination.is_empty() {
            return Err(BackupError::InvalidRequest(
                "destination is required".to_string(),
            ));
        }
        let api_method = {
            let m = req.api_method.trim().to_uppercase();
            if m.is_empty() {
                "PUT".to_string()
            } else {
                m
            }
        };
        if mode == BackupMode::Api && api_method != "PUT" && api_method != "POST" {
            return Err(BackupError::InvalidRequest(
                "api_method must be PUT or POST".to_string(),
            ));
        }

        {
            let mut status = self.status.lock().unwrap();
            if status.state == "running" {
                return Err(BackupError::Busy);
            }
            let now = now_nanos();
            *status = BackupStatus {
                state: "running".to_string(),
                mode: req.mode.trim().to_lowercase(),
                destination: destination.clone(),
                started_at: now.clone(),
                updated_at: now,
                message: "Backup started...".to_string(),
                ..Default::default()
            };
        }

        let manager = Arc::clone(self);
        let actor = actor.to_string();
        let req = BackupRequest {
            destination,
            api_method,
            ..req
        };
        tokio::spawn(async move {
            match manager.run(mode, &req).await {
                Ok(()) => {
                    let mut status = manager.status.lock().unwrap();
                    let now = now_nanos();
                    status.state = "success".to_string();
                    status.updated_at = now.clone();
                    status.finished_at = now;
                    status.message = format!("Backup completed by {actor}.");
                }
                Err(err) => manager.fail(&err),
            }
        });
        Ok(())
    }

    fn fail(&self, message: &str) {
        warn!(message, "backup failed");
        let mut status = self.status.lock().unwrap();
        let now = now_nanos();
        status.state = "error".to_string();
        status.updated_at = now.clone();
        status.finished_at = now;
        status.message = message.to_string();
    }

    fn bump_progress(&self, path: &Path, size: u64) {
        let mut status = self.status.lock().unwrap();
        status.files += 1;
        status.bytes += size;
        status.current_path = path.display().to_string();
        status.updated_at = now_nanos();
    }

    fn db_files(&self) -> Vec<PathBuf> {
        let base = self.db_path.clone();
        let wal = PathBuf::from(format!("{}-wal", base.display()));
        let shm = PathBuf::from(format!("{}-shm", base.display()));
        [base, wal, shm]
            .into_iter()
            .filter(|p| p.is_file())
            .collect()
    }

    async fn run(self: &Arc<Self>, mode: BackupMode, req: &BackupRequest) -> Result<(), String> {
        let base_storage = self
            .store
            .get_setting(BASE_STORAGE_SETTING)
            .map_err(|e| format!("database error: {e}"))?
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BackupError::NotConfigured.to_string())?;
        let base_storage = PathBuf::from(base_storage.trim());

        match mode {
            BackupMode::Rsync => self.run_rsync(&base_storage, &req.destination).await,
            _ => self.run_archive_transfer(mode, &base_storage, req).await,
        }
    }

    /// Produce the tar.gz on a blocking thread writing into an OS pipe while
    /// the transport consumes the read end.
    async fn run_archive_transfer(
        self: &Arc<Self>,
        mode: BackupMode,
        base_storage: &Path,
        req: &BackupRequest,
    ) -> Result<(), String> {
        let (reader, writer) = std::io::pipe().map_err(|e| format!("pipe: {e}"))?;

        let manager = Arc::clone(self);
        let base = base_storage.to_path_buf();
        let db_files = self.db_files();
        let producer = tokio::task::spawn_blocking(move || {
            manager.write_targz_archive(writer, &base, &db_files)
        });

        let transfer = match mode {
            BackupMode::Ssh => self.send_via_ssh(reader, &req.destination, req.ssh_port).await,
            BackupMode::S3 => self.send_via_s3(reader, &req.destination).await,
            BackupMode::Api => {
                self.send_via_api(reader, &req.destination, &req.api_method, &req.api_token)
                    .await
            }
            BackupMode::Rsync => unreachable!("rsync handled separately"),
        };

        let archive = producer
            .await
            .map_err(|e| format!("archive task: {e}"))
            .and_then(|r| r);
        transfer?;
        archive
    }

    fn write_targz_archive(
        self: Arc<Self>,
        writer: std::io::PipeWriter,
        base_storage: &Path,
        db_files: &[PathBuf],
    ) -> Result<(), String> {
        let gz = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
        let mut tar = tar::Builder::new(gz);
        tar.follow_symlinks(false);

        let root = format!(
            "usbvault-backup-{}",
            Utc::now().format("%Y%m%d-%H%M%S")
        );

        let manifest = serde_json::json!({
            "created_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "base_storage": base_storage.display().to_string(),
            "db_files": db_files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "archive_format": "tar.gz",
        });
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|e| format!("manifest: {e}"))?;
        append_bytes(&mut tar, &format!("{root}/manifest.json"), &manifest_bytes)?;

        let walker = WalkDir::new(base_storage)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !(e.depth() > 0
                    && e.file_type().is_dir()
                    && e.file_name().to_string_lossy().starts_with('.'))
            });
        for entry in walker {
            let entry = entry.map_err(|e| format!("walk library: {e}"))?;
            if entry.depth() == 0 {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(base_storage)
                .map_err(|e| format!("relativize: {e}"))?;
            let arc_name = format!("{root}/media/{}", rel.to_string_lossy());
            if entry.file_type().is_dir() {
                tar.append_dir(&arc_name, entry.path())
                    .map_err(|e| format!("archive dir: {e}"))?;
            } else if entry.file_type().is_file() {
                tar.append_path_with_name(entry.path(), &arc_name)
                    .map_err(|e| format!("archive {}: {e}", entry.path().display()))?;
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                self.bump_progress(entry.path(), size);
            }
        }

        for db_path in db_files {
            let arc_name = format!(
                "{root}/db/{}",
                db_path.file_name().unwrap_or_default().to_string_lossy()
            );
            tar.append_path_with_name(db_path, &arc_name)
                .map_err(|e| format!("archive db {}: {e}", db_path.display()))?;
            let size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
            self.bump_progress(db_path, size);
        }

        let gz = tar.into_inner().map_err(|e| format!("finish tar: {e}"))?;
        let mut writer = gz.finish().map_err(|e| format!("finish gzip: {e}"))?;
        writer.flush().map_err(|e| format!("flush archive: {e}"))?;
        Ok(())
    }

    async fn send_via_ssh(
        &self,
        reader: std::io::PipeReader,
        destination: &str,
        port: u16,
    ) -> Result<(), String> {
        let (host, remote_path) = split_ssh_destination(destination)?;
        let mut cmd = Command::new("ssh");
        if port > 0 {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(&host)
            .arg("sh")
            .arg("-c")
            .arg(format!("cat > {}", shell_quote(&remote_path)));
        pipe_into_command(cmd, reader, "ssh upload").await
    }

    async fn send_via_s3(
        &self,
        reader: std::io::PipeReader,
        destination: &str,
    ) -> Result<(), String> {
        let mut cmd = Command::new("aws");
        cmd.arg("s3").arg("cp").arg("-").arg(destination);
        pipe_into_command(cmd, reader, "s3 upload (requires aws cli/config)").await
    }

    async fn send_via_api(
        &self,
        mut reader: std::io::PipeReader,
        destination: &str,
        method: &str,
        token: &str,
    ) -> Result<(), String> {
        // Uploads can be huge; no client timeout here. The archive producer
        // finishing (or failing) closes the pipe and ends the body.
        let body = tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut body = Vec::new();
            reader.read_to_end(&mut body).map(|_| body)
        })
        .await
        .map_err(|e| format!("read archive stream: {e}"))?
        .map_err(|e| format!("read archive stream: {e}"))?;

        let client = reqwest::Client::new();
        let mut request = match method {
            "POST" => client.post(destination),
            _ => client.put(destination),
        }
        .header(reqwest::header::CONTENT_TYPE, "application/gzip")
        .body(body);
        if !token.trim().is_empty() {
            request = request.bearer_auth(token.trim());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| format!("api upload failed: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(4096).collect();
            return Err(format!("api upload failed: status {status}: {}", snippet.trim()));
        }
        Ok(())
    }

    async fn run_rsync(&self, base_storage: &Path, destination: &str) -> Result<(), String> {
        let destination = destination.trim();
        {
            let mut status = self.status.lock().unwrap();
            status.message = "Running rsync transfer...".to_string();
            status.updated_at = now_nanos();
        }

        if split_remote_host_path(destination).is_none() {
            std::fs::create_dir_all(destination)
                .map_err(|e| format!("create rsync destination: {e}"))?;
        }

        let media_dest = append_dest(destination, "media");
        let db_dest = append_dest(destination, "db");
        ensure_remote_dir_if_ssh(&media_dest).await?;
        ensure_remote_dir_if_ssh(&db_dest).await?;

        run_command(
            "rsync",
            &[
                "-az",
                "--delete",
                &with_trailing_sep(&base_storage.display().to_string()),
                &with_trailing_sep(&media_dest),
            ],
        )
        .await?;

        for db_path in self.db_files() {
            run_command(
                "rsync",
                &[
                    "-az",
                    &db_path.display().to_string(),
                    &with_trailing_sep(&db_dest),
                ],
            )
            .await?;
        }
        Ok(())
    }
}

async fn pipe_into_command(
    mut cmd: Command,
    reader: std::io::PipeReader,
    what: &str,
) -> Result<(), String> {
    cmd.stdin(Stdio::from(reader))
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| format!("{what} failed to spawn: {e}"))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("{what} failed: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{what} failed: {}: {}", output.status, stderr.trim()));
    }
    info!("{what} finished");
    Ok(())
}

async fn run_command(name: &str, args: &[&str]) -> Result<(), String> {
    let output = Command::new(name)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("{name} failed to spawn: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{name} failed: {}: {}", output.status, stderr.trim()));
    }
    Ok(())
}

fn append_bytes<W: Write>(
    tar: &mut tar::Builder<W>,
    arc_name: &str,
    body: &[u8],
) -> Result<(), String> {
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o640);
    header.set_mtime(Utc::now().timestamp() as u64);
    header.set_cksum();
    tar.append_data(&mut header, arc_name, body)
        .map_err(|e| format!("archive {arc_name}: {e}"))
}

fn split_ssh_destination(destination: &str) -> Result<(String, String), String> {
    split_remote_host_path(destination).ok_or_else(|| {
        "invalid backup request: ssh destination must be user@host:/absolute/path/file.tar.gz"
            .to_string()
    })
}

fn split_remote_host_path(dest: &str) -> Option<(String, String)> {
    if dest.contains("://") {
        return None;
    }
    // A drive-letter path (C:\backup) is local, not host:path.
    let bytes = dest.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && dest.len() >= 3 {
        let third = bytes[2];
        if third == b'\\' || third == b'/' {
            return None;
        }
    }
    let (host, remote) = dest.split_once(':')?;
    let host = host.trim();
    let remote = remote.trim();
    if host.is_empty() || remote.is_empty() {
        return None;
    }
    Some((host.to_string(), remote.to_string()))
}

fn shell_quote(v: &str) -> String {
    format!("'{}'", v.replace('\'', r#"'"'"'"#))
}

fn append_dest(dest: &str, child: &str) -> String {
    let dest = dest.trim();
    match split_remote_host_path(dest) {
        Some((host, remote)) => {
            let remote = remote.trim_end_matches('/');
            if remote.is_empty() {
                format!("{host}:/{child}")
            } else {
                format!("{host}:{remote}/{child}")
            }
        }
        None => Path::new(dest).join(child).display().to_string(),
    }
}

fn with_trailing_sep(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

async fn ensure_remote_dir_if_ssh(dest: &str) -> Result<(), String> {
    let Some((host, remote)) = split_remote_host_path(dest) else {
        return Ok(());
    };
    run_command("ssh", &[&host, "mkdir", "-p", &remote]).await
}
