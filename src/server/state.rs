//! Shared state handed to every request handler.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::backup::BackupManager;
use crate::ingest::IngestManager;
use crate::store::VaultStore;
use crate::usb::MountWatcher;

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<dyn VaultStore>,
    pub audit: Arc<AuditLogger>,
    pub ingestor: Arc<IngestManager>,
    pub backuper: Arc<BackupManager>,
    pub watcher: Arc<MountWatcher>,
    pub cancel: CancellationToken,
    pub web_dir: PathBuf,
    pub session_ttl_hours: i64,
}
