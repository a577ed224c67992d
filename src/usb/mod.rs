//! Removable volume detection.
//!
//! No platform notification APIs: the watcher polls the mount roots on an
//! interval and diffs against what it has already seen. A mount appearing
//! fires `on_new` exactly once; a mount that goes away is forgotten so
//! replugging it fires again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::pathpolicy::path_key;
use crate::config::MountRootSource;

pub type MountCallback = Arc<dyn Fn(&Path) + Send + Sync>;

pub struct MountWatcher {
    roots: Arc<dyn MountRootSource>,
    interval: Duration,
    on_new: MountCallback,
    seen: Mutex<HashMap<String, Instant>>,
    current: Mutex<Vec<PathBuf>>,
}

fn should_skip_mount_name(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    let lower = name.to_lowercase();
    lower == "macintosh hd" || lower.starts_with('.') || lower.contains("snapshot")
}

fn is_system_drive(path: &Path) -> bool {
    cfg!(windows) && path_key(path).starts_with("c:")
}

impl MountWatcher {
    pub fn new(
        roots: Arc<dyn MountRootSource>,
        interval: Duration,
        on_new: MountCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            roots,
            interval,
            on_new,
            seen: Mutex::new(HashMap::new()),
            current: Mutex::new(Vec::new()),
        })
    }

    /// Latest enumeration, for the mount-policy endpoint.
    pub fn current_mounts(&self) -> Vec<PathBuf> {
        self.current.lock().unwrap().clone()
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.tick();
            let mut ticker = tokio::time::interval(watcher.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // First tick fires immediately; already done.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => watcher.tick(),
                }
            }
        });
    }

    fn tick(&self) {
        let mounts = self.discover_mounts();
        *self.current.lock().unwrap() = mounts.clone();

        let mut seen = self.seen.lock().unwrap();
        let mut present = std::collections::HashSet::new();
        let mut fresh = Vec::new();
        for mount in &mounts {
            let key = path_key(mount);
            present.insert(key.clone());
            if !seen.contains_key(&key) {
                seen.insert(key, Instant::now());
                fresh.push(mount.clone());
            }
        }
        seen.retain(|key, _| present.contains(key));
        drop(seen);

        for mount in fresh {
            info!(mount = %mount.display(), "new removable volume detected");
            (self.on_new)(&mount);
        }
    }

    fn discover_mounts(&self) -> Vec<PathBuf> {
        if cfg!(windows) {
            return self
                .roots
                .roots()
                .into_iter()
                .filter(|drive| !is_system_drive(drive))
                .filter(|drive| drive.is_dir())
                .collect();
        }

        let mut mounts = Vec::new();
        for root in self.roots.roots() {
            let Ok(entries) = std::fs::read_dir(&root) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if !file_type.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if should_skip_mount_name(&name) {
                    continue;
                }
                mounts.push(root.join(name));
            }
        }
        mounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixedMountRoots;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn watcher_over(
        root: &Path,
        events: Arc<Mutex<Vec<PathBuf>>>,
    ) -> Arc<MountWatcher> {
        let roots = Arc::new(FixedMountRoots(vec![root.to_path_buf()]));
        MountWatcher::new(
            roots,
            Duration::from_secs(3600),
            Arc::new(move |mount: &Path| {
                events.lock().unwrap().push(mount.to_path_buf());
            }),
        )
    }

    #[test]
    fn new_mount_fires_once_and_reappears_after_removal() {
        let root = tempfile::tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let watcher = watcher_over(root.path(), events.clone());

        watcher.tick();
        assert!(events.lock().unwrap().is_empty());

        let usb = root.path().join("USB0");
        std::fs::create_dir(&usb).unwrap();
        watcher.tick();
        watcher.tick();
        assert_eq!(events.lock().unwrap().as_slice(), &[usb.clone()]);
        assert_eq!(watcher.current_mounts(), vec![usb.clone()]);

        // Unplug, then replug: fires again.
        std::fs::remove_dir(&usb).unwrap();
        watcher.tick();
        assert!(watcher.current_mounts().is_empty());
        std::fs::create_dir(&usb).unwrap();
        watcher.tick();
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn hidden_and_snapshot_names_are_filtered() {
        let root = tempfile::tempdir().unwrap();
        for name in [".hidden", "a-snapshot-vol", "Macintosh HD"] {
            std::fs::create_dir(root.path().join(name)).unwrap();
        }
        std::fs::create_dir(root.path().join("CARD")).unwrap();
        std::fs::write(root.path().join("file-not-dir"), b"x").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let watcher = watcher_over(root.path(), events.clone());
        watcher.tick();

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[root.path().join("CARD")]
        );
    }

    #[test]
    fn unreadable_roots_are_skipped() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let watcher = watcher_over(Path::new("/nonexistent-root-for-test"), events.clone());
        watcher.tick();
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn started_watcher_polls_and_honors_cancellation() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("USB0")).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let roots = Arc::new(FixedMountRoots(vec![root.path().to_path_buf()]));
        let watcher = MountWatcher::new(
            roots,
            Duration::from_millis(50),
            Arc::new(move |_: &Path| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let cancel = CancellationToken::new();
        watcher.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }
}
