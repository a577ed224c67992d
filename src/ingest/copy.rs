//! Atomic library writes.
//!
//! Data lands in `<dst>.part` (created exclusively, mode 0640), is fsynced,
//! and only then renamed over the final name. A crash at any point leaves
//! either nothing or a `.part` file the next run ignores — never a truncated
//! artifact under the final name. After the rename the file gets the source
//! mtime and is locked down to 0440.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("copy cancelled")]
    Cancelled,
    #[error("open source: {0}")]
    OpenSource(io::Error),
    #[error("create {path}: {source}")]
    CreatePart { path: String, source: io::Error },
    #[error("write: {0}")]
    Write(io::Error),
    #[error("read: {0}")]
    Read(io::Error),
    #[error("sync: {0}")]
    Sync(io::Error),
    #[error("rename into place: {0}")]
    Rename(io::Error),
}

fn part_path(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_part(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), %err, "failed to remove partial file");
        }
    }
}

/// Copy `src` to `dst` atomically, reporting written bytes to `on_progress`.
pub async fn copy_file_atomic<F>(
    src: &Path,
    dst: &Path,
    src_mtime: SystemTime,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<(), CopyError>
where
    F: FnMut(u64),
{
    let tmp = part_path(dst);

    let mut source = tokio::fs::File::open(src)
        .await
        .map_err(CopyError::OpenSource)?;

    let open_part = || async {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o640);
        options.open(&tmp).await
    };
    let mut part = match open_part().await {
        Ok(part) => part,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            // A leftover from a run that died between write and rename.
            // This daemon is the only writer under the library root, so the
            // stale part file is ours to reclaim.
            debug!(path = %tmp.display(), "reclaiming stale partial file");
            remove_part(&tmp).await;
            open_part().await.map_err(|source| CopyError::CreatePart {
                path: tmp.display().to_string(),
                source,
            })?
        }
        Err(source) => {
            return Err(CopyError::CreatePart {
                path: tmp.display().to_string(),
                source,
            })
        }
    };

    let result: Result<(), CopyError> = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            let n = source.read(&mut buf).await.map_err(CopyError::Read)?;
            if n == 0 {
                break;
            }
            part.write_all(&buf[..n]).await.map_err(CopyError::Write)?;
            on_progress(n as u64);
        }
        part.sync_all().await.map_err(CopyError::Sync)?;
        Ok(())
    }
    .await;

    drop(part);
    if let Err(err) = result {
        remove_part(&tmp).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp, dst).await {
        // EXDEV would mean the part file and the final name ended up on
        // different filesystems; fall back to a plain copy of the synced
        // part file.
        if err.raw_os_error() == Some(EXDEV) {
            if let Err(copy_err) = fallback_copy(&tmp, dst).await {
                remove_part(&tmp).await;
                return Err(copy_err);
            }
            remove_part(&tmp).await;
        } else {
            remove_part(&tmp).await;
            return Err(CopyError::Rename(err));
        }
    }

    finalize_permissions(dst, src_mtime);
    Ok(())
}

/// Cross-device link errno on Linux and macOS.
const EXDEV: i32 = 18;

async fn fallback_copy(tmp: &Path, dst: &Path) -> Result<(), CopyError> {
    tokio::fs::copy(tmp, dst).await.map_err(CopyError::Write)?;
    let file = tokio::fs::File::open(dst).await.map_err(CopyError::Write)?;
    file.sync_all().await.map_err(CopyError::Sync)?;
    Ok(())
}

/// Best effort: mirror the source mtime and make the artifact read-only.
fn finalize_permissions(dst: &Path, src_mtime: SystemTime) {
    if let Ok(file) = std::fs::OpenOptions::new().write(true).open(dst) {
        let times = std::fs::FileTimes::new()
            .set_accessed(src_mtime)
            .set_modified(src_mtime);
        let _ = file.set_times(times);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dst, std::fs::Permissions::from_mode(0o440));
    }
}
