//! Copying files into and out of container filesystems
//!
//! A stopped container has no mounted rootfs, so its snapshot and volumes
//! are mounted for the duration of the operation and unmounted again when
//! the operation (or the returned stream) is dropped.

use super::manager::ContainerManager;
use super::meta::{ContainerMeta, FsLease};
use crate::error::{HullError, Result};
use crate::runtime::syscall;
use crate::storage::rootfs::{mount_rootfs, scoped_join, scoped_join_leaf, Mounter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// `stat` of a path inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStat {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    /// Target of a symlink, empty otherwise
    pub link_target: String,
}

impl PathStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

/// Mounts made for one operation, unmounted in reverse order on drop
struct TempMounts {
    mounter: Arc<dyn Mounter>,
    targets: Vec<PathBuf>,
    // Released after the targets are unmounted
    _lease: Option<FsLease>,
}

impl Drop for TempMounts {
    fn drop(&mut self) {
        for target in self.targets.drain(..).rev() {
            if let Err(e) = self.mounter.unmount(&target) {
                warn!(target = %target.display(), "failed to unmount: {}", e);
            }
        }
    }
}

/// Tar stream of a container path.
///
/// The archive is produced on a separate thread while the caller reads.
/// Dropping the stream stops the producer and releases any mounts.
pub struct ArchiveStream {
    reader: Option<File>,
    writer: Option<JoinHandle<io::Result<()>>>,
    _mounts: TempMounts,
}

impl ArchiveStream {
    /// Close the stream and report whether the archive was written fully
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.reader.take();
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        match writer.join() {
            Ok(Ok(())) => Ok(()),
            // Reader went away first
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HullError::Internal("archive writer panicked".into())),
        }
    }
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("archive stream failed: {}", e);
        }
    }
}

fn check_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(HullError::InvalidParam(format!(
            "path {} must be absolute",
            path
        )));
    }
    Ok(())
}

/// Host location of `path`. Volumes of a live container are resolved to
/// their sources; otherwise everything is under the temporarily mounted
/// rootfs, volumes included. Unless `follow` is set, a symlink at `path`
/// itself is not resolved.
fn host_path(meta: &ContainerMeta, path: &str, follow: bool) -> Result<PathBuf> {
    let join: fn(&Path, &str) -> Result<PathBuf> = if follow {
        scoped_join
    } else {
        scoped_join_leaf
    };
    if meta.state.is_alive() {
        if let Some(mount) = meta.mount_for(path) {
            let rel = path
                .strip_prefix(mount.destination.trim_end_matches('/'))
                .unwrap_or("");
            return join(&mount.source, rel);
        }
    }
    join(&meta.base_fs, path)
}

fn path_stat(host: &Path, path: &str) -> Result<PathStat> {
    let metadata = std::fs::symlink_metadata(host).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => HullError::NotFound {
            kind: "path",
            id: path.to_string(),
        },
        _ => e.into(),
    })?;
    let link_target = if metadata.file_type().is_symlink() {
        std::fs::read_link(host)?.to_string_lossy().into_owned()
    } else {
        String::new()
    };
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());

    Ok(PathStat {
        name,
        size: metadata.len(),
        mode: metadata.mode(),
        mtime: DateTime::from_timestamp(metadata.mtime(), metadata.mtime_nsec() as u32)
            .unwrap_or_default(),
        link_target,
    })
}

fn write_tar(out: File, host: &Path, name: &str) -> io::Result<()> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    if std::fs::symlink_metadata(host)?.is_dir() {
        builder.append_dir_all(name, host)?;
    } else {
        builder.append_path_with_name(host, name)?;
    }
    builder.into_inner()?;
    Ok(())
}

impl ContainerManager {
    async fn temp_mount(&self, meta: &ContainerMeta) -> Result<TempMounts> {
        let mut mounts = TempMounts {
            mounter: self.mounter.clone(),
            targets: Vec::new(),
            _lease: None,
        };
        if meta.state.is_alive() {
            return Ok(mounts);
        }
        mounts._lease = Some(meta.fs_leases.acquire());

        mount_rootfs(
            self.runtime.as_ref(),
            self.mounter.as_ref(),
            &meta.snapshot_id,
            &meta.base_fs,
        )
        .await?;
        mounts.targets.push(meta.base_fs.clone());

        for mount in &meta.mounts {
            let target = scoped_join(&meta.base_fs, &mount.destination)?;
            if mount.source.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if !target.exists() {
                    File::create(&target)?;
                }
            }
            self.mounter.bind(&mount.source, &target, !mount.rw)?;
            mounts.targets.push(target);
        }
        debug!(container = %meta.id, mounts = mounts.targets.len(), "mounted container filesystem");
        Ok(mounts)
    }

    pub async fn stat_path(&self, id: &str, path: &str) -> Result<PathStat> {
        check_path(path)?;
        let container = self.registry.get(id)?;
        let meta = container.lock().await;
        let _mounts = self.temp_mount(&meta).await?;
        path_stat(&host_path(&meta, path, false)?, path)
    }

    /// Tar archive of `path` along with its stat
    pub async fn archive_path(&self, id: &str, path: &str) -> Result<(PathStat, ArchiveStream)> {
        check_path(path)?;
        let container = self.registry.get(id)?;
        let meta = container.lock().await;
        let mounts = self.temp_mount(&meta).await?;

        let host = host_path(&meta, path, false)?;
        let stat = path_stat(&host, path)?;
        let name = if stat.name == "/" {
            ".".to_string()
        } else {
            stat.name.clone()
        };
        let (reader, writer) = syscall::pipe()?;
        let handle = std::thread::spawn(move || write_tar(writer, &host, &name));

        self.events
            .publish(self.event("archive-path", &meta).attr("path", path));
        Ok((
            stat,
            ArchiveStream {
                reader: Some(reader),
                writer: Some(handle),
                _mounts: mounts,
            },
        ))
    }

    /// Unpack a tar stream into the directory `path`
    pub async fn extract_to_dir(
        &self,
        id: &str,
        path: &str,
        content: Box<dyn Read + Send>,
    ) -> Result<()> {
        check_path(path)?;
        let container = self.registry.get(id)?;
        let meta = container.lock().await;
        if meta.host_config.readonly_rootfs {
            return Err(HullError::InvalidParam(format!(
                "container {} has a read-only rootfs",
                meta.id
            )));
        }
        let _mounts = self.temp_mount(&meta).await?;

        let dest = host_path(&meta, path, true)?;
        if !path_stat(&dest, path)?.is_dir() {
            return Err(HullError::InvalidParam(format!(
                "extraction point {} is not a directory",
                path
            )));
        }

        tokio::task::spawn_blocking(move || {
            let mut archive = tar::Archive::new(content);
            archive.set_preserve_permissions(true);
            archive.unpack(&dest)
        })
        .await
        .map_err(|e| HullError::Internal(format!("extract task failed: {}", e)))??;

        self.events
            .publish(self.event("extract-to-dir", &meta).attr("path", path));
        Ok(())
    }
}
