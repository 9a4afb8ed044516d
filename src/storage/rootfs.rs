//! Container root filesystem preparation
//!
//! The runtime owns the snapshot; this module mounts it at the container's
//! base path and lays out the bits the daemon itself is responsible for:
//! the working directory, `/etc/mtab` and first-use volume seeding.

use crate::container::MountPoint;
use crate::error::{HullError, Result};
use crate::runtime::syscall::{self, mount_flags, umount_flags};
use crate::runtime::{MountDescriptor, RuntimeClient};
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Filesystem type reported when the real one cannot be discovered
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Performs mounts on behalf of the daemon
pub trait Mounter: Send + Sync {
    /// Mount a runtime-provided descriptor at `target`
    fn mount(&self, mount: &MountDescriptor, target: &Path) -> Result<()>;

    /// Bind `source` at `target`
    fn bind(&self, source: &Path, target: &Path, readonly: bool) -> Result<()>;

    /// Unmount `target`; a target that is not mounted is not an error
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// `mount(2)` backed mounter
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount(&self, mount: &MountDescriptor, target: &Path) -> Result<()> {
        let (flags, data) = syscall::parse_mount_options(&mount.options);
        let fstype = match mount.typ.as_str() {
            "bind" | "rbind" => None,
            t => Some(t),
        };
        let flags = if mount.typ == "rbind" {
            flags | mount_flags::MS_BIND | mount_flags::MS_REC
        } else if mount.typ == "bind" {
            flags | mount_flags::MS_BIND
        } else {
            flags
        };
        syscall::mount(&mount.source, target, fstype, flags, Some(data.as_str()))?;
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        let src = source
            .to_str()
            .ok_or_else(|| HullError::InvalidParam(format!("non-utf8 path {}", source.display())))?;
        syscall::mount(src, target, None, mount_flags::MS_BIND | mount_flags::MS_REC, None)?;
        if readonly {
            syscall::mount(
                src,
                target,
                None,
                mount_flags::MS_BIND | mount_flags::MS_REMOUNT | mount_flags::MS_RDONLY,
                None,
            )?;
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match syscall::umount2(target, umount_flags::MNT_DETACH) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Mount the snapshot `key` at `target`
pub async fn mount_rootfs(
    runtime: &dyn RuntimeClient,
    mounter: &dyn Mounter,
    key: &str,
    target: &Path,
) -> Result<()> {
    let mounts = runtime.get_mounts(key).await?;
    let [mount] = mounts.as_slice() else {
        return Err(HullError::Internal(format!(
            "snapshot {} has {} mounts, expected exactly one",
            key,
            mounts.len()
        )));
    };

    fs::create_dir_all(target)?;
    mounter.mount(mount, target)?;
    debug!(snapshot = key, target = %target.display(), "mounted rootfs");
    Ok(())
}

pub fn unmount_rootfs(mounter: &dyn Mounter, target: &Path) -> Result<()> {
    mounter.unmount(target)?;
    debug!(target = %target.display(), "unmounted rootfs");
    Ok(())
}

/// `path` made relative with `.` and `..` applied; `..` at the top stays there
fn clean_relative(path: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Resolve `path` inside `root` as if `root` were `/`.
///
/// Symlinks met on the way are followed but can never lead outside `root`;
/// an absolute link target is taken relative to `root`.
pub fn scoped_join(root: &Path, path: &str) -> Result<PathBuf> {
    Ok(safe_path::scoped_join(root, clean_relative(path))?)
}

/// Like [`scoped_join`], except the last component is not resolved, so a
/// symlink at `path` is addressed itself.
pub fn scoped_join_leaf(root: &Path, path: &str) -> Result<PathBuf> {
    let rel = clean_relative(path);
    match (rel.parent(), rel.file_name()) {
        (Some(parent), Some(name)) => Ok(safe_path::scoped_join(root, parent)?.join(name)),
        _ => Ok(safe_path::scoped_join(root, rel)?),
    }
}

/// Create the working directory inside the rootfs
pub fn setup_working_dir(rootfs: &Path, working_dir: &str) -> Result<()> {
    if working_dir.is_empty() {
        return Ok(());
    }
    if !working_dir.starts_with('/') {
        return Err(HullError::InvalidParam(format!(
            "working dir {} must be an absolute path",
            working_dir
        )));
    }
    let dir = scoped_join(rootfs, working_dir)?;
    match fs::metadata(&dir) {
        Ok(m) if m.is_dir() => Ok(()),
        Ok(_) => Err(HullError::InvalidParam(format!(
            "working dir {} is not a directory",
            working_dir
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// One line of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Parse the contents of a mountinfo file
pub fn parse_mountinfo(contents: &str) -> Vec<MountInfo> {
    contents
        .lines()
        .filter_map(|line| {
            let (pre, post) = line.split_once(" - ")?;
            let mount_point = pre.split_whitespace().nth(4)?;
            let mut post = post.split_whitespace();
            let fs_type = post.next()?;
            let source = post.next().unwrap_or("none");
            Some(MountInfo {
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                fs_type: fs_type.to_string(),
                source: source.to_string(),
            })
        })
        .collect()
}

fn unescape_octal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let code: String = chars.by_ref().take(3).collect();
            match u8::from_str_radix(&code, 8) {
                Ok(b) => out.push(b as char),
                Err(_) => {
                    out.push('\\');
                    out.push_str(&code);
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// The mount holding `path`, by longest mount point prefix
pub fn mount_info_for(mounts: &[MountInfo], path: &Path) -> Option<MountInfo> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.as_os_str().len())
        .cloned()
}

fn host_mounts() -> Vec<MountInfo> {
    fs::read_to_string("/proc/self/mountinfo")
        .map(|c| parse_mountinfo(&c))
        .unwrap_or_default()
}

/// Render the `/etc/mtab` the container sees
pub fn render_mtab(rootfs_type: &str, mounts: &[(String, String)]) -> String {
    let mut out = format!("/dev/root / {} rw 0 0\n", rootfs_type);
    for (dest, fs_type) in mounts {
        out.push_str(&format!("/dev/root {} {} rw 0 0\n", dest, fs_type));
    }
    out
}

/// Write `/etc/mtab` into the rootfs, reflecting each mount source's real filesystem type
pub fn write_mtab(rootfs: &Path, mounts: &[MountPoint]) -> Result<()> {
    let host = host_mounts();
    let fs_type = |p: &Path| {
        mount_info_for(&host, p)
            .map(|m| m.fs_type)
            .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string())
    };

    let entries: Vec<(String, String)> = mounts
        .iter()
        .map(|m| (m.destination.clone(), fs_type(&m.source)))
        .collect();

    let etc = scoped_join(rootfs, "/etc")?;
    fs::create_dir_all(&etc)?;
    let mtab = etc.join("mtab");
    // Images commonly ship mtab as a symlink to /proc/mounts
    if fs::symlink_metadata(&mtab).is_ok() {
        fs::remove_file(&mtab)?;
    }
    fs::write(&mtab, render_mtab(&fs_type(rootfs), &entries))?;
    Ok(())
}

/// Whether a directory has no entries (a missing directory counts as empty)
pub fn dir_is_empty(dir: &Path) -> Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Seed a fresh volume with the image content under its destination.
///
/// Nothing is copied unless the volume directory is empty, so a volume that
/// was populated before is never clobbered. Returns whether data was copied.
pub fn seed_volume(rootfs: &Path, mount: &MountPoint) -> Result<bool> {
    if !mount.copy_data || !mount.is_volume() {
        return Ok(false);
    }
    let image_dir = scoped_join(rootfs, &mount.destination)?;
    if !image_dir.is_dir() || !dir_is_empty(&mount.source)? {
        return Ok(false);
    }

    copy_tree(&image_dir, &mount.source)?;
    info!(volume = %mount.name, destination = %mount.destination, "seeded volume from image");
    Ok(true)
}

/// Copy a directory tree preserving modes and symlinks
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| HullError::Io(io::Error::other(e.to_string())))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| HullError::Internal(e.to_string()))?;
        let dest = to.join(rel);
        let file_type = entry.file_type();
        let meta = entry.metadata().map_err(|e| HullError::Io(io::Error::other(e.to_string())))?;

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&dest).is_ok() {
                fs::remove_file(&dest)?;
            }
            std::os::unix::fs::symlink(link, &dest)?;
            continue;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
        } else {
            warn!(path = %entry.path().display(), "skipping special file");
            continue;
        }
        fs::set_permissions(&dest, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - xfs /dev/sda1 rw,attr2
35 22 0:31 / /var/lib/hull rw,relatime shared:2 - ext4 /dev/sdb1 rw
36 22 0:32 / /mnt/with\\040space rw - tmpfs tmpfs rw
";

    #[test]
    fn test_parse_mountinfo() {
        let mounts = parse_mountinfo(MOUNTINFO);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[2].mount_point, PathBuf::from("/mnt/with space"));

        let m = mount_info_for(&mounts, Path::new("/var/lib/hull/volumes/x")).unwrap();
        assert_eq!(m.fs_type, "ext4");
        let m = mount_info_for(&mounts, Path::new("/etc")).unwrap();
        assert_eq!(m.fs_type, "xfs");
    }

    #[test]
    fn test_render_mtab() {
        let mtab = render_mtab("xfs", &[("/data".to_string(), "ext4".to_string())]);
        assert_eq!(mtab, "/dev/root / xfs rw 0 0\n/dev/root /data ext4 rw 0 0\n");
    }

    #[test]
    fn test_scoped_join() {
        let temp = tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        assert_eq!(scoped_join(&root, "/etc/passwd").unwrap(), root.join("etc/passwd"));
        assert_eq!(scoped_join(&root, "/../../etc").unwrap(), root.join("etc"));
        assert_eq!(scoped_join(&root, "/a/../b").unwrap(), root.join("b"));
        assert_eq!(scoped_join(&root, "/").unwrap(), root);
    }

    #[test]
    fn test_scoped_join_keeps_symlinks_inside_root() {
        let temp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::write(outside.path().join("secret"), b"host").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("evil")).unwrap();
        std::os::unix::fs::symlink("../../..", root.join("up")).unwrap();

        let resolved = scoped_join(&root, "/evil/secret").unwrap();
        assert!(resolved.starts_with(&root));
        assert!(!resolved.exists());
        assert!(scoped_join(&root, "/up/etc").unwrap().starts_with(&root));

        // The link itself, not its target
        assert_eq!(scoped_join_leaf(&root, "/evil").unwrap(), root.join("evil"));
        let leaf = scoped_join_leaf(&root, "/evil/secret").unwrap();
        assert!(leaf.starts_with(&root));
        assert!(!leaf.exists());
    }

    #[test]
    fn test_write_mtab_does_not_follow_etc_out_of_rootfs() {
        let temp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("etc")).unwrap();

        write_mtab(temp.path(), &[]).unwrap();
        assert!(!outside.path().join("mtab").exists());
    }

    #[test]
    fn test_setup_working_dir() {
        let temp = tempdir().unwrap();
        setup_working_dir(temp.path(), "/app/src").unwrap();
        assert!(temp.path().join("app/src").is_dir());
        assert!(setup_working_dir(temp.path(), "relative").is_err());

        fs::write(temp.path().join("file"), b"x").unwrap();
        assert!(setup_working_dir(temp.path(), "/file").is_err());
    }

    #[test]
    fn test_write_mtab_replaces_symlink() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::os::unix::fs::symlink("/proc/mounts", temp.path().join("etc/mtab")).unwrap();

        write_mtab(temp.path(), &[]).unwrap();
        let mtab = fs::read_to_string(temp.path().join("etc/mtab")).unwrap();
        assert!(mtab.starts_with("/dev/root / "));
    }

    #[test]
    fn test_seed_volume_only_when_empty() {
        let rootfs = tempdir().unwrap();
        let vol = tempdir().unwrap();
        fs::create_dir_all(rootfs.path().join("data/sub")).unwrap();
        fs::write(rootfs.path().join("data/sub/seed.txt"), b"seed").unwrap();

        let mount = MountPoint {
            source: vol.path().to_path_buf(),
            destination: "/data".into(),
            name: "v1".into(),
            copy_data: true,
            ..Default::default()
        };
        assert!(seed_volume(rootfs.path(), &mount).unwrap());
        assert_eq!(fs::read(vol.path().join("sub/seed.txt")).unwrap(), b"seed");

        fs::write(rootfs.path().join("data/sub/seed.txt"), b"changed").unwrap();
        assert!(!seed_volume(rootfs.path(), &mount).unwrap());
        assert_eq!(fs::read(vol.path().join("sub/seed.txt")).unwrap(), b"seed");
    }

    #[test]
    fn test_dir_is_empty() {
        let temp = tempdir().unwrap();
        assert!(dir_is_empty(temp.path()).unwrap());
        assert!(dir_is_empty(&temp.path().join("missing")).unwrap());
        fs::write(temp.path().join("f"), b"").unwrap();
        assert!(!dir_is_empty(temp.path()).unwrap());
    }
}
