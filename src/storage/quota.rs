//! Disk quota
//!
//! Quotas are project quotas keyed by a numeric ID. The ID space is shared
//! by every container on the host, so allocation goes through one atomic
//! counter per process.

use super::rootfs;
use crate::container::ContainerMeta;
use crate::error::{HullError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::process::Command;
use tracing::{debug, warn};

/// Key in `disk_quota` that targets the rootfs
pub const ROOTFS_QUOTA_KEY: &str = "/";

/// Applies project quotas to directories
#[async_trait]
pub trait QuotaDriver: Send + Sync {
    /// Bind `path` to project `id` and cap it at `size` bytes
    async fn set_quota(&self, path: &Path, id: u32, size: u64) -> Result<()>;
}

/// Project quota driver backed by `xfs_quota`
#[derive(Debug, Default, Clone, Copy)]
pub struct XfsQuota;

impl XfsQuota {
    async fn xfs_quota(&self, mount_point: &Path, command: String) -> Result<()> {
        let output = Command::new("xfs_quota")
            .arg("-x")
            .arg("-c")
            .arg(&command)
            .arg(mount_point)
            .output()
            .await?;
        if !output.status.success() {
            return Err(HullError::Internal(format!(
                "xfs_quota {}: {}",
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaDriver for XfsQuota {
    async fn set_quota(&self, path: &Path, id: u32, size: u64) -> Result<()> {
        let mounts = rootfs::parse_mountinfo(&tokio::fs::read_to_string("/proc/self/mountinfo").await?);
        let mount = rootfs::mount_info_for(&mounts, path).ok_or_else(|| {
            HullError::Internal(format!("no mount found for {}", path.display()))
        })?;
        if mount.fs_type != "xfs" {
            return Err(HullError::InvalidParam(format!(
                "project quota needs xfs, {} is on {}",
                path.display(),
                mount.fs_type
            )));
        }

        self.xfs_quota(
            &mount.mount_point,
            format!("project -s -p {} {}", path.display(), id),
        )
        .await?;
        self.xfs_quota(
            &mount.mount_point,
            format!("limit -p bsoft={} bhard={} {}", size, size, id),
        )
        .await?;
        debug!(path = %path.display(), id, size, "set project quota");
        Ok(())
    }
}

/// Process-wide sequential quota ID allocator
#[derive(Debug)]
pub struct QuotaIdAllocator {
    next: AtomicU32,
}

impl QuotaIdAllocator {
    pub fn new(base: u32) -> Self {
        Self {
            next: AtomicU32::new(base),
        }
    }

    /// Hand out a fresh ID
    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure `id`, already in use by a restored container, is never handed out
    pub fn reserve(&self, id: u32) {
        self.next.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }
}

/// Parse a size such as `512m`, `10g` or `1024`
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let invalid = || HullError::InvalidParam(format!("invalid size {}", s));
    let lower = s.to_ascii_lowercase();
    let digits = lower.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let unit = &lower[digits.len()..];
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let mult: u64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        _ => return Err(invalid()),
    };
    n.checked_mul(mult).ok_or_else(invalid)
}

/// Explicit quota ID requested in the config, if any. `-1` means "allocate".
fn requested_id(meta: &ContainerMeta) -> Result<Option<u32>> {
    match meta.config.quota_id.as_str() {
        "" | "-1" | "0" => Ok(None),
        s => s
            .parse()
            .map(Some)
            .map_err(|_| HullError::InvalidParam(format!("invalid quota id {}", s))),
    }
}

/// Reject quota settings that cannot be honoured
pub fn validate_quota(meta: &ContainerMeta) -> Result<()> {
    if requested_id(meta)?.is_some() && meta.config.disk_quota.is_empty() {
        return Err(HullError::InvalidParam(
            "disk quota size must be set together with quota id".into(),
        ));
    }
    for size in meta.config.disk_quota.values() {
        parse_size(size)?;
    }
    Ok(())
}

/// Apply the container's disk quotas to its rootfs and volume mounts.
///
/// Quota enforcement is best-effort: a failure to set a quota is logged and
/// the container still starts. Only an invalid request is an error.
pub async fn apply_quotas(
    driver: &dyn QuotaDriver,
    allocator: &QuotaIdAllocator,
    meta: &mut ContainerMeta,
) -> Result<()> {
    validate_quota(meta)?;
    if meta.config.disk_quota.is_empty() {
        return Ok(());
    }

    let id = match (meta.quota_id, requested_id(meta)?) {
        (Some(id), _) => id,
        (None, Some(id)) => {
            allocator.reserve(id);
            id
        }
        (None, None) => allocator.allocate(),
    };
    meta.quota_id = Some(id);

    if let Some(size) = meta.config.disk_quota.get(ROOTFS_QUOTA_KEY) {
        let size = parse_size(size)?;
        if let Err(e) = driver.set_quota(&meta.base_fs, id, size).await {
            warn!(container = %meta.id, "failed to set rootfs quota: {}", e);
        }
    }

    for mount in meta.mounts.iter().filter(|m| m.is_volume()) {
        let Some(size) = meta.config.disk_quota.get(&mount.destination) else {
            continue;
        };
        let size = parse_size(size)?;
        if let Err(e) = driver.set_quota(&mount.source, id, size).await {
            warn!(container = %meta.id, destination = %mount.destination, "failed to set volume quota: {}", e);
        }
    }
    Ok(())
}
