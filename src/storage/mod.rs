//! Storage management module
//!
//! Volumes, mount point resolution, rootfs preparation, disk quota and the
//! snapshot cache.

pub mod mounts;
pub mod quota;
pub mod rootfs;
pub mod snapshot;
pub mod volume;

pub use mounts::{generate_mount_points, parse_bind, BindSpec, InheritedMounts, MountRequest};
pub use quota::{QuotaDriver, QuotaIdAllocator, XfsQuota};
pub use rootfs::{Mounter, SysMounter};
pub use snapshot::{SnapshotInfo, SnapshotStore};
pub use volume::{LocalVolumes, TracedVolumes, Volume, VolumeMgr};
