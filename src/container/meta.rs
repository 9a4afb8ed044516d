//! The container entity

use super::config::{ContainerConfig, HostConfig};
use super::state::State;
use crate::error::{HullError, Result};
use crate::meta::{Object, CONTAINER_BUCKET};
use chrono::{DateTime, Utc};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::{Mutex, MutexGuard};

/// Length of the name generated from an ID when none is given
pub const GENERATED_NAME_LEN: usize = 6;

/// Generate a fresh 64 hex-character ID
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Check a user-supplied container name
pub fn validate_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        Regex::new(r"^/?[a-zA-Z0-9][a-zA-Z0-9_.-]+$").expect("static regex is valid")
    });
    if !re.is_match(name) {
        return Err(HullError::InvalidParam(format!(
            "invalid container name {}: only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed",
            name
        )));
    }
    Ok(())
}

/// Mount propagation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    #[default]
    Rprivate,
    Private,
    Rshared,
    Shared,
    Rslave,
    Slave,
}

impl Propagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Rprivate => "rprivate",
            Propagation::Private => "private",
            Propagation::Rshared => "rshared",
            Propagation::Shared => "shared",
            Propagation::Rslave => "rslave",
            Propagation::Slave => "slave",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rprivate" => Some(Propagation::Rprivate),
            "private" => Some(Propagation::Private),
            "rshared" => Some(Propagation::Rshared),
            "shared" => Some(Propagation::Shared),
            "rslave" => Some(Propagation::Rslave),
            "slave" => Some(Propagation::Slave),
            _ => None,
        }
    }
}

/// One resolved bind or volume mount
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Host path backing the mount
    pub source: PathBuf,
    /// Path inside the container
    pub destination: String,
    /// Volume name; empty for a plain host bind
    pub name: String,
    /// Volume driver; empty for a plain host bind
    pub driver: String,
    /// User-named volume, which outlives the container
    pub named: bool,
    pub rw: bool,
    pub propagation: Propagation,
    /// Raw mode string as given by the user
    pub mode: String,
    /// Seed the volume with image content under the destination on first use
    pub copy_data: bool,
}

impl MountPoint {
    pub fn is_volume(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Durable record of a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub id: String,
    pub name: String,
    /// Resolved image ID
    pub image: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub state: State,
    pub mounts: Vec<MountPoint>,
    /// Runtime snapshot backing the rootfs
    pub snapshot_id: String,
    /// Where the rootfs is mounted while the container is prepared
    pub base_fs: PathBuf,
    pub log_path: PathBuf,
    pub created: DateTime<Utc>,
    pub restart_count: u32,
    pub exec_ids: BTreeSet<String>,
    /// Project quota ID bound to the rootfs, once allocated
    pub quota_id: Option<u32>,
    /// Outstanding temporary mounts of the rootfs held by copy operations
    #[serde(skip)]
    pub fs_leases: FsLeases,
}

impl ContainerMeta {
    pub fn new(id: String, name: String, config: ContainerConfig, host_config: HostConfig) -> Self {
        Self {
            id,
            name,
            image: String::new(),
            config,
            host_config,
            state: State::new(),
            mounts: Vec::new(),
            snapshot_id: String::new(),
            base_fs: PathBuf::new(),
            log_path: PathBuf::new(),
            created: Utc::now(),
            restart_count: 0,
            exec_ids: BTreeSet::new(),
            quota_id: None,
            fs_leases: FsLeases::default(),
        }
    }

    /// Fail if a copy operation still holds the rootfs mounted
    pub fn ensure_fs_idle(&self) -> Result<()> {
        let active = self.fs_leases.active();
        if active > 0 {
            return Err(HullError::InvalidState(format!(
                "filesystem of container {} is in use by {} copy operation(s)",
                self.id, active
            )));
        }
        Ok(())
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Mount point whose destination covers `path`, longest match first
    pub fn mount_for(&self, path: &str) -> Option<&MountPoint> {
        self.mounts
            .iter()
            .filter(|m| {
                let dest = m.destination.trim_end_matches('/');
                path == dest || path.starts_with(&format!("{}/", dest))
            })
            .max_by_key(|m| m.destination.len())
    }
}

/// Shared count of temporary rootfs mounts
#[derive(Debug, Clone, Default)]
pub struct FsLeases(Arc<AtomicUsize>);

impl FsLeases {
    pub fn acquire(&self) -> FsLease {
        self.0.fetch_add(1, Ordering::SeqCst);
        FsLease(self.0.clone())
    }

    pub fn active(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Released when dropped
#[derive(Debug)]
pub struct FsLease(Arc<AtomicUsize>);

impl Drop for FsLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Object for ContainerMeta {
    const BUCKET: &'static str = CONTAINER_BUCKET;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Fields other containers may read without taking the container lock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exported {
    pub pid: u32,
    /// Running or paused
    pub running: bool,
    pub mounts: Vec<MountPoint>,
}

impl Exported {
    fn of(meta: &ContainerMeta) -> Self {
        Self {
            pid: meta.state.pid(),
            running: meta.state.is_alive(),
            mounts: meta.mounts.clone(),
        }
    }
}

/// A live container owned by the registry.
///
/// The ID is immutable and readable without locking; everything else sits
/// behind the per-container mutex. A copy of the PID and mounts is
/// republished after every change for `container:<id>` namespace modes and
/// `volumes_from`, along with a full copy of the record for readers that
/// must not wait on an operation in flight.
#[derive(Debug)]
pub struct Container {
    id: String,
    meta: Mutex<ContainerMeta>,
    exported: RwLock<Exported>,
    published: RwLock<ContainerMeta>,
}

impl Container {
    pub fn new(meta: ContainerMeta) -> Self {
        Self {
            id: meta.id.clone(),
            exported: RwLock::new(Exported::of(&meta)),
            published: RwLock::new(meta.clone()),
            meta: Mutex::new(meta),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquire the container lock
    pub async fn lock(&self) -> MutexGuard<'_, ContainerMeta> {
        self.meta.lock().await
    }

    /// Copy of the current record, taken under the lock
    pub async fn snapshot(&self) -> ContainerMeta {
        self.meta.lock().await.clone()
    }

    /// Current record when nobody holds the lock, otherwise the record as
    /// of the last export. Never waits.
    pub fn peek(&self) -> Result<ContainerMeta> {
        if let Ok(meta) = self.meta.try_lock() {
            return Ok(meta.clone());
        }
        self.published
            .read()
            .map(|m| m.clone())
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))
    }

    /// Republish the exported fields from `meta`
    pub fn export(&self, meta: &ContainerMeta) -> Result<()> {
        let mut exported = self
            .exported
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        *exported = Exported::of(meta);
        drop(exported);

        let mut published = self
            .published
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        *published = meta.clone();
        Ok(())
    }

    pub fn exported(&self) -> Result<Exported> {
        self.exported
            .read()
            .map(|e| e.clone())
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))
    }
}
