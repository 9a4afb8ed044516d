//! Runtime client interface
//!
//! The low-level container runtime (namespaces, cgroups, process
//! supervision, snapshots) is an external collaborator. The lifecycle
//! manager only talks to it through [`RuntimeClient`].

pub mod syscall;

use crate::error::RuntimeError;
use crate::image::ImageConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oci_spec::runtime::{LinuxResources, Process, Spec};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result type returned by the runtime client
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Exit information for a finished process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i64,
    pub exited_at: DateTime<Utc>,
}

/// Mount needed to assemble a snapshot into a rootfs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Filesystem type, e.g. `overlay` or `bind`
    pub typ: String,
    pub source: String,
    pub options: Vec<String>,
}

/// Kind of snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    #[default]
    Active,
    Committed,
    View,
}

/// Disk usage of one snapshot as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUsage {
    pub key: String,
    pub kind: SnapshotKind,
    pub size: u64,
    pub inodes: u64,
}

/// Resource usage sample
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_usage_nanos: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids: u64,
    pub read_at: Option<DateTime<Utc>>,
}

/// Event pushed asynchronously by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A container's init process or one of its exec processes exited
    Exit {
        container_id: String,
        exec_id: Option<String>,
        /// PID of the process that exited
        pid: u32,
        status: ExitStatus,
    },
    /// The container's cgroup hit its memory limit
    Oom { container_id: String },
}

/// Client of the external container runtime
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Create the container and its init process from `spec`, without starting it
    async fn create_container(&self, id: &str, spec: &Spec) -> RuntimeResult<()>;

    /// Start the init process; returns its PID
    async fn start_container(&self, id: &str) -> RuntimeResult<u32>;

    /// Signal the init process
    async fn kill_container(&self, id: &str, signal: i32) -> RuntimeResult<()>;

    /// Wait for the init process to exit; `None` if it is still running after `timeout`
    async fn wait_container(&self, id: &str, timeout: Duration)
        -> RuntimeResult<Option<ExitStatus>>;

    /// Delete the container from the runtime once its process is gone
    async fn destroy_container(&self, id: &str) -> RuntimeResult<ExitStatus>;

    async fn pause_container(&self, id: &str) -> RuntimeResult<()>;

    async fn resume_container(&self, id: &str) -> RuntimeResult<()>;

    /// PID of the init process if the runtime still runs it
    async fn probe_container(&self, id: &str) -> RuntimeResult<Option<u32>>;

    async fn update_resources(&self, id: &str, resources: &LinuxResources) -> RuntimeResult<()>;

    /// Start an extra process in a running container; returns its PID
    async fn exec_container(&self, id: &str, exec_id: &str, process: &Process)
        -> RuntimeResult<u32>;

    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats>;

    /// Dump the container state into `dir`; `exit` stops it afterwards
    async fn create_checkpoint(&self, id: &str, dir: &Path, exit: bool) -> RuntimeResult<()>;

    /// Produce a new image from the container filesystem; returns the image ID
    async fn commit(
        &self,
        id: &str,
        snapshot_key: &str,
        reference: &str,
        config: &ImageConfig,
    ) -> RuntimeResult<String>;

    /// Prepare a writable snapshot on top of `image`
    async fn create_snapshot(&self, key: &str, image: &str) -> RuntimeResult<()>;

    async fn remove_snapshot(&self, key: &str) -> RuntimeResult<()>;

    /// Mounts that assemble the snapshot; exactly one is expected
    async fn get_mounts(&self, key: &str) -> RuntimeResult<Vec<MountDescriptor>>;

    async fn list_snapshots(&self) -> RuntimeResult<Vec<SnapshotUsage>>;

    /// Stream of asynchronous runtime events
    async fn subscribe_events(&self) -> RuntimeResult<mpsc::Receiver<RuntimeEvent>>;
}
