//! Container lifecycle manager
//!
//! Every operation resolves its container through the registry and then
//! holds that container's lock for the whole state change, runtime calls
//! included. Reads of other containers (namespace peers, `volumes_from`
//! donors) go through [`Container::exported`] and never take a second
//! container lock.

use super::config::{ContainerConfig, HostConfig, Resources, RestartPolicy};
use super::exec::ExecStore;
use super::filter::Filters;
use super::meta::{generate_id, validate_name, Container, ContainerMeta, GENERATED_NAME_LEN};
use super::monitor::{run_monitor, EventHandler, Monitor, MonitorEvent};
use super::registry::Registry;
use super::state::Status;
use crate::config::DaemonConfig;
use crate::error::{HullError, Result, RuntimeErrorKind};
use crate::events::{Event, EventsService};
use crate::image::ImageMgr;
use crate::meta::Store;
use crate::runtime::{syscall, ContainerStats, RuntimeClient, RuntimeEvent};
use crate::spec::namespaces::NamespaceMode;
use crate::spec::resources::linux_resources;
use crate::spec::{default_pipeline, NamespacePeers, SetupContext, SpecPipeline};
use crate::storage::mounts::{
    detach_mount_points, generate_mount_points, parse_bind, parse_volumes_from, InheritedMounts,
    MountRequest,
};
use crate::storage::quota::{apply_quotas, validate_quota, QuotaDriver, QuotaIdAllocator};
use crate::storage::rootfs::{
    mount_rootfs, seed_volume, setup_working_dir, unmount_rootfs, write_mtab, Mounter,
};
use crate::storage::snapshot::{run_snapshot_syncer, SnapshotStore};
use crate::storage::VolumeMgr;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for a process to die after SIGKILL
pub(super) const KILL_WAIT: Duration = Duration::from_secs(10);

/// Exit code recorded for a process that vanished while the daemon was down
const LOST_EXIT_CODE: i64 = 255;

const RESTART_POLICIES: &[&str] = &["", "no", "always", "on-failure", "unless-stopped"];

/// Collaborators the manager is built from
pub struct ManagerDeps {
    pub config: DaemonConfig,
    pub store: Store,
    pub runtime: Arc<dyn RuntimeClient>,
    pub images: Arc<dyn ImageMgr>,
    pub volumes: Arc<dyn VolumeMgr>,
    pub mounter: Arc<dyn Mounter>,
    pub quota: Arc<dyn QuotaDriver>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub id: String,
    pub name: String,
}

/// Changes accepted by [`ContainerManager::update`]
#[derive(Debug, Clone, Default)]
pub struct UpdateConfig {
    pub resources: Option<Resources>,
    pub restart_policy: Option<RestartPolicy>,
    /// Merged into the existing labels
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitResult {
    pub exit_code: i64,
    pub error: String,
}

pub struct ContainerManager {
    pub(super) config: DaemonConfig,
    pub(super) store: Store,
    pub(super) registry: Registry,
    pub(super) runtime: Arc<dyn RuntimeClient>,
    pub(super) images: Arc<dyn ImageMgr>,
    pub(super) volumes: Arc<dyn VolumeMgr>,
    pub(super) mounter: Arc<dyn Mounter>,
    quota: Arc<dyn QuotaDriver>,
    quota_ids: QuotaIdAllocator,
    pipeline: SpecPipeline,
    pub(super) events: EventsService,
    monitor: Monitor,
    monitor_rx: std::sync::Mutex<Option<mpsc::Receiver<MonitorEvent>>>,
    pub(super) execs: ExecStore,
    snapshots: Arc<SnapshotStore>,
}

impl ContainerManager {
    pub fn new(deps: ManagerDeps) -> Result<Self> {
        deps.config.validate()?;
        std::fs::create_dir_all(deps.config.containers_dir())?;

        let (monitor, monitor_rx) = Monitor::new(deps.config.monitor_capacity);
        Ok(Self {
            pipeline: default_pipeline(&deps.config),
            quota_ids: QuotaIdAllocator::new(deps.config.quota_base_id),
            config: deps.config,
            store: deps.store,
            registry: Registry::new(),
            runtime: deps.runtime,
            images: deps.images,
            volumes: deps.volumes,
            mounter: deps.mounter,
            quota: deps.quota,
            events: EventsService::default(),
            monitor,
            monitor_rx: std::sync::Mutex::new(Some(monitor_rx)),
            execs: ExecStore::default(),
            snapshots: Arc::new(SnapshotStore::new()),
        })
    }

    pub fn events(&self) -> &EventsService {
        &self.events
    }

    /// Cached snapshot usage, refreshed by the background syncer
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Start the monitor loop, the runtime event pump and the snapshot
    /// syncer. Can only be called once.
    pub async fn spawn_background(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let monitor_rx = self
            .monitor_rx
            .lock()
            .map_err(|_| HullError::Lock("Failed to acquire monitor lock".to_string()))?
            .take()
            .ok_or_else(|| HullError::InvalidState("background tasks already running".into()))?;
        let runtime_events = self.runtime.subscribe_events().await?;
        let handler: Arc<dyn EventHandler> = self.clone();

        Ok(vec![
            tokio::spawn(run_monitor(monitor_rx, handler, cancel.clone())),
            tokio::spawn(self.clone().pump_runtime_events(runtime_events, cancel.clone())),
            tokio::spawn(run_snapshot_syncer(
                self.runtime.clone(),
                self.snapshots.clone(),
                self.config.snapshot_sync_interval,
                cancel,
            )),
        ])
    }

    async fn pump_runtime_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RuntimeEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                RuntimeEvent::Exit {
                    container_id,
                    exec_id: None,
                    pid,
                    status,
                } => {
                    let event = MonitorEvent::Exit {
                        container_id,
                        pid,
                        exit_code: status.exit_code,
                    };
                    if let Err(e) = self.monitor.post(event).await {
                        warn!("failed to queue exit event: {}", e);
                    }
                }
                RuntimeEvent::Exit {
                    container_id,
                    exec_id: Some(exec_id),
                    status,
                    ..
                } => self.finish_exec(&container_id, &exec_id, status.exit_code),
                RuntimeEvent::Oom { container_id } => {
                    // Dropped when the monitor is saturated; the exit that
                    // follows still arrives
                    if let Err(e) = self.monitor.try_post(MonitorEvent::Oom { container_id }) {
                        warn!("failed to queue oom event: {}", e);
                    }
                }
            }
        }
        debug!("runtime event pump stopped");
    }

    pub(super) fn event(&self, action: &str, meta: &ContainerMeta) -> Event {
        Event::container(action, &meta.id)
            .attr("name", &meta.name)
            .attr("image", &meta.config.image)
    }

    /// Publish the record to peers and persist it. A failed write is logged;
    /// the in-memory record stays authoritative.
    pub(super) fn save(&self, container: &Container, meta: &ContainerMeta) {
        if let Err(e) = container.export(meta) {
            warn!(container = %meta.id, "failed to export container state: {}", e);
        }
        if let Err(e) = self.store.put(meta) {
            warn!(container = %meta.id, "failed to persist container: {}", e);
        }
    }

    pub(super) fn container_dir(&self, id: &str) -> PathBuf {
        self.config.containers_dir().join(id)
    }

    // ===== Create =====

    /// Create a container from `config`. An empty name gets one derived
    /// from the ID.
    pub async fn create(
        &self,
        name: &str,
        mut config: ContainerConfig,
        mut host_config: HostConfig,
    ) -> Result<CreateResponse> {
        let name = name.trim_start_matches('/');
        if !name.is_empty() {
            validate_name(name)?;
            if self.registry.name_taken(name)? {
                return Err(HullError::AlreadyExists(format!(
                    "container name {} is already in use",
                    name
                )));
            }
        }
        if config.image.is_empty() {
            return Err(HullError::InvalidParam("image must be specified".into()));
        }

        let image = self.images.get_image(&config.image).await?;
        let image_config = self.images.get_oci_image_config(&image.id).await?;
        config.merge_image_config(&image_config);
        self.validate_host_config(&mut host_config)?;

        let meta = loop {
            let (id, assigned) = self.allocate_identity(name)?;
            let dir = self.container_dir(&id);
            let mut meta =
                ContainerMeta::new(id.clone(), assigned.clone(), config.clone(), host_config.clone());
            meta.image = image.id.clone();
            meta.snapshot_id = id.clone();
            meta.base_fs = dir.join("rootfs");
            meta.log_path = dir.join("json.log");
            validate_quota(&meta)?;

            std::fs::create_dir_all(&dir)?;
            if let Err(e) = self.runtime.create_snapshot(&meta.snapshot_id, &meta.image).await {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e.into());
            }
            match self.registry.put(&assigned, Arc::new(Container::new(meta.clone()))) {
                Ok(()) => break meta,
                Err(e) => {
                    self.discard_snapshot(&meta.snapshot_id).await;
                    let _ = std::fs::remove_dir_all(&dir);
                    // A generated name may be claimed between allocation and registration
                    if name.is_empty() && matches!(e, HullError::AlreadyExists(_)) {
                        debug!(name = %assigned, "generated name taken, picking another");
                        continue;
                    }
                    return Err(e);
                }
            }
        };
        let id = meta.id.clone();
        let name = meta.name.clone();
        if let Err(e) = self.store.put(&meta) {
            warn!(container = %id, "failed to persist container: {}", e);
        }

        info!(container = %id, name = %name, image = %meta.config.image, "container created");
        self.events.publish(self.event("create", &meta));
        Ok(CreateResponse { id, name })
    }

    fn validate_host_config(&self, host: &mut HostConfig) -> Result<()> {
        host.resources.validate()?;

        if host.log_config.driver.is_empty() {
            host.log_config.driver = self.config.default_log_driver.clone();
        }
        if !self.config.log_drivers.contains(&host.log_config.driver) {
            return Err(HullError::InvalidParam(format!(
                "log driver {} is not supported",
                host.log_config.driver
            )));
        }
        if !RESTART_POLICIES.contains(&host.restart_policy.name.as_str()) {
            return Err(HullError::InvalidParam(format!(
                "invalid restart policy {}",
                host.restart_policy.name
            )));
        }

        for bind in &host.binds {
            parse_bind(bind)?;
        }
        for donor in &host.volumes_from {
            parse_volumes_from(donor)?;
        }
        Ok(())
    }

    /// Pick an ID unknown to both the registry and the store, and a name
    fn allocate_identity(&self, name: &str) -> Result<(String, String)> {
        loop {
            let id = generate_id();
            if self.registry.contains_id(&id)? || self.store.exists::<ContainerMeta>(&id)? {
                continue;
            }
            if !name.is_empty() {
                return Ok((id, name.to_string()));
            }
            let generated = id[..GENERATED_NAME_LEN].to_string();
            if !self.registry.name_taken(&generated)? {
                return Ok((id, generated));
            }
        }
    }

    // ===== Start =====

    pub async fn start(&self, id: &str) -> Result<()> {
        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if !meta.state.status().is_startable() {
            return Err(HullError::InvalidState(format!(
                "container {} is {}",
                meta.id,
                meta.state.status()
            )));
        }

        let result = self.start_locked(&mut meta).await;
        if let Err(e) = &result {
            warn!(container = %meta.id, "failed to start container: {}", e);
            meta.state.set_error(e.to_string());
        }
        self.save(&container, &meta);
        result?;

        info!(container = %meta.id, pid = meta.state.pid(), "container started");
        self.events.publish(self.event("start", &meta));
        Ok(())
    }

    /// Mount, generate the spec and launch. Partial work is rolled back on
    /// failure; the caller records the error.
    pub(super) async fn start_locked(&self, meta: &mut ContainerMeta) -> Result<()> {
        meta.ensure_fs_idle()?;
        let peers = self.namespace_peers(meta)?;
        let inherited = self.inherited_mounts(meta)?;
        let image_volumes = match self.images.get_oci_image_config(&meta.image).await {
            Ok(config) => config.volumes,
            Err(e) if e.is_not_found() => {
                warn!(container = %meta.id, image = %meta.image, "image is gone, skipping its volumes");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mounts = generate_mount_points(
            MountRequest {
                meta,
                inherited: &inherited,
                image_volumes: &image_volumes,
                default_driver: &self.config.default_volume_driver,
            },
            self.volumes.as_ref(),
        )
        .await?;
        meta.mounts = mounts;

        self.prepare_rootfs(meta).await?;

        let ctx = SetupContext {
            config: &self.config,
        };
        let spec = match self.pipeline.generate(&ctx, meta, peers) {
            Ok(spec) => spec,
            Err(e) => {
                self.release_rootfs(meta);
                return Err(e);
            }
        };

        if let Err(e) = self.runtime.create_container(&meta.id, &spec).await {
            self.release_rootfs(meta);
            return Err(e.into());
        }
        let pid = match self.runtime.start_container(&meta.id).await {
            Ok(pid) => pid,
            Err(e) => {
                self.discard_task(&meta.id).await;
                self.release_rootfs(meta);
                return Err(e.into());
            }
        };
        meta.state.set_running(pid)
    }

    fn namespace_peers(&self, meta: &ContainerMeta) -> Result<NamespacePeers> {
        let host = &meta.host_config;
        Ok(NamespacePeers {
            network: self.peer_pid(meta, &host.network_mode)?,
            ipc: self.peer_pid(meta, &host.ipc_mode)?,
            pid: self.peer_pid(meta, &host.pid_mode)?,
        })
    }

    fn peer_pid(&self, meta: &ContainerMeta, mode: &str) -> Result<Option<u32>> {
        let NamespaceMode::Container(peer) = NamespaceMode::parse(mode) else {
            return Ok(None);
        };
        let container = self.registry.get(&peer)?;
        if container.id() == meta.id {
            return Err(HullError::InvalidParam(format!(
                "container {} cannot join its own namespace",
                meta.id
            )));
        }
        let exported = container.exported()?;
        if !exported.running || exported.pid == 0 {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                peer
            )));
        }
        Ok(Some(exported.pid))
    }

    fn inherited_mounts(&self, meta: &ContainerMeta) -> Result<Vec<InheritedMounts>> {
        meta.host_config
            .volumes_from
            .iter()
            .map(|entry| {
                let (donor, rw) = parse_volumes_from(entry)?;
                let container = self.registry.get(&donor)?;
                if container.id() == meta.id {
                    return Err(HullError::InvalidParam(format!(
                        "container {} cannot inherit its own volumes",
                        meta.id
                    )));
                }
                Ok(InheritedMounts {
                    container_id: container.id().to_string(),
                    mounts: container.exported()?.mounts,
                    rw,
                })
            })
            .collect()
    }

    /// Mount the snapshot on `base_fs` and lay out the working directory,
    /// mtab, volume seeds and quotas
    pub(super) async fn prepare_rootfs(&self, meta: &mut ContainerMeta) -> Result<()> {
        mount_rootfs(
            self.runtime.as_ref(),
            self.mounter.as_ref(),
            &meta.snapshot_id,
            &meta.base_fs,
        )
        .await?;
        if let Err(e) = self.init_rootfs(meta).await {
            self.release_rootfs(meta);
            return Err(e);
        }
        Ok(())
    }

    async fn init_rootfs(&self, meta: &mut ContainerMeta) -> Result<()> {
        setup_working_dir(&meta.base_fs, &meta.config.working_dir)?;
        write_mtab(&meta.base_fs, &meta.mounts)?;
        for mount in &meta.mounts {
            if seed_volume(&meta.base_fs, mount)? {
                debug!(container = %meta.id, destination = %mount.destination, "seeded volume from image");
            }
        }
        apply_quotas(self.quota.as_ref(), &self.quota_ids, meta).await
    }

    pub(super) fn release_rootfs(&self, meta: &ContainerMeta) {
        if let Err(e) = unmount_rootfs(self.mounter.as_ref(), &meta.base_fs) {
            warn!(container = %meta.id, "failed to unmount rootfs: {}", e);
        }
    }

    /// Delete the runtime task; a task that is already gone is fine
    pub(super) async fn discard_task(&self, id: &str) {
        match self.runtime.destroy_container(id).await {
            Ok(_) => {}
            Err(e) if e.kind == RuntimeErrorKind::NotFound => {}
            Err(e) => warn!(container = id, "failed to destroy runtime task: {}", e),
        }
    }

    pub(super) async fn discard_snapshot(&self, key: &str) {
        match self.runtime.remove_snapshot(key).await {
            Ok(()) => {}
            Err(e) if e.kind == RuntimeErrorKind::NotFound => {}
            Err(e) => warn!(snapshot = key, "failed to remove snapshot: {}", e),
        }
    }

    // ===== Stop / Kill =====

    pub async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if !meta.state.is_alive() {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                meta.id
            )));
        }

        self.stop_locked(&mut meta, timeout).await?;
        self.save(&container, &meta);

        info!(container = %meta.id, exit_code = meta.state.exit_code(), "container stopped");
        self.events.publish(self.event("stop", &meta));
        Ok(())
    }

    /// Signal, wait, escalate to SIGKILL, then tear the task down
    pub(super) async fn stop_locked(
        &self,
        meta: &mut ContainerMeta,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| {
            Duration::from_secs(
                meta.config
                    .stop_timeout
                    .unwrap_or(self.config.default_stop_timeout),
            )
        });

        // A frozen process cannot handle the stop signal
        if meta.state.is_paused() {
            if let Err(e) = self.runtime.resume_container(&meta.id).await {
                warn!(container = %meta.id, "failed to resume before stop: {}", e);
            }
        }

        let signal = syscall::parse_signal(&meta.config.stop_signal).unwrap_or(libc::SIGTERM);
        if let Err(e) = self.runtime.kill_container(&meta.id, signal).await {
            let e = HullError::from(e);
            if !e.is_process_gone() {
                warn!(container = %meta.id, signal, "failed to send stop signal: {}", e);
            }
        }

        let status = match self.runtime.wait_container(&meta.id, timeout).await {
            Ok(Some(status)) => status,
            other => {
                if let Err(e) = other {
                    warn!(container = %meta.id, "waiting for graceful stop failed: {}", e);
                }
                info!(container = %meta.id, ?timeout, "container did not stop in time, killing");
                self.kill_process(meta, libc::SIGKILL).await?;
                self.runtime
                    .wait_container(&meta.id, KILL_WAIT)
                    .await?
                    .ok_or_else(|| {
                        HullError::Internal(format!(
                            "container {} did not exit after SIGKILL",
                            meta.id
                        ))
                    })?
            }
        };

        self.discard_task(&meta.id).await;
        meta.state.set_stopped(status.exit_code, status.exited_at)?;
        self.release_rootfs(meta);
        self.events.publish(
            self.event("die", meta)
                .attr("exitCode", status.exit_code.to_string()),
        );
        Ok(())
    }

    pub async fn kill(&self, id: &str, signal: &str) -> Result<()> {
        let signo = if signal.is_empty() {
            libc::SIGKILL
        } else {
            syscall::parse_signal(signal)
                .ok_or_else(|| HullError::InvalidParam(format!("invalid signal {}", signal)))?
        };

        let container = self.registry.get(id)?;
        let meta = container.lock().await;
        if !meta.state.is_alive() {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                meta.id
            )));
        }
        self.kill_process(&meta, signo).await?;

        self.events.publish(self.event("kill", &meta).attr("signal", signo.to_string()));
        Ok(())
    }

    /// Deliver `signal` through the runtime. A process that is already gone
    /// counts as delivered. SIGKILL falls back to signalling the recorded
    /// PID directly when the runtime cannot.
    pub(super) async fn kill_process(&self, meta: &ContainerMeta, signal: i32) -> Result<()> {
        let result = self
            .runtime
            .kill_container(&meta.id, signal)
            .await
            .map_err(HullError::from);
        match &result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_process_gone() => {
                debug!(container = %meta.id, signal, "process already gone");
                return Ok(());
            }
            Err(_) => {}
        }

        let pid = meta.state.pid();
        if signal == libc::SIGKILL
            && meta.state.is_alive()
            && pid != 0
            && syscall::process_alive(pid as i32)
        {
            match syscall::kill(pid as i32, libc::SIGKILL) {
                Ok(()) => {
                    debug!(container = %meta.id, pid, "killed process directly");
                    return Ok(());
                }
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(()),
                Err(e) => warn!(container = %meta.id, pid, "direct kill failed: {}", e),
            }
        }
        result
    }

    // ===== Pause / Unpause / Restart =====

    pub async fn pause(&self, id: &str) -> Result<()> {
        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if !meta.state.is_running() {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                meta.id
            )));
        }

        self.runtime.pause_container(&meta.id).await?;
        meta.state.set_paused()?;
        self.save(&container, &meta);
        self.events.publish(self.event("pause", &meta));
        Ok(())
    }

    pub async fn unpause(&self, id: &str) -> Result<()> {
        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if !meta.state.is_paused() {
            return Err(HullError::InvalidState(format!(
                "container {} is not paused",
                meta.id
            )));
        }

        self.runtime.resume_container(&meta.id).await?;
        meta.state.set_unpaused()?;
        self.save(&container, &meta);
        self.events.publish(self.event("unpause", &meta));
        Ok(())
    }

    pub async fn restart(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if meta.state.is_dead() {
            return Err(HullError::InvalidState(format!(
                "container {} is being removed",
                meta.id
            )));
        }

        let was_alive = meta.state.is_alive();
        if was_alive {
            self.stop_locked(&mut meta, timeout).await?;
            meta.state.set_restarting()?;
        }
        let result = self.start_locked(&mut meta).await;
        match &result {
            Ok(()) => meta.restart_count += 1,
            Err(e) => {
                if was_alive {
                    let exit_code = meta.state.exit_code();
                    meta.state.set_stopped(exit_code, Utc::now())?;
                }
                meta.state.set_error(e.to_string());
            }
        }
        self.save(&container, &meta);
        result?;

        info!(container = %meta.id, "container restarted");
        self.events.publish(self.event("restart", &meta));
        Ok(())
    }

    // ===== Remove / Rename / Update =====

    pub async fn remove(&self, id: &str, force: bool, remove_volumes: bool) -> Result<()> {
        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        meta.ensure_fs_idle()?;

        if meta.state.is_alive() {
            if !force {
                return Err(HullError::InvalidState(format!(
                    "container {} is running, stop it first or force the removal",
                    meta.id
                )));
            }
            self.kill_process(&meta, libc::SIGKILL).await?;
            match self.runtime.wait_container(&meta.id, KILL_WAIT).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(HullError::Internal(format!(
                        "container {} did not exit after SIGKILL",
                        meta.id
                    )))
                }
                Err(e) if e.kind == RuntimeErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        meta.state.set_dead()?;
        self.save(&container, &meta);

        self.discard_task(&meta.id).await;
        let unmounted = match unmount_rootfs(self.mounter.as_ref(), &meta.base_fs) {
            Ok(()) => true,
            Err(e) => {
                warn!(container = %meta.id, "failed to unmount rootfs: {}", e);
                false
            }
        };
        if let Err(e) =
            detach_mount_points(&meta.id, &meta.mounts, self.volumes.as_ref(), remove_volumes).await
        {
            warn!(container = %meta.id, "failed to release volumes: {}", e);
        }
        self.discard_snapshot(&meta.snapshot_id).await;
        self.execs.remove_container(&meta.id)?;

        self.registry.remove(&meta.id)?;
        if let Err(e) = self.store.remove::<ContainerMeta>(&meta.id) {
            warn!(container = %meta.id, "failed to delete container record: {}", e);
        }
        // Never delete through a rootfs that may still be mounted
        if unmounted {
            match std::fs::remove_dir_all(self.container_dir(&meta.id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(container = %meta.id, "failed to remove container dir: {}", e),
            }
        }

        info!(container = %meta.id, "container removed");
        self.events.publish(self.event("destroy", &meta));
        Ok(())
    }

    pub async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        let new_name = new_name.trim_start_matches('/');
        validate_name(new_name)?;

        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if meta.name == new_name {
            return Ok(());
        }
        self.registry.rename(&meta.id, new_name)?;
        let old_name = std::mem::replace(&mut meta.name, new_name.to_string());
        self.save(&container, &meta);

        self.events.publish(self.event("rename", &meta).attr("oldName", old_name));
        Ok(())
    }

    /// Apply resource, restart policy and label changes. Resources are
    /// pushed to the runtime first when the container is alive; nothing is
    /// recorded if that fails.
    pub async fn update(&self, id: &str, update: UpdateConfig) -> Result<()> {
        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if meta.state.is_dead() {
            return Err(HullError::InvalidState(format!(
                "container {} is being removed",
                meta.id
            )));
        }

        let mut host = meta.host_config.clone();
        if let Some(policy) = update.restart_policy {
            if !RESTART_POLICIES.contains(&policy.name.as_str()) {
                return Err(HullError::InvalidParam(format!(
                    "invalid restart policy {}",
                    policy.name
                )));
            }
            host.restart_policy = policy;
        }
        if let Some(resources) = update.resources {
            resources.validate()?;
            host.resources = resources;
            if meta.state.is_alive() {
                let linux = linux_resources(&host.resources)?;
                self.runtime.update_resources(&meta.id, &linux).await?;
            }
        }

        meta.host_config = host;
        meta.config.labels.extend(update.labels);
        self.save(&container, &meta);
        self.events.publish(self.event("update", &meta));
        Ok(())
    }

    // ===== Queries =====

    /// Block until the container is no longer running
    pub async fn wait(&self, id: &str, cancel: &CancellationToken) -> Result<WaitResult> {
        let container = self.registry.get(id)?;
        // Subscribe before checking so an exit in between is not missed
        let mut events = self.events.subscribe();
        loop {
            {
                let meta = container.lock().await;
                if !meta.state.is_alive() && meta.state.status() != Status::Restarting {
                    return Ok(WaitResult {
                        exit_code: meta.state.exit_code(),
                        error: meta.state.error().to_string(),
                    });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(HullError::Internal("wait cancelled".into()));
                }
                event = events.recv() => match event {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(HullError::Internal("event stream closed".into()));
                    }
                },
            }
        }
    }

    pub async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let container = self.registry.get(id)?;
        let meta = container.lock().await;
        if !meta.state.is_running() {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                meta.id
            )));
        }
        Ok(self.runtime.container_stats(&meta.id).await?)
    }

    /// Record of the container. While another operation holds the
    /// container, the record as of its last save is returned.
    pub async fn inspect(&self, id: &str) -> Result<ContainerMeta> {
        self.registry.get(id)?.peek()
    }

    /// Containers matching `filters`, newest first. Only live containers
    /// are listed unless `all` is set.
    pub async fn list(&self, filters: &Filters, all: bool) -> Result<Vec<ContainerMeta>> {
        filters.validate()?;
        let mut out = self
            .registry
            .list(|meta| (all || meta.state.is_alive()) && filters.matches(meta))?;
        out.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(out)
    }

    // ===== Restore =====

    /// Reload every persisted container and reconcile it with the runtime.
    /// Returns the number of containers registered.
    pub async fn restore(&self) -> Result<usize> {
        let mut records = Vec::new();
        self.store.for_each::<ContainerMeta>(|meta| {
            records.push(meta);
            Ok(())
        })?;

        let mut restored = 0;
        for mut meta in records {
            if meta.state.is_dead() {
                info!(container = %meta.id, "dropping container whose removal was interrupted");
                self.discard_snapshot(&meta.snapshot_id).await;
                if let Err(e) = self.store.remove::<ContainerMeta>(&meta.id) {
                    warn!(container = %meta.id, "failed to delete container record: {}", e);
                }
                continue;
            }

            if let Some(quota_id) = meta.quota_id {
                self.quota_ids.reserve(quota_id);
            }
            meta.exec_ids.clear();

            if meta.state.is_alive() {
                let alive = match self.runtime.probe_container(&meta.id).await {
                    Ok(pid) => pid.is_some(),
                    Err(e) if e.kind == RuntimeErrorKind::NotFound => false,
                    Err(e) => {
                        warn!(container = %meta.id, "failed to probe container, keeping state: {}", e);
                        true
                    }
                };
                if !alive {
                    info!(container = %meta.id, "container process exited while the daemon was down");
                    meta.state.set_exited(LOST_EXIT_CODE, Utc::now())?;
                    meta.state.set_error("container process is gone");
                    self.release_rootfs(&meta);
                }
            }

            let name = meta.name.clone();
            if let Err(e) = self.registry.put(&name, Arc::new(Container::new(meta.clone()))) {
                warn!(container = %meta.id, "skipping container: {}", e);
                continue;
            }
            if let Err(e) = self.store.put(&meta) {
                warn!(container = %meta.id, "failed to persist container: {}", e);
            }
            restored += 1;
        }

        info!(count = restored, "restored containers");
        Ok(restored)
    }

    // ===== Runtime events =====

    async fn handle_exit(&self, id: &str, pid: u32, exit_code: i64) -> Result<()> {
        let container = match self.registry.get(id) {
            Ok(container) => container,
            Err(e) if e.is_not_found() => {
                debug!(container = id, "exit of unknown container");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut meta = container.lock().await;
        // Stop and Remove tear the task down themselves
        if meta.state.is_dead() || !meta.state.is_alive() {
            return Ok(());
        }
        // Exit of a task that a restart or upgrade already replaced
        if pid != 0 && pid != meta.state.pid() {
            debug!(container = %meta.id, pid, "ignoring exit of replaced task");
            return Ok(());
        }

        meta.state.set_exited(exit_code, Utc::now())?;
        self.discard_task(&meta.id).await;
        self.release_rootfs(&meta);
        self.save(&container, &meta);

        info!(container = %meta.id, exit_code, "container exited");
        let mut event = self.event("die", &meta).attr("exitCode", exit_code.to_string());
        if meta.state.oom_killed() {
            event = event.attr("oomKilled", "true");
        }
        self.events.publish(event);
        Ok(())
    }

    async fn handle_oom(&self, id: &str) -> Result<()> {
        let container = match self.registry.get(id) {
            Ok(container) => container,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut meta = container.lock().await;
        if meta.state.is_dead() {
            return Ok(());
        }

        meta.state.set_oom_killed();
        self.save(&container, &meta);
        warn!(container = %meta.id, "container hit its memory limit");
        self.events.publish(self.event("oom", &meta));
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ContainerManager {
    async fn handle(&self, event: MonitorEvent) -> Result<()> {
        match event {
            MonitorEvent::Oom { container_id } => self.handle_oom(&container_id).await,
            MonitorEvent::Exit {
                container_id,
                pid,
                exit_code,
            } => self.handle_exit(&container_id, pid, exit_code).await,
        }
    }
}
