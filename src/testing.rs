//! In-process fakes of the runtime, mounter and quota driver

use crate::config::DaemonConfig;
use crate::container::{ContainerManager, ManagerDeps};
use crate::error::{Result, RuntimeError};
use crate::image::{Image, ImageConfig, ImageStore};
use crate::meta::Store;
use crate::runtime::{
    ContainerStats, ExitStatus, MountDescriptor, RuntimeClient, RuntimeEvent, RuntimeResult,
    SnapshotKind, SnapshotUsage,
};
use crate::storage::quota::QuotaDriver;
use crate::storage::rootfs::Mounter;
use crate::storage::LocalVolumes;
use async_trait::async_trait;
use chrono::Utc;
use oci_spec::runtime::{LinuxResources, Process, Spec};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const BUSYBOX_ID: &str =
    "sha256:3f57d9401f8d42f986df300f0c69192fc41da28ccc8d797829467780db3dd741";
pub const BUSYBOX_NEXT_ID: &str =
    "sha256:a416a98b71e224a31ee99cff8e16063554498227d2b696152a9c3e0aa65e5824";

/// Fake PIDs start above the kernel's PID_MAX_LIMIT so a direct kill can
/// never reach a real process
const FAKE_PID_BASE: u32 = 4_194_400;

#[derive(Debug, Default, Clone)]
pub struct Task {
    pub pid: u32,
    pub running: bool,
    pub paused: bool,
    pub exit: Option<ExitStatus>,
}

#[derive(Default)]
pub struct FakeState {
    pub tasks: HashMap<String, Task>,
    pub specs: HashMap<String, Spec>,
    pub snapshots: BTreeSet<String>,
    pub signals: Vec<(String, i32)>,
    pub execs: Vec<(String, Process)>,
    pub commits: Vec<(String, String, ImageConfig)>,
    pub updates: Vec<String>,
    next_pid: u32,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    events: Mutex<Option<mpsc::Sender<RuntimeEvent>>>,
    /// Receives committed images, like a runtime writing to the content store
    image_sink: Mutex<Option<Arc<ImageStore>>>,
    pub fail_start: AtomicBool,
    /// Fail the next `get_mounts` call only
    pub fail_next_mounts: AtomicBool,
    pub fail_checkpoint: AtomicBool,
    /// Only SIGKILL stops a task
    pub ignore_term: AtomicBool,
    /// `wait_container` on a running task sleeps out its timeout
    pub slow_wait: AtomicBool,
    /// Run once with the key of the next snapshot created
    on_snapshot: Mutex<Option<SnapshotHook>>,
}

type SnapshotHook = Box<dyn FnOnce(&str) + Send>;

impl FakeRuntime {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn notify(&self, event: RuntimeEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.try_send(event);
        }
    }

    fn terminate(&self, id: &str, exit_code: i64) {
        let status = ExitStatus {
            exit_code,
            exited_at: Utc::now(),
        };
        let pid = {
            let mut state = self.state();
            let Some(task) = state.tasks.get_mut(id) else {
                return;
            };
            task.running = false;
            task.paused = false;
            task.exit = Some(status.clone());
            task.pid
        };
        self.notify(RuntimeEvent::Exit {
            container_id: id.to_string(),
            exec_id: None,
            pid,
            status,
        });
    }

    /// Make the container's init process exit on its own
    pub fn exit(&self, id: &str, exit_code: i64) {
        self.terminate(id, exit_code);
    }

    pub fn set_image_sink(&self, images: Arc<ImageStore>) {
        *self.image_sink.lock().unwrap() = Some(images);
    }

    pub fn has_task(&self, id: &str) -> bool {
        self.state().tasks.contains_key(id)
    }

    pub fn spec(&self, id: &str) -> Option<Spec> {
        self.state().specs.get(id).cloned()
    }

    pub fn signals(&self) -> Vec<(String, i32)> {
        self.state().signals.clone()
    }

    pub fn on_next_snapshot(&self, hook: impl FnOnce(&str) + Send + 'static) {
        *self.on_snapshot.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn snapshot_keys(&self) -> Vec<String> {
        self.state().snapshots.iter().cloned().collect()
    }

    pub fn execs(&self) -> Vec<(String, Process)> {
        self.state().execs.clone()
    }

    pub fn commits(&self) -> Vec<(String, String, ImageConfig)> {
        self.state().commits.clone()
    }

    pub fn updates(&self) -> Vec<String> {
        self.state().updates.clone()
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn create_container(&self, id: &str, spec: &Spec) -> RuntimeResult<()> {
        let mut state = self.state();
        if state.tasks.contains_key(id) {
            return Err(RuntimeError::other(format!("task {} already exists", id)));
        }
        state.tasks.insert(id.to_string(), Task::default());
        state.specs.insert(id.to_string(), spec.clone());
        Ok(())
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<u32> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::other("exec format error"));
        }
        let mut state = self.state();
        state.next_pid += 1;
        let pid = FAKE_PID_BASE + state.next_pid;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found(id))?;
        task.pid = pid;
        task.running = true;
        Ok(pid)
    }

    async fn kill_container(&self, id: &str, signal: i32) -> RuntimeResult<()> {
        let stops = {
            let mut state = self.state();
            state.signals.push((id.to_string(), signal));
            let task = state.tasks.get(id).ok_or_else(|| RuntimeError::not_found(id))?;
            if !task.running {
                return Err(RuntimeError::process_gone("no such process"));
            }
            signal == libc::SIGKILL || !self.ignore_term.load(Ordering::SeqCst)
        };
        if stops {
            self.terminate(id, 128 + signal as i64);
        }
        Ok(())
    }

    async fn wait_container(
        &self,
        id: &str,
        timeout: Duration,
    ) -> RuntimeResult<Option<ExitStatus>> {
        let exit = {
            let state = self.state();
            let task = state.tasks.get(id).ok_or_else(|| RuntimeError::not_found(id))?;
            task.exit.clone()
        };
        if exit.is_some() || !self.slow_wait.load(Ordering::SeqCst) {
            return Ok(exit);
        }
        tokio::time::sleep(timeout).await;
        let state = self.state();
        let task = state.tasks.get(id).ok_or_else(|| RuntimeError::not_found(id))?;
        Ok(task.exit.clone())
    }

    async fn destroy_container(&self, id: &str) -> RuntimeResult<ExitStatus> {
        let mut state = self.state();
        match state.tasks.get(id) {
            None => return Err(RuntimeError::not_found(id)),
            Some(task) if task.running => {
                return Err(RuntimeError::other(format!("task {} is running", id)))
            }
            Some(_) => {}
        }
        state.specs.remove(id);
        let task = state.tasks.remove(id).unwrap_or_default();
        Ok(task.exit.unwrap_or(ExitStatus {
            exit_code: 0,
            exited_at: Utc::now(),
        }))
    }

    async fn pause_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        let task = state.tasks.get_mut(id).ok_or_else(|| RuntimeError::not_found(id))?;
        if !task.running {
            return Err(RuntimeError::process_gone("no such process"));
        }
        task.paused = true;
        Ok(())
    }

    async fn resume_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        let task = state.tasks.get_mut(id).ok_or_else(|| RuntimeError::not_found(id))?;
        task.paused = false;
        Ok(())
    }

    async fn probe_container(&self, id: &str) -> RuntimeResult<Option<u32>> {
        Ok(self
            .state()
            .tasks
            .get(id)
            .filter(|t| t.running)
            .map(|t| t.pid))
    }

    async fn update_resources(&self, id: &str, _resources: &LinuxResources) -> RuntimeResult<()> {
        let mut state = self.state();
        if !state.tasks.contains_key(id) {
            return Err(RuntimeError::not_found(id));
        }
        state.updates.push(id.to_string());
        Ok(())
    }

    async fn exec_container(
        &self,
        id: &str,
        _exec_id: &str,
        process: &Process,
    ) -> RuntimeResult<u32> {
        let mut state = self.state();
        if !state.tasks.get(id).map_or(false, |t| t.running) {
            return Err(RuntimeError::other(format!("task {} is not running", id)));
        }
        state.execs.push((id.to_string(), process.clone()));
        state.next_pid += 1;
        Ok(FAKE_PID_BASE + state.next_pid)
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats> {
        let state = self.state();
        let task = state.tasks.get(id).ok_or_else(|| RuntimeError::not_found(id))?;
        Ok(ContainerStats {
            pids: u64::from(task.running),
            read_at: Some(Utc::now()),
            ..Default::default()
        })
    }

    async fn create_checkpoint(&self, id: &str, dir: &Path, exit: bool) -> RuntimeResult<()> {
        if self.fail_checkpoint.load(Ordering::SeqCst) {
            return Err(RuntimeError::other("criu failed"));
        }
        if !self.state().tasks.get(id).map_or(false, |t| t.running) {
            return Err(RuntimeError::process_gone("no such process"));
        }
        std::fs::write(dir.join("inventory.img"), id).map_err(RuntimeError::other)?;
        if exit {
            self.terminate(id, 0);
        }
        Ok(())
    }

    async fn commit(
        &self,
        id: &str,
        _snapshot_key: &str,
        reference: &str,
        config: &ImageConfig,
    ) -> RuntimeResult<String> {
        let image_id = {
            let mut state = self.state();
            state
                .commits
                .push((id.to_string(), reference.to_string(), config.clone()));
            format!("sha256:{:064x}", state.commits.len())
        };
        if let Some(images) = self.image_sink.lock().unwrap().as_ref() {
            images
                .store(Image::new(&image_id, config.clone()))
                .map_err(RuntimeError::other)?;
        }
        Ok(image_id)
    }

    async fn create_snapshot(&self, key: &str, _image: &str) -> RuntimeResult<()> {
        if !self.state().snapshots.insert(key.to_string()) {
            return Err(RuntimeError::other(format!("snapshot {} already exists", key)));
        }
        let hook = self.on_snapshot.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(key);
        }
        Ok(())
    }

    async fn remove_snapshot(&self, key: &str) -> RuntimeResult<()> {
        if !self.state().snapshots.remove(key) {
            return Err(RuntimeError::not_found(key));
        }
        Ok(())
    }

    async fn get_mounts(&self, key: &str) -> RuntimeResult<Vec<MountDescriptor>> {
        if self.fail_next_mounts.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::other("snapshotter unavailable"));
        }
        if !self.state().snapshots.contains(key) {
            return Err(RuntimeError::not_found(key));
        }
        Ok(vec![MountDescriptor {
            typ: "bind".into(),
            source: format!("/fake/snapshots/{}", key),
            options: vec!["rbind".into()],
        }])
    }

    async fn list_snapshots(&self) -> RuntimeResult<Vec<SnapshotUsage>> {
        Ok(self
            .state()
            .snapshots
            .iter()
            .map(|key| SnapshotUsage {
                key: key.clone(),
                kind: SnapshotKind::Active,
                size: 0,
                inodes: 0,
            })
            .collect())
    }

    async fn subscribe_events(&self) -> RuntimeResult<mpsc::Receiver<RuntimeEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

/// Records mounts instead of performing them
#[derive(Default)]
pub struct RecordingMounter {
    active: Mutex<Vec<PathBuf>>,
}

impl RecordingMounter {
    /// Targets currently mounted, in mount order
    pub fn active(&self) -> Vec<PathBuf> {
        self.active.lock().unwrap().clone()
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, _mount: &MountDescriptor, target: &Path) -> Result<()> {
        self.active.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn bind(&self, _source: &Path, target: &Path, _readonly: bool) -> Result<()> {
        self.active.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.active.lock().unwrap().retain(|t| t != target);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeQuota {
    pub calls: Mutex<Vec<(PathBuf, u32, u64)>>,
}

#[async_trait]
impl QuotaDriver for FakeQuota {
    async fn set_quota(&self, path: &Path, id: u32, size: u64) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), id, size));
        Ok(())
    }
}

/// A manager wired to fakes, with busybox images in a temporary home
pub struct Harness {
    pub manager: Arc<ContainerManager>,
    pub runtime: Arc<FakeRuntime>,
    pub mounter: Arc<RecordingMounter>,
    pub quota: Arc<FakeQuota>,
    pub images: Arc<ImageStore>,
    pub volumes: Arc<LocalVolumes>,
    pub store: Store,
    pub config: DaemonConfig,
    _home: TempDir,
}

fn image(id: &str, tag: &str, cmd: &str) -> Image {
    let mut image = Image::new(
        id,
        ImageConfig {
            cmd: vec![cmd.to_string()],
            env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into()],
            ..Default::default()
        },
    );
    image.repo_tags = vec![tag.to_string()];
    image
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(f: impl FnOnce(&mut DaemonConfig)) -> Self {
        let home = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig {
            home_dir: home.path().to_path_buf(),
            ..Default::default()
        };
        f(&mut config);

        let images = Arc::new(ImageStore::new(config.images_dir()).unwrap());
        images.store(image(BUSYBOX_ID, "busybox:latest", "sh")).unwrap();
        images.store(image(BUSYBOX_NEXT_ID, "busybox:1.36", "top")).unwrap();
        let volumes = Arc::new(LocalVolumes::new(config.volumes_dir()).unwrap());
        let runtime = Arc::new(FakeRuntime::default());
        runtime.set_image_sink(images.clone());
        let mounter = Arc::new(RecordingMounter::default());
        let quota = Arc::new(FakeQuota::default());
        let store = Store::in_memory();

        let manager = ContainerManager::new(ManagerDeps {
            config: config.clone(),
            store: store.clone(),
            runtime: runtime.clone(),
            images: images.clone(),
            volumes: volumes.clone(),
            mounter: mounter.clone(),
            quota: quota.clone(),
        })
        .unwrap();

        Self {
            manager: Arc::new(manager),
            runtime,
            mounter,
            quota,
            images,
            volumes,
            store,
            config,
            _home: home,
        }
    }

    /// Another manager over the same store, images and volumes, as after a
    /// daemon restart
    pub fn manager_with(&self, runtime: Arc<FakeRuntime>) -> ContainerManager {
        ContainerManager::new(ManagerDeps {
            config: self.config.clone(),
            store: self.store.clone(),
            runtime,
            images: self.images.clone(),
            volumes: self.volumes.clone(),
            mounter: self.mounter.clone(),
            quota: self.quota.clone(),
        })
        .unwrap()
    }
}
