//! Exec sessions inside running containers

use super::config::HostConfig;
use super::manager::ContainerManager;
use super::meta::{generate_id, ContainerMeta};
use crate::error::{HullError, Result};
use crate::spec::process::{capabilities, resolve_user, DEFAULT_PATH_ENV};
use oci_spec::runtime::{LinuxCapabilitiesBuilder, Process, ProcessBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Exit code recorded when an exec process could not be launched
pub const EXEC_FAILED_EXIT_CODE: i64 = 126;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    /// Appended to the container's environment
    pub env: Vec<String>,
    /// Defaults to the container's user
    pub user: String,
    /// Defaults to the container's working directory
    pub working_dir: String,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRecord {
    pub id: String,
    pub container_id: String,
    pub config: ExecConfig,
    pub started: bool,
    pub running: bool,
    pub pid: u32,
    pub exit_code: Option<i64>,
    pub error: String,
}

/// In-memory exec table. Exec sessions do not survive a daemon restart.
#[derive(Default)]
pub struct ExecStore {
    execs: RwLock<HashMap<String, ExecRecord>>,
}

impl ExecStore {
    pub fn insert(&self, record: ExecRecord) -> Result<()> {
        let mut execs = self
            .execs
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        execs.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ExecRecord> {
        let execs = self
            .execs
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;
        execs.get(id).cloned().ok_or_else(|| HullError::exec_not_found(id))
    }

    /// Mutate one record under the table lock
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut ExecRecord) -> R) -> Result<R> {
        let mut execs = self
            .execs
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        let record = execs.get_mut(id).ok_or_else(|| HullError::exec_not_found(id))?;
        Ok(f(record))
    }

    pub fn list(&self, container_id: &str) -> Result<Vec<ExecRecord>> {
        let execs = self
            .execs
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;
        let mut out: Vec<ExecRecord> = execs
            .values()
            .filter(|r| r.container_id == container_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut execs = self
            .execs
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        execs.retain(|_, r| r.container_id != container_id);
        Ok(())
    }
}

fn exec_process(meta: &ContainerMeta, config: &ExecConfig) -> Result<Process> {
    let mut env = meta.config.env.clone();
    env.extend(config.env.iter().cloned());
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.insert(0, DEFAULT_PATH_ENV.to_string());
    }

    let cwd = [config.working_dir.as_str(), meta.config.working_dir.as_str()]
        .into_iter()
        .find(|d| !d.is_empty())
        .unwrap_or("/")
        .to_string();
    let user = if config.user.is_empty() {
        &meta.config.user
    } else {
        &config.user
    };
    let user = resolve_user(&meta.base_fs, user, &meta.host_config.group_add)?;

    let caps = if config.privileged {
        capabilities(&HostConfig {
            privileged: true,
            ..Default::default()
        })?
    } else {
        capabilities(&meta.host_config)?
    };
    let caps = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .permitted(caps)
        .inheritable(HashSet::new())
        .ambient(HashSet::new())
        .build()?;

    Ok(ProcessBuilder::default()
        .args(config.cmd.clone())
        .env(env)
        .cwd(cwd)
        .terminal(config.tty)
        .user(user)
        .capabilities(caps)
        .build()?)
}

impl ContainerManager {
    /// Register an exec session in a running container
    pub async fn create_exec(&self, id: &str, config: ExecConfig) -> Result<String> {
        if config.cmd.is_empty() {
            return Err(HullError::InvalidParam("no exec command specified".into()));
        }

        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if meta.state.is_paused() {
            return Err(HullError::InvalidState(format!(
                "container {} is paused, unpause it first",
                meta.id
            )));
        }
        if !meta.state.is_running() {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                meta.id
            )));
        }

        let exec_id = generate_id();
        self.execs.insert(ExecRecord {
            id: exec_id.clone(),
            container_id: meta.id.clone(),
            config,
            started: false,
            running: false,
            pid: 0,
            exit_code: None,
            error: String::new(),
        })?;
        meta.exec_ids.insert(exec_id.clone());
        self.save(&container, &meta);

        self.events
            .publish(self.event("exec_create", &meta).attr("execID", &exec_id));
        Ok(exec_id)
    }

    /// Launch a created exec session. Each session can be started once.
    pub async fn start_exec(&self, exec_id: &str) -> Result<u32> {
        let record = self.execs.update(exec_id, |r| {
            if r.started {
                return Err(HullError::InvalidState(format!(
                    "exec {} has already been started",
                    r.id
                )));
            }
            r.started = true;
            Ok(r.clone())
        })??;

        match self.launch_exec(&record).await {
            Ok(pid) => {
                self.execs.update(exec_id, |r| {
                    r.running = true;
                    r.pid = pid;
                })?;
                info!(container = %record.container_id, exec = exec_id, pid, "exec started");
                Ok(pid)
            }
            Err(e) => {
                warn!(container = %record.container_id, exec = exec_id, "failed to start exec: {}", e);
                self.execs.update(exec_id, |r| {
                    r.running = false;
                    r.exit_code = Some(EXEC_FAILED_EXIT_CODE);
                    r.error = e.to_string();
                })?;
                Err(e)
            }
        }
    }

    async fn launch_exec(&self, record: &ExecRecord) -> Result<u32> {
        let container = self.registry.get(&record.container_id)?;
        let meta = container.lock().await;
        if !meta.state.is_running() {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                meta.id
            )));
        }

        let process = exec_process(&meta, &record.config)?;
        let pid = self
            .runtime
            .exec_container(&meta.id, &record.id, &process)
            .await?;
        self.events
            .publish(self.event("exec_start", &meta).attr("execID", &record.id));
        Ok(pid)
    }

    pub fn inspect_exec(&self, exec_id: &str) -> Result<ExecRecord> {
        self.execs.get(exec_id)
    }

    pub(super) fn finish_exec(&self, container_id: &str, exec_id: &str, exit_code: i64) {
        let updated = self.execs.update(exec_id, |r| {
            r.running = false;
            r.exit_code = Some(exit_code);
        });
        match updated {
            Ok(()) => {
                debug!(container = container_id, exec = exec_id, exit_code, "exec exited");
                self.events.publish(
                    crate::events::Event::container("exec_die", container_id)
                        .attr("execID", exec_id)
                        .attr("exitCode", exit_code.to_string()),
                );
            }
            Err(e) if e.is_not_found() => {
                debug!(container = container_id, exec = exec_id, "exit of unknown exec");
            }
            Err(e) => warn!(exec = exec_id, "failed to record exec exit: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::container::ContainerConfig;
    use std::time::Duration;

    async fn running(h: &Harness) -> String {
        let id = h
            .manager
            .create("execd", ContainerConfig::new("busybox:latest"), HostConfig::default())
            .await
            .unwrap()
            .id;
        h.manager.start(&id).await.unwrap();
        id
    }

    fn ls() -> ExecConfig {
        ExecConfig {
            cmd: vec!["ls".into(), "-l".into()],
            env: vec!["LANG=C".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exec_lifecycle() {
        let h = Harness::new();
        let id = running(&h).await;

        let exec_id = h.manager.create_exec(&id, ls()).await.unwrap();
        assert!(h.manager.inspect(&id).await.unwrap().exec_ids.contains(&exec_id));

        let pid = h.manager.start_exec(&exec_id).await.unwrap();
        let record = h.manager.inspect_exec(&exec_id).unwrap();
        assert!(record.running);
        assert_eq!(record.pid, pid);

        let (container, process) = h.runtime.execs().pop().unwrap();
        assert_eq!(container, id);
        assert_eq!(process.args().clone().unwrap(), vec!["ls", "-l"]);
        let env = process.env().clone().unwrap();
        assert!(env.iter().any(|e| e.starts_with("PATH=")));
        assert!(env.contains(&"LANG=C".to_string()));

        assert!(matches!(
            h.manager.start_exec(&exec_id).await,
            Err(HullError::InvalidState(_))
        ));

        h.manager.finish_exec(&id, &exec_id, 2);
        let record = h.manager.inspect_exec(&exec_id).unwrap();
        assert!(!record.running);
        assert_eq!(record.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let h = Harness::new();
        let id = h
            .manager
            .create("idle", ContainerConfig::new("busybox:latest"), HostConfig::default())
            .await
            .unwrap()
            .id;
        assert!(matches!(
            h.manager.create_exec(&id, ls()).await,
            Err(HullError::InvalidState(_))
        ));
        assert!(matches!(
            h.manager.create_exec(&id, ExecConfig::default()).await,
            Err(HullError::InvalidParam(_))
        ));
        assert!(h.manager.inspect_exec("nope").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_start_records_exit_code() {
        let h = Harness::new();
        let id = running(&h).await;
        let exec_id = h.manager.create_exec(&id, ls()).await.unwrap();
        h.manager.stop(&id, Some(Duration::from_secs(1))).await.unwrap();

        assert!(h.manager.start_exec(&exec_id).await.is_err());
        let record = h.manager.inspect_exec(&exec_id).unwrap();
        assert!(!record.running);
        assert_eq!(record.exit_code, Some(EXEC_FAILED_EXIT_CODE));
        assert!(!record.error.is_empty());
    }

    #[tokio::test]
    async fn test_remove_drops_execs() {
        let h = Harness::new();
        let id = running(&h).await;
        let exec_id = h.manager.create_exec(&id, ls()).await.unwrap();
        h.manager.remove(&id, true, false).await.unwrap();
        assert!(h.manager.inspect_exec(&exec_id).unwrap_err().is_not_found());
    }
}
