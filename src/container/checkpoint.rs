//! Checkpoints of running containers
//!
//! Each checkpoint is a directory named after its ID under the checkpoint
//! root, which defaults to `<containers_dir>/<id>/checkpoints`.

use super::manager::{ContainerManager, KILL_WAIT};
use super::meta::ContainerMeta;
use crate::error::{HullError, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub checkpoint_id: String,
    /// Overrides the default checkpoint root
    pub checkpoint_dir: Option<PathBuf>,
    /// Stop the container once the checkpoint is written
    pub exit: bool,
}

fn validate_checkpoint_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') {
        return Err(HullError::InvalidParam(format!(
            "invalid checkpoint id {:?}",
            id
        )));
    }
    Ok(())
}

impl ContainerManager {
    fn checkpoint_root(&self, meta: &ContainerMeta, dir: Option<&Path>) -> PathBuf {
        match dir {
            Some(dir) => dir.to_path_buf(),
            None => self.container_dir(&meta.id).join("checkpoints"),
        }
    }

    pub async fn create_checkpoint(&self, id: &str, options: CheckpointOptions) -> Result<()> {
        validate_checkpoint_id(&options.checkpoint_id)?;

        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if !meta.state.is_running() {
            return Err(HullError::InvalidState(format!(
                "container {} is not running",
                meta.id
            )));
        }
        if meta.config.tty {
            return Err(HullError::InvalidParam(
                "cannot checkpoint a container with a tty".into(),
            ));
        }

        let root = self.checkpoint_root(&meta, options.checkpoint_dir.as_deref());
        std::fs::create_dir_all(&root)?;
        let dir = root.join(&options.checkpoint_id);
        std::fs::create_dir(&dir).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => HullError::AlreadyExists(format!(
                "checkpoint {} of container {}",
                options.checkpoint_id, meta.id
            )),
            _ => e.into(),
        })?;

        if let Err(e) = self
            .runtime
            .create_checkpoint(&meta.id, &dir, options.exit)
            .await
        {
            if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                warn!(checkpoint = %dir.display(), "failed to remove partial checkpoint: {}", cleanup);
            }
            return Err(e.into());
        }
        info!(container = %meta.id, checkpoint = %options.checkpoint_id, "checkpoint created");

        if options.exit {
            match self.runtime.wait_container(&meta.id, KILL_WAIT).await? {
                Some(status) => {
                    self.discard_task(&meta.id).await;
                    meta.state.set_stopped(status.exit_code, status.exited_at)?;
                    self.release_rootfs(&meta);
                    self.save(&container, &meta);
                    self.events.publish(
                        self.event("die", &meta)
                            .attr("exitCode", status.exit_code.to_string()),
                    );
                }
                None => warn!(container = %meta.id, "container still running after checkpoint exit"),
            }
        }

        self.events.publish(
            self.event("checkpoint", &meta)
                .attr("checkpoint", &options.checkpoint_id),
        );
        Ok(())
    }

    /// Checkpoint IDs, sorted. A missing root means no checkpoints.
    pub async fn list_checkpoints(&self, id: &str, dir: Option<&Path>) -> Result<Vec<String>> {
        let meta = self.registry.get(id)?.snapshot().await;
        let root = self.checkpoint_root(&meta, dir);

        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    pub async fn delete_checkpoint(
        &self,
        id: &str,
        checkpoint_id: &str,
        dir: Option<&Path>,
    ) -> Result<()> {
        validate_checkpoint_id(checkpoint_id)?;
        let meta = self.registry.get(id)?.snapshot().await;
        let path = self.checkpoint_root(&meta, dir).join(checkpoint_id);

        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(HullError::NotFound {
                kind: "checkpoint",
                id: checkpoint_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
