//! In-place upgrade of a container onto a new image
//!
//! The container keeps its ID, name, host config and volumes. A fresh
//! snapshot is prepared from the new image; on failure the previous image,
//! config and snapshot are put back and, if the container was running, it
//! is started again from them.

use super::config::{ContainerConfig, HostConfig};
use super::manager::ContainerManager;
use super::meta::{ContainerMeta, MountPoint};
use crate::error::{HullError, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub image: String,
    /// Replaces the command; empty takes the new image's
    pub cmd: Vec<String>,
    /// Replaces the entrypoint; empty takes the new image's
    pub entrypoint: Vec<String>,
}

/// Everything an upgrade may change
struct Rollback {
    config: ContainerConfig,
    host_config: HostConfig,
    image: String,
    snapshot_id: String,
    mounts: Vec<MountPoint>,
}

impl Rollback {
    fn capture(meta: &ContainerMeta) -> Self {
        Self {
            config: meta.config.clone(),
            host_config: meta.host_config.clone(),
            image: meta.image.clone(),
            snapshot_id: meta.snapshot_id.clone(),
            mounts: meta.mounts.clone(),
        }
    }

    fn restore(self, meta: &mut ContainerMeta) {
        meta.config = self.config;
        meta.host_config = self.host_config;
        meta.image = self.image;
        meta.snapshot_id = self.snapshot_id;
        meta.mounts = self.mounts;
    }
}

impl ContainerManager {
    pub async fn upgrade(&self, id: &str, upgrade: UpgradeConfig) -> Result<()> {
        if upgrade.image.is_empty() {
            return Err(HullError::InvalidParam("upgrade image must be specified".into()));
        }

        let container = self.registry.get(id)?;
        let mut meta = container.lock().await;
        if meta.state.is_paused() || meta.state.is_dead() {
            return Err(HullError::InvalidState(format!(
                "cannot upgrade container {} while it is {}",
                meta.id,
                meta.state.status()
            )));
        }
        meta.ensure_fs_idle()?;
        let image = self.images.get_image(&upgrade.image).await?;
        let image_config = self.images.get_oci_image_config(&image.id).await?;

        let was_running = meta.state.is_running();
        let rollback = Rollback::capture(&meta);
        if was_running {
            self.stop_locked(&mut meta, None).await?;
        }

        meta.config.image = upgrade.image.clone();
        meta.config.cmd = upgrade.cmd;
        meta.config.entrypoint = upgrade.entrypoint;
        meta.config.merge_image_config(&image_config);
        meta.image = image.id.clone();
        let new_snapshot = format!("{}-{}", meta.id, Uuid::new_v4().simple());

        match self.upgrade_locked(&mut meta, &new_snapshot, was_running).await {
            Ok(()) => {
                self.discard_snapshot(&rollback.snapshot_id).await;
                self.save(&container, &meta);
                info!(container = %meta.id, image = %upgrade.image, "container upgraded");
                self.events.publish(self.event("upgrade", &meta));
                Ok(())
            }
            Err(e) => {
                warn!(container = %meta.id, "upgrade failed, rolling back: {}", e);
                rollback.restore(&mut meta);
                if was_running {
                    if let Err(restart) = self.start_locked(&mut meta).await {
                        error!(container = %meta.id, "failed to restart after rollback: {}", restart);
                        meta.state
                            .set_error(format!("failed to rollback upgrade: {}", restart));
                    }
                }
                self.save(&container, &meta);
                Err(e)
            }
        }
    }

    async fn upgrade_locked(
        &self,
        meta: &mut ContainerMeta,
        snapshot: &str,
        start: bool,
    ) -> Result<()> {
        self.runtime.create_snapshot(snapshot, &meta.image).await?;
        meta.snapshot_id = snapshot.to_string();

        let result = if start {
            self.start_locked(meta).await
        } else {
            // Prove the new snapshot mounts before committing to it
            match self.prepare_rootfs(meta).await {
                Ok(()) => {
                    self.release_rootfs(meta);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if result.is_err() {
            self.discard_snapshot(snapshot).await;
        }
        result
    }
}
