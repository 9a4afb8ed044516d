use super::manager::ContainerManager;
use super::meta::ContainerMeta;
use crate::error::Result;
use crate::events::Event;
use crate::image::ImageConfig;
use tracing::info;

/// The container's effective config, with the image's filling the gaps
fn committed_config(meta: &ContainerMeta, base: &ImageConfig) -> ImageConfig {
    let mut config = meta.config.clone();
    config.merge_image_config(base);

    let mut volumes = base.volumes.clone();
    for volume in config.volumes {
        if !volumes.contains(&volume) {
            volumes.push(volume);
        }
    }
    ImageConfig {
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        env: config.env,
        working_dir: config.working_dir,
        user: config.user,
        labels: config.labels,
        stop_signal: config.stop_signal,
        volumes,
    }
}

impl ContainerManager {
    /// Snapshot the container filesystem into a new image tagged `reference`.
    /// Returns the image ID.
    pub async fn commit(&self, id: &str, reference: &str) -> Result<String> {
        let reference = self.images.check_reference(reference).await?;

        let container = self.registry.get(id)?;
        let meta = container.lock().await;
        let base = self.images.get_oci_image_config(&meta.image).await?;
        let config = committed_config(&meta, &base);

        let image_id = self
            .runtime
            .commit(&meta.id, &meta.snapshot_id, &reference, &config)
            .await?;
        self.images.store_image_reference(&image_id, &reference).await?;

        info!(container = %meta.id, image = %image_id, reference = %reference, "container committed");
        self.events.publish(
            Event::image("commit", &image_id)
                .attr("container", &meta.id)
                .attr("reference", &reference),
        );
        Ok(image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, HostConfig};
    use crate::testing::Harness;

    #[tokio::test]
    async fn test_commit_tags_new_image() {
        let h = Harness::new();
        let mut config = ContainerConfig::new("busybox:latest").env("MODE", "prod");
        config.volumes = vec!["/cache".into()];
        let id = h
            .manager
            .create("builder", config, HostConfig::default())
            .await
            .unwrap()
            .id;

        let image_id = h.manager.commit(&id, "myapp").await.unwrap();

        let (container, reference, config) = h.runtime.commits().pop().unwrap();
        assert_eq!(container, id);
        assert_eq!(reference, "myapp:latest");
        assert_eq!(config.cmd, vec!["sh".to_string()]);
        assert!(config.env.contains(&"MODE=prod".to_string()));
        assert_eq!(config.volumes, vec!["/cache".to_string()]);

        let tagged = h.images.get("myapp:latest").unwrap();
        assert_eq!(tagged.id, image_id);
    }

    #[tokio::test]
    async fn test_commit_rejects_bad_reference() {
        let h = Harness::new();
        let id = h
            .manager
            .create("builder", ContainerConfig::new("busybox:latest"), HostConfig::default())
            .await
            .unwrap()
            .id;
        assert!(h.manager.commit(&id, "Not A Ref").await.is_err());
        assert!(h.runtime.commits().is_empty());
    }
}
