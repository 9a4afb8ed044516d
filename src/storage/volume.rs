//! Volume management

use crate::error::{HullError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// The only driver served in-process; others are plugin territory
pub const LOCAL_DRIVER: &str = "local";

/// Volume record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Volume driver
    pub driver: String,
    /// Mount point on host
    pub mountpoint: PathBuf,
    /// Driver options
    pub options: HashMap<String, String>,
    /// Volume labels
    pub labels: HashMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// IDs of the containers the volume is attached to
    pub refs: BTreeSet<String>,
}

impl Volume {
    /// Create a new volume
    pub fn new(name: &str, base_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            driver: LOCAL_DRIVER.to_string(),
            mountpoint: base_path.join(name).join("_data"),
            options: HashMap::new(),
            labels: HashMap::new(),
            created_at: Utc::now(),
            refs: BTreeSet::new(),
        }
    }

    pub fn in_use(&self) -> bool {
        !self.refs.is_empty()
    }

    /// Get size in bytes
    pub fn size(&self) -> Result<u64> {
        if !self.mountpoint.exists() {
            return Ok(0);
        }

        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
            }
        }

        Ok(total)
    }
}

/// Volume manager interface
#[async_trait]
pub trait VolumeMgr: Send + Sync {
    /// Create a volume; an empty name generates one
    async fn create(
        &self,
        name: &str,
        driver: &str,
        options: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> Result<Volume>;

    async fn get(&self, name: &str) -> Result<Volume>;

    /// Record that `container_id` uses the volume. Attaching twice is a no-op.
    async fn attach(&self, name: &str, container_id: &str) -> Result<Volume>;

    /// Drop the reference held by `container_id`
    async fn detach(&self, name: &str, container_id: &str) -> Result<Volume>;

    /// Remove a volume no container is attached to
    async fn remove(&self, name: &str) -> Result<()>;

    /// Host path backing the volume
    async fn path(&self, name: &str) -> Result<PathBuf>;

    async fn list(&self) -> Result<Vec<Volume>>;
}

/// Volumes stored as directories under one base path
pub struct LocalVolumes {
    /// Volumes indexed by name
    volumes: Arc<RwLock<HashMap<String, Volume>>>,
    /// Base path for volume storage
    base_path: PathBuf,
}

impl LocalVolumes {
    /// Open the volume root, loading its index if present
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        let index_path = base_path.join("volumes.json");
        let volumes = if index_path.exists() {
            serde_json::from_slice(&std::fs::read(&index_path)?)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            volumes: Arc::new(RwLock::new(volumes)),
            base_path,
        })
    }

    fn save(&self, volumes: &HashMap<String, Volume>) -> Result<()> {
        let tmp = self.base_path.join("volumes.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(volumes)?)?;
        std::fs::rename(&tmp, self.base_path.join("volumes.json"))?;
        Ok(())
    }

    fn update(
        &self,
        name: &str,
        f: impl FnOnce(&mut Volume) -> Result<()>,
    ) -> Result<Volume> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| HullError::volume_not_found(name))?;
        f(volume)?;
        let volume = volume.clone();
        self.save(&volumes)?;
        Ok(volume)
    }
}

#[async_trait]
impl VolumeMgr for LocalVolumes {
    async fn create(
        &self,
        name: &str,
        driver: &str,
        options: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> Result<Volume> {
        let driver = if driver.is_empty() { LOCAL_DRIVER } else { driver };
        if driver != LOCAL_DRIVER {
            return Err(HullError::InvalidParam(format!(
                "volume driver {} is not supported",
                driver
            )));
        }

        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;

        if volumes.contains_key(name) {
            return Err(HullError::AlreadyExists(format!("volume {}", name)));
        }

        // Generate name if not provided
        let volume_name = if name.is_empty() {
            Uuid::new_v4().simple().to_string()
        } else {
            name.to_string()
        };

        let mut volume = Volume::new(&volume_name, &self.base_path);
        volume.options = options;
        volume.labels = labels;

        // Create the volume directory
        std::fs::create_dir_all(&volume.mountpoint)?;

        volumes.insert(volume_name.clone(), volume.clone());
        self.save(&volumes)?;

        info!(volume = %volume_name, "created volume");
        Ok(volume)
    }

    async fn get(&self, name: &str) -> Result<Volume> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| HullError::volume_not_found(name))
    }

    async fn attach(&self, name: &str, container_id: &str) -> Result<Volume> {
        self.update(name, |v| {
            v.refs.insert(container_id.to_string());
            Ok(())
        })
    }

    async fn detach(&self, name: &str, container_id: &str) -> Result<Volume> {
        self.update(name, |v| {
            v.refs.remove(container_id);
            Ok(())
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get(name)
            .ok_or_else(|| HullError::volume_not_found(name))?;

        // Check if volume is in use
        if volume.in_use() {
            return Err(HullError::InvalidState(format!(
                "volume {} is in use by {} container(s)",
                name,
                volume.refs.len()
            )));
        }

        let dir = self.base_path.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        volumes.remove(name);
        self.save(&volumes)?;

        info!(volume = %name, "removed volume");
        Ok(())
    }

    async fn path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.get(name).await?.mountpoint)
    }

    async fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes.values().cloned().collect())
    }
}

/// Decorator that traces every call to the wrapped volume manager
pub struct TracedVolumes {
    inner: Arc<dyn VolumeMgr>,
}

impl TracedVolumes {
    pub fn new(inner: Arc<dyn VolumeMgr>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl VolumeMgr for TracedVolumes {
    async fn create(
        &self,
        name: &str,
        driver: &str,
        options: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> Result<Volume> {
        let result = self.inner.create(name, driver, options, labels).await;
        debug!(volume = name, driver, ok = result.is_ok(), "volume create");
        result
    }

    async fn get(&self, name: &str) -> Result<Volume> {
        let result = self.inner.get(name).await;
        debug!(volume = name, ok = result.is_ok(), "volume get");
        result
    }

    async fn attach(&self, name: &str, container_id: &str) -> Result<Volume> {
        let result = self.inner.attach(name, container_id).await;
        debug!(volume = name, container = container_id, ok = result.is_ok(), "volume attach");
        result
    }

    async fn detach(&self, name: &str, container_id: &str) -> Result<Volume> {
        let result = self.inner.detach(name, container_id).await;
        debug!(volume = name, container = container_id, ok = result.is_ok(), "volume detach");
        result
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let result = self.inner.remove(name).await;
        debug!(volume = name, ok = result.is_ok(), "volume remove");
        result
    }

    async fn path(&self, name: &str) -> Result<PathBuf> {
        self.inner.path(name).await
    }

    async fn list(&self) -> Result<Vec<Volume>> {
        self.inner.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_volume() {
        let temp = tempdir().unwrap();
        let manager = LocalVolumes::new(temp.path().to_path_buf()).unwrap();

        let volume = manager
            .create("test-volume", "", HashMap::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(volume.name, "test-volume");
        assert!(volume.mountpoint.exists());

        let err = manager
            .create("test-volume", "local", HashMap::new(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HullError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let temp = tempdir().unwrap();
        let manager = LocalVolumes::new(temp.path().to_path_buf()).unwrap();
        let err = manager
            .create("v", "nfs", HashMap::new(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HullError::InvalidParam(_)));
    }

    #[tokio::test]
    async fn test_attach_detach_and_remove() {
        let temp = tempdir().unwrap();
        let manager = LocalVolumes::new(temp.path().to_path_buf()).unwrap();
        manager
            .create("data", "", HashMap::new(), HashMap::new())
            .await
            .unwrap();

        manager.attach("data", "c1").await.unwrap();
        manager.attach("data", "c1").await.unwrap();
        let volume = manager.attach("data", "c2").await.unwrap();
        assert_eq!(volume.refs.len(), 2);

        assert!(manager.remove("data").await.is_err());

        manager.detach("data", "c1").await.unwrap();
        manager.detach("data", "c2").await.unwrap();
        manager.remove("data").await.unwrap();
        assert!(manager.get("data").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_references_persist() {
        let temp = tempdir().unwrap();
        {
            let manager = LocalVolumes::new(temp.path().to_path_buf()).unwrap();
            manager
                .create("data", "", HashMap::new(), HashMap::new())
                .await
                .unwrap();
            manager.attach("data", "c1").await.unwrap();
        }
        let manager = LocalVolumes::new(temp.path().to_path_buf()).unwrap();
        assert!(manager.get("data").await.unwrap().in_use());
    }

    #[tokio::test]
    async fn test_generated_name() {
        let temp = tempdir().unwrap();
        let manager = TracedVolumes::new(Arc::new(
            LocalVolumes::new(temp.path().to_path_buf()).unwrap(),
        ));
        let volume = manager
            .create("", "", HashMap::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(volume.name.len(), 32);
        assert_eq!(manager.path(&volume.name).await.unwrap(), volume.mountpoint);
    }
}
