//! Image store - local index of images known to the daemon

use super::{normalize_reference, ImageMgr};
use crate::error::{HullError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Container image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    /// Image ID (sha256 digest)
    pub id: String,
    /// Repository tags (e.g., ["nginx:latest", "nginx:1.21"])
    pub repo_tags: Vec<String>,
    /// Created timestamp
    pub created: DateTime<Utc>,
    /// Image configuration
    pub config: ImageConfig,
    /// Image size in bytes
    pub size: u64,
}

impl Image {
    pub fn new(id: &str, config: ImageConfig) -> Self {
        Self {
            id: id.to_string(),
            repo_tags: Vec::new(),
            created: Utc::now(),
            config,
            size: 0,
        }
    }
}

/// Image-declared configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub user: String,
    pub labels: HashMap<String, String>,
    pub stop_signal: String,
    /// Volume destinations declared by the image
    pub volumes: Vec<String>,
}

#[derive(Default, Serialize, Deserialize)]
struct Index {
    /// Images indexed by ID
    images: HashMap<String, Image>,
    /// Tag to ID mapping
    tags: HashMap<String, String>,
}

/// Image store for managing local images
pub struct ImageStore {
    index: Arc<RwLock<Index>>,
    /// Storage path
    storage_path: PathBuf,
}

impl ImageStore {
    /// Open (or create) an image store, loading its index if present
    pub fn new(storage_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&storage_path)?;
        let index_path = storage_path.join("index.json");
        let index = if index_path.exists() {
            serde_json::from_slice(&std::fs::read(&index_path)?)?
        } else {
            Index::default()
        };

        Ok(Self {
            index: Arc::new(RwLock::new(index)),
            storage_path,
        })
    }

    fn save(&self, index: &Index) -> Result<()> {
        let tmp = self.storage_path.join("index.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(index)?)?;
        std::fs::rename(&tmp, self.storage_path.join("index.json"))?;
        Ok(())
    }

    /// Store an image
    pub fn store(&self, image: Image) -> Result<()> {
        let mut index = self
            .index
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;

        for tag in &image.repo_tags {
            index.tags.insert(tag.clone(), image.id.clone());
        }
        index.images.insert(image.id.clone(), image);
        self.save(&index)
    }

    /// Get image by ID, tag or unambiguous ID prefix
    pub fn get(&self, reference: &str) -> Result<Image> {
        let index = self
            .index
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;

        if let Some(image) = index.images.get(reference) {
            return Ok(image.clone());
        }

        if let Ok(normalized) = normalize_reference(reference) {
            if let Some(image) = index.tags.get(&normalized).and_then(|id| index.images.get(id)) {
                return Ok(image.clone());
            }
        }

        let bare = reference.strip_prefix("sha256:").unwrap_or(reference);
        let mut matched = index
            .images
            .iter()
            .filter(|(id, _)| id.strip_prefix("sha256:").unwrap_or(id.as_str()).starts_with(bare));
        match (matched.next(), matched.next()) {
            (Some((_, image)), None) if bare.len() >= 4 => Ok(image.clone()),
            (Some(_), Some(_)) => Err(HullError::TooMany(reference.to_string())),
            _ => Err(HullError::image_not_found(reference)),
        }
    }

    /// Tag an image
    pub fn tag(&self, id: &str, reference: &str) -> Result<()> {
        let mut index = self
            .index
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;

        if !index.images.contains_key(id) {
            return Err(HullError::image_not_found(id));
        }

        // Move the tag off whichever image held it before
        if let Some(previous) = index.tags.insert(reference.to_string(), id.to_string()) {
            if let Some(image) = index.images.get_mut(&previous) {
                image.repo_tags.retain(|t| t != reference);
            }
        }
        if let Some(image) = index.images.get_mut(id) {
            image.repo_tags.push(reference.to_string());
        }
        self.save(&index)
    }

    /// List all images
    pub fn list(&self) -> Result<Vec<Image>> {
        let index = self
            .index
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(index.images.values().cloned().collect())
    }
}

#[async_trait]
impl ImageMgr for ImageStore {
    async fn get_image(&self, reference: &str) -> Result<Image> {
        self.get(reference)
    }

    async fn check_reference(&self, reference: &str) -> Result<String> {
        normalize_reference(reference)
    }

    async fn get_oci_image_config(&self, image_id: &str) -> Result<ImageConfig> {
        Ok(self.get(image_id)?.config)
    }

    async fn store_image_reference(&self, image_id: &str, reference: &str) -> Result<()> {
        let reference = normalize_reference(reference)?;
        self.tag(image_id, &reference)
    }
}
