//! Image management module
//!
//! The lifecycle manager only needs to resolve image references and read
//! image configuration; pulling and content storage belong to the image
//! service behind [`ImageMgr`].

pub mod store;

pub use store::{Image, ImageConfig, ImageStore};

use crate::error::{HullError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Image manager interface
#[async_trait]
pub trait ImageMgr: Send + Sync {
    /// Resolve a reference (tag, ID or ID prefix) to a local image
    async fn get_image(&self, reference: &str) -> Result<Image>;

    /// Validate a reference and return its normalized `name:tag` form
    async fn check_reference(&self, reference: &str) -> Result<String>;

    /// Configuration declared by the image
    async fn get_oci_image_config(&self, image_id: &str) -> Result<ImageConfig>;

    /// Point `reference` at `image_id`
    async fn store_image_reference(&self, image_id: &str, reference: &str) -> Result<()>;
}

/// Add the default `latest` tag and validate the reference grammar
pub fn normalize_reference(reference: &str) -> Result<String> {
    static REF_RE: OnceLock<Regex> = OnceLock::new();
    let re = REF_RE.get_or_init(|| {
        Regex::new(
            r"^([a-z0-9.-]+(:[0-9]+)?/)?[a-z0-9]+([._/-][a-z0-9]+)*(:[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?(@sha256:[a-f0-9]{64})?$",
        )
        .expect("static regex is valid")
    });

    if !re.is_match(reference) {
        return Err(HullError::InvalidParam(format!(
            "invalid image reference {}",
            reference
        )));
    }
    if reference.contains('@') {
        return Ok(reference.to_string());
    }

    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') {
        Ok(reference.to_string())
    } else {
        Ok(format!("{}:latest", reference))
    }
}

/// Decorator that traces every call to the wrapped image manager
pub struct TracedImages {
    inner: Arc<dyn ImageMgr>,
}

impl TracedImages {
    pub fn new(inner: Arc<dyn ImageMgr>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ImageMgr for TracedImages {
    async fn get_image(&self, reference: &str) -> Result<Image> {
        let result = self.inner.get_image(reference).await;
        debug!(reference, ok = result.is_ok(), "image get");
        result
    }

    async fn check_reference(&self, reference: &str) -> Result<String> {
        let result = self.inner.check_reference(reference).await;
        debug!(reference, ok = result.is_ok(), "image check reference");
        result
    }

    async fn get_oci_image_config(&self, image_id: &str) -> Result<ImageConfig> {
        let result = self.inner.get_oci_image_config(image_id).await;
        debug!(image = image_id, ok = result.is_ok(), "image config");
        result
    }

    async fn store_image_reference(&self, image_id: &str, reference: &str) -> Result<()> {
        let result = self.inner.store_image_reference(image_id, reference).await;
        debug!(image = image_id, reference, ok = result.is_ok(), "image store reference");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reference() {
        assert_eq!(normalize_reference("busybox").unwrap(), "busybox:latest");
        assert_eq!(normalize_reference("busybox:1.36").unwrap(), "busybox:1.36");
        assert_eq!(
            normalize_reference("registry.local:5000/team/app").unwrap(),
            "registry.local:5000/team/app:latest"
        );
        assert!(normalize_reference("Busybox").is_err());
        assert!(normalize_reference("busy box").is_err());
    }

    #[tokio::test]
    async fn test_traced_images_delegates() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = ImageStore::new(temp.path().to_path_buf()).unwrap();
        let mut image = Image::new("sha256:abcd1234", ImageConfig::default());
        image.repo_tags.push("app:v1".to_string());
        store.store(image).unwrap();

        let traced = TracedImages::new(Arc::new(store));
        assert_eq!(traced.get_image("app:v1").await.unwrap().id, "sha256:abcd1234");
        traced
            .store_image_reference("sha256:abcd1234", "app")
            .await
            .unwrap();
        assert_eq!(traced.get_image("app").await.unwrap().id, "sha256:abcd1234");
    }
}
