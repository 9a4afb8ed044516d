//! In-memory registry of live containers

use super::meta::{Container, ContainerMeta};
use crate::error::{HullError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Index {
    /// Containers keyed by full ID
    by_id: HashMap<String, Arc<Container>>,
    /// Name to ID
    names: HashMap<String, String>,
}

/// The single source of truth for which containers the daemon knows.
///
/// Membership is guarded by the registry's own lock, which is never held
/// across an await point; container fields are guarded by each container's
/// own mutex.
#[derive(Default)]
pub struct Registry {
    index: RwLock<Index>,
}

fn normalize(name: &str) -> &str {
    name.trim_start_matches('/')
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Index>> {
        self.index
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Index>> {
        self.index
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))
    }

    /// Resolve by exact ID, exact name, or unambiguous ID prefix
    pub fn get(&self, id_or_name: &str) -> Result<Arc<Container>> {
        let index = self.read()?;
        let key = normalize(id_or_name);
        if key.is_empty() {
            return Err(HullError::container_not_found(id_or_name));
        }

        if let Some(c) = index.by_id.get(key) {
            return Ok(c.clone());
        }
        if let Some(id) = index.names.get(key) {
            if let Some(c) = index.by_id.get(id) {
                return Ok(c.clone());
            }
        }

        let mut matched = index.by_id.iter().filter(|(id, _)| id.starts_with(key));
        match (matched.next(), matched.next()) {
            (Some((_, c)), None) => Ok(c.clone()),
            (Some(_), Some(_)) => Err(HullError::TooMany(id_or_name.to_string())),
            (None, _) => Err(HullError::container_not_found(id_or_name)),
        }
    }

    pub fn contains_id(&self, id: &str) -> Result<bool> {
        Ok(self.read()?.by_id.contains_key(id))
    }

    pub fn name_taken(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.names.contains_key(normalize(name)))
    }

    /// Register a container under `name`. Fails without side effects if
    /// either the ID or the name is already known.
    pub fn put(&self, name: &str, container: Arc<Container>) -> Result<()> {
        let mut index = self.write()?;
        let name = normalize(name);
        if index.names.contains_key(name) {
            return Err(HullError::AlreadyExists(format!("container name {}", name)));
        }
        if index.by_id.contains_key(container.id()) {
            return Err(HullError::AlreadyExists(format!(
                "container id {}",
                container.id()
            )));
        }
        index.names.insert(name.to_string(), container.id().to_string());
        index.by_id.insert(container.id().to_string(), container);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Option<Arc<Container>>> {
        let mut index = self.write()?;
        let removed = index.by_id.remove(id);
        if removed.is_some() {
            index.names.retain(|_, v| v != id);
        }
        Ok(removed)
    }

    /// Move the name index entry of `id` to `new_name`
    pub fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        let mut index = self.write()?;
        let new_name = normalize(new_name);
        if let Some(owner) = index.names.get(new_name) {
            if owner == id {
                return Ok(());
            }
            return Err(HullError::AlreadyExists(format!("container name {}", new_name)));
        }
        if !index.by_id.contains_key(id) {
            return Err(HullError::container_not_found(id));
        }
        index.names.retain(|_, v| v != id);
        index.names.insert(new_name.to_string(), id.to_string());
        Ok(())
    }

    /// Stable snapshot of the membership
    pub fn all(&self) -> Result<Vec<Arc<Container>>> {
        Ok(self.read()?.by_id.values().cloned().collect())
    }

    /// Records satisfying `predicate`. A container busy with an operation
    /// is judged by its last published record, so listing never blocks.
    pub fn list<F>(&self, predicate: F) -> Result<Vec<ContainerMeta>>
    where
        F: Fn(&ContainerMeta) -> bool,
    {
        let mut out = Vec::new();
        for c in self.all()? {
            let meta = c.peek()?;
            if predicate(&meta) {
                out.push(meta);
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.by_id.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{ContainerConfig, HostConfig};

    fn container(id: &str) -> Arc<Container> {
        Arc::new(Container::new(ContainerMeta::new(
            id.to_string(),
            format!("n{}", id),
            ContainerConfig::default(),
            HostConfig::default(),
        )))
    }

    #[test]
    fn test_get_by_id_name_and_prefix() {
        let registry = Registry::new();
        registry.put("web", container("abc123")).unwrap();
        registry.put("db", container("abd456")).unwrap();

        assert_eq!(registry.get("abc123").unwrap().id(), "abc123");
        assert_eq!(registry.get("/web").unwrap().id(), "abc123");
        assert_eq!(registry.get("abd").unwrap().id(), "abd456");
        assert!(matches!(registry.get("ab"), Err(HullError::TooMany(_))));
        assert!(registry.get("zz").unwrap_err().is_not_found());
        assert!(registry.get("").unwrap_err().is_not_found());
    }

    #[test]
    fn test_name_prefers_exact_match_over_prefix() {
        let registry = Registry::new();
        registry.put("abc", container("abcdef")).unwrap();
        registry.put("other", container("abc999")).unwrap();
        // "abc" is both a name and an ambiguous prefix; the name wins
        assert_eq!(registry.get("abc").unwrap().id(), "abcdef");
    }

    #[test]
    fn test_put_rejects_duplicate_name_without_mutation() {
        let registry = Registry::new();
        registry.put("web", container("a1")).unwrap();
        let err = registry.put("web", container("b2")).unwrap_err();
        assert!(matches!(err, HullError::AlreadyExists(_)));
        assert_eq!(registry.len().unwrap(), 1);
        assert!(!registry.contains_id("b2").unwrap());
    }

    #[test]
    fn test_rename_and_remove() {
        let registry = Registry::new();
        registry.put("web", container("a1")).unwrap();
        registry.put("db", container("b2")).unwrap();

        assert!(registry.rename("a1", "db").is_err());
        registry.rename("a1", "frontend").unwrap();
        assert!(!registry.name_taken("web").unwrap());
        assert_eq!(registry.get("frontend").unwrap().id(), "a1");

        registry.remove("a1").unwrap();
        assert!(!registry.name_taken("frontend").unwrap());
        assert!(registry.get("a1").is_err());
    }

    #[tokio::test]
    async fn test_list_with_predicate() {
        let registry = Registry::new();
        let a = container("a1");
        a.lock().await.state.set_running(5).unwrap();
        registry.put("a", a).unwrap();
        registry.put("b", container("b2")).unwrap();

        let running = registry.list(|m| m.state.is_running()).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a1");
    }

    #[tokio::test]
    async fn test_list_does_not_wait_for_busy_container() {
        let registry = Registry::new();
        let a = container("a1");
        {
            let mut meta = a.lock().await;
            meta.state.set_running(5).unwrap();
            a.export(&meta).unwrap();
        }
        registry.put("a", a.clone()).unwrap();

        let mut held = a.lock().await;
        held.state.set_paused().unwrap();
        // Unpublished changes stay invisible until exported
        let listed = registry.list(|_| true).unwrap();
        assert!(listed[0].state.is_running());
        assert!(!listed[0].state.is_paused());

        a.export(&held).unwrap();
        assert!(registry.list(|_| true).unwrap()[0].state.is_paused());
        drop(held);
        assert!(a.peek().unwrap().state.is_paused());
    }
}
