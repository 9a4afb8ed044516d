//! List filters over containers

use super::meta::ContainerMeta;
use crate::error::{HullError, Result};
use std::collections::HashMap;

const FILTER_KEYS: &[&str] = &["id", "name", "status", "label", "ancestor"];

/// Filters of the form `key -> [values]`; values of one key are OR-ed,
/// keys are AND-ed.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    args: HashMap<String, Vec<String>>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, key: &str, value: &str) -> Self {
        self.args
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn from_map(args: HashMap<String, Vec<String>>) -> Result<Self> {
        let filters = Self { args };
        filters.validate()?;
        Ok(filters)
    }

    pub fn validate(&self) -> Result<()> {
        for key in self.args.keys() {
            if !FILTER_KEYS.contains(&key.as_str()) {
                return Err(HullError::InvalidParam(format!("invalid filter {}", key)));
            }
        }
        for status in self.args.get("status").into_iter().flatten() {
            status.parse::<super::state::Status>()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn get(&self, key: &str) -> &[String] {
        self.args.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether a container record passes every filter
    pub fn matches(&self, meta: &ContainerMeta) -> bool {
        let ids = self.get("id");
        if !ids.is_empty() && !ids.iter().any(|id| meta.id.starts_with(id.as_str())) {
            return false;
        }

        let names = self.get("name");
        if !names.is_empty()
            && !names
                .iter()
                .any(|n| meta.name.contains(n.trim_start_matches('/')))
        {
            return false;
        }

        let statuses = self.get("status");
        if !statuses.is_empty()
            && !statuses
                .iter()
                .any(|s| s == meta.state.status().as_str())
        {
            return false;
        }

        let ancestors = self.get("ancestor");
        if !ancestors.is_empty()
            && !ancestors
                .iter()
                .any(|a| *a == meta.config.image || meta.image.starts_with(a.as_str()))
        {
            return false;
        }

        match_kv_list(self.get("label"), &meta.config.labels)
    }
}

/// Label matching: every source must match.
///
/// A source is `key` (present), `key=value` (present with value) or
/// `key!=value` (absent, or present with another value).
pub fn match_kv_list(sources: &[String], labels: &HashMap<String, String>) -> bool {
    sources.iter().all(|source| {
        if let Some((key, value)) = source.split_once("!=") {
            return labels.get(key).map(|v| v != value).unwrap_or(true);
        }
        match source.split_once('=') {
            Some((key, value)) => labels.get(key).map(|v| v == value).unwrap_or(false),
            None => labels.contains_key(source.as_str()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{ContainerConfig, HostConfig};
    use crate::container::meta::generate_id;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_match_kv_list_not_equal() {
        let filter = vec!["env!=prod".to_string()];
        assert!(match_kv_list(&filter, &labels(&[])));
        assert!(match_kv_list(&filter, &labels(&[("env", "dev")])));
        assert!(!match_kv_list(&filter, &labels(&[("env", "prod")])));
    }

    #[test]
    fn test_match_kv_list_presence_and_equality() {
        let set = labels(&[("app", "web"), ("tier", "front")]);
        assert!(match_kv_list(&["app".to_string()], &set));
        assert!(match_kv_list(&["app=web".to_string(), "tier".to_string()], &set));
        assert!(!match_kv_list(&["app=db".to_string()], &set));
        assert!(!match_kv_list(&["owner".to_string()], &set));
    }

    #[test]
    fn test_filters_status_and_name() {
        let mut meta = ContainerMeta::new(
            generate_id(),
            "web-1".into(),
            ContainerConfig::new("busybox:latest").label("app", "web"),
            HostConfig::default(),
        );

        let running = Filters::new().add("status", "running");
        assert!(!running.matches(&meta));
        meta.state.set_running(10).unwrap();
        assert!(running.matches(&meta));

        assert!(Filters::new().add("name", "web").matches(&meta));
        assert!(!Filters::new().add("name", "db").matches(&meta));
        assert!(Filters::new()
            .add("ancestor", "busybox:latest")
            .add("label", "app=web")
            .matches(&meta));
    }

    #[test]
    fn test_filters_reject_unknown_key() {
        let args = HashMap::from([("color".to_string(), vec!["red".to_string()])]);
        assert!(Filters::from_map(args).is_err());
        let args = HashMap::from([("status".to_string(), vec!["sleeping".to_string()])]);
        assert!(Filters::from_map(args).is_err());
    }
}
