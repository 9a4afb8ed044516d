//! Daemon configuration

use crate::error::{HullError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data directory for containers, volumes and metadata
pub const DEFAULT_HOME_DIR: &str = "/var/lib/hull";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Data directory for containers, volumes and metadata
    pub home_dir: PathBuf,
    /// Volume driver used when a named volume is created on demand
    pub default_volume_driver: String,
    /// Log driver applied when a container does not choose one
    pub default_log_driver: String,
    /// Log drivers accepted in a container's host config
    pub log_drivers: Vec<String>,
    /// Parent cgroup for every container
    pub cgroup_parent: String,
    /// Seconds to wait for graceful stop before force-killing
    pub default_stop_timeout: u64,
    /// Capacity of the lifecycle monitor channel
    pub monitor_capacity: usize,
    /// Interval between snapshot usage refreshes
    #[serde(with = "duration_secs")]
    pub snapshot_sync_interval: Duration,
    /// Polling interval used by log follow to notice a stopped container
    #[serde(with = "duration_millis")]
    pub log_follow_interval: Duration,
    /// First project quota ID handed out by the allocator
    pub quota_base_id: u32,
    /// Default seccomp profile (path to a JSON profile, or "unconfined")
    pub seccomp_profile: Option<String>,
    /// Default AppArmor profile name
    pub apparmor_profile: Option<String>,
    /// Prestart hooks added to every container spec
    pub prestart_hooks: Vec<HookConfig>,
    /// Sysctls applied to every container before its own
    pub default_sysctls: HashMap<String, String>,
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
}

/// Hook executed by the OCI runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from(DEFAULT_HOME_DIR),
            default_volume_driver: "local".to_string(),
            default_log_driver: "json-file".to_string(),
            log_drivers: vec![
                "json-file".to_string(),
                "syslog".to_string(),
                "none".to_string(),
            ],
            cgroup_parent: "default".to_string(),
            default_stop_timeout: 10,
            monitor_capacity: 128,
            snapshot_sync_interval: Duration::from_secs(300),
            log_follow_interval: Duration::from_millis(250),
            quota_base_id: 16_777_216,
            seccomp_profile: None,
            apparmor_profile: None,
            prestart_hooks: Vec::new(),
            default_sysctls: HashMap::new(),
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a YAML or JSON file, picked by extension
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&data)?,
            _ => serde_yaml::from_str(&data)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.home_dir.as_os_str().is_empty() {
            return Err(HullError::InvalidParam("home_dir must not be empty".into()));
        }
        if self.monitor_capacity == 0 {
            return Err(HullError::InvalidParam(
                "monitor_capacity must be greater than zero".into(),
            ));
        }
        if self.snapshot_sync_interval.is_zero() || self.log_follow_interval.is_zero() {
            return Err(HullError::InvalidParam("intervals must be non-zero".into()));
        }
        if !self.log_drivers.contains(&self.default_log_driver) {
            return Err(HullError::InvalidParam(format!(
                "default log driver {} is not a supported log driver",
                self.default_log_driver
            )));
        }
        Ok(())
    }

    /// Directory holding per-container state (checkpoints, logs, rootfs mount points)
    pub fn containers_dir(&self) -> PathBuf {
        self.home_dir.join("containers")
    }

    /// Directory holding local volume data
    pub fn volumes_dir(&self) -> PathBuf {
        self.home_dir.join("volumes")
    }

    /// Directory holding the metadata store
    pub fn meta_dir(&self) -> PathBuf {
        self.home_dir.join("meta")
    }

    /// Directory holding the local image index
    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join("images")
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
