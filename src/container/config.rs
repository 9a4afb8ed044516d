//! Container configuration

use crate::error::{HullError, Result};
use crate::image::ImageConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Process-level configuration fixed at creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image reference as given by the user (e.g. `busybox:latest`)
    pub image: String,
    /// Command to run
    pub cmd: Vec<String>,
    /// Entry point
    pub entrypoint: Vec<String>,
    /// Environment variables in `KEY=VALUE` form
    pub env: Vec<String>,
    /// Working directory
    pub working_dir: String,
    /// User to run as (`uid[:gid]`)
    pub user: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Hostname
    pub hostname: String,
    /// Domain name
    pub domainname: String,
    /// Allocate a TTY
    pub tty: bool,
    /// Keep stdin open
    pub open_stdin: bool,
    /// Volume destinations declared by the container config
    pub volumes: Vec<String>,
    /// Signal sent on graceful stop
    pub stop_signal: String,
    /// Seconds to wait before force-killing on stop
    pub stop_timeout: Option<u64>,
    /// Disk quota per mount destination (`"/"` means the rootfs), e.g. `10g`
    pub disk_quota: HashMap<String, String>,
    /// Explicit project quota ID. `"-1"` asks the daemon to allocate one.
    pub quota_id: String,
    /// Annotations copied verbatim into the OCI spec
    pub spec_annotation: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// Set command to run
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: &str) -> Self {
        self.working_dir = dir.to_string();
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Fill unset fields from the image's own configuration.
    ///
    /// Used when creating a container and when upgrading it onto a new image.
    pub fn merge_image_config(&mut self, image: &ImageConfig) {
        if self.cmd.is_empty() && self.entrypoint.is_empty() {
            self.cmd = image.cmd.clone();
        }
        if self.entrypoint.is_empty() {
            self.entrypoint = image.entrypoint.clone();
        }
        if self.working_dir.is_empty() {
            self.working_dir = image.working_dir.clone();
        }
        if self.user.is_empty() {
            self.user = image.user.clone();
        }
        if self.stop_signal.is_empty() {
            self.stop_signal = image.stop_signal.clone();
        }

        // Image env is the base layer; keys set by the container win
        let own_keys: Vec<&str> = self.env.iter().map(|e| env_key(e)).collect();
        let mut env: Vec<String> = image
            .env
            .iter()
            .filter(|e| !own_keys.contains(&env_key(e)))
            .cloned()
            .collect();
        env.append(&mut self.env);
        self.env = env;

        for (k, v) in &image.labels {
            self.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Full process argv: entrypoint followed by cmd
    pub fn args(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

/// Host-level configuration: resources, mounts, namespaces, logging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Bind mounts in `host:container[:mode]` or `volume:container[:mode]` form
    pub binds: Vec<String>,
    /// Containers whose mounts are inherited (`id[:ro|rw]`)
    pub volumes_from: Vec<String>,
    /// Driver for volumes created on demand
    pub volume_driver: String,
    /// `bridge`, `host`, `none` or `container:<id>`
    pub network_mode: String,
    /// `private`, `host`, `shareable` or `container:<id>`
    pub ipc_mode: String,
    /// `host` or `container:<id>`; empty means private
    pub pid_mode: String,
    /// `host` or empty
    pub uts_mode: String,
    /// `host` or empty
    pub userns_mode: String,
    /// Privileged mode
    pub privileged: bool,
    /// Read-only root filesystem
    pub readonly_rootfs: bool,
    /// Capabilities added on top of the default set
    pub cap_add: Vec<String>,
    /// Capabilities removed from the default set
    pub cap_drop: Vec<String>,
    /// Host devices made available to the container
    pub devices: Vec<DeviceMapping>,
    /// Namespaced kernel parameters
    pub sysctls: HashMap<String, String>,
    /// `seccomp=<profile>`, `apparmor=<profile>`, `no-new-privileges`
    pub security_opt: Vec<String>,
    /// Additional groups for the process
    pub group_add: Vec<u32>,
    /// OOM score adjustment
    pub oom_score_adj: Option<i32>,
    /// Size of `/dev/shm` in bytes
    pub shm_size: Option<i64>,
    /// Tmpfs mounts: destination -> options
    pub tmpfs: HashMap<String, String>,
    /// Resource limits
    pub resources: Resources,
    /// Logging configuration
    pub log_config: LogConfig,
    /// Restart policy
    pub restart_policy: RestartPolicy,
}

impl HostConfig {
    /// Security option value for `key` (e.g. `seccomp` in `seccomp=unconfined`)
    pub fn security_opt(&self, key: &str) -> Option<&str> {
        self.security_opt.iter().find_map(|opt| {
            opt.split_once('=')
                .or_else(|| opt.split_once(':'))
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// Resource limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU shares (relative weight)
    pub cpu_shares: Option<u64>,
    /// CPU CFS period in microseconds
    pub cpu_period: Option<u64>,
    /// CPU CFS quota in microseconds
    pub cpu_quota: Option<i64>,
    /// CPUs in which to allow execution (`0-3`, `0,1`)
    pub cpuset_cpus: String,
    /// Memory nodes in which to allow execution
    pub cpuset_mems: String,
    /// Memory limit in bytes
    pub memory: Option<i64>,
    /// Memory plus swap limit in bytes; `-1` is unlimited
    pub memory_swap: Option<i64>,
    /// Memory soft limit in bytes
    pub memory_reservation: Option<i64>,
    /// Swappiness, 0-100
    pub memory_swappiness: Option<u64>,
    /// Disable the OOM killer
    pub oom_kill_disable: Option<bool>,
    /// PIDs limit
    pub pids_limit: Option<i64>,
    /// Block IO weight, 10-1000
    pub blkio_weight: Option<u16>,
    /// Per-device block IO weight
    pub blkio_weight_device: Vec<WeightDevice>,
    /// Per-device read limit in bytes per second
    pub blkio_device_read_bps: Vec<ThrottleDevice>,
    /// Per-device write limit in bytes per second
    pub blkio_device_write_bps: Vec<ThrottleDevice>,
    /// Memory watermark ratio for background reclaim, 0-100
    pub memory_wmark_ratio: Option<i64>,
    /// Extra memory over the limit the container may borrow, 0-100 percent
    pub memory_extra: Option<i64>,
    /// Force empty memory cgroup on destroy, 0 or 1
    pub memory_force_empty_ctl: Option<i64>,
    /// Scheduler latency statistics switch, 0 or 1
    pub schedule_latency_switch: Option<i64>,
}

impl Resources {
    /// Reject values the kernel would refuse
    pub fn validate(&self) -> Result<()> {
        if let Some(mem) = self.memory {
            if mem != 0 && mem < 4 * 1024 * 1024 {
                return Err(HullError::InvalidParam(
                    "minimum memory limit allowed is 4MB".into(),
                ));
            }
            if let Some(swap) = self.memory_swap {
                if swap > 0 && swap < mem {
                    return Err(HullError::InvalidParam(
                        "memory swap must be larger than memory limit".into(),
                    ));
                }
            }
        }
        if let Some(s) = self.memory_swappiness {
            if s > 100 {
                return Err(HullError::InvalidParam(format!(
                    "invalid memory swappiness {}: must be between 0 and 100",
                    s
                )));
            }
        }
        if let Some(w) = self.blkio_weight {
            if w != 0 && !(10..=1000).contains(&w) {
                return Err(HullError::InvalidParam(format!(
                    "invalid blkio weight {}: must be between 10 and 1000",
                    w
                )));
            }
        }
        for (name, value, max) in [
            ("memory wmark ratio", self.memory_wmark_ratio, 100),
            ("memory extra", self.memory_extra, 100),
            ("memory force empty ctl", self.memory_force_empty_ctl, 1),
            ("schedule latency switch", self.schedule_latency_switch, 1),
        ] {
            if let Some(v) = value {
                if !(0..=max).contains(&v) {
                    return Err(HullError::InvalidParam(format!(
                        "invalid {} {}: must be between 0 and {}",
                        name, v, max
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Host device exposed to the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    /// Cgroup permissions, subset of `rwm`
    pub cgroup_permissions: String,
}

impl DeviceMapping {
    /// Parse `host[:container[:perms]]`
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (host, container, perms) = match parts.as_slice() {
            [host] => (*host, *host, "rwm"),
            [host, container] => (*host, *container, "rwm"),
            [host, container, perms] => (*host, *container, *perms),
            _ => return Err(HullError::InvalidParam(format!("invalid device {}", spec))),
        };
        if host.is_empty() || !perms.chars().all(|c| "rwm".contains(c)) {
            return Err(HullError::InvalidParam(format!("invalid device {}", spec)));
        }
        Ok(Self {
            path_on_host: host.to_string(),
            path_in_container: container.to_string(),
            cgroup_permissions: perms.to_string(),
        })
    }
}

/// Block IO weight for one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightDevice {
    pub path: String,
    pub weight: u16,
}

/// Block IO rate limit for one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleDevice {
    pub path: String,
    pub rate: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log driver name; empty means the daemon default
    pub driver: String,
    pub options: HashMap<String, String>,
}

/// Restart policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// `no`, `always`, `on-failure` or `unless-stopped`
    pub name: String,
    pub maximum_retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_image_config() {
        let mut config = ContainerConfig::new("busybox:latest").env("FOO", "container");
        let image = ImageConfig {
            cmd: vec!["sh".to_string()],
            env: vec!["PATH=/bin".to_string(), "FOO=image".to_string()],
            working_dir: "/app".to_string(),
            labels: HashMap::from([("maintainer".to_string(), "x".to_string())]),
            ..Default::default()
        };

        config.merge_image_config(&image);

        assert_eq!(config.cmd, vec!["sh".to_string()]);
        assert_eq!(config.working_dir, "/app");
        assert_eq!(
            config.env,
            vec!["PATH=/bin".to_string(), "FOO=container".to_string()]
        );
        assert_eq!(config.labels.get("maintainer").unwrap(), "x");
    }

    #[test]
    fn test_merge_keeps_explicit_cmd() {
        let mut config = ContainerConfig::new("busybox").cmd(vec!["top".to_string()]);
        let image = ImageConfig {
            cmd: vec!["sh".to_string()],
            entrypoint: vec!["/init".to_string()],
            ..Default::default()
        };
        config.merge_image_config(&image);
        assert_eq!(config.args(), vec!["/init".to_string(), "top".to_string()]);
    }

    #[test]
    fn test_resources_validate() {
        let ok = Resources {
            memory: Some(64 * 1024 * 1024),
            memory_swap: Some(-1),
            memory_swappiness: Some(60),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let small = Resources {
            memory: Some(1024),
            ..Default::default()
        };
        assert!(small.validate().is_err());

        let bad_ratio = Resources {
            memory_wmark_ratio: Some(120),
            ..Default::default()
        };
        assert!(bad_ratio.validate().is_err());
    }

    #[test]
    fn test_device_parse() {
        let dev = DeviceMapping::parse("/dev/fuse").unwrap();
        assert_eq!(dev.path_in_container, "/dev/fuse");
        assert_eq!(dev.cgroup_permissions, "rwm");

        let dev = DeviceMapping::parse("/dev/sda:/dev/xvda:r").unwrap();
        assert_eq!(dev.path_in_container, "/dev/xvda");
        assert!(DeviceMapping::parse("/dev/sda:/dev/xvda:rx").is_err());
    }

    #[test]
    fn test_security_opt_lookup() {
        let host = HostConfig {
            security_opt: vec!["seccomp=unconfined".into(), "apparmor:hull-default".into()],
            ..Default::default()
        };
        assert_eq!(host.security_opt("seccomp"), Some("unconfined"));
        assert_eq!(host.security_opt("apparmor"), Some("hull-default"));
        assert_eq!(host.security_opt("label"), None);
    }
}
