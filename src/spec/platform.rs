//! Platform security: sysctls, masked paths, AppArmor and seccomp
//!
//! Seccomp and AppArmor support is chosen when the crate is built. Each is
//! a strategy object picked by [`seccomp_strategy`] / [`apparmor_strategy`]
//! according to the `seccomp` and `apparmor` cargo features; the pipeline
//! never branches on platform support at run time.

use super::{SetupContext, SetupStep, SpecWrapper};
use crate::config::DaemonConfig;
use crate::container::{ContainerMeta, HostConfig};
use crate::error::{HullError, Result};
use oci_spec::runtime::{
    LinuxSeccomp, LinuxSeccompAction, LinuxSeccompBuilder, LinuxSyscallBuilder,
};
use std::collections::HashMap;
use tracing::debug;

const UNCONFINED: &str = "unconfined";

/// IPC sysctls that are namespaced by the kernel
const IPC_SYSCTLS: &[&str] = &[
    "kernel.msgmax",
    "kernel.msgmnb",
    "kernel.msgmni",
    "kernel.sem",
    "kernel.shmall",
    "kernel.shmmax",
    "kernel.shmmni",
    "kernel.shm_rmid_forced",
];

/// Syscalls refused by the built-in seccomp profile
const BLOCKED_SYSCALLS: &[&str] = &[
    "acct",
    "add_key",
    "bpf",
    "clock_adjtime",
    "clock_settime",
    "create_module",
    "delete_module",
    "finit_module",
    "get_kernel_syms",
    "get_mempolicy",
    "init_module",
    "ioperm",
    "iopl",
    "kcmp",
    "kexec_file_load",
    "kexec_load",
    "keyctl",
    "lookup_dcookie",
    "mbind",
    "mount",
    "move_pages",
    "name_to_handle_at",
    "nfsservctl",
    "open_by_handle_at",
    "perf_event_open",
    "personality",
    "pivot_root",
    "process_vm_readv",
    "process_vm_writev",
    "ptrace",
    "query_module",
    "quotactl",
    "reboot",
    "request_key",
    "set_mempolicy",
    "setns",
    "settimeofday",
    "stime",
    "swapoff",
    "swapon",
    "sysfs",
    "_sysctl",
    "umount",
    "umount2",
    "unshare",
    "uselib",
    "userfaultfd",
    "ustat",
    "vm86",
    "vm86old",
];

/// Seccomp support as bound at build time
pub trait SeccompProfile: Send + Sync {
    /// Filter for a container, given its `seccomp=` security option
    fn profile(&self, requested: Option<&str>, privileged: bool) -> Result<Option<LinuxSeccomp>>;
}

/// AppArmor support as bound at build time
pub trait AppArmorProfile: Send + Sync {
    /// Profile name for a container, given its `apparmor=` security option
    fn profile(&self, requested: Option<&str>, privileged: bool) -> Result<Option<String>>;
}

/// Profile applied when neither the container nor the daemon names one
pub fn default_seccomp() -> Result<LinuxSeccomp> {
    let blocked = LinuxSyscallBuilder::default()
        .names(BLOCKED_SYSCALLS.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .action(LinuxSeccompAction::ScmpActErrno)
        .errno_ret(libc::EPERM as u32)
        .build()?;
    Ok(LinuxSeccompBuilder::default()
        .default_action(LinuxSeccompAction::ScmpActAllow)
        .syscalls(vec![blocked])
        .build()?)
}

fn load_seccomp(path: &str) -> Result<LinuxSeccomp> {
    let data = std::fs::read(path).map_err(|e| {
        HullError::InvalidParam(format!("failed to read seccomp profile {}: {}", path, e))
    })?;
    serde_json::from_slice(&data).map_err(|e| {
        HullError::InvalidParam(format!("failed to parse seccomp profile {}: {}", path, e))
    })
}

pub struct SeccompEnabled {
    default_profile: Option<String>,
}

impl SeccompEnabled {
    pub fn new(default_profile: Option<String>) -> Self {
        Self { default_profile }
    }
}

impl SeccompProfile for SeccompEnabled {
    fn profile(&self, requested: Option<&str>, privileged: bool) -> Result<Option<LinuxSeccomp>> {
        if privileged {
            return Ok(None);
        }
        match requested.or(self.default_profile.as_deref()) {
            Some(UNCONFINED) => Ok(None),
            Some(path) => load_seccomp(path).map(Some),
            None => default_seccomp().map(Some),
        }
    }
}

pub struct SeccompUnsupported;

impl SeccompProfile for SeccompUnsupported {
    fn profile(&self, requested: Option<&str>, _privileged: bool) -> Result<Option<LinuxSeccomp>> {
        match requested {
            Some(p) if p != UNCONFINED => Err(HullError::InvalidParam(
                "seccomp is not supported by this build".into(),
            )),
            _ => Ok(None),
        }
    }
}

pub struct AppArmorEnabled {
    default_profile: Option<String>,
}

impl AppArmorEnabled {
    pub fn new(default_profile: Option<String>) -> Self {
        Self { default_profile }
    }
}

impl AppArmorProfile for AppArmorEnabled {
    fn profile(&self, requested: Option<&str>, privileged: bool) -> Result<Option<String>> {
        match requested {
            Some(UNCONFINED) => Ok(None),
            Some(name) => Ok(Some(name.to_string())),
            None if privileged => Ok(None),
            None => Ok(self.default_profile.clone()),
        }
    }
}

pub struct AppArmorUnsupported;

impl AppArmorProfile for AppArmorUnsupported {
    fn profile(&self, requested: Option<&str>, _privileged: bool) -> Result<Option<String>> {
        match requested {
            Some(p) if p != UNCONFINED => Err(HullError::InvalidParam(
                "apparmor is not supported by this build".into(),
            )),
            _ => Ok(None),
        }
    }
}

#[cfg(feature = "seccomp")]
pub fn seccomp_strategy(config: &DaemonConfig) -> Box<dyn SeccompProfile> {
    Box::new(SeccompEnabled::new(config.seccomp_profile.clone()))
}

#[cfg(not(feature = "seccomp"))]
pub fn seccomp_strategy(_config: &DaemonConfig) -> Box<dyn SeccompProfile> {
    Box::new(SeccompUnsupported)
}

#[cfg(feature = "apparmor")]
pub fn apparmor_strategy(config: &DaemonConfig) -> Box<dyn AppArmorProfile> {
    Box::new(AppArmorEnabled::new(config.apparmor_profile.clone()))
}

#[cfg(not(feature = "apparmor"))]
pub fn apparmor_strategy(_config: &DaemonConfig) -> Box<dyn AppArmorProfile> {
    Box::new(AppArmorUnsupported)
}

/// Check that a sysctl is namespaced and its namespace is private
pub fn validate_sysctl(key: &str, host: &HostConfig) -> Result<()> {
    if IPC_SYSCTLS.contains(&key) || key.starts_with("fs.mqueue.") {
        if host.ipc_mode == "host" {
            return Err(HullError::InvalidParam(format!(
                "sysctl {} is not allowed in the host ipc namespace",
                key
            )));
        }
        return Ok(());
    }
    if key.starts_with("net.") {
        if host.network_mode == "host" {
            return Err(HullError::InvalidParam(format!(
                "sysctl {} is not allowed in the host network namespace",
                key
            )));
        }
        return Ok(());
    }
    Err(HullError::InvalidParam(format!(
        "sysctl {} is not namespaced",
        key
    )))
}

pub struct PlatformStep {
    seccomp: Box<dyn SeccompProfile>,
    apparmor: Box<dyn AppArmorProfile>,
}

impl PlatformStep {
    pub fn new(seccomp: Box<dyn SeccompProfile>, apparmor: Box<dyn AppArmorProfile>) -> Self {
        Self { seccomp, apparmor }
    }
}

impl SetupStep for PlatformStep {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn setup(&self, ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        let host = &meta.host_config;

        let mut sysctls: HashMap<String, String> = HashMap::new();
        for (key, value) in &ctx.config.default_sysctls {
            match validate_sysctl(key, host) {
                Ok(()) => {
                    sysctls.insert(key.clone(), value.clone());
                }
                Err(e) => debug!(container = %meta.id, "skip default sysctl: {}", e),
            }
        }
        for (key, value) in &host.sysctls {
            validate_sysctl(key, host)?;
            sysctls.insert(key.clone(), value.clone());
        }

        let seccomp = self
            .seccomp
            .profile(host.security_opt("seccomp"), host.privileged)?;
        let apparmor = self
            .apparmor
            .profile(host.security_opt("apparmor"), host.privileged)?;

        spec.update_linux(|linux| {
            if !sysctls.is_empty() {
                let mut all = linux.sysctl().clone().unwrap_or_default();
                all.extend(sysctls);
                linux.set_sysctl(Some(all));
            }
            if host.privileged {
                linux.set_masked_paths(None);
                linux.set_readonly_paths(None);
            }
            linux.set_seccomp(seccomp);
            Ok(())
        })?;
        spec.update_process(|process| {
            process.set_apparmor_profile(apparmor);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::tests::{test_meta, to_json};
    use crate::spec::NamespacePeers;

    fn run(step: &PlatformStep, config: &DaemonConfig, meta: &ContainerMeta) -> Result<serde_json::Value> {
        let ctx = SetupContext { config };
        let mut wrapper = SpecWrapper::new(NamespacePeers::default());
        step.setup(&ctx, meta, &mut wrapper)?;
        Ok(to_json(&wrapper.spec))
    }

    fn enabled() -> PlatformStep {
        PlatformStep::new(
            Box::new(SeccompEnabled::new(None)),
            Box::new(AppArmorEnabled::new(Some("hull-default".into()))),
        )
    }

    #[test]
    fn test_default_profiles() {
        let json = run(&enabled(), &DaemonConfig::default(), &test_meta()).unwrap();
        let seccomp = &json["linux"]["seccomp"];
        assert_eq!(seccomp["defaultAction"], "SCMP_ACT_ALLOW");
        let names = seccomp["syscalls"][0]["names"].as_array().unwrap();
        assert!(names.contains(&serde_json::json!("ptrace")));
        assert_eq!(json["process"]["apparmorProfile"], "hull-default");
    }

    #[test]
    fn test_unconfined_and_privileged() {
        let mut meta = test_meta();
        meta.host_config.security_opt = vec!["seccomp=unconfined".into(), "apparmor=unconfined".into()];
        let json = run(&enabled(), &DaemonConfig::default(), &meta).unwrap();
        assert!(json["linux"].get("seccomp").map_or(true, |s| s.is_null()));
        assert!(json["process"].get("apparmorProfile").map_or(true, |s| s.is_null()));

        let mut meta = test_meta();
        meta.host_config.privileged = true;
        let json = run(&enabled(), &DaemonConfig::default(), &meta).unwrap();
        assert!(json["linux"].get("seccomp").map_or(true, |s| s.is_null()));
        assert!(json["linux"].get("maskedPaths").map_or(true, |s| s.is_null()));
    }

    #[test]
    fn test_unsupported_rejects_explicit_profile() {
        let step = PlatformStep::new(Box::new(SeccompUnsupported), Box::new(AppArmorUnsupported));
        assert!(run(&step, &DaemonConfig::default(), &test_meta()).is_ok());

        let mut meta = test_meta();
        meta.host_config.security_opt = vec!["apparmor=docker-default".into()];
        assert!(matches!(
            run(&step, &DaemonConfig::default(), &meta),
            Err(HullError::InvalidParam(_))
        ));

        meta.host_config.security_opt = vec!["seccomp=unconfined".into()];
        assert!(run(&step, &DaemonConfig::default(), &meta).is_ok());
    }

    #[test]
    fn test_seccomp_profile_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, r#"{"defaultAction":"SCMP_ACT_ERRNO"}"#).unwrap();

        let mut meta = test_meta();
        meta.host_config.security_opt = vec![format!("seccomp={}", path.display())];
        let json = run(&enabled(), &DaemonConfig::default(), &meta).unwrap();
        assert_eq!(json["linux"]["seccomp"]["defaultAction"], "SCMP_ACT_ERRNO");

        meta.host_config.security_opt = vec!["seccomp=/nonexistent/profile.json".into()];
        assert!(run(&enabled(), &DaemonConfig::default(), &meta).is_err());
    }

    #[test]
    fn test_sysctls() {
        let mut config = DaemonConfig::default();
        config
            .default_sysctls
            .insert("net.ipv4.ip_forward".into(), "1".into());

        let mut meta = test_meta();
        meta.host_config
            .sysctls
            .insert("kernel.shmmax".into(), "1024".into());
        let json = run(&enabled(), &config, &meta).unwrap();
        assert_eq!(json["linux"]["sysctl"]["kernel.shmmax"], "1024");
        assert_eq!(json["linux"]["sysctl"]["net.ipv4.ip_forward"], "1");

        // Defaults that do not fit the container are skipped
        meta.host_config.network_mode = "host".into();
        let json = run(&enabled(), &config, &meta).unwrap();
        assert!(json["linux"]["sysctl"].get("net.ipv4.ip_forward").is_none());

        meta.host_config
            .sysctls
            .insert("net.core.somaxconn".into(), "1024".into());
        assert!(run(&enabled(), &config, &meta).is_err());

        let mut meta = test_meta();
        meta.host_config.sysctls.insert("vm.swappiness".into(), "1".into());
        assert!(run(&enabled(), &config, &meta).is_err());
    }
}
