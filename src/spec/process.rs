//! Process section: args, cwd, env, tty, user and capabilities

use super::{SetupContext, SetupStep, SpecWrapper};
use crate::container::{ContainerMeta, HostConfig};
use crate::error::{HullError, Result};
use oci_spec::runtime::{Capability, LinuxCapabilitiesBuilder, Process, User, UserBuilder};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Capabilities granted to unprivileged containers
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const ALL_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

pub struct ProcessStep;

impl SetupStep for ProcessStep {
    fn name(&self) -> &'static str {
        "process"
    }

    fn setup(&self, _ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        let config = &meta.config;
        let args = config.args();
        if args.is_empty() {
            return Err(HullError::InvalidParam("no command specified".into()));
        }

        let cwd = if config.working_dir.is_empty() {
            "/".to_string()
        } else {
            config.working_dir.clone()
        };

        let mut env = config.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.insert(0, DEFAULT_PATH_ENV.to_string());
        }
        if config.tty && !env.iter().any(|e| e.starts_with("TERM=")) {
            env.push("TERM=xterm".to_string());
        }

        let user = resolve_user(&meta.base_fs, &config.user, &meta.host_config.group_add)?;
        let caps = capabilities(&meta.host_config)?;
        let capabilities = LinuxCapabilitiesBuilder::default()
            .bounding(caps.clone())
            .effective(caps.clone())
            .permitted(caps)
            .inheritable(HashSet::new())
            .ambient(HashSet::new())
            .build()?;
        let no_new_privileges = meta
            .host_config
            .security_opt
            .iter()
            .any(|o| o == "no-new-privileges" || o == "no-new-privileges=true" || o == "no-new-privileges:true");

        spec.update_process(|process: &mut Process| {
            process.set_args(Some(args));
            process.set_cwd(cwd.into());
            process.set_env(Some(env));
            process.set_terminal(Some(config.tty));
            process.set_user(user);
            process.set_capabilities(Some(capabilities));
            process.set_no_new_privileges(Some(no_new_privileges));
            process.set_oom_score_adj(meta.host_config.oom_score_adj);
            Ok(())
        })
    }
}

fn parse_capability(name: &str) -> Result<Capability> {
    let upper = name.to_ascii_uppercase();
    let short = upper.strip_prefix("CAP_").unwrap_or(&upper);
    short
        .parse::<Capability>()
        .map_err(|_| HullError::InvalidParam(format!("unknown capability {}", name)))
}

/// Effective capability set after applying privileged mode, `cap_add` and `cap_drop`
pub fn capabilities(host: &HostConfig) -> Result<HashSet<Capability>> {
    let is_all = |c: &String| c.eq_ignore_ascii_case("ALL");

    let base: &[&str] = if host.privileged || host.cap_add.iter().any(is_all) {
        ALL_CAPABILITIES
    } else {
        DEFAULT_CAPABILITIES
    };
    let mut caps = base
        .iter()
        .map(|c| parse_capability(c))
        .collect::<Result<HashSet<_>>>()?;

    for cap in host.cap_add.iter().filter(|c| !is_all(c)) {
        caps.insert(parse_capability(cap)?);
    }
    if host.cap_drop.iter().any(is_all) {
        caps.clear();
    }
    for cap in host.cap_drop.iter().filter(|c| !is_all(c)) {
        caps.remove(&parse_capability(cap)?);
    }
    Ok(caps)
}

/// Resolve `user[:group]` against the rootfs passwd and group files.
///
/// A numeric UID is used as is; its primary group still comes from passwd
/// when the UID is listed there.
pub fn resolve_user(rootfs: &Path, user: &str, extra_groups: &[u32]) -> Result<User> {
    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let (uid, primary_gid) = if user_part.is_empty() {
        (0, 0)
    } else if let Ok(uid) = user_part.parse::<u32>() {
        let gid = lookup_passwd(rootfs, |name, id| name == user_part || id == uid)
            .map(|(_, gid)| gid)
            .unwrap_or(0);
        (uid, gid)
    } else {
        lookup_passwd(rootfs, |name, _| name == user_part).ok_or_else(|| {
            HullError::InvalidParam(format!("unable to find user {}", user_part))
        })?
    };

    let gid = match group_part {
        None | Some("") => primary_gid,
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup_group(rootfs, g)
                .ok_or_else(|| HullError::InvalidParam(format!("unable to find group {}", g)))?,
        },
    };

    let mut builder = UserBuilder::default().uid(uid).gid(gid);
    if !extra_groups.is_empty() {
        builder = builder.additional_gids(extra_groups.to_vec());
    }
    Ok(builder.build()?)
}

fn lookup_passwd(rootfs: &Path, pred: impl Fn(&str, u32) -> bool) -> Option<(u32, u32)> {
    let passwd = std::fs::read_to_string(rootfs.join("etc/passwd")).ok()?;
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        let name = *fields.first()?;
        let uid = fields.get(2)?.parse().ok()?;
        let gid = fields.get(3)?.parse().ok()?;
        pred(name, uid).then_some((uid, gid))
    })
}

fn lookup_group(rootfs: &Path, group: &str) -> Option<u32> {
    let groups = std::fs::read_to_string(rootfs.join("etc/group")).ok()?;
    groups.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.first() != Some(&group) {
            return None;
        }
        fields.get(2)?.parse().ok()
    })
}
