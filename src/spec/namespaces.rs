//! Namespace modes and network identity

use super::{SetupContext, SetupStep, SpecWrapper};
use crate::container::ContainerMeta;
use crate::error::{HullError, Result};
use oci_spec::runtime::{LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType};
use std::path::PathBuf;

/// How a container gets one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceMode {
    /// A new namespace of its own
    Private,
    /// The host's namespace
    Host,
    /// Join another container's namespace
    Container(String),
}

impl NamespaceMode {
    /// Parse a `host`, `container:<id>` or private mode string
    pub fn parse(mode: &str) -> Self {
        if mode == "host" {
            NamespaceMode::Host
        } else if let Some(id) = mode.strip_prefix("container:") {
            NamespaceMode::Container(id.to_string())
        } else {
            NamespaceMode::Private
        }
    }
}

fn proc_name(typ: LinuxNamespaceType) -> &'static str {
    match typ {
        LinuxNamespaceType::Network => "net",
        LinuxNamespaceType::Ipc => "ipc",
        LinuxNamespaceType::Pid => "pid",
        LinuxNamespaceType::Uts => "uts",
        LinuxNamespaceType::User => "user",
        LinuxNamespaceType::Mount => "mnt",
        LinuxNamespaceType::Cgroup => "cgroup",
        LinuxNamespaceType::Time => "time",
    }
}

fn set_namespace(
    namespaces: &mut Vec<LinuxNamespace>,
    typ: LinuxNamespaceType,
    mode: &NamespaceMode,
    peer_pid: Option<u32>,
) -> Result<()> {
    namespaces.retain(|ns| ns.typ() != typ);
    match mode {
        NamespaceMode::Host => {}
        NamespaceMode::Private => {
            namespaces.push(LinuxNamespaceBuilder::default().typ(typ).build()?);
        }
        NamespaceMode::Container(id) => {
            let pid = peer_pid.ok_or_else(|| {
                HullError::InvalidParam(format!(
                    "{} namespace of container {} is not available",
                    proc_name(typ),
                    id
                ))
            })?;
            namespaces.push(
                LinuxNamespaceBuilder::default()
                    .typ(typ)
                    .path(PathBuf::from(format!("/proc/{}/ns/{}", pid, proc_name(typ))))
                    .build()?,
            );
        }
    }
    Ok(())
}

/// User, network, ipc, pid and uts namespaces
pub struct NamespacesStep;

impl SetupStep for NamespacesStep {
    fn name(&self) -> &'static str {
        "namespaces"
    }

    fn setup(&self, _ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        let host = &meta.host_config;
        let peers = spec.peers;

        let uts = NamespaceMode::parse(&host.uts_mode);
        if matches!(uts, NamespaceMode::Container(_)) {
            return Err(HullError::InvalidParam("uts mode container is not supported".into()));
        }
        // A user namespace is only created on request
        let user = match NamespaceMode::parse(&host.userns_mode) {
            NamespaceMode::Private if !host.userns_mode.is_empty() => NamespaceMode::Private,
            NamespaceMode::Container(_) => {
                return Err(HullError::InvalidParam(
                    "userns mode container is not supported".into(),
                ))
            }
            _ => NamespaceMode::Host,
        };

        spec.update_linux(|linux| {
            let mut namespaces = linux.namespaces().clone().unwrap_or_default();
            set_namespace(&mut namespaces, LinuxNamespaceType::User, &user, None)?;
            set_namespace(
                &mut namespaces,
                LinuxNamespaceType::Network,
                &NamespaceMode::parse(&host.network_mode),
                peers.network,
            )?;
            set_namespace(
                &mut namespaces,
                LinuxNamespaceType::Ipc,
                &NamespaceMode::parse(&host.ipc_mode),
                peers.ipc,
            )?;
            set_namespace(
                &mut namespaces,
                LinuxNamespaceType::Pid,
                &NamespaceMode::parse(&host.pid_mode),
                peers.pid,
            )?;
            set_namespace(&mut namespaces, LinuxNamespaceType::Uts, &uts, None)?;
            linux.set_namespaces(Some(namespaces));
            Ok(())
        })
    }
}

/// Hostname and domain name
pub struct NetworkStep;

impl SetupStep for NetworkStep {
    fn name(&self) -> &'static str {
        "network"
    }

    fn setup(&self, _ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        // Sharing the host's UTS namespace keeps the host's name
        if NamespaceMode::parse(&meta.host_config.uts_mode) == NamespaceMode::Host {
            spec.spec.set_hostname(None);
            return Ok(());
        }

        let hostname = if meta.config.hostname.is_empty() {
            meta.short_id().to_string()
        } else {
            meta.config.hostname.clone()
        };
        if hostname.len() > 63 {
            return Err(HullError::InvalidParam(format!(
                "hostname {} is longer than 63 characters",
                hostname
            )));
        }
        spec.spec.set_hostname(Some(hostname));
        if !meta.config.domainname.is_empty() {
            spec.spec.set_domainname(Some(meta.config.domainname.clone()));
        }
        Ok(())
    }
}
