//! Root, tmpfs and volume mounts

use super::{SetupContext, SetupStep, SpecWrapper};
use crate::container::{ContainerMeta, MountPoint, Propagation};
use crate::error::Result;
use oci_spec::runtime::{Mount, MountBuilder, RootBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn bind_mount(mp: &MountPoint) -> Result<Mount> {
    let options = vec![
        "rbind".to_string(),
        if mp.rw { "rw" } else { "ro" }.to_string(),
        mp.propagation.as_str().to_string(),
    ];
    Ok(MountBuilder::default()
        .destination(PathBuf::from(&mp.destination))
        .typ("bind")
        .source(mp.source.clone())
        .options(options)
        .build()?)
}

fn tmpfs_mount(destination: &str, options: &str) -> Result<Mount> {
    let mut opts = vec!["noexec".to_string(), "nosuid".to_string(), "nodev".to_string()];
    opts.extend(
        options
            .split(',')
            .filter(|o| !o.is_empty())
            .map(String::from),
    );
    Ok(MountBuilder::default()
        .destination(PathBuf::from(destination))
        .typ("tmpfs")
        .source(PathBuf::from("tmpfs"))
        .options(opts)
        .build()?)
}

/// Rootfs propagation needed for the requested mount propagation modes
fn rootfs_propagation(mounts: &[MountPoint]) -> Option<&'static str> {
    if mounts
        .iter()
        .any(|m| matches!(m.propagation, Propagation::Shared | Propagation::Rshared))
    {
        Some("rshared")
    } else if mounts
        .iter()
        .any(|m| matches!(m.propagation, Propagation::Slave | Propagation::Rslave))
    {
        Some("rslave")
    } else {
        None
    }
}

pub struct MountsStep;

impl SetupStep for MountsStep {
    fn name(&self) -> &'static str {
        "mounts"
    }

    fn setup(&self, _ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        let host = &meta.host_config;

        spec.spec.set_root(Some(
            RootBuilder::default()
                .path(meta.base_fs.clone())
                .readonly(host.readonly_rootfs)
                .build()?,
        ));

        // User mounts replace default mounts on the same destination
        let taken: HashSet<PathBuf> = meta
            .mounts
            .iter()
            .map(|m| PathBuf::from(&m.destination))
            .chain(host.tmpfs.keys().map(PathBuf::from))
            .collect();
        let mut mounts: Vec<Mount> = spec
            .spec
            .mounts()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| !taken.contains(m.destination()))
            .collect();

        for mount in mounts.iter_mut() {
            let mut options = mount.options().clone().unwrap_or_default();
            if mount.destination() == Path::new("/dev/shm") {
                if let Some(size) = host.shm_size.filter(|s| *s > 0) {
                    options.retain(|o| !o.starts_with("size="));
                    options.push(format!("size={}", size));
                }
            }
            if host.privileged && mount.typ().as_deref() == Some("sysfs") {
                for o in options.iter_mut().filter(|o| o.as_str() == "ro") {
                    *o = "rw".to_string();
                }
            }
            mount.set_options(Some(options));
        }

        let mut tmpfs: Vec<(&String, &String)> = host.tmpfs.iter().collect();
        tmpfs.sort();
        for (dest, options) in tmpfs {
            mounts.push(tmpfs_mount(dest, options)?);
        }

        // Parents before children
        let mut binds: Vec<&MountPoint> = meta.mounts.iter().collect();
        binds.sort_by_key(|m| Path::new(&m.destination).components().count());
        for mp in binds {
            mounts.push(bind_mount(mp)?);
        }
        spec.spec.set_mounts(Some(mounts));

        if let Some(propagation) = rootfs_propagation(&meta.mounts) {
            spec.update_linux(|linux| {
                linux.set_rootfs_propagation(Some(propagation.to_string()));
                Ok(())
            })?;
        }
        Ok(())
    }
}
