//! Mount point resolution
//!
//! Mount points are resolved before every start, in a fixed priority order:
//! volumes inherited with `volumes_from`, explicit binds, volumes declared by
//! the image, then volumes declared in the container config. The first mount
//! claiming a destination wins.

use super::volume::VolumeMgr;
use crate::container::{ContainerMeta, MountPoint, Propagation};
use crate::error::{HullError, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

/// A parsed `source:destination[:mode]` bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Host path or volume name; empty for an anonymous volume
    pub source: String,
    pub destination: String,
    pub rw: bool,
    pub propagation: Propagation,
    /// `z` or `Z` relabel request
    pub relabel: Option<char>,
    pub copy_data: bool,
    pub mode: String,
}

impl BindSpec {
    /// Source is a host path rather than a volume name
    pub fn is_host_path(&self) -> bool {
        self.source.starts_with('/')
    }
}

/// Parse a bind in `dest`, `source:dest` or `source:dest:mode` form.
///
/// `mode` is a comma separated list of `ro`, `rw`, `z`, `Z`, `nocopy` and a
/// propagation mode.
pub fn parse_bind(spec: &str) -> Result<BindSpec> {
    let invalid = |why: &str| HullError::InvalidParam(format!("invalid bind {}: {}", spec, why));

    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination, mode) = match parts.as_slice() {
        [dest] => ("", *dest, ""),
        [source, dest] => (*source, *dest, ""),
        [source, dest, mode] => (*source, *dest, *mode),
        _ => return Err(invalid("too many colons")),
    };

    if !destination.starts_with('/') {
        return Err(invalid("destination must be an absolute path"));
    }
    if destination == "/" {
        return Err(invalid("destination can't be '/'"));
    }
    if parts.len() > 1 && source.is_empty() {
        return Err(invalid("empty source"));
    }

    let mut bind = BindSpec {
        source: source.to_string(),
        destination: destination.to_string(),
        rw: true,
        propagation: Propagation::default(),
        relabel: None,
        copy_data: true,
        mode: mode.to_string(),
    };

    let mut seen_rw = false;
    let mut seen_propagation = false;
    for opt in mode.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" | "rw" => {
                if seen_rw {
                    return Err(invalid("duplicate ro/rw mode"));
                }
                seen_rw = true;
                bind.rw = opt == "rw";
            }
            "z" | "Z" => {
                if bind.relabel.is_some() {
                    return Err(invalid("duplicate relabel mode"));
                }
                bind.relabel = opt.chars().next();
            }
            "nocopy" => bind.copy_data = false,
            other => match Propagation::parse(other) {
                Some(p) if !seen_propagation => {
                    seen_propagation = true;
                    bind.propagation = p;
                }
                Some(_) => return Err(invalid("duplicate propagation mode")),
                None => return Err(invalid(&format!("unknown mode {}", other))),
            },
        }
    }

    Ok(bind)
}

/// Parse a `container[:ro|rw]` volumes-from entry
pub fn parse_volumes_from(spec: &str) -> Result<(String, Option<bool>)> {
    match spec.split_once(':') {
        None if !spec.is_empty() => Ok((spec.to_string(), None)),
        Some((id, "rw")) if !id.is_empty() => Ok((id.to_string(), Some(true))),
        Some((id, "ro")) if !id.is_empty() => Ok((id.to_string(), Some(false))),
        _ => Err(HullError::InvalidParam(format!(
            "invalid volumes-from {}",
            spec
        ))),
    }
}

/// Mounts exported by one `volumes_from` donor
#[derive(Debug, Clone)]
pub struct InheritedMounts {
    pub container_id: String,
    pub mounts: Vec<MountPoint>,
    /// Override of the donor's read-write flag
    pub rw: Option<bool>,
}

/// Everything needed to resolve a container's mount points
pub struct MountRequest<'a> {
    pub meta: &'a ContainerMeta,
    pub inherited: &'a [InheritedMounts],
    /// Volume destinations declared by the image
    pub image_volumes: &'a [String],
    /// Driver used for volumes created on demand
    pub default_driver: &'a str,
}

/// Resolve, create and attach every mount point for a container.
///
/// Anonymous volumes already recorded on the container are reused by
/// destination, so restarts and upgrades keep their data.
pub async fn generate_mount_points(
    req: MountRequest<'_>,
    volumes: &dyn VolumeMgr,
) -> Result<Vec<MountPoint>> {
    let meta = req.meta;
    let driver = if meta.host_config.volume_driver.is_empty() {
        req.default_driver
    } else {
        meta.host_config.volume_driver.as_str()
    };
    let previous: HashMap<&str, &MountPoint> = meta
        .mounts
        .iter()
        .filter(|m| m.is_volume() && !m.named)
        .map(|m| (m.destination.as_str(), m))
        .collect();

    let mut seen = HashSet::new();
    let mut out: Vec<MountPoint> = Vec::new();
    let mut claim = |dest: &str, origin: &str| -> bool {
        if seen.insert(dest.to_string()) {
            true
        } else {
            warn!(container = %meta.id, destination = dest, origin, "duplicate mount point, ignoring");
            false
        }
    };

    // 1. volumes_from
    for donor in req.inherited {
        for mount in &donor.mounts {
            if !claim(&mount.destination, "volumes-from") {
                continue;
            }
            let mut m = mount.clone();
            if let Some(rw) = donor.rw {
                m.rw = rw;
            }
            out.push(m);
        }
    }

    // 2. binds
    for raw in &meta.host_config.binds {
        let bind = parse_bind(raw)?;
        if !claim(&bind.destination, "bind") {
            continue;
        }
        if bind.is_host_path() {
            out.push(MountPoint {
                source: PathBuf::from(&bind.source),
                destination: bind.destination,
                rw: bind.rw,
                propagation: bind.propagation,
                mode: bind.mode,
                ..Default::default()
            });
        } else {
            let named = !bind.source.is_empty();
            let name = if named {
                bind.source.clone()
            } else {
                previous
                    .get(bind.destination.as_str())
                    .map(|m| m.name.clone())
                    .unwrap_or_default()
            };
            out.push(MountPoint {
                name,
                driver: driver.to_string(),
                named,
                destination: bind.destination,
                rw: bind.rw,
                propagation: bind.propagation,
                mode: bind.mode,
                copy_data: bind.copy_data,
                ..Default::default()
            });
        }
    }

    // 3. image volumes, 4. config volumes
    for (dest, origin) in req
        .image_volumes
        .iter()
        .map(|d| (d, "image"))
        .chain(meta.config.volumes.iter().map(|d| (d, "config")))
    {
        if !dest.starts_with('/') {
            return Err(HullError::InvalidParam(format!(
                "invalid volume {}: destination must be an absolute path",
                dest
            )));
        }
        if !claim(dest, origin) {
            continue;
        }
        out.push(MountPoint {
            name: previous
                .get(dest.as_str())
                .map(|m| m.name.clone())
                .unwrap_or_default(),
            driver: driver.to_string(),
            destination: dest.clone(),
            rw: true,
            copy_data: true,
            ..Default::default()
        });
    }

    for mount in out.iter_mut().filter(|m| m.is_volume() || !m.driver.is_empty()) {
        attach_volume(mount, &meta.id, volumes).await?;
    }

    Ok(out)
}

/// Create the volume if absent, attach it, then resolve its host path
async fn attach_volume(mount: &mut MountPoint, container_id: &str, volumes: &dyn VolumeMgr) -> Result<()> {
    let exists = if mount.name.is_empty() {
        false
    } else {
        match volumes.get(&mount.name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        }
    };
    if !exists {
        let volume = volumes
            .create(&mount.name, &mount.driver, HashMap::new(), HashMap::new())
            .await?;
        mount.name = volume.name;
        mount.driver = volume.driver;
    }

    volumes.attach(&mount.name, container_id).await?;
    mount.source = volumes.path(&mount.name).await?;
    Ok(())
}

/// Drop the container's references; anonymous volumes are removed when
/// `remove_anonymous` is set
pub async fn detach_mount_points(
    container_id: &str,
    mounts: &[MountPoint],
    volumes: &dyn VolumeMgr,
    remove_anonymous: bool,
) -> Result<()> {
    for mount in mounts.iter().filter(|m| m.is_volume()) {
        match volumes.detach(&mount.name, container_id).await {
            Ok(volume) => {
                if remove_anonymous && !mount.named && !volume.in_use() {
                    volumes.remove(&mount.name).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                warn!(container = container_id, volume = %mount.name, "volume already gone");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
