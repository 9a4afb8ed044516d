//! Host devices and the device cgroup

use super::{SetupContext, SetupStep, SpecWrapper};
use crate::container::{ContainerMeta, DeviceMapping};
use crate::error::{HullError, Result};
use crate::runtime::syscall::device_numbers;
use oci_spec::runtime::{
    LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType,
};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::PathBuf;

fn host_device(mapping: &DeviceMapping) -> Result<(LinuxDevice, LinuxDeviceCgroup)> {
    let metadata = std::fs::metadata(&mapping.path_on_host).map_err(|e| {
        HullError::InvalidParam(format!(
            "error gathering device information while adding device {}: {}",
            mapping.path_on_host, e
        ))
    })?;
    let file_type = metadata.file_type();
    let typ = if file_type.is_char_device() {
        LinuxDeviceType::C
    } else if file_type.is_block_device() {
        LinuxDeviceType::B
    } else {
        return Err(HullError::InvalidParam(format!(
            "{} is not a device node",
            mapping.path_on_host
        )));
    };
    let (major, minor) = device_numbers(metadata.rdev());

    let device = LinuxDeviceBuilder::default()
        .path(PathBuf::from(&mapping.path_in_container))
        .typ(typ)
        .major(major)
        .minor(minor)
        .file_mode(metadata.mode() & 0o777)
        .uid(metadata.uid())
        .gid(metadata.gid())
        .build()?;
    let rule = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .major(major)
        .minor(minor)
        .access(mapping.cgroup_permissions.clone())
        .build()?;
    Ok((device, rule))
}

pub struct DevicesStep;

impl SetupStep for DevicesStep {
    fn name(&self) -> &'static str {
        "devices"
    }

    fn setup(&self, _ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        let host = &meta.host_config;
        let mut devices = Vec::with_capacity(host.devices.len());
        let mut rules = Vec::with_capacity(host.devices.len() + 1);

        if host.privileged {
            rules.push(
                LinuxDeviceCgroupBuilder::default()
                    .allow(true)
                    .access("rwm".to_string())
                    .build()?,
            );
        }
        for mapping in &host.devices {
            let (device, rule) = host_device(mapping)?;
            devices.push(device);
            rules.push(rule);
        }
        if devices.is_empty() && rules.is_empty() {
            return Ok(());
        }

        spec.update_linux(|linux| {
            let mut all = linux.devices().clone().unwrap_or_default();
            all.extend(devices);
            linux.set_devices(Some(all));
            Ok(())
        })?;
        spec.update_resources(|resources| {
            let mut all = resources.devices().clone().unwrap_or_default();
            all.extend(rules);
            resources.set_devices(Some(all));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::spec::tests::{test_meta, to_json};
    use crate::spec::NamespacePeers;

    fn run(meta: &ContainerMeta) -> Result<serde_json::Value> {
        let config = DaemonConfig::default();
        let ctx = SetupContext { config: &config };
        let mut wrapper = SpecWrapper::new(NamespacePeers::default());
        DevicesStep.setup(&ctx, meta, &mut wrapper)?;
        Ok(to_json(&wrapper.spec))
    }

    #[test]
    fn test_add_host_device() {
        let mut meta = test_meta();
        meta.host_config.devices = vec![DeviceMapping::parse("/dev/null:/dev/mynull:rw").unwrap()];

        let json = run(&meta).unwrap();
        let devices = json["linux"]["devices"].as_array().unwrap();
        let dev = devices.iter().find(|d| d["path"] == "/dev/mynull").unwrap();
        assert_eq!(dev["type"], "c");
        assert_eq!(dev["major"], 1);
        assert_eq!(dev["minor"], 3);

        let rules = json["linux"]["resources"]["devices"].as_array().unwrap();
        let last = rules.last().unwrap();
        assert_eq!(last["allow"], true);
        assert_eq!(last["access"], "rw");
    }

    #[test]
    fn test_missing_device() {
        let mut meta = test_meta();
        meta.host_config.devices = vec![DeviceMapping::parse("/dev/does-not-exist").unwrap()];
        assert!(matches!(run(&meta), Err(HullError::InvalidParam(_))));
    }

    #[test]
    fn test_regular_file_is_not_a_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut meta = test_meta();
        meta.host_config.devices = vec![DeviceMapping {
            path_on_host: file.path().to_string_lossy().into_owned(),
            path_in_container: "/dev/x".into(),
            cgroup_permissions: "rwm".into(),
        }];
        assert!(run(&meta).is_err());
    }

    #[test]
    fn test_privileged_allows_all() {
        let mut meta = test_meta();
        meta.host_config.privileged = true;
        let json = run(&meta).unwrap();
        let rules = json["linux"]["resources"]["devices"].as_array().unwrap();
        let last = rules.last().unwrap();
        assert_eq!(last["allow"], true);
        assert_eq!(last["access"], "rwm");
        assert!(last.get("major").map_or(true, |m| m.is_null()));
    }
}
