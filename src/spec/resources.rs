//! Cgroup resources, block IO and resource-controller annotations

use super::{SetupContext, SetupStep, SpecWrapper};
use crate::container::{ContainerMeta, Resources};
use crate::error::{HullError, Result};
use crate::runtime::syscall::device_numbers;
use oci_spec::runtime::{
    LinuxBlockIo, LinuxCpu, LinuxMemory, LinuxMemoryBuilder, LinuxPidsBuilder, LinuxResources,
    LinuxThrottleDevice, LinuxThrottleDeviceBuilder, LinuxWeightDeviceBuilder,
};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

pub const ANNOTATION_MEMORY_WMARK_RATIO: &str = "__memory_wmark_ratio";
pub const ANNOTATION_MEMORY_EXTRA: &str = "__memory_extra_in_percent";
pub const ANNOTATION_MEMORY_FORCE_EMPTY_CTL: &str = "__memory_force_empty_ctl";
pub const ANNOTATION_SCHEDULE_LATENCY_SWITCH: &str = "__schedule_latency_switch";

/// Parse a cpuset list such as `0-3,6`
pub fn parse_cpuset(list: &str) -> Result<Vec<usize>> {
    let invalid = || HullError::InvalidParam(format!("invalid cpuset {}", list));
    let mut cpus = Vec::new();
    for part in list.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().map_err(|_| invalid())?;
                let hi: usize = hi.parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| invalid())?),
        }
    }
    Ok(cpus)
}

fn validate_cpuset(r: &Resources) -> Result<()> {
    if r.cpuset_cpus.is_empty() {
        return Ok(());
    }
    let available = num_cpus::get();
    if let Some(cpu) = parse_cpuset(&r.cpuset_cpus)?.into_iter().find(|c| *c >= available) {
        return Err(HullError::InvalidParam(format!(
            "cpuset {} requests cpu {}, only {} available",
            r.cpuset_cpus, cpu, available
        )));
    }
    Ok(())
}

/// Fold CPU, memory and pids limits into `res`
pub fn apply_resources(r: &Resources, res: &mut LinuxResources) -> Result<()> {
    let mut cpu: LinuxCpu = res.cpu().clone().unwrap_or_default();
    let mut cpu_set = false;
    if let Some(shares) = r.cpu_shares {
        cpu.set_shares(Some(shares));
        cpu_set = true;
    }
    if let Some(period) = r.cpu_period {
        cpu.set_period(Some(period));
        cpu_set = true;
    }
    if let Some(quota) = r.cpu_quota {
        cpu.set_quota(Some(quota));
        cpu_set = true;
    }
    if !r.cpuset_cpus.is_empty() {
        cpu.set_cpus(Some(r.cpuset_cpus.clone()));
        cpu_set = true;
    }
    if !r.cpuset_mems.is_empty() {
        cpu.set_mems(Some(r.cpuset_mems.clone()));
        cpu_set = true;
    }
    if cpu_set {
        res.set_cpu(Some(cpu));
    }

    if let Some(memory) = merge_memory(r, res.memory().unwrap_or_default())? {
        res.set_memory(Some(memory));
    }

    if let Some(limit) = r.pids_limit.filter(|l| *l != 0) {
        res.set_pids(Some(LinuxPidsBuilder::default().limit(limit).build()?));
    }
    Ok(())
}

/// `existing` with the requested memory limits laid over it; `None` when
/// nothing is requested. `LinuxMemory` has no setters, so it is rebuilt.
fn merge_memory(r: &Resources, existing: LinuxMemory) -> Result<Option<LinuxMemory>> {
    let limit = r.memory.filter(|m| *m > 0);
    let swap = r.memory_swap.filter(|s| *s != 0);
    let reservation = r.memory_reservation.filter(|m| *m > 0);
    if limit.is_none()
        && swap.is_none()
        && reservation.is_none()
        && r.memory_swappiness.is_none()
        && r.oom_kill_disable.is_none()
    {
        return Ok(None);
    }

    let mut builder = LinuxMemoryBuilder::default();
    if let Some(v) = limit.or(existing.limit()) {
        builder = builder.limit(v);
    }
    if let Some(v) = swap.or(existing.swap()) {
        builder = builder.swap(v);
    }
    if let Some(v) = reservation.or(existing.reservation()) {
        builder = builder.reservation(v);
    }
    if let Some(v) = r.memory_swappiness.or(existing.swappiness()) {
        builder = builder.swappiness(v);
    }
    if let Some(v) = r.oom_kill_disable.or(existing.disable_oom_killer()) {
        builder = builder.disable_oom_killer(v);
    }
    if let Some(v) = existing.kernel() {
        builder = builder.kernel(v);
    }
    if let Some(v) = existing.kernel_tcp() {
        builder = builder.kernel_tcp(v);
    }
    if let Some(v) = existing.use_hierarchy() {
        builder = builder.use_hierarchy(v);
    }
    if let Some(v) = existing.check_before_update() {
        builder = builder.check_before_update(v);
    }
    Ok(Some(builder.build()?))
}

fn device_of(path: &str) -> Result<(i64, i64)> {
    let meta = std::fs::metadata(path)
        .map_err(|e| HullError::InvalidParam(format!("invalid device {}: {}", path, e)))?;
    Ok(device_numbers(meta.rdev()))
}

fn throttle(devices: &[crate::container::ThrottleDevice]) -> Result<Vec<LinuxThrottleDevice>> {
    devices
        .iter()
        .map(|d| {
            let (major, minor) = device_of(&d.path)?;
            Ok(LinuxThrottleDeviceBuilder::default()
                .major(major)
                .minor(minor)
                .rate(d.rate)
                .build()?)
        })
        .collect()
}

/// Fold block IO weights and throttles into `res`
pub fn apply_blkio(r: &Resources, res: &mut LinuxResources) -> Result<()> {
    if r.blkio_weight.is_none()
        && r.blkio_weight_device.is_empty()
        && r.blkio_device_read_bps.is_empty()
        && r.blkio_device_write_bps.is_empty()
    {
        return Ok(());
    }

    let mut blkio: LinuxBlockIo = res.block_io().clone().unwrap_or_default();
    if let Some(weight) = r.blkio_weight.filter(|w| *w > 0) {
        blkio.set_weight(Some(weight));
    }
    if !r.blkio_weight_device.is_empty() {
        let devices = r
            .blkio_weight_device
            .iter()
            .map(|d| {
                let (major, minor) = device_of(&d.path)?;
                Ok(LinuxWeightDeviceBuilder::default()
                    .major(major)
                    .minor(minor)
                    .weight(d.weight)
                    .build()?)
            })
            .collect::<Result<Vec<_>>>()?;
        blkio.set_weight_device(Some(devices));
    }
    if !r.blkio_device_read_bps.is_empty() {
        blkio.set_throttle_read_bps_device(Some(throttle(&r.blkio_device_read_bps)?));
    }
    if !r.blkio_device_write_bps.is_empty() {
        blkio.set_throttle_write_bps_device(Some(throttle(&r.blkio_device_write_bps)?));
    }
    res.set_block_io(Some(blkio));
    Ok(())
}

/// Full resource section for a runtime update
pub fn linux_resources(r: &Resources) -> Result<LinuxResources> {
    r.validate()?;
    validate_cpuset(r)?;
    let mut res = LinuxResources::default();
    apply_resources(r, &mut res)?;
    apply_blkio(r, &mut res)?;
    Ok(res)
}

/// CPU, memory, pids and the cgroup path
pub struct ResourcesStep;

impl SetupStep for ResourcesStep {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn setup(&self, ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        let r = &meta.host_config.resources;
        r.validate()?;
        validate_cpuset(r)?;

        let cgroup_path = PathBuf::from(format!("/{}/{}", ctx.config.cgroup_parent, meta.id));
        spec.update_linux(|linux| {
            linux.set_cgroups_path(Some(cgroup_path));
            Ok(())
        })?;
        spec.update_resources(|res| apply_resources(r, res))
    }
}

pub struct BlkioStep;

impl SetupStep for BlkioStep {
    fn name(&self) -> &'static str {
        "blkio"
    }

    fn setup(&self, _ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        spec.update_resources(|res| apply_blkio(&meta.host_config.resources, res))
    }
}

/// Extended memory and scheduler controls the runtime reads from annotations
pub struct AnnotationsStep;

impl SetupStep for AnnotationsStep {
    fn name(&self) -> &'static str {
        "annotations"
    }

    fn setup(&self, _ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        let mut annotations = spec.spec.annotations().clone().unwrap_or_default();
        annotations.extend(meta.config.spec_annotation.clone());

        let r = &meta.host_config.resources;
        for (key, value) in [
            (ANNOTATION_MEMORY_WMARK_RATIO, r.memory_wmark_ratio),
            (ANNOTATION_MEMORY_EXTRA, r.memory_extra),
            (ANNOTATION_MEMORY_FORCE_EMPTY_CTL, r.memory_force_empty_ctl),
            (ANNOTATION_SCHEDULE_LATENCY_SWITCH, r.schedule_latency_switch),
        ] {
            if let Some(v) = value {
                annotations.insert(key.to_string(), v.to_string());
            }
        }

        if !annotations.is_empty() {
            spec.spec.set_annotations(Some(annotations));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::container::WeightDevice;
    use crate::spec::tests::{test_meta, to_json};
    use crate::spec::NamespacePeers;

    fn run(step: &dyn SetupStep, meta: &ContainerMeta) -> Result<serde_json::Value> {
        let config = DaemonConfig::default();
        let ctx = SetupContext { config: &config };
        let mut wrapper = SpecWrapper::new(NamespacePeers::default());
        step.setup(&ctx, meta, &mut wrapper)?;
        Ok(to_json(&wrapper.spec))
    }

    #[test]
    fn test_parse_cpuset() {
        assert_eq!(parse_cpuset("0-2,5").unwrap(), vec![0, 1, 2, 5]);
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("a").is_err());
    }

    #[test]
    fn test_cpu_and_memory() {
        let mut meta = test_meta();
        meta.host_config.resources = Resources {
            cpu_shares: Some(512),
            cpuset_cpus: "0".into(),
            memory: Some(64 << 20),
            memory_swappiness: Some(10),
            pids_limit: Some(100),
            ..Default::default()
        };

        let json = run(&ResourcesStep, &meta).unwrap();
        let res = &json["linux"]["resources"];
        assert_eq!(res["cpu"]["shares"], 512);
        assert_eq!(res["cpu"]["cpus"], "0");
        assert_eq!(res["memory"]["limit"], 64 << 20);
        assert_eq!(res["memory"]["swappiness"], 10);
        assert_eq!(res["pids"]["limit"], 100);
    }

    #[test]
    fn test_merge_memory_keeps_existing_fields() {
        let existing = LinuxMemoryBuilder::default()
            .limit(1_i64 << 30)
            .kernel(4096_i64)
            .build()
            .unwrap();
        assert!(merge_memory(&Resources::default(), existing).unwrap().is_none());

        let r = Resources {
            memory: Some(256 << 20),
            oom_kill_disable: Some(true),
            ..Default::default()
        };
        let merged = merge_memory(&r, existing).unwrap().unwrap();
        assert_eq!(merged.limit(), Some(256 << 20));
        assert_eq!(merged.kernel(), Some(4096));
        assert_eq!(merged.disable_oom_killer(), Some(true));
        assert_eq!(merged.swap(), None);
    }

    #[test]
    fn test_cpuset_out_of_range() {
        let mut meta = test_meta();
        meta.host_config.resources.cpuset_cpus = format!("{}", num_cpus::get() + 1);
        assert!(run(&ResourcesStep, &meta).is_err());
    }

    #[test]
    fn test_blkio_weight_device() {
        let mut meta = test_meta();
        meta.host_config.resources.blkio_weight = Some(300);
        meta.host_config.resources.blkio_weight_device = vec![WeightDevice {
            path: "/dev/null".into(),
            weight: 200,
        }];

        let json = run(&BlkioStep, &meta).unwrap();
        let blkio = &json["linux"]["resources"]["blockIO"];
        assert_eq!(blkio["weight"], 300);
        assert_eq!(blkio["weightDevice"][0]["major"], 1);
        assert_eq!(blkio["weightDevice"][0]["minor"], 3);
        assert_eq!(blkio["weightDevice"][0]["weight"], 200);
    }

    #[test]
    fn test_blkio_missing_device() {
        let mut meta = test_meta();
        meta.host_config.resources.blkio_device_read_bps = vec![crate::container::ThrottleDevice {
            path: "/dev/definitely-missing".into(),
            rate: 1024,
        }];
        assert!(matches!(run(&BlkioStep, &meta), Err(HullError::InvalidParam(_))));
    }

    #[test]
    fn test_annotations() {
        let mut meta = test_meta();
        meta.host_config.resources.memory_wmark_ratio = Some(80);
        meta.config
            .spec_annotation
            .insert("io.hull.owner".into(), "ops".into());

        let json = run(&AnnotationsStep, &meta).unwrap();
        assert_eq!(json["annotations"][ANNOTATION_MEMORY_WMARK_RATIO], "80");
        assert_eq!(json["annotations"]["io.hull.owner"], "ops");
        assert!(json["annotations"].get(ANNOTATION_MEMORY_EXTRA).is_none());
    }
}
