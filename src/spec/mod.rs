//! OCI spec generation
//!
//! A container's OCI runtime spec is produced by folding its metadata
//! through an ordered list of setup steps. The list is assembled once when
//! the daemon starts and never changes afterwards; steps are only ever
//! appended, so later steps can rely on fields written by earlier ones.

pub mod devices;
pub mod hooks;
pub mod mounts;
pub mod namespaces;
pub mod platform;
pub mod process;
pub mod resources;

use crate::config::DaemonConfig;
use crate::container::ContainerMeta;
use crate::error::Result;
use oci_spec::runtime::{Linux, LinuxResources, Process, Spec};
use tracing::debug;

pub use platform::{AppArmorProfile, SeccompProfile};

/// PIDs of the containers whose namespaces are joined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespacePeers {
    pub network: Option<u32>,
    pub ipc: Option<u32>,
    pub pid: Option<u32>,
}

/// The spec under construction plus what steps need beyond the container record
#[derive(Debug, Clone)]
pub struct SpecWrapper {
    pub spec: Spec,
    pub peers: NamespacePeers,
}

impl SpecWrapper {
    pub fn new(peers: NamespacePeers) -> Self {
        Self {
            spec: Spec::default(),
            peers,
        }
    }

    /// Edit the process section in place
    pub fn update_process(&mut self, f: impl FnOnce(&mut Process) -> Result<()>) -> Result<()> {
        let mut process = self.spec.process().clone().unwrap_or_default();
        f(&mut process)?;
        self.spec.set_process(Some(process));
        Ok(())
    }

    /// Edit the linux section in place
    pub fn update_linux(&mut self, f: impl FnOnce(&mut Linux) -> Result<()>) -> Result<()> {
        let mut linux = self.spec.linux().clone().unwrap_or_default();
        f(&mut linux)?;
        self.spec.set_linux(Some(linux));
        Ok(())
    }

    /// Edit the cgroup resources in place
    pub fn update_resources(
        &mut self,
        f: impl FnOnce(&mut LinuxResources) -> Result<()>,
    ) -> Result<()> {
        self.update_linux(|linux| {
            let mut resources = linux.resources().clone().unwrap_or_default();
            f(&mut resources)?;
            linux.set_resources(Some(resources));
            Ok(())
        })
    }
}

/// Daemon-wide inputs shared by every step
pub struct SetupContext<'a> {
    pub config: &'a DaemonConfig,
}

/// One transform of the spec
pub trait SetupStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn setup(&self, ctx: &SetupContext<'_>, meta: &ContainerMeta, spec: &mut SpecWrapper)
        -> Result<()>;
}

/// Ordered, immutable list of setup steps
pub struct SpecPipeline {
    steps: Vec<Box<dyn SetupStep>>,
}

impl SpecPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder { steps: Vec::new() }
    }

    /// Step names in execution order
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order. The first failing step aborts generation.
    pub fn generate(
        &self,
        ctx: &SetupContext<'_>,
        meta: &ContainerMeta,
        peers: NamespacePeers,
    ) -> Result<Spec> {
        let mut wrapper = SpecWrapper::new(peers);
        for step in &self.steps {
            if let Err(e) = step.setup(ctx, meta, &mut wrapper) {
                debug!(container = %meta.id, step = step.name(), "spec setup failed: {}", e);
                return Err(e);
            }
        }
        Ok(wrapper.spec)
    }
}

/// Builder for [`SpecPipeline`]
pub struct PipelineBuilder {
    steps: Vec<Box<dyn SetupStep>>,
}

impl PipelineBuilder {
    /// Register a step after every step registered so far
    pub fn append(mut self, step: impl SetupStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn build(self) -> SpecPipeline {
        SpecPipeline { steps: self.steps }
    }
}

/// The daemon's pipeline, with the platform strategies chosen at build time
pub fn default_pipeline(config: &DaemonConfig) -> SpecPipeline {
    SpecPipeline::builder()
        .append(process::ProcessStep)
        .append(resources::ResourcesStep)
        .append(namespaces::NamespacesStep)
        .append(mounts::MountsStep)
        .append(namespaces::NetworkStep)
        .append(devices::DevicesStep)
        .append(platform::PlatformStep::new(
            platform::seccomp_strategy(config),
            platform::apparmor_strategy(config),
        ))
        .append(resources::BlkioStep)
        .append(resources::AnnotationsStep)
        .append(hooks::HooksStep)
        .build()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::container::{ContainerConfig, HostConfig};
    use crate::error::HullError;
    use std::sync::{Arc, Mutex};

    pub(crate) fn test_meta() -> ContainerMeta {
        let config = ContainerConfig::new("busybox").cmd(vec!["sh".to_string()]);
        let mut meta = ContainerMeta::new(
            "0123456789abcdef0123456789abcdef".into(),
            "test".into(),
            config,
            HostConfig::default(),
        );
        meta.base_fs = std::path::PathBuf::from("/var/lib/hull/containers/0123/rootfs");
        meta
    }

    pub(crate) fn to_json(spec: &Spec) -> serde_json::Value {
        serde_json::to_value(spec).unwrap()
    }

    struct Named(&'static str, Arc<Mutex<Vec<&'static str>>>, bool);

    impl SetupStep for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn setup(&self, _: &SetupContext<'_>, _: &ContainerMeta, _: &mut SpecWrapper) -> Result<()> {
            self.1.lock().unwrap().push(self.0);
            if self.2 {
                return Err(HullError::InvalidParam(self.0.into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_default_order() {
        let pipeline = default_pipeline(&DaemonConfig::default());
        assert_eq!(
            pipeline.names(),
            vec![
                "process",
                "resources",
                "namespaces",
                "mounts",
                "network",
                "devices",
                "platform",
                "blkio",
                "annotations",
                "hooks",
            ]
        );
    }

    #[test]
    fn test_failing_step_aborts() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let pipeline = SpecPipeline::builder()
            .append(Named("a", ran.clone(), false))
            .append(Named("b", ran.clone(), true))
            .append(Named("c", ran.clone(), false))
            .build();

        let config = DaemonConfig::default();
        let ctx = SetupContext { config: &config };
        let err = pipeline
            .generate(&ctx, &test_meta(), NamespacePeers::default())
            .unwrap_err();
        assert!(matches!(err, HullError::InvalidParam(_)));
        assert_eq!(*ran.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_generate_default_spec() {
        let config = DaemonConfig::default();
        let ctx = SetupContext { config: &config };
        let spec = default_pipeline(&config)
            .generate(&ctx, &test_meta(), NamespacePeers::default())
            .unwrap();

        let json = to_json(&spec);
        assert_eq!(json["process"]["args"], serde_json::json!(["sh"]));
        assert_eq!(json["process"]["cwd"], "/");
        assert_eq!(json["root"]["path"], "/var/lib/hull/containers/0123/rootfs");
        assert_eq!(json["hostname"], "0123456789ab");
        assert_eq!(
            json["linux"]["cgroupsPath"],
            "/default/0123456789abcdef0123456789abcdef"
        );
    }
}
