use super::{SetupContext, SetupStep, SpecWrapper};
use crate::container::ContainerMeta;
use crate::error::Result;
use oci_spec::runtime::HookBuilder;

/// Daemon-wide prestart hooks
pub struct HooksStep;

impl SetupStep for HooksStep {
    fn name(&self) -> &'static str {
        "hooks"
    }

    fn setup(&self, ctx: &SetupContext<'_>, _meta: &ContainerMeta, spec: &mut SpecWrapper) -> Result<()> {
        if ctx.config.prestart_hooks.is_empty() {
            return Ok(());
        }

        let mut hooks = spec.spec.hooks().clone().unwrap_or_default();
        let mut prestart = hooks.prestart().clone().unwrap_or_default();
        for hook in &ctx.config.prestart_hooks {
            let mut builder = HookBuilder::default().path(hook.path.clone());
            if !hook.args.is_empty() {
                builder = builder.args(hook.args.clone());
            }
            if !hook.env.is_empty() {
                builder = builder.env(hook.env.clone());
            }
            prestart.push(builder.build()?);
        }
        hooks.set_prestart(Some(prestart));
        spec.spec.set_hooks(Some(hooks));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, HookConfig};
    use crate::spec::tests::{test_meta, to_json};
    use crate::spec::NamespacePeers;

    #[test]
    fn test_prestart_hooks_appended() {
        let config = DaemonConfig {
            prestart_hooks: vec![
                HookConfig {
                    path: "/usr/libexec/hull/net-hook".into(),
                    args: vec!["net-hook".into(), "setup".into()],
                    env: vec![],
                },
                HookConfig {
                    path: "/usr/libexec/hull/audit".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let ctx = SetupContext { config: &config };
        let mut wrapper = SpecWrapper::new(NamespacePeers::default());
        HooksStep.setup(&ctx, &test_meta(), &mut wrapper).unwrap();

        let json = to_json(&wrapper.spec);
        let prestart = json["hooks"]["prestart"].as_array().unwrap();
        assert_eq!(prestart.len(), 2);
        assert_eq!(prestart[0]["path"], "/usr/libexec/hull/net-hook");
        assert_eq!(prestart[0]["args"], serde_json::json!(["net-hook", "setup"]));
        assert_eq!(prestart[1]["path"], "/usr/libexec/hull/audit");
    }

    #[test]
    fn test_no_hooks_leaves_spec_alone() {
        let config = DaemonConfig::default();
        let ctx = SetupContext { config: &config };
        let mut wrapper = SpecWrapper::new(NamespacePeers::default());
        HooksStep.setup(&ctx, &test_meta(), &mut wrapper).unwrap();
        assert!(wrapper.spec.hooks().is_none());
    }
}
