use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use api_types::ModelServing;
use api_types::PluginSpec;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::discovery;
use super::lws;
use super::ranktable;
use super::HookRequest;
use super::LwsPlugin;
use super::Plugin;
use super::PluginError;
use super::PluginResult;
use super::PodDiscoveryPlugin;
use super::RanktablePlugin;
use crate::domain::ranktable::SystemClock;
use crate::domain::ranktable::TimeSource;
use crate::domain::ranktable::DEFAULT_TEMPLATE_NAMESPACE;
use crate::domain::RetryPolicy;

/// Process wide settings shared by every plugin instance.
#[derive(Clone)]
pub struct PluginSettings {
    /// Namespace holding the rank table templates
    pub template_namespace: String,
    pub retry: RetryPolicy,
    pub clock: Arc<dyn TimeSource>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            template_namespace: DEFAULT_TEMPLATE_NAMESPACE.to_string(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for PluginSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSettings")
            .field("template_namespace", &self.template_namespace)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

pub type PluginFactory = fn(&PluginSpec, &PluginSettings) -> PluginResult<Box<dyn Plugin>>;

/// Maps plugin names to constructors.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

fn build_ranktable(spec: &PluginSpec, settings: &PluginSettings) -> PluginResult<Box<dyn Plugin>> {
    Ok(Box::new(RanktablePlugin::from_json(
        spec.config.as_ref(),
        settings,
    )?))
}

fn build_discovery(spec: &PluginSpec, settings: &PluginSettings) -> PluginResult<Box<dyn Plugin>> {
    Ok(Box::new(PodDiscoveryPlugin::new(spec.name.clone(), settings)))
}

fn build_lws(spec: &PluginSpec, _settings: &PluginSettings) -> PluginResult<Box<dyn Plugin>> {
    Ok(Box::new(LwsPlugin::new(spec.name.clone())))
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `ranktable`, `pod-discovery` and `lws` plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ranktable::PLUGIN_NAME, build_ranktable);
        registry.register(discovery::PLUGIN_NAME, build_discovery);
        registry.register(lws::PLUGIN_NAME, build_lws);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(
        &self,
        spec: &PluginSpec,
        settings: &PluginSettings,
    ) -> PluginResult<Box<dyn Plugin>> {
        let factory = self.factories.get(&spec.name).ok_or_else(|| {
            Report::new(PluginError::UnknownPlugin {
                name: spec.name.clone(),
            })
        })?;
        factory(spec, settings)
    }
}

/// The plugins attached to one ModelServing, in declaration order.
pub struct PluginSet {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginSet {
    pub fn build(
        registry: &PluginRegistry,
        model_serving: &ModelServing,
        settings: &PluginSettings,
    ) -> PluginResult<Self> {
        let plugins = model_serving
            .spec
            .plugins
            .iter()
            .map(|spec| registry.build(spec, settings))
            .collect::<PluginResult<Vec<_>>>()?;
        Ok(Self { plugins })
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub async fn on_pod_create(
        &self,
        cancel: &CancellationToken,
        req: &mut HookRequest,
    ) -> PluginResult<()> {
        for plugin in &self.plugins {
            debug!(plugin = %plugin.name(), "Running OnPodCreate");
            plugin
                .on_pod_create(cancel, req)
                .await
                .map_err(|report| report.attach_printable(format!("plugin: {}", plugin.name())))?;
        }
        Ok(())
    }

    pub async fn on_pod_ready(&self, cancel: &CancellationToken, req: &HookRequest) -> PluginResult<()> {
        for plugin in &self.plugins {
            debug!(plugin = %plugin.name(), "Running OnPodReady");
            plugin
                .on_pod_ready(cancel, req)
                .await
                .map_err(|report| report.attach_printable(format!("plugin: {}", plugin.name())))?;
        }
        Ok(())
    }

    pub async fn on_role_delete(&self, cancel: &CancellationToken, req: &HookRequest) -> PluginResult<()> {
        for plugin in &self.plugins {
            plugin
                .on_role_delete(cancel, req)
                .await
                .map_err(|report| report.attach_printable(format!("plugin: {}", plugin.name())))?;
        }
        Ok(())
    }

    pub async fn on_serving_group_delete(
        &self,
        cancel: &CancellationToken,
        req: &HookRequest,
    ) -> PluginResult<()> {
        for plugin in &self.plugins {
            plugin
                .on_serving_group_delete(cancel, req)
                .await
                .map_err(|report| report.attach_printable(format!("plugin: {}", plugin.name())))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use api_types::ModelServingSpec;
    use api_types::PluginType;
    use similar_asserts::assert_eq;

    use super::*;

    fn spec(name: &str, config: Option<serde_json::Value>) -> PluginSpec {
        PluginSpec {
            name: name.to_string(),
            plugin_type: PluginType::BuiltIn,
            config,
        }
    }

    #[test]
    fn builds_plugins_in_declaration_order() {
        let ms = ModelServing {
            spec: ModelServingSpec {
                plugins: vec![
                    spec("pod-discovery", None),
                    spec("ranktable", Some(serde_json::json!({"template": "mindie"}))),
                    spec("lws", None),
                ],
                ..Default::default()
            },
            ..Default::default()
        };

        let set = PluginSet::build(
            &PluginRegistry::with_builtins(),
            &ms,
            &PluginSettings::default(),
        )
        .unwrap();

        assert_eq!(set.names(), vec!["pod-discovery", "ranktable", "lws"]);
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let err = PluginRegistry::with_builtins()
            .build(&spec("volcano-gang", None), &PluginSettings::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.current_context(),
            PluginError::UnknownPlugin { name } if name == "volcano-gang"
        ));
    }

    #[test]
    fn plugin_config_errors_surface_at_build() {
        let ms = ModelServing {
            spec: ModelServingSpec {
                plugins: vec![spec("ranktable", Some(serde_json::json!({})))],
                ..Default::default()
            },
            ..Default::default()
        };

        let result = PluginSet::build(
            &PluginRegistry::with_builtins(),
            &ms,
            &PluginSettings::default(),
        );
        assert!(result.is_err());
    }
}
