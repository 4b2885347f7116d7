//! Rank table plugin
//!
//! Maintains one rank table ConfigMap per serving group or role instance and
//! mounts it into the pods of that scope.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::GROUP_NAME_LABEL_KEY;
use api_types::MODEL_SERVING_NAME_LABEL_KEY;
use api_types::ROLE_ID_LABEL_KEY;
use api_types::ROLE_LABEL_KEY;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::mounts::ConfigMapMount;
use super::HookRequest;
use super::Plugin;
use super::PluginError;
use super::PluginResult;
use super::PluginSettings;
use crate::domain::ranktable::aggregate;
use crate::domain::ranktable::ranktable_config_map_name;
use crate::domain::ranktable::template::level_override;
use crate::domain::ranktable::JinjaEngine;
use crate::domain::ranktable::PodParser;
use crate::domain::ranktable::RanktableLevel;
use crate::domain::ranktable::RanktableStatus;
use crate::domain::ranktable::RanktableTemplate;
use crate::domain::ranktable::ReadinessEvaluator;
use crate::domain::ranktable::Renderer;
use crate::domain::ranktable::TemplateEngine;
use crate::domain::ranktable::TemplateResolver;
use crate::domain::ranktable::TimeSource;
use crate::domain::ranktable::COMPONENT_LABEL_KEY;
use crate::domain::ranktable::RANKTABLE_COMPONENT;
use crate::domain::ranktable::RANKTABLE_LEVEL_ANNOTATION;
use crate::domain::ranktable::RANKTABLE_LEVEL_LABEL_KEY;
use crate::domain::ranktable::RANKTABLE_VOLUME_NAME;
use crate::domain::ArtifactReconciler;
use crate::domain::ArtifactTarget;
use crate::domain::RetryPolicy;
use crate::infrastructure::store::LabelSet;

pub const PLUGIN_NAME: &str = "ranktable";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RanktableConfig {
    #[serde(default)]
    pub template: String,
}

pub struct RanktablePlugin {
    config: RanktableConfig,
    resolver: TemplateResolver,
    parser: PodParser,
    renderer: Renderer,
    retry: RetryPolicy,
    clock: Arc<dyn TimeSource>,
}

/// Where the rank table of one hook invocation lives.
struct Scope {
    template: RanktableTemplate,
    config_map_name: String,
    labels: BTreeMap<String, String>,
}

impl RanktablePlugin {
    pub fn new(config: RanktableConfig, settings: &PluginSettings) -> PluginResult<Self> {
        if config.template.is_empty() {
            return Err(Report::new(PluginError::Configuration {
                plugin: PLUGIN_NAME.to_string(),
                message: "ranktable template is required in plugin config".to_string(),
            }));
        }

        let engine: Arc<dyn TemplateEngine> = Arc::new(JinjaEngine::new());
        Ok(Self {
            config,
            resolver: TemplateResolver::new(settings.template_namespace.clone()),
            parser: PodParser::new(engine.clone()),
            renderer: Renderer::new(engine),
            retry: settings.retry,
            clock: settings.clock.clone(),
        })
    }

    /// Build from the free-form plugin config `{"template": "<name>"}`.
    pub fn from_json(
        config: Option<&serde_json::Value>,
        settings: &PluginSettings,
    ) -> PluginResult<Self> {
        let config = match config {
            Some(value) => RanktableConfig::deserialize(value).change_context(
                PluginError::Configuration {
                    plugin: PLUGIN_NAME.to_string(),
                    message: "failed to decode ranktable plugin config".to_string(),
                },
            )?,
            None => RanktableConfig::default(),
        };
        Self::new(config, settings)
    }

    /// Resolve the template and apply the workload's level override.
    fn resolve_template(&self, req: &HookRequest) -> PluginResult<RanktableTemplate> {
        let mut template = self
            .resolver
            .resolve(req.handles.config_map_lister.as_ref(), &self.config.template)
            .change_context(PluginError::Ranktable)
            .attach_printable("failed to get ranktable template")?;

        if let Some(level) = level_override(req.model_serving.annotation(RANKTABLE_LEVEL_ANNOTATION))
        {
            template.level = level;
        }
        Ok(template)
    }

    fn scope(&self, req: &HookRequest) -> PluginResult<Scope> {
        let template = self.resolve_template(req)?;
        let ms_name = req.model_serving.name();

        let mut labels = BTreeMap::from([
            (MODEL_SERVING_NAME_LABEL_KEY.to_string(), ms_name.to_string()),
            (COMPONENT_LABEL_KEY.to_string(), RANKTABLE_COMPONENT.to_string()),
            (GROUP_NAME_LABEL_KEY.to_string(), req.serving_group.clone()),
            (
                RANKTABLE_LEVEL_LABEL_KEY.to_string(),
                template.level.to_string(),
            ),
        ]);

        let config_map_name = match template.level {
            RanktableLevel::Role => {
                labels.insert(ROLE_LABEL_KEY.to_string(), req.role_name.clone());
                labels.insert(ROLE_ID_LABEL_KEY.to_string(), req.role_id.clone());
                ranktable_config_map_name(ms_name, &req.serving_group, Some(&req.role_id))
            }
            RanktableLevel::Group => {
                ranktable_config_map_name(ms_name, &req.serving_group, None)
            }
        };

        Ok(Scope {
            template,
            config_map_name,
            labels,
        })
    }

    fn reconciler(&self, req: &HookRequest) -> ArtifactReconciler {
        ArtifactReconciler::new(req.handles.config_maps.clone(), self.retry)
    }

    async fn publish(
        &self,
        cancel: &CancellationToken,
        req: &HookRequest,
        scope: &Scope,
        content: String,
    ) -> PluginResult<()> {
        let target = ArtifactTarget {
            namespace: req.namespace().to_string(),
            name: scope.config_map_name.clone(),
            owner_references: vec![req.owner_reference()?],
            labels: scope.labels.clone(),
            key: scope.template.filename.clone(),
            content,
        };

        self.reconciler(req)
            .upsert(cancel, &target)
            .await
            .change_context(PluginError::Reconcile)?;
        Ok(())
    }

    /// Pods whose annotations make up the rank table of `scope`.
    fn scope_selector(&self, req: &HookRequest, scope: &Scope) -> LabelSet {
        let selector = LabelSet::new()
            .with(MODEL_SERVING_NAME_LABEL_KEY, req.model_serving.name())
            .with(GROUP_NAME_LABEL_KEY, req.serving_group.as_str());
        match scope.template.level {
            RanktableLevel::Role => selector.with(ROLE_ID_LABEL_KEY, req.role_id.as_str()),
            RanktableLevel::Group => selector,
        }
    }

    /// `1 + workerReplicas` of the request's role for role level tables.
    fn expected_pods(&self, req: &HookRequest, scope: &Scope) -> Option<usize> {
        if scope.template.level != RanktableLevel::Role {
            return None;
        }
        match req.model_serving.role(&req.role_name) {
            Some(role) => Some(1 + usize::try_from(role.worker_replicas).unwrap_or_default()),
            None => {
                warn!(role = %req.role_name, "Role not found in ModelServing template, skipping replica check");
                None
            }
        }
    }
}

#[async_trait]
impl Plugin for RanktablePlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    #[instrument(skip_all, fields(plugin = PLUGIN_NAME, group = %req.serving_group, role_id = %req.role_id))]
    async fn on_pod_create(
        &self,
        cancel: &CancellationToken,
        req: &mut HookRequest,
    ) -> PluginResult<()> {
        let scope = self.scope(req)?;

        let data = aggregate(RanktableStatus::Initializing, &[], self.clock.as_ref());
        let content = self
            .renderer
            .render(&scope.template.ranktable_template, &data)
            .change_context(PluginError::Ranktable)
            .attach_printable("failed to render initial ranktable")?;
        self.publish(cancel, req, &scope, content).await?;

        ConfigMapMount {
            volume_name: RANKTABLE_VOLUME_NAME,
            config_map_name: &scope.config_map_name,
            mount_path: &scope.template.mount_path,
            optional: false,
        }
        .inject(req.pod_mut()?);

        debug!(config_map = %scope.config_map_name, "Injected rank table volume");
        Ok(())
    }

    #[instrument(skip_all, fields(plugin = PLUGIN_NAME, group = %req.serving_group, role_id = %req.role_id))]
    async fn on_pod_ready(&self, cancel: &CancellationToken, req: &HookRequest) -> PluginResult<()> {
        let scope = self.scope(req)?;
        let selector = self.scope_selector(req, &scope);

        let pods = req
            .handles
            .pod_lister
            .list_pods(req.namespace(), &selector)
            .change_context(PluginError::Store)?;
        debug!(
            pods = pods.len(),
            level = %scope.template.level,
            "Found pods for rank table generation"
        );

        let readiness = ReadinessEvaluator::new(&self.parser, &scope.template)
            .evaluate(&pods, self.expected_pods(req, &scope));
        info!(
            status = %readiness.status,
            contributions = readiness.contributions.len(),
            active_pods = readiness.active_pods,
            config_map = %scope.config_map_name,
            "Evaluated rank table readiness"
        );

        let data = aggregate(
            readiness.status,
            &readiness.contributions,
            self.clock.as_ref(),
        );
        let content = self
            .renderer
            .render(&scope.template.ranktable_template, &data)
            .change_context(PluginError::Ranktable)
            .attach_printable("failed to render ranktable")?;

        self.publish(cancel, req, &scope, content).await
    }

    #[instrument(skip_all, fields(plugin = PLUGIN_NAME, group = %req.serving_group, role_id = %req.role_id))]
    async fn on_role_delete(&self, cancel: &CancellationToken, req: &HookRequest) -> PluginResult<()> {
        let scope = self.scope(req)?;
        if scope.template.level != RanktableLevel::Role {
            return Ok(());
        }

        self.reconciler(req)
            .delete(cancel, req.namespace(), &scope.config_map_name)
            .await
            .change_context(PluginError::Reconcile)?;
        Ok(())
    }

    #[instrument(skip_all, fields(plugin = PLUGIN_NAME, group = %req.serving_group))]
    async fn on_serving_group_delete(
        &self,
        cancel: &CancellationToken,
        req: &HookRequest,
    ) -> PluginResult<()> {
        let selector = LabelSet::new()
            .with(MODEL_SERVING_NAME_LABEL_KEY, req.model_serving.name())
            .with(GROUP_NAME_LABEL_KEY, req.serving_group.as_str())
            .with(COMPONENT_LABEL_KEY, RANKTABLE_COMPONENT);

        let deleted = self
            .reconciler(req)
            .delete_matching(cancel, req.namespace(), &selector)
            .await
            .change_context(PluginError::Reconcile)
            .attach_printable_lazy(|| {
                format!("failed to list ranktable configmaps for group {}", req.serving_group)
            })?;
        info!(deleted, "Deleted rank table ConfigMaps");
        Ok(())
    }
}
