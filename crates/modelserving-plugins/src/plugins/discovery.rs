//! Pod discovery plugin
//!
//! Publishes the IPs of the running pods of a serving group, grouped by role,
//! as `ips.json` in the `<group>-discovery` ConfigMap.

use std::collections::BTreeMap;

use api_types::pod_role_name;
use api_types::GROUP_NAME_LABEL_KEY;
use async_trait::async_trait;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;

use super::mounts::ConfigMapMount;
use super::HookRequest;
use super::Plugin;
use super::PluginError;
use super::PluginResult;
use super::PluginSettings;
use crate::domain::ArtifactReconciler;
use crate::domain::ArtifactTarget;
use crate::domain::RetryPolicy;
use crate::infrastructure::store::LabelSet;

pub const PLUGIN_NAME: &str = "pod-discovery";
pub const CONFIG_MAP_SUFFIX: &str = "-discovery";
pub const VOLUME_NAME: &str = "pod-discovery-volume";
pub const MOUNT_PATH: &str = "/etc/pod-discovery";
pub const FILE_NAME: &str = "ips.json";
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "model-serving-controller";

pub struct PodDiscoveryPlugin {
    name: String,
    retry: RetryPolicy,
}

pub fn discovery_config_map_name(serving_group: &str) -> String {
    format!("{serving_group}{CONFIG_MAP_SUFFIX}")
}

/// Running pod IPs keyed by role name, each list sorted.
pub fn role_ips(pods: &[Pod]) -> BTreeMap<String, Vec<String>> {
    let mut by_role: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pod in pods {
        let Some(status) = pod.status.as_ref() else {
            continue;
        };
        let Some(ip) = status.pod_ip.as_deref().filter(|ip| !ip.is_empty()) else {
            continue;
        };
        if status.phase.as_deref() != Some("Running") {
            continue;
        }
        let Some(role) = pod_role_name(pod.metadata.labels.as_ref()) else {
            continue;
        };
        by_role.entry(role.to_string()).or_default().push(ip.to_string());
    }

    for ips in by_role.values_mut() {
        ips.sort();
    }
    by_role
}

impl PodDiscoveryPlugin {
    pub fn new(name: impl Into<String>, settings: &PluginSettings) -> Self {
        Self {
            name: name.into(),
            retry: settings.retry,
        }
    }
}

#[async_trait]
impl Plugin for PodDiscoveryPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_pod_create(
        &self,
        _cancel: &CancellationToken,
        req: &mut HookRequest,
    ) -> PluginResult<()> {
        let config_map_name = discovery_config_map_name(&req.serving_group);
        ConfigMapMount {
            volume_name: VOLUME_NAME,
            config_map_name: &config_map_name,
            mount_path: MOUNT_PATH,
            // the first pods of a group start before anything is published
            optional: true,
        }
        .inject(req.pod_mut()?);
        Ok(())
    }

    #[instrument(skip_all, fields(plugin = %self.name, group = %req.serving_group))]
    async fn on_pod_ready(&self, cancel: &CancellationToken, req: &HookRequest) -> PluginResult<()> {
        let selector = LabelSet::new().with(GROUP_NAME_LABEL_KEY, req.serving_group.as_str());
        let pods = req
            .handles
            .pod_lister
            .list_pods(req.namespace(), &selector)
            .change_context(PluginError::Store)
            .attach_printable_lazy(|| {
                format!("failed to list pods for serving group {}", req.serving_group)
            })?;

        let by_role = role_ips(&pods);
        debug!(roles = by_role.len(), "Collected pod IPs");
        let content = serde_json::to_string(&by_role)
            .change_context(PluginError::Configuration {
                plugin: self.name.clone(),
                message: "failed to marshal pod IPs".to_string(),
            })?;

        let target = ArtifactTarget {
            namespace: req.namespace().to_string(),
            name: discovery_config_map_name(&req.serving_group),
            owner_references: vec![req.owner_reference()?],
            labels: BTreeMap::from([
                (GROUP_NAME_LABEL_KEY.to_string(), req.serving_group.clone()),
                (MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY.to_string()),
            ]),
            key: FILE_NAME.to_string(),
            content,
        };

        ArtifactReconciler::new(req.handles.config_maps.clone(), self.retry)
            .upsert(cancel, &target)
            .await
            .change_context(PluginError::Reconcile)?;
        Ok(())
    }

    #[instrument(skip_all, fields(plugin = %self.name, group = %req.serving_group))]
    async fn on_serving_group_delete(
        &self,
        cancel: &CancellationToken,
        req: &HookRequest,
    ) -> PluginResult<()> {
        ArtifactReconciler::new(req.handles.config_maps.clone(), self.retry)
            .delete(
                cancel,
                req.namespace(),
                &discovery_config_map_name(&req.serving_group),
            )
            .await
            .change_context(PluginError::Reconcile)?;
        Ok(())
    }
}
