//! Shared API type definitions
//!
//! This crate contains the ModelServing workload types consumed by the
//! lifecycle plugins: the custom resource itself, its role template, the
//! plugin specs attached to it and the well-known label/annotation keys the
//! controller stamps on every pod it creates.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use serde::Deserialize;
use serde::Serialize;

/// API group of the workload resources.
pub const WORKLOAD_GROUP: &str = "workload.serving.volcano.sh";
/// API version of the workload resources.
pub const WORKLOAD_VERSION: &str = "v1alpha1";

/// Label carrying the owning ModelServing name.
pub const MODEL_SERVING_NAME_LABEL_KEY: &str = "modelserving.volcano.sh/name";
/// Label carrying the serving group name.
pub const GROUP_NAME_LABEL_KEY: &str = "modelserving.volcano.sh/group-name";
/// Label carrying the role name.
pub const ROLE_LABEL_KEY: &str = "modelserving.volcano.sh/role";
/// Label carrying the role instance id.
pub const ROLE_ID_LABEL_KEY: &str = "modelserving.volcano.sh/role-id";
/// Label set on the entry (leader) pod of a role instance.
pub const ENTRY_LABEL_KEY: &str = "modelserving.volcano.sh/entry";

/// Env var holding a pod's index within its role instance.
pub const WORKER_INDEX_ENV: &str = "WORKER_INDEX";
/// Env var holding the number of pods in a role instance.
pub const GROUP_SIZE_ENV: &str = "GROUP_SIZE";
/// Env var holding the address of the role instance's entry pod.
pub const ENTRY_ADDRESS_ENV: &str = "ENTRY_ADDRESS";

/// How a plugin is provided to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PluginType {
    #[default]
    BuiltIn,
}

/// A plugin attached to a ModelServing, with its free-form JSON config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: PluginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// A homogeneous set of pods inside a serving group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    /// Number of role instances per serving group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Number of worker pods next to the entry pod of one role instance
    #[serde(default)]
    pub worker_replicas: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingGroupTemplate {
    #[serde(default)]
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelServingSpec {
    /// Number of serving groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub template: ServingGroupTemplate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginSpec>,
}

/// The ModelServing custom resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelServing {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ModelServingSpec,
}

impl ModelServing {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Look up a workload annotation.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Find a role of the group template by name.
    pub fn role(&self, role_name: &str) -> Option<&Role> {
        self.spec
            .template
            .roles
            .iter()
            .find(|role| role.name == role_name)
    }
}

impl kube::Resource for ModelServing {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_dt: &()) -> Cow<'_, str> {
        "ModelServing".into()
    }

    fn group(_dt: &()) -> Cow<'_, str> {
        WORKLOAD_GROUP.into()
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        WORKLOAD_VERSION.into()
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        "modelservings".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Role name a pod was created for, taken from its labels.
pub fn pod_role_name(labels: Option<&BTreeMap<String, String>>) -> Option<&str> {
    labels
        .and_then(|labels| labels.get(ROLE_LABEL_KEY))
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}
