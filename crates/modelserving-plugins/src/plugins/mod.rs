//! Lifecycle plugins
//!
//! The workload controller calls every plugin attached to a ModelServing at
//! fixed points of a pod's life. Plugins mutate the pod before it is created
//! and maintain ConfigMaps derived from the pods of a serving group.

use core::error::Error;
use std::sync::Arc;

use api_types::ModelServing;
use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::store::ClusterHandles;

pub mod discovery;
pub mod lws;
pub mod mounts;
pub mod ranktable;
pub mod registry;

pub use discovery::PodDiscoveryPlugin;
pub use lws::LwsPlugin;
pub use ranktable::RanktablePlugin;
pub use registry::PluginRegistry;
pub use registry::PluginSet;
pub use registry::PluginSettings;

pub type PluginResult<T> = Result<T, Report<PluginError>>;

#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("Invalid configuration for plugin {plugin}: {message}")]
    Configuration { plugin: String, message: String },
    #[display("Unknown plugin: {name}")]
    UnknownPlugin { name: String },
    #[display("Hook request is missing {field}")]
    InvalidRequest { field: &'static str },
    #[display("Rank table generation failed")]
    Ranktable,
    #[display("Failed to reconcile ConfigMap")]
    Reconcile,
    #[display("Failed to read cluster state")]
    Store,
}

impl Error for PluginError {}

/// Everything a hook needs to know about the pod it is called for.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub model_serving: Arc<ModelServing>,
    pub serving_group: String,
    pub role_name: String,
    pub role_id: String,
    pub is_entry: bool,
    /// Present on pod hooks; `on_pod_create` mutates it in place
    pub pod: Option<Pod>,
    pub handles: ClusterHandles,
}

impl HookRequest {
    pub fn namespace(&self) -> &str {
        self.model_serving.namespace()
    }

    pub(crate) fn pod_mut(&mut self) -> PluginResult<&mut Pod> {
        self.pod
            .as_mut()
            .ok_or_else(|| Report::new(PluginError::InvalidRequest { field: "pod" }))
    }

    /// Controller reference making the workload own derived objects.
    pub(crate) fn owner_reference(&self) -> PluginResult<OwnerReference> {
        let mut owner = self
            .model_serving
            .controller_owner_ref(&())
            .ok_or_else(|| {
                Report::new(PluginError::InvalidRequest {
                    field: "ModelServing name or uid",
                })
            })?;
        owner.block_owner_deletion = Some(true);
        Ok(owner)
    }
}

/// Lifecycle hooks a plugin may implement.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Invoked before the pod is created. Mutations to `req.pod` are kept.
    async fn on_pod_create(
        &self,
        cancel: &CancellationToken,
        req: &mut HookRequest,
    ) -> PluginResult<()>;

    /// Invoked when the pod is observed running and ready.
    async fn on_pod_ready(&self, cancel: &CancellationToken, req: &HookRequest)
        -> PluginResult<()>;

    async fn on_role_delete(
        &self,
        _cancel: &CancellationToken,
        _req: &HookRequest,
    ) -> PluginResult<()> {
        Ok(())
    }

    async fn on_serving_group_delete(
        &self,
        _cancel: &CancellationToken,
        _req: &HookRequest,
    ) -> PluginResult<()> {
        Ok(())
    }
}
