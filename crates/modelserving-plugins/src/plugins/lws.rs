//! LeaderWorkerSet compatibility plugin
//!
//! Stamps the labels, annotations and env vars a LeaderWorkerSet would set,
//! so workloads written against LWS run unchanged under a ModelServing.

use std::collections::BTreeMap;

use api_types::ENTRY_ADDRESS_ENV;
use api_types::GROUP_SIZE_ENV;
use api_types::WORKER_INDEX_ENV;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::Pod;
use sha1::Digest;
use sha1::Sha1;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::HookRequest;
use super::Plugin;
use super::PluginResult;

pub const PLUGIN_NAME: &str = "lws";

pub const NAME_LABEL_KEY: &str = "leaderworkerset.sigs.k8s.io/name";
pub const GROUP_INDEX_LABEL_KEY: &str = "leaderworkerset.sigs.k8s.io/group-index";
pub const GROUP_HASH_LABEL_KEY: &str = "leaderworkerset.sigs.k8s.io/group-key";
pub const WORKER_INDEX_LABEL_KEY: &str = "leaderworkerset.sigs.k8s.io/worker-index";
pub const SIZE_ANNOTATION_KEY: &str = "leaderworkerset.sigs.k8s.io/size";
pub const REPLICAS_ANNOTATION_KEY: &str = "leaderworkerset.sigs.k8s.io/replicas";

pub const LWS_WORKER_INDEX_ENV: &str = "LWS_WORKER_INDEX";
pub const LWS_GROUP_SIZE_ENV: &str = "LWS_GROUP_SIZE";
pub const LWS_LEADER_ADDRESS_ENV: &str = "LWS_LEADER_ADDRESS";

pub struct LwsPlugin {
    name: String,
}

/// Ordinal of a serving group, parsed from its trailing `-<n>`.
pub fn group_index(serving_group: &str) -> Option<u32> {
    let (parent, ordinal) = serving_group.rsplit_once('-')?;
    if parent.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ordinal.parse().ok()
}

/// Hex SHA-1 of the serving group name.
pub fn group_hash(serving_group: &str) -> String {
    hex::encode(Sha1::digest(serving_group.as_bytes()))
}

/// Values the controller already injected, read from the first container.
#[derive(Debug, Default, PartialEq, Eq)]
struct ControllerEnv {
    worker_index: Option<String>,
    group_size: Option<String>,
    entry_address: Option<String>,
}

impl ControllerEnv {
    fn from_pod(pod: &Pod) -> Self {
        let mut found = Self::default();
        let env = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .and_then(|c| c.env.as_ref());
        for var in env.into_iter().flatten() {
            let Some(value) = var.value.clone().filter(|v| !v.is_empty()) else {
                continue;
            };
            match var.name.as_str() {
                WORKER_INDEX_ENV => found.worker_index = Some(value),
                GROUP_SIZE_ENV => found.group_size = Some(value),
                ENTRY_ADDRESS_ENV => found.entry_address = Some(value),
                _ => {}
            }
        }
        found
    }
}

fn append_env(pod: &mut Pod, vars: &[EnvVar]) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    let init_containers = spec.init_containers.iter_mut().flatten();
    for container in spec.containers.iter_mut().chain(init_containers) {
        container
            .env
            .get_or_insert_with(Vec::new)
            .extend_from_slice(vars);
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

impl LwsPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Plugin for LwsPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_pod_create(
        &self,
        _cancel: &CancellationToken,
        req: &mut HookRequest,
    ) -> PluginResult<()> {
        let Some(pod) = req.pod.as_mut() else {
            return Ok(());
        };
        let model_serving = req.model_serving.clone();

        let mut labels = BTreeMap::from([
            (
                NAME_LABEL_KEY.to_string(),
                format!("{}-{}", model_serving.name(), req.role_name),
            ),
            (GROUP_HASH_LABEL_KEY.to_string(), group_hash(&req.serving_group)),
        ]);
        if let Some(index) = group_index(&req.serving_group) {
            labels.insert(GROUP_INDEX_LABEL_KEY.to_string(), index.to_string());
        }

        let env = ControllerEnv::from_pod(pod);
        let mut annotations = BTreeMap::new();
        let mut injected = Vec::new();
        if let Some(worker_index) = &env.worker_index {
            labels.insert(WORKER_INDEX_LABEL_KEY.to_string(), worker_index.clone());
            injected.push(env_var(LWS_WORKER_INDEX_ENV, worker_index));
        }
        if let Some(group_size) = &env.group_size {
            annotations.insert(SIZE_ANNOTATION_KEY.to_string(), group_size.clone());
            injected.push(env_var(LWS_GROUP_SIZE_ENV, group_size));
        }
        if let Some(entry_address) = &env.entry_address {
            injected.push(env_var(LWS_LEADER_ADDRESS_ENV, entry_address));
        }
        if let Some(replicas) = model_serving.spec.replicas {
            annotations.insert(REPLICAS_ANNOTATION_KEY.to_string(), replicas.to_string());
        }

        debug!(
            plugin = %self.name,
            group = %req.serving_group,
            env = injected.len(),
            "Applying LeaderWorkerSet metadata"
        );
        pod.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels);
        if !annotations.is_empty() {
            pod.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(annotations);
        }
        if !injected.is_empty() {
            append_env(pod, &injected);
        }
        Ok(())
    }

    async fn on_pod_ready(&self, _cancel: &CancellationToken, _req: &HookRequest) -> PluginResult<()> {
        Ok(())
    }
}
