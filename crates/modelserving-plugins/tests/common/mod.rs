#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::ModelServing;
use api_types::ModelServingSpec;
use api_types::Role;
use api_types::ServingGroupTemplate;
use api_types::GROUP_NAME_LABEL_KEY;
use api_types::MODEL_SERVING_NAME_LABEL_KEY;
use api_types::ROLE_ID_LABEL_KEY;
use api_types::ROLE_LABEL_KEY;
use chrono::TimeZone;
use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use modelserving_plugins::domain::ranktable::*;
use modelserving_plugins::domain::RetryPolicy;
use modelserving_plugins::infrastructure::store::memory::InMemoryStore;
use modelserving_plugins::infrastructure::store::ClusterHandles;
use modelserving_plugins::plugins::HookRequest;
use modelserving_plugins::plugins::PluginSettings;

pub const TEMPLATE_NAMESPACE: &str = "kthena-system";
pub const NAMESPACE: &str = "serving";
pub const MODEL_SERVING: &str = "llama";
pub const GROUP: &str = "llama-0";
pub const ROLE: &str = "prefill";
pub const ROLE_ID: &str = "prefill-0";

pub const PARSER_TEMPLATE: &str = r#"{% set data = annotation | fromJson %}
podName: {{ data.pod_name | quote }}
serverId: {{ data.server_id | quote }}
devices:
{% for d in data.devices | default([]) %}
  - deviceId: {{ d.device_id | quote }}
    deviceIp: {{ d.device_ip | quote }}
{% endfor %}
"#;

pub const RANKTABLE_TEMPLATE: &str = r#"{
  "status": {{ Status | quote }},
  "server_count": {{ ServerCount | quote }},
  "server_list": [
{% for server in Servers %}
    {"server_id": {{ server.ServerId | quote }}, "device": [
{% for d in server.Devices %}
      {"device_id": {{ d.DeviceId | quote }}, "device_ip": {{ d.DeviceIp | quote }}, "rank_id": {{ d.RankId | quote }}}{% if not loop.last %},{% endif %}

{% endfor %}
    ]}{% if not loop.last %},{% endif %}

{% endfor %}
  ]
}"#;

pub fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEMPLATE_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Store seeded with a `mindie` template at the given level and its parser.
pub fn seeded_store(level: RanktableLevel) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.insert_config_map(config_map(
        "mindie",
        &[
            (LEVEL_KEY, level.as_str()),
            (POD_PARSER_TEMPLATE_KEY, "ascend-parser"),
            (RANKTABLE_TEMPLATE_KEY, RANKTABLE_TEMPLATE),
            (MOUNT_PATH_KEY, "/user/serverid/devindex/config"),
            (FILENAME_KEY, "hccl.json"),
            (INFERENCE_ENGINE_KEY, "mindie"),
        ],
    ));
    store.insert_config_map(config_map(
        "ascend-parser",
        &[(PARSER_TEMPLATE_KEY, PARSER_TEMPLATE)],
    ));
    store
}

pub fn settings() -> PluginSettings {
    PluginSettings {
        template_namespace: TEMPLATE_NAMESPACE.to_string(),
        retry: RetryPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        },
        clock: Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())),
    }
}

pub fn model_serving(worker_replicas: i32) -> Arc<ModelServing> {
    Arc::new(ModelServing {
        metadata: ObjectMeta {
            name: Some(MODEL_SERVING.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("4f7c2a1e-0000-4000-8000-000000000001".to_string()),
            ..Default::default()
        },
        spec: ModelServingSpec {
            template: ServingGroupTemplate {
                roles: vec![Role {
                    name: ROLE.to_string(),
                    replicas: Some(1),
                    worker_replicas,
                }],
            },
            ..Default::default()
        },
    })
}

pub fn annotation(pod_name: &str, server_id: &str, devices: &[(&str, &str)]) -> String {
    serde_json::json!({
        "pod_name": pod_name,
        "server_id": server_id,
        "devices": devices
            .iter()
            .map(|(id, ip)| serde_json::json!({"device_id": id, "device_ip": ip}))
            .collect::<Vec<_>>(),
    })
    .to_string()
}

pub fn labels(role_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MODEL_SERVING_NAME_LABEL_KEY.to_string(), MODEL_SERVING.to_string()),
        (GROUP_NAME_LABEL_KEY.to_string(), GROUP.to_string()),
        (ROLE_LABEL_KEY.to_string(), ROLE.to_string()),
        (ROLE_ID_LABEL_KEY.to_string(), role_id.to_string()),
    ])
}

/// Running pod of the `prefill-0` role instance.
pub fn running_pod(name: &str, ip: &str, annotation: Option<String>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels(ROLE_ID)),
            annotations: annotation
                .map(|value| BTreeMap::from([(POD_RANKTABLE_ANNOTATION.to_string(), value)])),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn request(
    store: Arc<InMemoryStore>,
    model_serving: Arc<ModelServing>,
    pod: Option<Pod>,
) -> HookRequest {
    HookRequest {
        model_serving,
        serving_group: GROUP.to_string(),
        role_name: ROLE.to_string(),
        role_id: ROLE_ID.to_string(),
        is_entry: false,
        pod,
        handles: ClusterHandles::from_shared(store),
    }
}

/// Rendered rank table content stored under `hccl.json`.
pub fn ranktable_json(store: &InMemoryStore, name: &str) -> serde_json::Value {
    let content = store
        .config_map(NAMESPACE, name)
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove("hccl.json"))
        .unwrap();
    serde_json::from_str(&content).unwrap()
}
