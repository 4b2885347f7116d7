use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use api_types::ModelServing;
use api_types::GROUP_NAME_LABEL_KEY;
use api_types::MODEL_SERVING_NAME_LABEL_KEY;
use api_types::ROLE_ID_LABEL_KEY;
use api_types::ROLE_LABEL_KEY;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use modelserving_plugins::config::RenderArgs;
use modelserving_plugins::domain::ranktable::ranktable_config_map_name;
use modelserving_plugins::domain::ranktable::RanktableLevel;
use modelserving_plugins::domain::ranktable::ServerIdSource;
use modelserving_plugins::domain::ranktable::SystemClock;
use modelserving_plugins::domain::ranktable::TemplateResolver;
use modelserving_plugins::infrastructure::store::memory::InMemoryStore;
use modelserving_plugins::infrastructure::store::ClusterHandles;
use modelserving_plugins::plugins::ranktable::RanktableConfig;
use modelserving_plugins::plugins::HookRequest;
use modelserving_plugins::plugins::Plugin;
use modelserving_plugins::plugins::PluginSettings;
use modelserving_plugins::plugins::RanktablePlugin;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::load_template_dir;

fn offline_pod(args: &RenderArgs, name: &str, annotation_key: &str, payload: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(args.templates.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MODEL_SERVING_NAME_LABEL_KEY.to_string(), args.model_serving.clone()),
                (GROUP_NAME_LABEL_KEY.to_string(), args.serving_group.clone()),
                (ROLE_LABEL_KEY.to_string(), args.role.clone()),
                (ROLE_ID_LABEL_KEY.to_string(), args.role_id.clone()),
            ])),
            annotations: Some(BTreeMap::from([(
                annotation_key.to_string(),
                payload.to_string(),
            )])),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Feed the annotations through the rank table plugin and print the result.
pub async fn run_render(args: RenderArgs) -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let loaded = load_template_dir(
        &store,
        &args.templates.template_dir,
        &args.templates.namespace,
    )?;
    info!(loaded, "Loaded template documents");

    let template = TemplateResolver::new(args.templates.namespace.clone())
        .resolve(store.as_ref(), &args.templates.template)
        .map_err(|e| anyhow::anyhow!("Failed to resolve template: {e:?}"))?;
    if template.server_id_source == ServerIdSource::PodIp {
        warn!("Template takes server ids from pod IPs, which offline pods do not have");
    }

    let payloads: BTreeMap<String, String> = serde_json::from_str(
        &fs::read_to_string(&args.annotations)
            .with_context(|| format!("read annotations file {}", args.annotations.display()))?,
    )
    .context("annotations file must be a JSON object of pod name to annotation string")?;
    for (pod_name, payload) in &payloads {
        store.insert_pod(offline_pod(
            &args,
            pod_name,
            &template.pod_annotation_name,
            payload,
        ));
    }

    let model_serving = Arc::new(ModelServing {
        metadata: ObjectMeta {
            name: Some(args.model_serving.clone()),
            namespace: Some(args.templates.namespace.clone()),
            uid: Some(format!("offline-{}", args.model_serving)),
            ..Default::default()
        },
        ..Default::default()
    });

    let settings = PluginSettings {
        template_namespace: args.templates.namespace.clone(),
        retry: args.retry_policy(),
        clock: Arc::new(SystemClock),
    };
    let plugin = RanktablePlugin::new(
        RanktableConfig {
            template: args.templates.template.clone(),
        },
        &settings,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create rank table plugin: {e:?}"))?;

    let req = HookRequest {
        model_serving,
        serving_group: args.serving_group.clone(),
        role_name: args.role.clone(),
        role_id: args.role_id.clone(),
        is_entry: true,
        pod: None,
        handles: ClusterHandles::from_shared(store.clone()),
    };

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    plugin
        .on_pod_ready(&cancel, &req)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to generate rank table: {e:?}"))?;

    let role_id = (template.level == RanktableLevel::Role).then_some(args.role_id.as_str());
    let name = ranktable_config_map_name(&args.model_serving, &args.serving_group, role_id);
    let content = store
        .config_map(&args.templates.namespace, &name)
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(&template.filename))
        .with_context(|| format!("rank table ConfigMap {name} was not written"))?;

    println!("{content}");
    Ok(())
}
