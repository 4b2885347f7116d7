use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use api_types::ModelServing;
use kube::Api;
use modelserving_plugins::config::Hook;
use modelserving_plugins::config::ReconcileArgs;
use modelserving_plugins::domain::ranktable::SystemClock;
use modelserving_plugins::infrastructure::store::cluster::connect_client;
use modelserving_plugins::infrastructure::store::ClusterHandles;
use modelserving_plugins::plugins::HookRequest;
use modelserving_plugins::plugins::PluginRegistry;
use modelserving_plugins::plugins::PluginSet;
use modelserving_plugins::plugins::PluginSettings;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// Run one hook of every plugin attached to a ModelServing in the cluster.
pub async fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    let client = connect_client(args.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to the cluster: {e:?}"))?;

    let model_serving = Api::<ModelServing>::namespaced(client.clone(), &args.namespace)
        .get(&args.model_serving)
        .await
        .with_context(|| {
            format!(
                "get ModelServing {}/{}",
                args.namespace, args.model_serving
            )
        })?;

    let settings = PluginSettings {
        template_namespace: args.template_namespace.clone(),
        retry: args.retry.policy(),
        clock: Arc::new(SystemClock),
    };
    let plugins = PluginSet::build(&PluginRegistry::with_builtins(), &model_serving, &settings)
        .map_err(|e| anyhow::anyhow!("Failed to build plugins: {e:?}"))?;
    if plugins.is_empty() {
        warn!(model_serving = %args.model_serving, "ModelServing has no plugins attached");
        return Ok(());
    }
    info!(plugins = ?plugins.names(), hook = ?args.hook, "Running plugins");

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let watches = cancel.child_token();
    let handles = select! {
        biased;
        _ = cancel.cancelled() => anyhow::bail!("Interrupted while syncing cluster caches"),
        handles = ClusterHandles::connect(
            client,
            &args.namespace,
            &args.template_namespace,
            watches.clone(),
        ) => handles.map_err(|e| anyhow::anyhow!("Failed to sync cluster caches: {e:?}"))?,
    };

    let req = HookRequest {
        model_serving: Arc::new(model_serving),
        serving_group: args.serving_group.clone(),
        role_name: args.role.clone(),
        role_id: args.role_id.clone(),
        is_entry: args.entry,
        pod: None,
        handles,
    };

    let result = match args.hook {
        Hook::Ready => plugins.on_pod_ready(&cancel, &req).await,
        Hook::RoleDelete => plugins.on_role_delete(&cancel, &req).await,
        Hook::GroupDelete => plugins.on_serving_group_delete(&cancel, &req).await,
    };
    watches.cancel();
    result.map_err(|e| anyhow::anyhow!("Plugin hook failed: {e:?}"))?;

    info!(group = %args.serving_group, "Plugins reconciled");
    Ok(())
}
