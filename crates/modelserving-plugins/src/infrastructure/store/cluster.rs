use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::runtime::reflector;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use kube::Config;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ClusterHandles;
use super::ConfigMapLister;
use super::ConfigMapStore;
use super::LabelSet;
use super::PodLister;
use super::StoreError;
use super::StoreResult;

/// Client for the cluster named by `kubeconfig`, or the inferred one (in-cluster
/// service account, then `$KUBECONFIG` and `~/.kube/config`) when unset.
pub async fn connect_client(kubeconfig: Option<&Path>) -> StoreResult<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .change_context(StoreError::Api {
                    message: "unreadable kubeconfig".to_string(),
                })
                .attach_printable_lazy(|| format!("path: {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(StoreError::Api {
                    message: "invalid kubeconfig".to_string(),
                })
                .attach_printable_lazy(|| format!("path: {}", path.display()))?
        }
        None => Config::infer().await.change_context(StoreError::Api {
            message: "no cluster configuration found".to_string(),
        })?,
    };
    info!(
        cluster_url = %config.cluster_url,
        namespace = %config.default_namespace,
        "Connecting to cluster"
    );
    Client::try_from(config).change_context(StoreError::Api {
        message: "failed to build cluster client".to_string(),
    })
}

/// Map a kube error onto the store taxonomy, keeping the original as the report source.
fn classify(err: kube::Error, namespace: &str, name: &str) -> Report<StoreError> {
    let context = match &err {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => StoreError::Api {
            message: other.to_string(),
        },
    };
    Report::new(err).change_context(context)
}

/// ConfigMap access through the API server.
#[derive(Clone)]
pub struct KubeConfigMapStore {
    client: Client,
}

impl KubeConfigMapStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_key(config_map: &ConfigMap) -> (String, String) {
    (
        config_map.metadata.namespace.clone().unwrap_or_default(),
        config_map.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, namespace, name))
    }

    async fn create(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap> {
        let (namespace, name) = object_key(config_map);
        self.api(&namespace)
            .create(&PostParams::default(), config_map)
            .await
            .map_err(|e| classify(e, &namespace, &name))
    }

    async fn update(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap> {
        let (namespace, name) = object_key(config_map);
        self.api(&namespace)
            .replace(&name, &PostParams::default(), config_map)
            .await
            .map_err(|e| classify(e, &namespace, &name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, namespace, name))
    }

    async fn list(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<ConfigMap>> {
        let params = ListParams::default().labels(&selector.to_string());
        self.api(namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| classify(e, namespace, &selector.to_string()))
    }
}

/// Keep a reflector store of `K` up to date until the token is cancelled.
pub fn start_reflector<K>(api: Api<K>, cancellation_token: CancellationToken) -> reflector::Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let (reader, writer) = reflector::store();
    let mut stream = reflector(writer, watcher(api, watcher::Config::default()))
        .applied_objects()
        .boxed();

    tokio::spawn(async move {
        info!(kind = %K::kind(&K::DynamicType::default()), "Starting reflector");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Reflector shutdown requested");
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Reflector watch failed: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    None => {
                        warn!("Reflector stream ended unexpectedly");
                        break;
                    }
                },
            }
        }
    });

    reader
}

/// Pod lister backed by a reflector cache.
pub struct ReflectorPodLister {
    reader: reflector::Store<Pod>,
}

impl ReflectorPodLister {
    pub fn new(reader: reflector::Store<Pod>) -> Self {
        Self { reader }
    }
}

impl PodLister for ReflectorPodLister {
    fn list_pods(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<Pod>> {
        Ok(self
            .reader
            .state()
            .into_iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| selector.matches(pod.metadata.labels.as_ref()))
            .map(|pod| Pod::clone(&pod))
            .collect())
    }
}

/// ConfigMap lister backed by a reflector cache.
pub struct ReflectorConfigMapLister {
    reader: reflector::Store<ConfigMap>,
}

impl ReflectorConfigMapLister {
    pub fn new(reader: reflector::Store<ConfigMap>) -> Self {
        Self { reader }
    }
}

impl ConfigMapLister for ReflectorConfigMapLister {
    fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self.reader.get(&key).map(|cm| ConfigMap::clone(&cm)))
    }
}

async fn wait_synced<K>(reader: &reflector::Store<K>) -> StoreResult<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    reader.wait_until_ready().await.map_err(|_| {
        Report::new(StoreError::Api {
            message: format!(
                "{} cache stopped before its first listing",
                K::kind(&K::DynamicType::default())
            ),
        })
    })
}

impl ClusterHandles {
    /// Build handles against a cluster. Pods are watched in `pod_namespace`
    /// and templates in `template_namespace` until `cancellation_token` fires.
    /// Returns once both caches hold a full listing.
    pub async fn connect(
        client: Client,
        pod_namespace: &str,
        template_namespace: &str,
        cancellation_token: CancellationToken,
    ) -> StoreResult<Self> {
        let pods = start_reflector(
            Api::<Pod>::namespaced(client.clone(), pod_namespace),
            cancellation_token.clone(),
        );
        let templates = start_reflector(
            Api::<ConfigMap>::namespaced(client.clone(), template_namespace),
            cancellation_token,
        );
        wait_synced(&pods).await?;
        wait_synced(&templates).await?;
        info!(pod_namespace, template_namespace, "Cluster caches synced");

        Ok(Self {
            config_maps: Arc::new(KubeConfigMapStore::new(client)),
            pod_lister: Arc::new(ReflectorPodLister::new(pods)),
            config_map_lister: Arc::new(ReflectorConfigMapLister::new(templates)),
        })
    }
}
