use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;

use super::ConfigMapLister;
use super::ConfigMapStore;
use super::LabelSet;
use super::PodLister;
use super::StoreError;
use super::StoreResult;

type ObjectKey = (String, String);

#[derive(Default)]
struct State {
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
    pods: BTreeMap<ObjectKey, Pod>,
    resource_version: u64,
    writes: usize,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-process store with the same optimistic concurrency rules as the API
/// server. Used by the offline CLI and by tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

fn key_of(namespace: Option<&String>, name: Option<&String>) -> ObjectKey {
    (
        namespace.cloned().unwrap_or_else(|| "default".to_string()),
        name.cloned().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed or overwrite a ConfigMap without counting it as a write.
    pub fn insert_config_map(&self, mut config_map: ConfigMap) {
        let mut state = self.lock();
        let key = key_of(
            config_map.metadata.namespace.as_ref(),
            config_map.metadata.name.as_ref(),
        );
        config_map.metadata.namespace = Some(key.0.clone());
        config_map.metadata.resource_version = Some(state.next_resource_version());
        state.config_maps.insert(key, config_map);
    }

    /// Seed or overwrite a pod.
    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.lock();
        let key = key_of(pod.metadata.namespace.as_ref(), pod.metadata.name.as_ref());
        pod.metadata.namespace = Some(key.0.clone());
        state.pods.insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.remove(&key(namespace, name))
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock().config_maps.get(&key(namespace, name)).cloned()
    }

    pub fn config_maps(&self) -> Vec<ConfigMap> {
        self.lock().config_maps.values().cloned().collect()
    }

    /// Number of successful create/update/delete calls.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }
}

#[async_trait]
impl ConfigMapStore for InMemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
        Ok(self.config_map(namespace, name))
    }

    async fn create(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap> {
        let mut state = self.lock();
        let key = key_of(
            config_map.metadata.namespace.as_ref(),
            config_map.metadata.name.as_ref(),
        );
        if state.config_maps.contains_key(&key) {
            return Err(Report::new(StoreError::AlreadyExists {
                namespace: key.0,
                name: key.1,
            }));
        }

        let mut created = config_map.clone();
        created.metadata.namespace = Some(key.0.clone());
        created.metadata.resource_version = Some(state.next_resource_version());
        state.config_maps.insert(key, created.clone());
        state.writes += 1;
        Ok(created)
    }

    async fn update(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap> {
        let mut state = self.lock();
        let key = key_of(
            config_map.metadata.namespace.as_ref(),
            config_map.metadata.name.as_ref(),
        );
        let Some(current) = state.config_maps.get(&key) else {
            return Err(Report::new(StoreError::NotFound {
                namespace: key.0,
                name: key.1,
            }));
        };
        if config_map.metadata.resource_version.is_some()
            && current.metadata.resource_version != config_map.metadata.resource_version
        {
            return Err(Report::new(StoreError::Conflict {
                namespace: key.0,
                name: key.1,
            }));
        }

        let mut updated = config_map.clone();
        updated.metadata.namespace = Some(key.0.clone());
        updated.metadata.resource_version = Some(state.next_resource_version());
        state.config_maps.insert(key, updated.clone());
        state.writes += 1;
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut state = self.lock();
        match state.config_maps.remove(&key(namespace, name)) {
            Some(_) => {
                state.writes += 1;
                Ok(())
            }
            None => Err(Report::new(StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })),
        }
    }

    async fn list(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<ConfigMap>> {
        Ok(self
            .lock()
            .config_maps
            .iter()
            .filter(|((ns, _), cm)| ns == namespace && selector.matches(cm.metadata.labels.as_ref()))
            .map(|(_, cm)| cm.clone())
            .collect())
    }
}

impl PodLister for InMemoryStore {
    fn list_pods(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && selector.matches(pod.metadata.labels.as_ref())
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }
}

impl ConfigMapLister for InMemoryStore {
    fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
        Ok(self.config_map(namespace, name))
    }
}
