//! Backing store contract.
//!
//! The plugins never talk to the API server directly. Everything they need is
//! behind three small seams:
//! - [`ConfigMapStore`]: live, versioned read/write access to ConfigMaps
//! - [`PodLister`]: cached, read-only pod listing by label
//! - [`ConfigMapLister`]: cached, read-only ConfigMap lookup (templates)
//!
//! [`cluster`] implements them against the API server, [`memory`] in process.

use core::error::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;

pub mod cluster;
pub mod memory;

pub type StoreResult<T> = Result<T, Report<StoreError>>;

/// Errors returned by the backing store.
#[derive(Debug, derive_more::Display)]
pub enum StoreError {
    #[display("ConfigMap {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[display("ConfigMap {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },
    #[display("ConfigMap {namespace}/{name} was modified concurrently")]
    Conflict { namespace: String, name: String },
    #[display("API request failed: {message}")]
    Api { message: String },
}

impl Error for StoreError {}

impl StoreError {
    /// Whether a fresh read-modify-write cycle can succeed where this one failed.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. } | Self::Conflict { .. })
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Equality based label selector, rendered as `k1=v1,k2=v2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Whether every pair of the selector is present in `labels`.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(key, value)| {
            labels
                .and_then(|labels| labels.get(key))
                .is_some_and(|actual| actual == value)
        })
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Live ConfigMap access with optimistic concurrency.
///
/// `update` must reject the write with [`StoreError::Conflict`] when the
/// passed object's `resourceVersion` no longer matches the stored one, and
/// `create` must fail with [`StoreError::AlreadyExists`] on a name clash.
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>>;

    async fn create(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap>;

    async fn update(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap>;

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;

    async fn list(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<ConfigMap>>;
}

/// Cached pod listing.
pub trait PodLister: Send + Sync {
    fn list_pods(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<Pod>>;
}

/// Cached ConfigMap lookup.
pub trait ConfigMapLister: Send + Sync {
    fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>>;
}

/// Store handles passed to every hook invocation.
#[derive(Clone)]
pub struct ClusterHandles {
    pub config_maps: Arc<dyn ConfigMapStore>,
    pub pod_lister: Arc<dyn PodLister>,
    pub config_map_lister: Arc<dyn ConfigMapLister>,
}

impl fmt::Debug for ClusterHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandles").finish_non_exhaustive()
    }
}

impl ClusterHandles {
    /// Use one object for all three seams.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: ConfigMapStore + PodLister + ConfigMapLister + 'static,
    {
        Self {
            config_maps: store.clone(),
            pod_lister: store.clone(),
            config_map_lister: store,
        }
    }
}
