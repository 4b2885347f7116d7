//! Reconciles rendered artifacts into ConfigMaps.
//!
//! Writes are optimistic read-modify-write cycles. A cycle that loses a race
//! (`AlreadyExists` on create, `Conflict` or `NotFound` on update) is repeated
//! from the read
//! at a fixed interval until the retry ceiling, after which the invocation
//! fails with [`ReconcileError::Timeout`].

use core::error::Error;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::infrastructure::store::ConfigMapStore;
use crate::infrastructure::store::LabelSet;
use crate::infrastructure::store::StoreError;
use crate::infrastructure::store::StoreResult;

#[derive(Debug, derive_more::Display)]
pub enum ReconcileError {
    #[display("ConfigMap store request failed")]
    Store,
    #[display("Gave up reconciling ConfigMap {namespace}/{name} after {attempts} attempts")]
    Timeout {
        namespace: String,
        name: String,
        attempts: u32,
    },
    #[display("Reconciliation cancelled")]
    Cancelled,
}

impl Error for ReconcileError {}

/// Fixed interval retry with an overall ceiling. The first attempt is
/// immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Desired state of one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactTarget {
    pub namespace: String,
    pub name: String,
    pub owner_references: Vec<OwnerReference>,
    pub labels: BTreeMap<String, String>,
    /// Data key the content is stored under
    pub key: String,
    pub content: String,
}

impl ArtifactTarget {
    fn desired_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.key.clone(), self.content.clone())])
    }

    fn to_config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(self.owner_references.clone()),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            data: Some(self.desired_data()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = StoreResult<T>>,
) -> Result<T, Report<ReconcileError>> {
    select! {
        biased;
        _ = cancel.cancelled() => Err(Report::new(ReconcileError::Cancelled)),
        result = call => result.change_context(ReconcileError::Store),
    }
}

/// A write that lost to another writer. `NotFound` can only come from an
/// update whose object was deleted after the read.
fn lost_race(report: &Report<ReconcileError>) -> bool {
    report
        .downcast_ref::<StoreError>()
        .is_some_and(|e| e.is_recoverable() || e.is_not_found())
}

#[derive(Clone)]
pub struct ArtifactReconciler {
    store: Arc<dyn ConfigMapStore>,
    retry: RetryPolicy,
}

impl ArtifactReconciler {
    pub fn new(store: Arc<dyn ConfigMapStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Make the stored artifact hold exactly `{key: content}`.
    pub async fn upsert(
        &self,
        cancel: &CancellationToken,
        target: &ArtifactTarget,
    ) -> Result<UpsertOutcome, Report<ReconcileError>> {
        let deadline = Instant::now() + self.retry.timeout;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let report = match self.try_upsert(cancel, target).await {
                Ok(outcome) => return Ok(outcome),
                Err(report) if lost_race(&report) => report,
                Err(report) => return Err(report),
            };

            if Instant::now() + self.retry.interval > deadline {
                return Err(report.change_context(ReconcileError::Timeout {
                    namespace: target.namespace.clone(),
                    name: target.name.clone(),
                    attempts,
                }));
            }

            debug!(
                namespace = %target.namespace,
                name = %target.name,
                attempts,
                "Lost a write race, retrying: {}",
                report.current_context()
            );

            select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(report.change_context(ReconcileError::Cancelled));
                }
                _ = tokio::time::sleep(self.retry.interval) => {}
            }
        }
    }

    async fn try_upsert(
        &self,
        cancel: &CancellationToken,
        target: &ArtifactTarget,
    ) -> Result<UpsertOutcome, Report<ReconcileError>> {
        let existing = guarded(cancel, self.store.get(&target.namespace, &target.name)).await?;

        let Some(mut existing) = existing else {
            guarded(cancel, self.store.create(&target.to_config_map())).await?;
            info!(namespace = %target.namespace, name = %target.name, "Created ConfigMap");
            return Ok(UpsertOutcome::Created);
        };

        let desired = target.desired_data();
        if existing.data.as_ref() == Some(&desired) {
            debug!(namespace = %target.namespace, name = %target.name, "ConfigMap is up to date");
            return Ok(UpsertOutcome::Unchanged);
        }

        existing.data = Some(desired);
        guarded(cancel, self.store.update(&existing)).await?;
        info!(namespace = %target.namespace, name = %target.name, "Updated ConfigMap");
        Ok(UpsertOutcome::Updated)
    }

    /// Delete one artifact. Returns `false` when it did not exist.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Report<ReconcileError>> {
        match guarded(cancel, self.store.delete(namespace, name)).await {
            Ok(()) => {
                info!(namespace = %namespace, name = %name, "Deleted ConfigMap");
                Ok(true)
            }
            Err(report)
                if report
                    .downcast_ref::<StoreError>()
                    .is_some_and(StoreError::is_not_found) =>
            {
                debug!(namespace = %namespace, name = %name, "ConfigMap already gone");
                Ok(false)
            }
            Err(report) => Err(report),
        }
    }

    /// Delete every artifact matching `selector`, returning how many were
    /// removed. Individual delete failures are logged and skipped.
    pub async fn delete_matching(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        selector: &LabelSet,
    ) -> Result<usize, Report<ReconcileError>> {
        let config_maps = guarded(cancel, self.store.list(namespace, selector))
            .await
            .attach_printable_lazy(|| format!("selector: {selector}"))?;

        let mut deleted = 0;
        for config_map in config_maps {
            let Some(name) = config_map.metadata.name.as_deref() else {
                continue;
            };
            match self.delete(cancel, namespace, name).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(report) if matches!(report.current_context(), ReconcileError::Cancelled) => {
                    return Err(report);
                }
                Err(report) => {
                    error!(namespace = %namespace, name = %name, "Failed to delete ConfigMap: {report:?}");
                }
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::infrastructure::store::memory::InMemoryStore;

    fn target(content: &str) -> ArtifactTarget {
        ArtifactTarget {
            namespace: "ns".to_string(),
            name: "llama-g0-ranktable".to_string(),
            owner_references: vec![OwnerReference {
                api_version: "workload.serving.volcano.sh/v1alpha1".to_string(),
                kind: "ModelServing".to_string(),
                name: "llama".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }],
            labels: BTreeMap::from([("app.kubernetes.io/component".to_string(), "ranktable".to_string())]),
            key: "hccl.json".to_string(),
            content: content.to_string(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        }
    }

    #[test(tokio::test)]
    async fn upsert_creates_then_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());
        let cancel = CancellationToken::new();

        let first = reconciler.upsert(&cancel, &target("{}")).await.unwrap();
        let second = reconciler.upsert(&cancel, &target("{}")).await.unwrap();

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Unchanged);
        assert_eq!(store.write_count(), 1);

        let cm = store.config_map("ns", "llama-g0-ranktable").unwrap();
        assert_eq!(cm.metadata.owner_references.unwrap()[0].name, "llama");
        assert_eq!(
            cm.metadata.labels.unwrap()["app.kubernetes.io/component"],
            "ranktable"
        );
    }

    #[test(tokio::test)]
    async fn upsert_replaces_foreign_keys() {
        let store = Arc::new(InMemoryStore::new());
        let mut seeded = target("{}").to_config_map();
        seeded.data = Some(BTreeMap::from([
            ("hccl.json".to_string(), "{}".to_string()),
            ("stale".to_string(), "x".to_string()),
        ]));
        store.insert_config_map(seeded);

        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());
        let outcome = reconciler
            .upsert(&CancellationToken::new(), &target("{}"))
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        let data = store.config_map("ns", "llama-g0-ranktable").unwrap().data.unwrap();
        assert_eq!(data.len(), 1);
    }

    /// Store failing every update with a conflict.
    struct AlwaysConflict {
        inner: InMemoryStore,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl ConfigMapStore for AlwaysConflict {
        async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
            self.inner.get(namespace, name).await
        }

        async fn create(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap> {
            self.inner.create(config_map).await
        }

        async fn update(&self, _config_map: &ConfigMap) -> StoreResult<ConfigMap> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Err(Report::new(StoreError::Conflict {
                namespace: "ns".to_string(),
                name: "llama-g0-ranktable".to_string(),
            }))
        }

        async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
            self.inner.delete(namespace, name).await
        }

        async fn list(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<ConfigMap>> {
            self.inner.list(namespace, selector).await
        }
    }

    #[test(tokio::test)]
    async fn persistent_conflict_times_out() {
        let store = Arc::new(AlwaysConflict {
            inner: InMemoryStore::new(),
            updates: AtomicUsize::new(0),
        });
        store.inner.insert_config_map(target("old").to_config_map());

        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());
        let err = reconciler
            .upsert(&CancellationToken::new(), &target("new"))
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            ReconcileError::Timeout { attempts, .. } if *attempts > 1
        ));
        assert!(store.updates.load(Ordering::SeqCst) > 1);
    }

    #[test(tokio::test)]
    async fn cancellation_interrupts_retry_wait() {
        let store = Arc::new(AlwaysConflict {
            inner: InMemoryStore::new(),
            updates: AtomicUsize::new(0),
        });
        store.inner.insert_config_map(target("old").to_config_map());
        let slow_retry = RetryPolicy {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        };
        let reconciler = ArtifactReconciler::new(store.clone(), slow_retry);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = reconciler.upsert(&cancel, &target("new")).await.unwrap_err();

        assert!(matches!(err.current_context(), ReconcileError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
    }

    /// Store failing the first update with `error`. With `vanish` the object
    /// is deleted before the failure, as if another writer removed it.
    struct FailFirstUpdate {
        inner: InMemoryStore,
        error: Mutex<Option<StoreError>>,
        vanish: bool,
        updates: AtomicUsize,
    }

    impl FailFirstUpdate {
        fn new(error: StoreError, vanish: bool) -> Self {
            let inner = InMemoryStore::new();
            inner.insert_config_map(target("old").to_config_map());
            Self {
                inner,
                error: Mutex::new(Some(error)),
                vanish,
                updates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ConfigMapStore for FailFirstUpdate {
        async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
            self.inner.get(namespace, name).await
        }

        async fn create(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap> {
            self.inner.create(config_map).await
        }

        async fn update(&self, config_map: &ConfigMap) -> StoreResult<ConfigMap> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let error = self.error.lock().unwrap().take();
            if let Some(error) = error {
                if self.vanish {
                    self.inner.delete("ns", "llama-g0-ranktable").await?;
                }
                return Err(Report::new(error));
            }
            self.inner.update(config_map).await
        }

        async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
            self.inner.delete(namespace, name).await
        }

        async fn list(&self, namespace: &str, selector: &LabelSet) -> StoreResult<Vec<ConfigMap>> {
            self.inner.list(namespace, selector).await
        }
    }

    #[test(tokio::test)]
    async fn single_conflict_is_retried_from_a_fresh_read() {
        let store = Arc::new(FailFirstUpdate::new(
            StoreError::Conflict {
                namespace: "ns".to_string(),
                name: "llama-g0-ranktable".to_string(),
            },
            false,
        ));
        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());

        let outcome = reconciler
            .upsert(&CancellationToken::new(), &target("new"))
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(store.updates.load(Ordering::SeqCst), 2);
        let data = store.inner.config_map("ns", "llama-g0-ranktable").unwrap().data.unwrap();
        assert_eq!(data["hccl.json"], "new");
    }

    #[test(tokio::test)]
    async fn artifact_deleted_before_update_is_recreated() {
        let store = Arc::new(FailFirstUpdate::new(
            StoreError::NotFound {
                namespace: "ns".to_string(),
                name: "llama-g0-ranktable".to_string(),
            },
            true,
        ));
        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());

        let outcome = reconciler
            .upsert(&CancellationToken::new(), &target("new"))
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome::Created);
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
        let data = store.inner.config_map("ns", "llama-g0-ranktable").unwrap().data.unwrap();
        assert_eq!(data["hccl.json"], "new");
    }

    #[test(tokio::test)]
    async fn cancelled_token_stops_before_writing() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconciler.upsert(&cancel, &target("{}")).await.unwrap_err();

        assert!(matches!(err.current_context(), ReconcileError::Cancelled));
        assert_eq!(store.write_count(), 0);
    }

    #[test(tokio::test)]
    async fn delete_tolerates_missing() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());
        let cancel = CancellationToken::new();

        assert!(!reconciler.delete(&cancel, "ns", "nope").await.unwrap());

        reconciler.upsert(&cancel, &target("{}")).await.unwrap();
        assert!(reconciler.delete(&cancel, "ns", "llama-g0-ranktable").await.unwrap());
    }

    #[test(tokio::test)]
    async fn delete_matching_removes_only_selected() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = ArtifactReconciler::new(store.clone(), fast_retry());
        let cancel = CancellationToken::new();

        reconciler.upsert(&cancel, &target("{}")).await.unwrap();
        let mut other = target("{}");
        other.name = "unrelated".to_string();
        other.labels = BTreeMap::from([("app".to_string(), "other".to_string())]);
        reconciler.upsert(&cancel, &other).await.unwrap();

        let selector = LabelSet::new().with("app.kubernetes.io/component", "ranktable");
        let deleted = reconciler
            .delete_matching(&cancel, "ns", &selector)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(store.config_map("ns", "unrelated").is_some());
    }
}
