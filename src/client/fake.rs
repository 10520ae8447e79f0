//! In-memory fake cluster used by unit tests in place of a real API
//! server. Mirrors the server behaviors the reconciliation core depends
//! on: resource-version bookkeeping, AlreadyExists/NotFound rejections,
//! JSON merge-patch application, label-selector lists, and Invalid
//! rejections for configured immutable field paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind, PropagationPolicy};
use serde_json::Value;

use crate::error::{Error, Result};

use super::{ClusterClient, ResourceKey};

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<BTreeMap<ResourceKey, DynamicObject>>,
    next_rv: AtomicU64,
    generate_counter: AtomicU64,

    creates: AtomicUsize,
    updates: AtomicUsize,
    patches: AtomicUsize,
    deletes: AtomicUsize,

    immutable_paths: Mutex<Vec<String>>,
    create_errors: Mutex<VecDeque<Error>>,
    patch_errors: Mutex<VecDeque<Error>>,
    delete_errors: Mutex<VecDeque<Error>>,

    // When set, every operation sleeps for the delay while counted as
    // in-flight, so tests can observe whether callers overlap requests.
    op_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an object directly, bypassing counters. Assigns a
    /// resourceVersion if the object has none.
    pub fn seed(&self, mut obj: DynamicObject) {
        if obj.metadata.resource_version.is_none() {
            obj.metadata.resource_version = Some(self.bump_rv());
        }
        let key = ResourceKey::from_object(&obj);
        self.state.lock().unwrap().insert(key, obj);
    }

    pub fn get_stored(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Total write operations that reached the store.
    pub fn mutations(&self) -> usize {
        self.creates() + self.updates() + self.patches() + self.deletes()
    }

    /// Patches touching `path` (dotted, e.g. `spec.selector`) with a value
    /// differing from the stored one are rejected as Invalid, like an API
    /// server refusing an immutable-field change.
    pub fn set_immutable_path(&self, path: &str) {
        self.immutable_paths.lock().unwrap().push(path.to_string());
    }

    pub fn inject_create_error(&self, err: Error) {
        self.create_errors.lock().unwrap().push_back(err);
    }

    pub fn inject_patch_error(&self, err: Error) {
        self.patch_errors.lock().unwrap().push_back(err);
    }

    pub fn inject_delete_error(&self, err: Error) {
        self.delete_errors.lock().unwrap().push_back(err);
    }

    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of operations ever observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn bump_rv(&self) -> String {
        (self.next_rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    async fn begin_op(&self) {
        let delay = *self.op_delay.lock().unwrap();
        if let Some(delay) = delay {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
        }
    }

    fn end_op(&self) {
        if self.op_delay.lock().unwrap().is_some() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject> {
        self.begin_op().await;
        let result = self
            .state
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()));
        self.end_op();
        result
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.begin_op().await;
        let result = (|| {
            if let Some(err) = self.create_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut stored = obj.clone();
            if stored.metadata.name.as_deref().unwrap_or("").is_empty() {
                let prefix = stored
                    .metadata
                    .generate_name
                    .clone()
                    .ok_or_else(|| Error::Invalid(
                        "unknown".to_string(),
                        "name or generateName is required".to_string(),
                    ))?;
                let n = self.generate_counter.fetch_add(1, Ordering::SeqCst);
                stored.metadata.name = Some(format!("{prefix}{n}"));
            }
            let key = ResourceKey::from_object(&stored);
            let mut state = self.state.lock().unwrap();
            if state.contains_key(&key) {
                return Err(Error::AlreadyExists(key.to_string()));
            }
            stored.metadata.resource_version = Some(self.bump_rv());
            state.insert(key, stored.clone());
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(stored)
        })();
        self.end_op();
        result
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.begin_op().await;
        let result = (|| {
            let key = ResourceKey::from_object(obj);
            let mut state = self.state.lock().unwrap();
            let existing = state
                .get(&key)
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            if let Some(rv) = &obj.metadata.resource_version {
                if Some(rv) != existing.metadata.resource_version.as_ref() {
                    return Err(Error::Conflict(key.to_string()));
                }
            }
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(self.bump_rv());
            state.insert(key, stored.clone());
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(stored)
        })();
        self.end_op();
        result
    }

    async fn patch(&self, key: &ResourceKey, patch: &Value) -> Result<DynamicObject> {
        self.begin_op().await;
        let result = (|| {
            if let Some(err) = self.patch_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut state = self.state.lock().unwrap();
            let existing = state
                .get(key)
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            let mut live = serde_json::to_value(existing)?;
            for path in self.immutable_paths.lock().unwrap().iter() {
                if let Some(patched) = value_at(patch, path) {
                    if value_at(&live, path) != Some(patched) {
                        return Err(Error::Invalid(
                            key.to_string(),
                            format!("{path}: field is immutable"),
                        ));
                    }
                }
            }
            merge_json(&mut live, patch);
            let mut stored: DynamicObject = serde_json::from_value(live)?;
            stored.metadata.resource_version = Some(self.bump_rv());
            state.insert(key.clone(), stored.clone());
            self.patches.fetch_add(1, Ordering::SeqCst);
            Ok(stored)
        })();
        self.end_op();
        result
    }

    async fn delete(&self, key: &ResourceKey, _propagation: PropagationPolicy) -> Result<()> {
        self.begin_op().await;
        let result = (|| {
            if let Some(err) = self.delete_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.state
                .lock()
                .unwrap()
                .remove(key)
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })();
        self.end_op();
        result
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        self.begin_op().await;
        let api_version = gvk.api_version();
        let items = self
            .state
            .lock()
            .unwrap()
            .values()
            .filter(|obj| {
                let Some(types) = &obj.types else { return false };
                if types.api_version != api_version || types.kind != gvk.kind {
                    return false;
                }
                if let Some(ns) = namespace {
                    if obj.metadata.namespace.as_deref() != Some(ns) {
                        return false;
                    }
                }
                let labels = obj.metadata.labels.clone().unwrap_or_default();
                selector
                    .iter()
                    .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
            })
            .cloned()
            .collect();
        self.end_op();
        Ok(items)
    }
}

/// Builds a [`DynamicObject`] from literal JSON. Panics on malformed
/// input; test fixtures only.
pub fn obj(value: Value) -> DynamicObject {
    serde_json::from_value(value).expect("valid object JSON")
}

/// RFC 7386 JSON merge patch: objects merge recursively, `null` removes a
/// key, everything else replaces.
pub fn merge_json(target: &mut Value, patch: &Value) {
    if let Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = Value::Object(serde_json::Map::new());
        }
        let target_map = target.as_object_mut().unwrap();
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_json(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config_map(name: &str, data: Value) -> DynamicObject {
        obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "test"},
            "data": data,
        }))
    }

    #[tokio::test]
    async fn test_create_then_get_roundtrip() {
        let cluster = FakeCluster::new();
        let created = cluster
            .create(&config_map("cm", json!({"a": "1"})))
            .await
            .unwrap();
        assert!(created.metadata.resource_version.is_some());

        let key = ResourceKey::new("v1", "ConfigMap", Some("test"), "cm");
        let fetched = cluster.get(&key).await.unwrap();
        assert_eq!(fetched.data["data"]["a"], "1");

        let err = cluster
            .create(&config_map("cm", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_merge_patch_null_removes_key() {
        let cluster = FakeCluster::new();
        cluster.seed(config_map("cm", json!({"a": "1", "b": "2"})));

        let key = ResourceKey::new("v1", "ConfigMap", Some("test"), "cm");
        let patched = cluster
            .patch(&key, &json!({"data": {"a": "changed", "b": null}}))
            .await
            .unwrap();
        assert_eq!(patched.data["data"], json!({"a": "changed"}));
    }

    #[tokio::test]
    async fn test_immutable_path_rejected_as_invalid() {
        let cluster = FakeCluster::new();
        cluster.set_immutable_path("spec.selector");
        cluster.seed(obj(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "test"},
            "spec": {"selector": {"app": "old"}},
        })));

        let key = ResourceKey::new("v1", "Service", Some("test"), "svc");
        let err = cluster
            .patch(&key, &json!({"spec": {"selector": {"app": "new"}}}))
            .await
            .unwrap_err();
        assert!(err.is_invalid());
    }

    #[tokio::test]
    async fn test_list_filters_by_label_and_namespace() {
        let cluster = FakeCluster::new();
        let mut labeled = config_map("one", json!({}));
        labeled.metadata.labels =
            Some(BTreeMap::from([("owner".to_string(), "mesh".to_string())]));
        cluster.seed(labeled);
        cluster.seed(config_map("two", json!({})));

        let selector = BTreeMap::from([("owner".to_string(), "mesh".to_string())]);
        let items = cluster
            .list(&super::super::gvk("v1", "ConfigMap"), Some("test"), &selector)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata.name.as_deref(), Some("one"));
    }
}
