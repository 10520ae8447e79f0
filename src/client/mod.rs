//! Cluster API client abstraction.
//!
//! All reconciliation code talks to the cluster through [`ClusterClient`],
//! a thin get/create/update/patch/delete/list surface over
//! [`DynamicObject`]. Production code uses [`KubeClient`]; tests substitute
//! an in-memory fake.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind, PropagationPolicy};
use serde_json::Value;

use crate::error::Result;

mod kube_client;
pub use kube_client::KubeClient;

#[cfg(test)]
pub mod fake;

/// Identity tuple (GVK + namespace + name) for a cluster object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(String::from),
            name: name.into(),
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Self {
        let (api_version, kind) = match &obj.types {
            Some(t) => (t.api_version.clone(), t.kind.clone()),
            None => (String::new(), String::new()),
        };
        Self {
            api_version,
            kind,
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        gvk(&self.api_version, &self.kind)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Builds a [`GroupVersionKind`] from an `apiVersion` string and kind.
pub fn gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };
    GroupVersionKind::gvk(group, version, kind)
}

/// Kubernetes-API-compatible collaborator the reconciliation core runs
/// against. Implementations must map server rejections onto the
/// distinguished [`crate::error::Error`] kinds (NotFound, AlreadyExists,
/// Invalid, Conflict, Gone) so callers can branch on them.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Full replace of an existing object; the object's resourceVersion
    /// must match the stored one.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Applies a JSON merge patch to an existing object.
    async fn patch(&self, key: &ResourceKey, patch: &Value) -> Result<DynamicObject>;

    async fn delete(&self, key: &ResourceKey, propagation: PropagationPolicy) -> Result<()>;

    /// Lists objects of `gvk`, optionally namespace-scoped, matching every
    /// label in `selector`.
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;
}
