//! [`ClusterClient`] implementation backed by a real `kube::Client`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams, PropagationPolicy,
};
use kube::discovery::ApiResource;
use serde_json::Value;

use crate::error::{Error, Result};

use super::{ClusterClient, ResourceKey};

#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api_for(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject> {
        let api = self.api_for(&key.gvk(), key.namespace.as_deref());
        api.get(&key.name).await.map_err(|e| classify(e, key))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj);
        let api = self.api_for(&key.gvk(), key.namespace.as_deref());
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj);
        let api = self.api_for(&key.gvk(), key.namespace.as_deref());
        api.replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key))
    }

    async fn patch(&self, key: &ResourceKey, patch: &Value) -> Result<DynamicObject> {
        let api = self.api_for(&key.gvk(), key.namespace.as_deref());
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, key))
    }

    async fn delete(&self, key: &ResourceKey, propagation: PropagationPolicy) -> Result<()> {
        let api = self.api_for(&key.gvk(), key.namespace.as_deref());
        let params = DeleteParams {
            propagation_policy: Some(propagation),
            ..Default::default()
        };
        api.delete(&key.name, &params)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, key))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api_for(gvk, namespace);
        let labels = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&labels);
        }
        let list = api.list(&params).await.map_err(|e| {
            classify(e, &ResourceKey::new(gvk.api_version(), &gvk.kind, namespace, "*"))
        })?;
        Ok(list.items)
    }
}

/// Maps kube API rejections onto the distinguished error kinds the
/// reconciliation core branches on.
fn classify(err: kube::Error, key: &ResourceKey) -> Error {
    if let kube::Error::Api(ref resp) = err {
        let what = key.to_string();
        match (resp.code, resp.reason.as_str()) {
            (404, _) | (_, "NotFound") => return Error::NotFound(what),
            (_, "AlreadyExists") => return Error::AlreadyExists(what),
            (410, _) | (_, "Gone") => return Error::Gone(what),
            (422, _) | (_, "Invalid") => return Error::Invalid(what, resp.message.clone()),
            (409, _) | (_, "Conflict") => return Error::Conflict(what),
            _ => {}
        }
    }
    Error::KubeError(err)
}

/// Builds an [`ApiResource`] for a GVK, guessing the resource plural the
/// same way the discovery fallback does. Covers every kind this operator
/// touches (ConfigMaps, RoleBindings, NetworkPolicies, CRDs, ...).
fn api_resource(gvk: &GroupVersionKind) -> ApiResource {
    ApiResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        api_version: gvk.api_version(),
        kind: gvk.kind.clone(),
        plural: pluralize(&gvk.kind),
    }
}

fn pluralize(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{lower}es")
    } else {
        format!("{lower}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pluralize_common_kinds() {
        assert_eq!(pluralize("ConfigMap"), "configmaps");
        assert_eq!(pluralize("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize("Ingress"), "ingresses");
        assert_eq!(
            pluralize("CustomResourceDefinition"),
            "customresourcedefinitions"
        );
        assert_eq!(
            pluralize("NetworkAttachmentDefinition"),
            "networkattachmentdefinitions"
        );
    }

    #[test]
    fn test_classify_not_found() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "configmaps \"foo\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        let key = ResourceKey::new("v1", "ConfigMap", Some("test"), "foo");
        assert!(classify(err, &key).is_not_found());
    }

    #[test]
    fn test_classify_invalid() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "field is immutable".to_string(),
            reason: "Invalid".to_string(),
            code: 422,
        });
        let key = ResourceKey::new("v1", "Service", Some("test"), "foo");
        assert!(classify(err, &key).is_invalid());
    }
}
