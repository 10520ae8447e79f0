//! Namespace mesh-membership reconciliation.
//!
//! Joining a namespace to a mesh means labeling the namespace and copying
//! the mesh's template objects (role bindings plus whatever the selected
//! networking strategy manages) into it; leaving means deleting the
//! copies and removing the label. Convergence is driven by the
//! required/existing set difference, so repeated reconciliation of an
//! already-member namespace is a no-op.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DynamicObject, ObjectMeta, PropagationPolicy};
use serde_json::json;
use tracing::{error, info};

use crate::client::{gvk, ClusterClient, ResourceKey};
use crate::controller::resource_meta::{
    get_annotation, get_label, member_selector, owner_selector, set_label, INTERNAL_KEY,
    MEMBER_OF_KEY,
};
use crate::error::{AggregateError, Error, Result};

const ROLE_BINDING_API_VERSION: &str = "rbac.authorization.k8s.io/v1";
const ROLE_BINDING_KIND: &str = "RoleBinding";

const NETWORK_POLICY_API_VERSION: &str = "networking.k8s.io/v1";
const NETWORK_POLICY_KIND: &str = "NetworkPolicy";

const NET_ATTACH_DEF_API_VERSION: &str = "k8s.cni.cncf.io/v1";
const NET_ATTACH_DEF_KIND: &str = "NetworkAttachmentDefinition";

/// Capability for adding a namespace to a mesh and removing it again.
/// Implemented by the member reconciler itself and by the pluggable
/// networking strategies it delegates to.
#[async_trait]
pub trait NamespaceReconciler: Send + Sync {
    async fn reconcile_namespace_in_mesh(&self, namespace: &str) -> Result<()>;
    async fn remove_namespace_from_mesh(&self, namespace: &str) -> Result<()>;
}

/// One kind of mesh-scoped template object copied into member
/// namespaces. The required set is computed once, at construction, from
/// the mesh namespace's non-internal template objects.
struct TemplateObjectSet {
    api_version: &'static str,
    kind: &'static str,
    mesh_namespace: String,
    templates: Vec<DynamicObject>,
    required: BTreeSet<String>,
}

impl TemplateObjectSet {
    async fn load(
        client: &dyn ClusterClient,
        api_version: &'static str,
        kind: &'static str,
        mesh_namespace: &str,
    ) -> Result<Self> {
        let templates = client
            .list(
                &gvk(api_version, kind),
                Some(mesh_namespace),
                &owner_selector(mesh_namespace),
            )
            .await?;
        let mut required = BTreeSet::new();
        for template in &templates {
            if get_annotation(template, INTERNAL_KEY).is_some() {
                // internal-only objects stay in the mesh namespace
                continue;
            }
            if let Some(name) = template.metadata.name.clone() {
                required.insert(name);
            }
        }
        Ok(Self {
            api_version,
            kind,
            mesh_namespace: mesh_namespace.to_string(),
            templates,
            required,
        })
    }

    /// Converges the member namespace onto the required set: creates
    /// `required − existing`, deletes `existing − required`, leaves the
    /// intersection untouched. Individual failures are aggregated; the
    /// next reconciliation pass corrects whatever is left over.
    async fn reconcile(&self, client: &dyn ClusterClient, namespace: &str) -> Result<()> {
        let mut existing: BTreeSet<String> = client
            .list(
                &gvk(self.api_version, self.kind),
                Some(namespace),
                &member_selector(&self.mesh_namespace),
            )
            .await?
            .into_iter()
            .filter_map(|obj| obj.metadata.name)
            .collect();

        let mut errors = AggregateError::new();

        for template in &self.templates {
            let Some(name) = template.metadata.name.as_deref() else {
                continue;
            };
            if !self.required.contains(name) {
                // not required for members
                continue;
            }
            if existing.contains(name) {
                continue;
            }
            info!(kind = self.kind, name, namespace, "creating resource in member namespace");
            let copy = self.copy_into_namespace(template, namespace);
            match client.create(&copy).await {
                Ok(_) => {
                    existing.insert(name.to_string());
                }
                Err(err) => {
                    error!(kind = self.kind, name, namespace, %err, "error creating resource in member namespace");
                    errors.push(err);
                }
            }
        }

        // delete obsolete copies
        for name in existing.difference(&self.required) {
            info!(kind = self.kind, name = name.as_str(), namespace, "deleting obsolete resource from member namespace");
            let key = ResourceKey::new(self.api_version, self.kind, Some(namespace), name.clone());
            match client.delete(&key, PropagationPolicy::Foreground).await {
                Err(err) if !(err.is_not_found() || err.is_gone()) => {
                    error!(kind = self.kind, name = name.as_str(), namespace, %err, "error deleting resource from member namespace");
                    errors.push(err);
                }
                _ => {}
            }
        }

        errors.into_result()
    }

    /// Deletes every copy of this kind that the mesh placed in the
    /// namespace.
    async fn remove(&self, client: &dyn ClusterClient, namespace: &str) -> Result<()> {
        let mut errors = AggregateError::new();
        match client
            .list(
                &gvk(self.api_version, self.kind),
                Some(namespace),
                &member_selector(&self.mesh_namespace),
            )
            .await
        {
            Ok(copies) => {
                for copy in copies {
                    let key = ResourceKey::from_object(&copy);
                    info!(resource = %key, "deleting resource for mesh");
                    if let Err(err) = client.delete(&key, PropagationPolicy::Background).await {
                        if !(err.is_not_found() || err.is_gone()) {
                            error!(resource = %key, %err, "error removing resource associated with mesh");
                            errors.push(err);
                        }
                    }
                }
            }
            Err(err) => {
                error!(kind = self.kind, namespace, %err, "could not retrieve resources associated with mesh");
                errors.push(err);
            }
        }
        errors.into_result()
    }

    fn copy_into_namespace(&self, template: &DynamicObject, namespace: &str) -> DynamicObject {
        let mut copy = template.clone();
        copy.metadata = ObjectMeta {
            name: template.metadata.name.clone(),
            namespace: Some(namespace.to_string()),
            labels: template.metadata.labels.clone(),
            annotations: template.metadata.annotations.clone(),
            ..Default::default()
        };
        set_label(&mut copy, MEMBER_OF_KEY, &self.mesh_namespace);
        copy
    }
}

/// NetworkPolicy-based networking strategy: member namespaces receive
/// copies of the mesh namespace's non-internal NetworkPolicies.
pub struct NetworkPolicyStrategy {
    client: Arc<dyn ClusterClient>,
    objects: TemplateObjectSet,
}

impl NetworkPolicyStrategy {
    pub async fn new(client: Arc<dyn ClusterClient>, mesh_namespace: &str) -> Result<Self> {
        let objects = TemplateObjectSet::load(
            client.as_ref(),
            NETWORK_POLICY_API_VERSION,
            NETWORK_POLICY_KIND,
            mesh_namespace,
        )
        .await?;
        Ok(Self { client, objects })
    }
}

#[async_trait]
impl NamespaceReconciler for NetworkPolicyStrategy {
    async fn reconcile_namespace_in_mesh(&self, namespace: &str) -> Result<()> {
        self.objects.reconcile(self.client.as_ref(), namespace).await
    }

    async fn remove_namespace_from_mesh(&self, namespace: &str) -> Result<()> {
        self.objects.remove(self.client.as_ref(), namespace).await
    }
}

/// CNI-based networking strategy: member namespaces receive copies of
/// the mesh namespace's NetworkAttachmentDefinitions so the mesh CNI
/// plugin can attach their pods.
pub struct CniStrategy {
    client: Arc<dyn ClusterClient>,
    objects: TemplateObjectSet,
}

impl CniStrategy {
    pub async fn new(client: Arc<dyn ClusterClient>, mesh_namespace: &str) -> Result<Self> {
        let objects = TemplateObjectSet::load(
            client.as_ref(),
            NET_ATTACH_DEF_API_VERSION,
            NET_ATTACH_DEF_KIND,
            mesh_namespace,
        )
        .await?;
        Ok(Self { client, objects })
    }
}

#[async_trait]
impl NamespaceReconciler for CniStrategy {
    async fn reconcile_namespace_in_mesh(&self, namespace: &str) -> Result<()> {
        self.objects.reconcile(self.client.as_ref(), namespace).await
    }

    async fn remove_namespace_from_mesh(&self, namespace: &str) -> Result<()> {
        self.objects.remove(self.client.as_ref(), namespace).await
    }
}

/// Reconciles namespace membership in a mesh: the member-of label on the
/// Namespace, copies of the mesh's role bindings, and whatever the
/// selected networking strategy manages.
pub struct MemberReconciler {
    client: Arc<dyn ClusterClient>,
    mesh_namespace: String,
    role_bindings: TemplateObjectSet,
    networking_strategy: Box<dyn NamespaceReconciler>,
}

impl MemberReconciler {
    /// The networking strategy is fixed at construction: CNI
    /// network-attachment when the cluster runs the mesh CNI plugin,
    /// NetworkPolicy otherwise.
    pub async fn new(
        client: Arc<dyn ClusterClient>,
        mesh_namespace: &str,
        cni_enabled: bool,
    ) -> Result<Self> {
        let role_bindings = TemplateObjectSet::load(
            client.as_ref(),
            ROLE_BINDING_API_VERSION,
            ROLE_BINDING_KIND,
            mesh_namespace,
        )
        .await?;
        let networking_strategy: Box<dyn NamespaceReconciler> = if cni_enabled {
            Box::new(CniStrategy::new(client.clone(), mesh_namespace).await?)
        } else {
            Box::new(NetworkPolicyStrategy::new(client.clone(), mesh_namespace).await?)
        };
        Ok(Self {
            client,
            mesh_namespace: mesh_namespace.to_string(),
            role_bindings,
            networking_strategy,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_networking_strategy(&mut self, strategy: Box<dyn NamespaceReconciler>) {
        self.networking_strategy = strategy;
    }

    fn namespace_key(namespace: &str) -> ResourceKey {
        ResourceKey::new("v1", "Namespace", None, namespace)
    }
}

#[async_trait]
impl NamespaceReconciler for MemberReconciler {
    async fn reconcile_namespace_in_mesh(&self, namespace: &str) -> Result<()> {
        let ns_key = Self::namespace_key(namespace);
        let ns = self.client.get(&ns_key).await?;

        // a namespace can be a member of at most one mesh; joining a
        // second one must fail before anything is mutated
        match get_label(&ns, MEMBER_OF_KEY) {
            Some(member_of) if member_of != self.mesh_namespace => {
                return Err(Error::ConfigError(format!(
                    "namespace {namespace} is already a member of mesh {member_of}"
                )));
            }
            Some(_) => {}
            None => {
                info!(namespace, mesh = %self.mesh_namespace, "adding namespace to mesh");
                let patch = json!({
                    "metadata": {"labels": {MEMBER_OF_KEY: &self.mesh_namespace}},
                });
                self.client.patch(&ns_key, &patch).await?;
            }
        }

        let mut errors = AggregateError::new();
        if let Err(err) = self
            .role_bindings
            .reconcile(self.client.as_ref(), namespace)
            .await
        {
            errors.push(err);
        }
        if let Err(err) = self
            .networking_strategy
            .reconcile_namespace_in_mesh(namespace)
            .await
        {
            errors.push(err);
        }
        errors.into_result()
    }

    async fn remove_namespace_from_mesh(&self, namespace: &str) -> Result<()> {
        info!(namespace, mesh = %self.mesh_namespace, "removing namespace from mesh");
        let mut errors = AggregateError::new();

        if let Err(err) = self
            .role_bindings
            .remove(self.client.as_ref(), namespace)
            .await
        {
            errors.push(err);
        }

        let ns_key = Self::namespace_key(namespace);
        match self.client.get(&ns_key).await {
            Ok(ns) => {
                if get_label(&ns, MEMBER_OF_KEY).is_some() {
                    let patch = json!({
                        "metadata": {"labels": {MEMBER_OF_KEY: null}},
                    });
                    if let Err(err) = self.client.patch(&ns_key, &patch).await {
                        errors.push(err);
                    }
                }
            }
            Err(err) if err.is_not_found() => {} // namespace itself is gone
            Err(err) => errors.push(err),
        }

        if let Err(err) = self
            .networking_strategy
            .remove_namespace_from_mesh(namespace)
            .await
        {
            errors.push(err);
        }
        errors.into_result()
    }
}
