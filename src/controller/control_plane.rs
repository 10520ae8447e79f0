//! Control-plane install and teardown orchestration.
//!
//! Installation walks the components in priority order and feeds each
//! component's rendered manifests through the manifest processor;
//! teardown prunes every owned object in the inverse order, bracketed by
//! lifecycle events on the owning ServiceMeshControlPlane.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::SecondsFormat;
use kube::api::{DynamicObject, PropagationPolicy};
use serde_json::json;
use tracing::{error, info, warn};

use crate::bootstrap::CrdInstaller;
use crate::client::{gvk, ClusterClient, ResourceKey};
use crate::controller::processor::{ManifestProcessor, NoopHooks};
use crate::controller::resource_meta::{APP_COMPONENT_KEY, OWNER_KEY};
use crate::error::{AggregateError, Result};
use crate::manifest::Manifest;

/// Control-plane components in install order. Teardown runs the same
/// list in reverse so dependents go away before their dependencies.
pub const ORDERED_COMPONENTS: &[&str] = &[
    "security",
    "galley",
    "prometheus",
    "mixer",
    "pilot",
    "gateways",
    "sidecarInjectorWebhook",
    "grafana",
    "tracing",
    "kiali",
];

/// Namespaced kinds the operator may own, in prune order.
const PRUNABLE_NAMESPACED: &[(&str, &str)] = &[
    ("autoscaling/v2", "HorizontalPodAutoscaler"),
    ("policy/v1", "PodDisruptionBudget"),
    ("apps/v1", "Deployment"),
    ("apps/v1", "DaemonSet"),
    ("apps/v1", "StatefulSet"),
    ("v1", "Service"),
    ("networking.k8s.io/v1", "Ingress"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("v1", "ConfigMap"),
    ("v1", "Secret"),
    ("v1", "ServiceAccount"),
];

/// Cluster-scoped kinds the operator may own, in prune order.
const PRUNABLE_CLUSTER_SCOPED: &[(&str, &str)] = &[
    ("admissionregistration.k8s.io/v1", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io/v1", "ValidatingWebhookConfiguration"),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
    ("rbac.authorization.k8s.io/v1", "ClusterRole"),
];

/// Supplies rendered manifests per component. Chart rendering itself is
/// outside this crate; the operator only consumes its output.
pub trait ManifestSource: Send + Sync {
    fn manifests(&self, component: &str) -> Result<Vec<Manifest>>;
}

/// Reads pre-rendered chart output from `<dir>/<component>/`, one
/// manifest per file. Components without a directory render nothing.
pub struct RenderedChartsSource {
    dir: PathBuf,
}

impl RenderedChartsSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ManifestSource for RenderedChartsSource {
    fn manifests(&self, component: &str) -> Result<Vec<Manifest>> {
        let dir = self.dir.join(component);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        let mut manifests = Vec::new();
        for entry in entries {
            let path = entry.path();
            if path.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                manifests.push(Manifest::new(name, fs::read_to_string(&path)?));
            }
        }
        Ok(manifests)
    }
}

pub struct ControlPlaneReconciler {
    client: Arc<dyn ClusterClient>,
    source: Arc<dyn ManifestSource>,
    crd_installer: Arc<CrdInstaller>,
    instance_name: String,
    namespace: String,
    version: String,
    processor: ManifestProcessor,
}

impl ControlPlaneReconciler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        source: Arc<dyn ManifestSource>,
        crd_installer: Arc<CrdInstaller>,
        instance_name: &str,
        namespace: &str,
        version: &str,
    ) -> Self {
        let processor = ManifestProcessor::new(
            client.clone(),
            Arc::new(NoopHooks),
            instance_name,
            version,
            namespace,
        );
        Self {
            client,
            source,
            crd_installer,
            instance_name: instance_name.to_string(),
            namespace: namespace.to_string(),
            version: version.to_string(),
            processor,
        }
    }

    /// Installs or converges the control plane: CRDs first, then every
    /// component's manifests in priority order. Component failures are
    /// aggregated so one broken component doesn't keep the rest of the
    /// mesh from converging.
    pub async fn reconcile(&self) -> Result<()> {
        self.crd_installer.install_crds(&self.version).await?;

        let mut errors = AggregateError::new();
        for component in ORDERED_COMPONENTS {
            let manifests = match self.source.manifests(component) {
                Ok(manifests) => manifests,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            if manifests.is_empty() {
                continue;
            }
            info!(component, "reconciling component");
            if let Err(err) = self.processor.process_manifests(&manifests, component).await {
                errors.push(err);
            }
        }
        errors.into_result()
    }

    /// Tears the control plane down: emits the deleting event, prunes all
    /// owned objects in descending priority order, and reports the
    /// outcome as a terminal event.
    pub async fn delete(&self) -> Result<()> {
        self.event("Normal", "ServiceMeshDeleting", "Deleting service mesh")
            .await;
        let result = self.prune_all().await;
        match &result {
            Ok(()) => {
                self.event(
                    "Normal",
                    "ServiceMeshDeleted",
                    "Successfully deleted service mesh components",
                )
                .await;
            }
            Err(err) => {
                self.event(
                    "Warning",
                    "ServiceMeshDeleted",
                    &format!("Error occurred during service mesh deletion: {err}"),
                )
                .await;
            }
        }
        result
    }

    async fn prune_all(&self) -> Result<()> {
        let mut errors = AggregateError::new();
        for component in ORDERED_COMPONENTS.iter().rev() {
            self.prune_component(component, &mut errors).await;
        }
        errors.into_result()
    }

    async fn prune_component(&self, component: &str, errors: &mut AggregateError) {
        let selector = BTreeMap::from([
            (OWNER_KEY.to_string(), self.namespace.clone()),
            (APP_COMPONENT_KEY.to_string(), component.to_string()),
        ]);
        for (api_version, kind) in PRUNABLE_NAMESPACED {
            self.prune_kind(api_version, kind, Some(&self.namespace), &selector, errors)
                .await;
        }
        for (api_version, kind) in PRUNABLE_CLUSTER_SCOPED {
            self.prune_kind(api_version, kind, None, &selector, errors)
                .await;
        }
    }

    async fn prune_kind(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
        errors: &mut AggregateError,
    ) {
        let items = match self.client.list(&gvk(api_version, kind), namespace, selector).await {
            Ok(items) => items,
            Err(err) => {
                error!(kind, %err, "error listing resources for pruning");
                errors.push(err);
                return;
            }
        };
        for item in items {
            let key = ResourceKey::from_object(&item);
            info!(resource = %key, "pruning resource");
            match self.client.delete(&key, PropagationPolicy::Background).await {
                Err(err) if !(err.is_not_found() || err.is_gone()) => {
                    error!(resource = %key, %err, "error pruning resource");
                    errors.push(err);
                }
                _ => {}
            }
        }
    }

    /// Emits a lifecycle event on the owning control-plane resource.
    /// Best effort: a failure to record the event is logged, never
    /// allowed to fail the surrounding operation.
    async fn event(&self, event_type: &str, reason: &str, message: &str) {
        let timestamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let event = json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": {
                "generateName": format!("{}.", self.instance_name),
                "namespace": &self.namespace,
            },
            "type": event_type,
            "reason": reason,
            "message": message,
            "involvedObject": {
                "apiVersion": "maistra.io/v1",
                "kind": "ServiceMeshControlPlane",
                "name": &self.instance_name,
                "namespace": &self.namespace,
            },
            "source": {"component": "mesh-operator"},
            "firstTimestamp": &timestamp,
            "lastTimestamp": &timestamp,
            "count": 1,
        });
        match serde_json::from_value::<DynamicObject>(event) {
            Ok(obj) => {
                if let Err(err) = self.client.create(&obj).await {
                    warn!(reason, %err, "unable to record lifecycle event");
                }
            }
            Err(err) => warn!(reason, %err, "unable to build lifecycle event"),
        }
    }
}
