//! Per-object reconciliation of rendered chart manifests.
//!
//! Drives each decoded document through label stamping, the pre-process
//! hook, get-or-create, patch-or-recreate, and the post-create hook,
//! aggregating per-object errors so a failure on one object never blocks
//! the rest of the batch.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kube::api::{DynamicObject, PropagationPolicy};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::client::{ClusterClient, ResourceKey};
use crate::controller::patch;
use crate::controller::resource_meta::{
    set_label, APP_COMPONENT_KEY, APP_INSTANCE_KEY, APP_MANAGED_BY_KEY, APP_NAME_KEY,
    APP_PART_OF_KEY, APP_VERSION_KEY, MANAGED_BY, OWNER_KEY, PART_OF,
};
use crate::error::{AggregateError, Error, Result};
use crate::manifest::{decode_document, decode_value, split_manifests, Manifest};

/// Collaborator hooks invoked around object persistence.
#[async_trait::async_trait]
pub trait ObjectHooks: Send + Sync {
    /// May mutate or reject the object before it is persisted (e.g. to
    /// set owner references). An error aborts processing of this object
    /// only.
    async fn preprocess_object(&self, _obj: &mut DynamicObject) -> Result<()> {
        Ok(())
    }

    /// Invoked after an object was newly created. Errors are logged and
    /// swallowed; the object already exists and retrying creation would
    /// fail.
    async fn on_object_created(&self, _obj: &DynamicObject) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
pub struct NoopHooks;

#[async_trait::async_trait]
impl ObjectHooks for NoopHooks {}

pub struct ManifestProcessor {
    client: Arc<dyn ClusterClient>,
    hooks: Arc<dyn ObjectHooks>,
    app_instance: String,
    app_version: String,
    owner: String,
}

impl ManifestProcessor {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        hooks: Arc<dyn ObjectHooks>,
        app_instance: impl Into<String>,
        app_version: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            client,
            hooks,
            app_instance: app_instance.into(),
            app_version: app_version.into(),
            owner: owner.into(),
        }
    }

    /// Reconciles every document in every `.yaml` manifest of the batch.
    /// Per-document failures are collected; the returned error is the
    /// aggregate of all of them, `Ok` only if every object converged.
    pub async fn process_manifests(&self, manifests: &[Manifest], component: &str) -> Result<()> {
        let mut errors = AggregateError::new();

        for manifest in manifests {
            if !manifest.name.ends_with(".yaml") {
                debug!(manifest = %manifest.name, "skipping rendering of manifest");
                continue;
            }
            debug!(manifest = %manifest.name, "processing resources from manifest");
            for raw in split_manifests(&manifest.content) {
                match decode_document(&raw) {
                    Ok(None) => {}
                    Ok(Some(obj)) => {
                        if let Err(err) = self.process_object(obj, component).await {
                            errors.push(err);
                        }
                    }
                    Err(err) => {
                        error!(manifest = %manifest.name, %err, "unable to decode object");
                        errors.push(err);
                    }
                }
            }
        }

        errors.into_result()
    }

    fn process_object<'a>(
        &'a self,
        mut obj: DynamicObject,
        component: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let key = ResourceKey::from_object(&obj);

            if key.kind == "List" {
                return self.process_list(obj, component).await;
            }

            self.add_metadata(&mut obj, component);

            debug!(resource = %key, "beginning reconciliation of resource");

            if let Err(err) = self.hooks.preprocess_object(&mut obj).await {
                error!(resource = %key, %err, "error preprocessing object");
                return Err(err);
            }

            if let Err(err) = patch::apply_annotation(&mut obj) {
                error!(resource = %key, %err, "error adding apply annotation to object");
            }

            let result = match self.client.get(&key).await {
                Err(err) if err.is_not_found() => self.create_object(&key, &obj).await,
                Err(err) => Err(err),
                Ok(live) => self.patch_object(&key, &live, &mut obj).await,
            };

            debug!(resource = %key, "resource reconciliation complete");
            if let Err(err) = &result {
                error!(resource = %key, %err, "error occurred reconciling resource");
            }
            result
        }
        .boxed()
    }

    /// A `List` document is unwrapped and each item reconciled as an
    /// independent document, with the usual error aggregation.
    async fn process_list(&self, obj: DynamicObject, component: &str) -> Result<()> {
        let mut errors = AggregateError::new();
        let items = match obj.data.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        for item in items {
            match decode_value(item) {
                Ok(item_obj) => {
                    if let Err(err) = self.process_object(item_obj, component).await {
                        errors.push(err);
                    }
                }
                Err(err) => {
                    error!(%err, "error converting List item");
                    errors.push(err);
                }
            }
        }
        errors.into_result()
    }

    async fn create_object(&self, key: &ResourceKey, obj: &DynamicObject) -> Result<()> {
        info!(resource = %key, "creating resource");
        match self.client.create(obj).await {
            Ok(created) => {
                if let Err(err) = self.hooks.on_object_created(&created).await {
                    error!(resource = %key, %err, "error during postprocessing of new resource");
                }
                Ok(())
            }
            Err(err) => {
                error!(resource = %key, %err, "error during creation of new resource");
                Err(err)
            }
        }
    }

    async fn patch_object(
        &self,
        key: &ResourceKey,
        live: &DynamicObject,
        desired: &mut DynamicObject,
    ) -> Result<()> {
        let Some(object_patch) = patch::compute_patch(live, desired)? else {
            return Ok(());
        };
        info!(resource = %key, "updating existing resource");
        match object_patch.apply(self.client.as_ref()).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_invalid() => self.recreate_object(key, desired, err).await,
            Err(err) => Err(err),
        }
    }

    /// Fallback for patches the server rejects as structurally invalid
    /// (immutable-field changes and the like): delete with foreground
    /// propagation and create fresh. A failed delete surfaces the
    /// original patch rejection; a failed create surfaces the create
    /// error.
    async fn recreate_object(
        &self,
        key: &ResourceKey,
        obj: &mut DynamicObject,
        patch_err: Error,
    ) -> Result<()> {
        info!(resource = %key, "patch failed, attempting to delete and recreate the resource");
        if let Err(delete_err) = self.client.delete(key, PropagationPolicy::Foreground).await {
            error!(resource = %key, %delete_err, "error deleting resource for recreation");
            return Err(patch_err);
        }
        // the resource version belonged to the deleted incarnation
        obj.metadata.resource_version = None;
        match self.client.create(obj).await {
            Ok(_) => {
                info!(resource = %key, "successfully recreated resource after patch failure");
                Ok(())
            }
            Err(create_err) => {
                error!(resource = %key, %create_err, "error trying to recreate resource after patch failure");
                Err(create_err)
            }
        }
    }

    /// Ownership and ancestry labels, stamped before any persistence so
    /// the object is discoverable even if later steps fail.
    fn add_metadata(&self, obj: &mut DynamicObject, component: &str) {
        let labels = [
            (APP_NAME_KEY, component),
            (APP_INSTANCE_KEY, self.app_instance.as_str()),
            (APP_VERSION_KEY, self.app_version.as_str()),
            (APP_COMPONENT_KEY, component),
            (APP_PART_OF_KEY, PART_OF),
            (APP_MANAGED_BY_KEY, MANAGED_BY),
            (OWNER_KEY, self.owner.as_str()),
        ];
        for (key, value) in labels {
            set_label(obj, key, value);
        }
    }
}
