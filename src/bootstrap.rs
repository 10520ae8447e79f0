//! CRD installation at operator bootstrap and control-plane install time.
//!
//! CRDs are located from files in `<charts-dir>/<version>/istio-init/files`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::api::DynamicObject;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::client::{ClusterClient, ResourceKey};
use crate::controller::patch;
use crate::controller::resource_meta::{get_label, VERSION_LABEL};
use crate::error::{AggregateError, Error, Result};
use crate::manifest::{decode_document, split_manifests};

/// The error text the API server returns when it rejects `type: object`
/// at the root of a CRD OpenAPI schema with the status subresource
/// enabled.
const TYPE_OBJECT_PROBLEM: &str =
    "must only have \"properties\", \"required\" or \"description\" at the root if the status subresource is enabled";

/// Name of the aggregated ClusterRole granting full access to the mesh's
/// custom API groups.
const CRD_ROLE_NAME: &str = "istio-admin";

const CRD_API_GROUP: &str = "apiextensions.k8s.io";

pub struct CrdInstaller {
    client: Arc<dyn ClusterClient>,
    charts_dir: PathBuf,
    // Serializes CRD installation across all reconciler workers. Held for
    // the whole installation; there is intentionally no timeout on it.
    lock: Arc<Mutex<()>>,
}

impl CrdInstaller {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        charts_dir: impl Into<PathBuf>,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            client,
            charts_dir: charts_dir.into(),
            lock,
        }
    }

    /// Makes sure all CRDs shipped for `version` are installed, upgrading
    /// any whose `maistra-version` label is older than the incoming one.
    /// Errors for individual files and documents are aggregated; one
    /// malformed CRD never blocks installation of the others.
    pub async fn install_crds(&self, version: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        info!("ensuring {version} CRDs are installed");
        let crd_path = self.charts_dir.join(version).join("istio-init/files");
        if !crd_path.is_dir() {
            return Err(Error::ConfigError(format!(
                "cannot locate any CRD files in {}",
                crd_path.display()
            )));
        }

        let mut files = Vec::new();
        collect_files(&crd_path, &mut files)?;

        let mut errors = AggregateError::new();
        for file in files {
            self.process_crd_file(&file, &mut errors).await;
        }
        if let Err(err) = self.install_crd_role().await {
            errors.push(err);
        }
        errors.into_result()
    }

    async fn process_crd_file(&self, file: &Path, errors: &mut AggregateError) {
        let content = match fs::read_to_string(file) {
            Ok(content) => content,
            Err(err) => {
                errors.push(err.into());
                return;
            }
        };
        for raw in split_manifests(&content) {
            match decode_crd(&raw) {
                Ok(None) => {} // the document isn't a CRD
                Ok(Some(crd)) => {
                    if let Err(err) = self.install_crd(crd).await {
                        error!(file = %file.display(), %err, "error installing CRD");
                        errors.push(err);
                    }
                }
                Err(err) => {
                    error!(file = %file.display(), %err, "unable to decode CRD document");
                    errors.push(err);
                }
            }
        }
    }

    async fn install_crd(&self, crd: DynamicObject) -> Result<()> {
        let key = ResourceKey::from_object(&crd);
        let existing = match self.client.get(&key).await {
            Ok(existing) => existing,
            Err(err) if err.is_not_found() => {
                info!(crd = %key.name, "creating CRD");
                return self.create_crd(&crd).await;
            }
            Err(err) => return Err(err),
        };

        let Some(incoming_version) = maistra_version(&crd) else {
            warn!(crd = %key.name, "incoming CRD has no parseable version label, leaving existing CRD untouched");
            return Ok(());
        };
        let existing_version = maistra_version(&existing);
        if existing_version.is_none() {
            info!(crd = %key.name, "could not determine version of existing CRD");
        }

        if existing_version.map_or(true, |v| v < incoming_version) {
            info!(crd = %key.name, "CRD exists, but is old or has no version label, replacing with newer version");
            self.update_crd(&existing, &crd).await
        } else {
            info!(crd = %key.name, "CRD exists");
            Ok(())
        }
    }

    async fn create_crd(&self, crd: &DynamicObject) -> Result<()> {
        match self.client.create(crd).await {
            Err(err) if is_type_object_problem(&err) => {
                let mut stripped = crd.clone();
                strip_type_object_fields(&mut stripped)?;
                self.client.create(&stripped).await.map(|_| ())
            }
            Err(err) => Err(err),
            Ok(_) => Ok(()),
        }
    }

    async fn update_crd(&self, existing: &DynamicObject, crd: &DynamicObject) -> Result<()> {
        let Some(object_patch) = patch::compute_patch(existing, crd)? else {
            // existing and new CRDs are identical apart from server fields
            return Ok(());
        };
        match object_patch.apply(self.client.as_ref()).await {
            Err(err) if is_type_object_problem(&err) => {
                let mut stripped = crd.clone();
                strip_type_object_fields(&mut stripped)?;
                stripped.metadata.resource_version = existing.metadata.resource_version.clone();
                self.client.update(&stripped).await.map(|_| ())
            }
            Err(err) => Err(err),
            Ok(_) => Ok(()),
        }
    }

    /// Aggregated admin role for the mesh API groups: looked up, created
    /// if absent, never updated afterwards.
    async fn install_crd_role(&self) -> Result<()> {
        let role: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {
                "name": CRD_ROLE_NAME,
                "labels": {
                    "rbac.authorization.k8s.io/aggregate-to-admin": "true",
                },
            },
            "rules": [{
                "apiGroups": [
                    "config.istio.io",
                    "networking.istio.io",
                    "authentication.istio.io",
                    "rbac.istio.io",
                    "authentication.maistra.io",
                    "rbac.maistra.io",
                ],
                "resources": ["*"],
                "verbs": ["*"],
            }],
        }))?;

        let key = ResourceKey::from_object(&role);
        match self.client.get(&key).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => self.client.create(&role).await.map(|_| ()),
            Err(err) => Err(err),
        }
    }
}

/// Decodes a raw document, returning it only if it is a
/// CustomResourceDefinition; anything else in the file is skipped.
fn decode_crd(raw: &str) -> Result<Option<DynamicObject>> {
    let Some(obj) = decode_document(raw)? else {
        return Ok(None);
    };
    let Some(types) = &obj.types else {
        return Ok(None);
    };
    let group = types.api_version.split('/').next().unwrap_or_default();
    if types.kind == "CustomResourceDefinition" && group == CRD_API_GROUP {
        Ok(Some(obj))
    } else {
        Ok(None)
    }
}

fn maistra_version(crd: &DynamicObject) -> Option<semver::Version> {
    semver::Version::parse(get_label(crd, VERSION_LABEL)?).ok()
}

/// Returns true if the error is the one the API server usually returns
/// when it doesn't like `type: object` fields in the CRD's OpenAPI
/// schema.
fn is_type_object_problem(err: &Error) -> bool {
    err.to_string().contains(TYPE_OBJECT_PROBLEM)
}

/// Works around API servers that reject `type: object` in CRD OpenAPI
/// schemas: removes all occurrences from the schema tree.
fn strip_type_object_fields(crd: &mut DynamicObject) -> Result<()> {
    info!("the API server rejected the CRD, removing type:object fields from the CRD schema and trying again");
    let Some(schema) = crd.data.pointer_mut("/spec/validation/openAPIV3Schema") else {
        return Err(Error::ConfigError(
            "could not remove type:object fields from CRD schema as no spec.validation.openAPIV3Schema exists"
                .to_string(),
        ));
    };
    remove_type_object(schema);
    Ok(())
}

fn remove_type_object(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.remove("type");
            }
            for child in map.values_mut() {
                remove_type_object(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                remove_type_object(item);
            }
        }
        _ => {}
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}
