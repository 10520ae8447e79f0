//! Patch computation between live and desired object state.
//!
//! Produces JSON merge patches restricted to fields the operator owns: a
//! field participates in the diff only if the desired object sets it, or
//! if the recorded last-applied configuration shows the operator set it
//! previously (in which case its removal is patched as `null`). Fields
//! the API server populates on its own never produce a diff.

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use crate::client::{ClusterClient, ResourceKey};
use crate::controller::resource_meta;
use crate::error::Result;

/// Annotation recording the configuration last applied by the operator,
/// used to detect field removals between applies.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// A computed, ready-to-apply merge patch for a single object.
#[derive(Debug)]
pub struct ObjectPatch {
    key: ResourceKey,
    body: Value,
}

impl ObjectPatch {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Applies the patch with a single merge-patch API call.
    pub async fn apply(&self, client: &dyn ClusterClient) -> Result<DynamicObject> {
        client.patch(&self.key, &self.body).await
    }
}

/// Stamps the last-applied-configuration annotation onto `obj`, recording
/// its current serialized form (minus the annotation itself).
pub fn apply_annotation(obj: &mut DynamicObject) -> Result<()> {
    let mut recorded = obj.clone();
    if let Some(annotations) = recorded.metadata.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
    }
    let serialized = serde_json::to_string(&recorded)?;
    resource_meta::set_annotation(obj, LAST_APPLIED_ANNOTATION, &serialized);
    Ok(())
}

/// Computes the minimal merge patch turning `live` into `desired`.
/// `None` means the object already matches and nothing must be applied.
pub fn compute_patch(live: &DynamicObject, desired: &DynamicObject) -> Result<Option<ObjectPatch>> {
    let live_json = serde_json::to_value(live)?;
    let desired_json = serde_json::to_value(desired)?;

    let mut patch = diff(&live_json, &desired_json);
    if let Some(original) = last_applied(live) {
        add_removals(&mut patch, &original, &desired_json, &live_json);
    }

    if patch.is_empty() {
        Ok(None)
    } else {
        Ok(Some(ObjectPatch {
            key: ResourceKey::from_object(live),
            body: Value::Object(patch),
        }))
    }
}

fn last_applied(live: &DynamicObject) -> Option<Value> {
    let raw = resource_meta::get_annotation(live, LAST_APPLIED_ANNOTATION)?;
    serde_json::from_str(raw).ok()
}

/// Fields set by `desired` that differ from `live`. Maps recurse;
/// sequences and scalars replace atomically, per merge-patch semantics.
fn diff(live: &Value, desired: &Value) -> Map<String, Value> {
    let mut patch = Map::new();
    let (Some(live_map), Some(desired_map)) = (live.as_object(), desired.as_object()) else {
        return patch;
    };
    for (key, desired_value) in desired_map {
        match live_map.get(key) {
            None => {
                patch.insert(key.clone(), desired_value.clone());
            }
            Some(live_value) if live_value == desired_value => {}
            Some(live_value) => {
                if live_value.is_object() && desired_value.is_object() {
                    let nested = diff(live_value, desired_value);
                    if !nested.is_empty() {
                        patch.insert(key.clone(), Value::Object(nested));
                    }
                } else {
                    patch.insert(key.clone(), desired_value.clone());
                }
            }
        }
    }
    patch
}

/// Fields present in the last-applied configuration but no longer in
/// `desired` are removed from the live object by patching them to null.
fn add_removals(patch: &mut Map<String, Value>, original: &Value, desired: &Value, live: &Value) {
    let Some(original_map) = original.as_object() else {
        return;
    };
    let empty = Value::Object(Map::new());
    for (key, original_value) in original_map {
        match desired.get(key) {
            None => {
                if live.get(key).is_some() {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Some(desired_value) if original_value.is_object() && desired_value.is_object() => {
                let live_value = live.get(key).unwrap_or(&empty);
                let entry = patch
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(nested) = entry.as_object_mut() {
                    add_removals(nested, original_value, desired_value, live_value);
                }
                if entry.as_object().is_some_and(|nested| nested.is_empty()) {
                    patch.remove(key);
                }
            }
            Some(_) => {}
        }
    }
}
