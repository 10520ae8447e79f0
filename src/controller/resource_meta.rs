//! Label and annotation conventions stamped onto every object the
//! operator manages. The exact keys are load-bearing for interop with
//! other mesh tooling and must not change.

use std::collections::BTreeMap;

use kube::api::DynamicObject;

pub const APP_NAME_KEY: &str = "app.kubernetes.io/name";
pub const APP_INSTANCE_KEY: &str = "app.kubernetes.io/instance";
pub const APP_VERSION_KEY: &str = "app.kubernetes.io/version";
pub const APP_COMPONENT_KEY: &str = "app.kubernetes.io/component";
pub const APP_PART_OF_KEY: &str = "app.kubernetes.io/part-of";
pub const APP_MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";

pub const PART_OF: &str = "istio";
pub const MANAGED_BY: &str = "maistra-istio-operator";

/// Legacy ownership label; value is the mesh (control-plane) namespace.
pub const OWNER_KEY: &str = "maistra.io/owner";
/// Marks an object as copied into a member namespace by the given mesh.
pub const MEMBER_OF_KEY: &str = "maistra.io/member-of";
/// Annotation marking a mesh-namespace object as internal-only, never
/// copied to member namespaces.
pub const INTERNAL_KEY: &str = "maistra.io/internal";
/// Semantic-version label driving CRD upgrade decisions.
pub const VERSION_LABEL: &str = "maistra-version";

pub fn set_label(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

pub fn set_labels<'a>(obj: &mut DynamicObject, labels: impl IntoIterator<Item = (&'a str, &'a str)>) {
    for (key, value) in labels {
        set_label(obj, key, value);
    }
}

pub fn get_label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn remove_label(obj: &mut DynamicObject, key: &str) {
    if let Some(labels) = obj.metadata.labels.as_mut() {
        labels.remove(key);
    }
}

pub fn set_annotation(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

pub fn get_annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Selector matching objects owned by the given mesh namespace.
pub fn owner_selector(mesh_namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNER_KEY.to_string(), mesh_namespace.to_string())])
}

/// Selector matching objects copied into member namespaces by the given
/// mesh namespace.
pub fn member_selector(mesh_namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(MEMBER_OF_KEY.to_string(), mesh_namespace.to_string())])
}
