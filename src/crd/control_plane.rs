//! ServiceMeshControlPlane Custom Resource Definition.
//!
//! One ServiceMeshControlPlane per mesh namespace describes the desired
//! control-plane installation; the controller renders and reconciles the
//! matching chart manifests.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maistra.io",
    version = "v1",
    kind = "ServiceMeshControlPlane",
    namespaced,
    status = "ServiceMeshControlPlaneStatus",
    shortname = "smcp",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Reconciled","type":"string","jsonPath":".status.reconciledVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshControlPlaneSpec {
    /// Chart version to install (selects `<charts-dir>/<version>`)
    #[serde(default = "default_version")]
    pub version: String,

    /// Name of the base template the installation derives from
    #[serde(default = "default_template")]
    pub template: String,

    /// Raw chart value overrides, passed to rendering untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub istio: Option<serde_json::Value>,
}

fn default_version() -> String {
    "v1.1".to_string()
}

fn default_template() -> String {
    "default".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshControlPlaneStatus {
    /// Generation last acted upon by the controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Chart version of the last successful reconciliation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
