//! ServiceMeshMemberRoll Custom Resource Definition.
//!
//! Lists the namespaces participating in a mesh's data plane. Lives in
//! the mesh (control-plane) namespace; the controller converges actual
//! namespace membership onto `spec.members`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maistra.io",
    version = "v1",
    kind = "ServiceMeshMemberRoll",
    namespaced,
    status = "ServiceMeshMemberRollStatus",
    shortname = "smmr",
    printcolumn = r#"{"name":"Members","type":"string","jsonPath":".spec.members"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshMemberRollSpec {
    /// Namespaces that should be members of the mesh
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshMemberRollStatus {
    /// Generation last acted upon by the controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Namespaces whose membership has been configured
    #[serde(default)]
    pub configured_members: Vec<String>,
}
