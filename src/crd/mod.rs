//! Custom Resource Definitions owned by the mesh operator.

mod control_plane;
mod member_roll;


pub use control_plane::{
    ServiceMeshControlPlane, ServiceMeshControlPlaneSpec, ServiceMeshControlPlaneStatus,
};
pub use member_roll::{
    ServiceMeshMemberRoll, ServiceMeshMemberRollSpec, ServiceMeshMemberRollStatus,
};
