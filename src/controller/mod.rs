//! Controller module for service-mesh reconciliation.
//! Contains the controller loops, the manifest reconciliation core, and
//! namespace membership management.

pub mod control_plane;
pub mod hints;
pub mod member;
#[cfg(test)]
mod member_test;
pub mod patch;
pub mod processor;
mod reconciler;
pub mod resource_meta;

pub use control_plane::{ControlPlaneReconciler, ManifestSource, RenderedChartsSource};
pub use hints::{ReconciliationHintSink, ReconciliationHints};
pub use member::{CniStrategy, MemberReconciler, NamespaceReconciler, NetworkPolicyStrategy};
pub use processor::{ManifestProcessor, NoopHooks, ObjectHooks};
pub use reconciler::{
    run_controller, ControllerState, CONTROL_PLANE_FINALIZER, MEMBER_ROLL_FINALIZER,
};
