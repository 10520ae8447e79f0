//! Controller loops for ServiceMeshControlPlane and
//! ServiceMeshMemberRoll resources, built on the kube-rs runtime.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument};

use crate::bootstrap::CrdInstaller;
use crate::client::ClusterClient;
use crate::controller::control_plane::{ControlPlaneReconciler, RenderedChartsSource};
use crate::controller::hints::{ReconciliationHintSink, ReconciliationHints};
use crate::controller::member::{MemberReconciler, NamespaceReconciler};
use crate::crd::{ServiceMeshControlPlane, ServiceMeshMemberRoll};
use crate::error::{AggregateError, Error, Result};

pub const CONTROL_PLANE_FINALIZER: &str = "servicemeshcontrolplane.maistra.io/finalizer";
pub const MEMBER_ROLL_FINALIZER: &str = "servicemeshmemberroll.maistra.io/finalizer";

/// Shared state for both controller loops.
pub struct ControllerState {
    pub client: kube::Client,
    pub cluster: Arc<dyn ClusterClient>,
    pub charts_dir: PathBuf,
    /// Serializes CRD installation across all reconciler workers.
    pub crd_lock: Arc<tokio::sync::Mutex<()>>,
    pub hints: Arc<ReconciliationHints>,
    /// Concurrent reconcile workers per resource kind.
    pub concurrent_reconcilers: u16,
    /// Selects the CNI networking strategy for member namespaces.
    pub cni_enabled: bool,
}

/// Main entry point: runs both controllers until shutdown.
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let control_planes: Api<ServiceMeshControlPlane> = Api::all(state.client.clone());
    let member_rolls: Api<ServiceMeshMemberRoll> = Api::all(state.client.clone());

    info!("Starting ServiceMeshControlPlane controller");

    // Verify the operator CRDs exist before watching them
    if let Err(e) = control_planes.list(&Default::default()).await {
        error!("ServiceMeshControlPlane CRD not found. Please install the operator CRDs first: {e:?}");
        return Err(Error::ConfigError(
            "ServiceMeshControlPlane CRD not installed".to_string(),
        ));
    }

    let control_plane_controller = Controller::new(control_planes, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(state.concurrent_reconcilers))
        .shutdown_on_signal()
        .run(reconcile_control_plane, control_plane_error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("reconciled ServiceMeshControlPlane: {obj:?}"),
                Err(e) => error!("ServiceMeshControlPlane reconcile error: {e:?}"),
            }
        });

    let member_roll_controller = Controller::new(member_rolls, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(state.concurrent_reconcilers))
        .shutdown_on_signal()
        .run(reconcile_member_roll, member_roll_error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("reconciled ServiceMeshMemberRoll: {obj:?}"),
                Err(e) => error!("ServiceMeshMemberRoll reconcile error: {e:?}"),
            }
        });

    tokio::join!(control_plane_controller, member_roll_controller);
    Ok(())
}

fn control_plane_reconciler(
    state: &ControllerState,
    name: &str,
    namespace: &str,
    version: &str,
) -> ControlPlaneReconciler {
    let source = Arc::new(RenderedChartsSource::new(state.charts_dir.join(version)));
    let crd_installer = Arc::new(CrdInstaller::new(
        state.cluster.clone(),
        state.charts_dir.clone(),
        state.crd_lock.clone(),
    ));
    ControlPlaneReconciler::new(
        state.cluster.clone(),
        source,
        crd_installer,
        name,
        namespace,
        version,
    )
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_control_plane(
    obj: Arc<ServiceMeshControlPlane>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    // a write we just made may not have hit the cache yet
    if let Some(delay) = ctx.hints.should_skip(&namespace, &name) {
        debug!("skipping reconciliation until cache is synced");
        return Ok(Action::requeue(delay));
    }

    let api: Api<ServiceMeshControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, CONTROL_PLANE_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(cp) => apply_control_plane(&ctx, &cp).await,
            FinalizerEvent::Cleanup(cp) => cleanup_control_plane(&ctx, &cp).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn apply_control_plane(
    ctx: &ControllerState,
    cp: &ServiceMeshControlPlane,
) -> Result<Action> {
    let namespace = cp.namespace().unwrap_or_else(|| "default".to_string());
    let name = cp.name_any();
    let version = cp.spec.version.clone();

    info!("Installing/updating ServiceMeshControlPlane {namespace}/{name} (version {version})");

    let reconciler = control_plane_reconciler(ctx, &name, &namespace, &version);
    reconciler.reconcile().await?;

    let api: Api<ServiceMeshControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({
        "status": {
            "observedGeneration": cp.metadata.generation,
            "reconciledVersion": version,
            "message": "Successfully installed all mesh components",
        }
    });
    api.patch_status(
        &name,
        &PatchParams::apply("mesh-operator"),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    ctx.hints.skip_until_cache_synced(&namespace, &name);

    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn cleanup_control_plane(
    ctx: &ControllerState,
    cp: &ServiceMeshControlPlane,
) -> Result<Action> {
    let namespace = cp.namespace().unwrap_or_else(|| "default".to_string());
    let name = cp.name_any();

    info!("Deleting ServiceMeshControlPlane {namespace}/{name}");

    let reconciler = control_plane_reconciler(ctx, &name, &namespace, &cp.spec.version);
    reconciler.delete().await?;

    Ok(Action::await_change())
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_member_roll(
    obj: Arc<ServiceMeshMemberRoll>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    if let Some(delay) = ctx.hints.should_skip(&namespace, &name) {
        debug!("skipping reconciliation until cache is synced");
        return Ok(Action::requeue(delay));
    }

    let api: Api<ServiceMeshMemberRoll> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, MEMBER_ROLL_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(roll) => apply_member_roll(&ctx, &roll).await,
            FinalizerEvent::Cleanup(roll) => cleanup_member_roll(&ctx, &roll).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn apply_member_roll(ctx: &ControllerState, roll: &ServiceMeshMemberRoll) -> Result<Action> {
    let mesh_namespace = roll.namespace().unwrap_or_else(|| "default".to_string());
    let name = roll.name_any();

    let reconciler =
        MemberReconciler::new(ctx.cluster.clone(), &mesh_namespace, ctx.cni_enabled).await?;

    // the mesh namespace itself is never a member
    let desired: BTreeSet<String> = roll
        .spec
        .members
        .iter()
        .filter(|member| member.as_str() != mesh_namespace)
        .cloned()
        .collect();
    let configured: BTreeSet<String> = roll
        .status
        .as_ref()
        .map(|status| status.configured_members.iter().cloned().collect())
        .unwrap_or_default();

    let mut errors = AggregateError::new();
    let mut configured_members = Vec::new();

    for member in &desired {
        match reconciler.reconcile_namespace_in_mesh(member).await {
            Ok(()) => configured_members.push(member.clone()),
            Err(err) => {
                error!(namespace = %member, %err, "error configuring namespace membership");
                errors.push(err);
            }
        }
    }

    // namespaces no longer on the roll leave the mesh
    for member in configured.difference(&desired) {
        if let Err(err) = reconciler.remove_namespace_from_mesh(member).await {
            error!(namespace = %member, %err, "error removing namespace membership");
            errors.push(err);
        }
    }

    let api: Api<ServiceMeshMemberRoll> = Api::namespaced(ctx.client.clone(), &mesh_namespace);
    let patch = json!({
        "status": {
            "observedGeneration": roll.metadata.generation,
            "configuredMembers": configured_members,
        }
    });
    api.patch_status(
        &name,
        &PatchParams::apply("mesh-operator"),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    ctx.hints.skip_until_cache_synced(&mesh_namespace, &name);

    errors.into_result()?;
    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn cleanup_member_roll(
    ctx: &ControllerState,
    roll: &ServiceMeshMemberRoll,
) -> Result<Action> {
    let mesh_namespace = roll.namespace().unwrap_or_else(|| "default".to_string());

    let reconciler =
        MemberReconciler::new(ctx.cluster.clone(), &mesh_namespace, ctx.cni_enabled).await?;

    let mut errors = AggregateError::new();
    let configured = roll
        .status
        .as_ref()
        .map(|status| status.configured_members.clone())
        .unwrap_or_default();
    for member in configured {
        if let Err(err) = reconciler.remove_namespace_from_mesh(&member).await {
            error!(namespace = %member, %err, "error removing namespace membership");
            errors.push(err);
        }
    }
    errors.into_result()?;

    Ok(Action::await_change())
}

fn control_plane_error_policy(
    cp: Arc<ServiceMeshControlPlane>,
    error: &Error,
    _ctx: Arc<ControllerState>,
) -> Action {
    error!("Reconciliation error for {}: {error:?}", cp.name_any());
    Action::requeue(retry_delay(error))
}

fn member_roll_error_policy(
    roll: Arc<ServiceMeshMemberRoll>,
    error: &Error,
    _ctx: Arc<ControllerState>,
) -> Action {
    error!("Reconciliation error for {}: {error:?}", roll.name_any());
    Action::requeue(retry_delay(error))
}

fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}
