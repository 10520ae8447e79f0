//! Tests for namespace mesh-membership reconciliation: labeling,
//! template copying, set-difference convergence, membership
//! exclusivity, and removal.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::client::fake::{obj, FakeCluster};
    use crate::client::{ClusterClient, ResourceKey};
    use crate::controller::member::{
        CniStrategy, MemberReconciler, NamespaceReconciler, NetworkPolicyStrategy,
    };
    use crate::controller::resource_meta::{get_label, MEMBER_OF_KEY};
    use crate::error::Result;

    const MESH_NS: &str = "istio-system";
    const APP_NS: &str = "bookinfo";

    fn seed_namespace(cluster: &FakeCluster, name: &str, member_of: Option<&str>) {
        let mut metadata = json!({"name": name});
        if let Some(mesh) = member_of {
            metadata["labels"] = json!({MEMBER_OF_KEY: mesh});
        }
        cluster.seed(obj(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": metadata,
        })));
    }

    fn seed_mesh_role_binding(cluster: &FakeCluster, name: &str, internal: bool) {
        let mut metadata = json!({
            "name": name,
            "namespace": MESH_NS,
            "labels": {"maistra.io/owner": MESH_NS},
        });
        if internal {
            metadata["annotations"] = json!({"maistra.io/internal": "true"});
        }
        cluster.seed(obj(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": metadata,
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "Role",
                "name": "istio-view",
            },
            "subjects": [{"kind": "User", "name": "alice"}],
        })));
    }

    fn seed_mesh_network_policy(cluster: &FakeCluster, name: &str, internal: bool) {
        let mut metadata = json!({
            "name": name,
            "namespace": MESH_NS,
            "labels": {"maistra.io/owner": MESH_NS},
        });
        if internal {
            metadata["annotations"] = json!({"maistra.io/internal": "true"});
        }
        cluster.seed(obj(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": metadata,
            "spec": {"podSelector": {}},
        })));
    }

    fn seed_mesh_net_attach_def(cluster: &FakeCluster, name: &str) {
        cluster.seed(obj(json!({
            "apiVersion": "k8s.cni.cncf.io/v1",
            "kind": "NetworkAttachmentDefinition",
            "metadata": {
                "name": name,
                "namespace": MESH_NS,
                "labels": {"maistra.io/owner": MESH_NS},
            },
        })));
    }

    fn role_binding_key(namespace: &str, name: &str) -> ResourceKey {
        ResourceKey::new(
            "rbac.authorization.k8s.io/v1",
            "RoleBinding",
            Some(namespace),
            name,
        )
    }

    fn namespace_key(name: &str) -> ResourceKey {
        ResourceKey::new("v1", "Namespace", None, name)
    }

    #[derive(Default)]
    struct FakeNetworkStrategy {
        reconciled: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NamespaceReconciler for Arc<FakeNetworkStrategy> {
        async fn reconcile_namespace_in_mesh(&self, namespace: &str) -> Result<()> {
            self.reconciled.lock().unwrap().push(namespace.to_string());
            Ok(())
        }

        async fn remove_namespace_from_mesh(&self, namespace: &str) -> Result<()> {
            self.removed.lock().unwrap().push(namespace.to_string());
            Ok(())
        }
    }

    async fn reconciler_with_fake_strategy(
        cluster: &Arc<FakeCluster>,
    ) -> (MemberReconciler, Arc<FakeNetworkStrategy>) {
        let mut reconciler = MemberReconciler::new(cluster.clone(), MESH_NS, false)
            .await
            .unwrap();
        let strategy = Arc::new(FakeNetworkStrategy::default());
        reconciler.set_networking_strategy(Box::new(strategy.clone()));
        (reconciler, strategy)
    }

    #[tokio::test]
    async fn test_reconcile_namespace_in_mesh() {
        let cluster = Arc::new(FakeCluster::new());
        seed_namespace(&cluster, APP_NS, None);
        seed_mesh_role_binding(&cluster, "istio-mesh-role-binding", false);

        let (reconciler, strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler.reconcile_namespace_in_mesh(APP_NS).await.unwrap();

        // namespace carries the member-of label
        let ns = cluster.get_stored(&namespace_key(APP_NS)).unwrap();
        assert_eq!(get_label(&ns, MEMBER_OF_KEY), Some(MESH_NS));

        // the mesh role binding was copied, stamped with the membership label
        let copied = cluster
            .get_stored(&role_binding_key(APP_NS, "istio-mesh-role-binding"))
            .expect("role binding copied into member namespace");
        assert_eq!(get_label(&copied, MEMBER_OF_KEY), Some(MESH_NS));
        assert_eq!(copied.data["roleRef"]["name"], "istio-view");
        // server bookkeeping was not copied from the template
        assert!(copied.metadata.uid.is_none());

        assert_eq!(*strategy.reconciled.lock().unwrap(), vec![APP_NS.to_string()]);
        assert!(strategy.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_fails_if_namespace_is_part_of_another_mesh() {
        let cluster = Arc::new(FakeCluster::new());
        seed_namespace(&cluster, APP_NS, Some("other-control-plane"));
        seed_mesh_role_binding(&cluster, "istio-mesh-role-binding", false);

        let (reconciler, strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler
            .reconcile_namespace_in_mesh(APP_NS)
            .await
            .unwrap_err();

        // nothing was mutated
        assert_eq!(cluster.mutations(), 0);
        let ns = cluster.get_stored(&namespace_key(APP_NS)).unwrap();
        assert_eq!(get_label(&ns, MEMBER_OF_KEY), Some("other-control-plane"));
        assert!(strategy.reconciled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new());
        seed_namespace(&cluster, APP_NS, None);
        seed_mesh_role_binding(&cluster, "istio-mesh-role-binding", false);

        let (reconciler, _strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler.reconcile_namespace_in_mesh(APP_NS).await.unwrap();
        let mutations_after_first = cluster.mutations();

        reconciler.reconcile_namespace_in_mesh(APP_NS).await.unwrap();
        assert_eq!(cluster.mutations(), mutations_after_first);
    }

    #[tokio::test]
    async fn test_remove_namespace_from_mesh() {
        let cluster = Arc::new(FakeCluster::new());
        seed_namespace(&cluster, APP_NS, None);
        seed_mesh_role_binding(&cluster, "istio-mesh-role-binding", false);

        let (reconciler, _strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler.reconcile_namespace_in_mesh(APP_NS).await.unwrap();

        let (reconciler, strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler.remove_namespace_from_mesh(APP_NS).await.unwrap();

        // membership label is gone
        let ns = cluster.get_stored(&namespace_key(APP_NS)).unwrap();
        assert_eq!(get_label(&ns, MEMBER_OF_KEY), None);

        // the copied role binding is gone, the mesh template is untouched
        assert!(cluster
            .get_stored(&role_binding_key(APP_NS, "istio-mesh-role-binding"))
            .is_none());
        assert!(cluster
            .get_stored(&role_binding_key(MESH_NS, "istio-mesh-role-binding"))
            .is_some());

        assert_eq!(*strategy.removed.lock().unwrap(), vec![APP_NS.to_string()]);
    }

    #[tokio::test]
    async fn test_reconcile_deletes_obsolete_role_bindings() {
        let cluster = Arc::new(FakeCluster::new());
        seed_namespace(&cluster, APP_NS, None);
        seed_mesh_role_binding(&cluster, "istio-mesh-role-binding", false);

        let (reconciler, _strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler.reconcile_namespace_in_mesh(APP_NS).await.unwrap();

        // the template disappears from the mesh namespace; a freshly
        // constructed reconciler computes the new required set
        cluster
            .delete(
                &role_binding_key(MESH_NS, "istio-mesh-role-binding"),
                kube::api::PropagationPolicy::Background,
            )
            .await
            .unwrap();

        let (reconciler, _strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler.reconcile_namespace_in_mesh(APP_NS).await.unwrap();

        assert!(cluster
            .get_stored(&role_binding_key(APP_NS, "istio-mesh-role-binding"))
            .is_none());
    }

    #[tokio::test]
    async fn test_internal_role_bindings_are_not_copied() {
        let cluster = Arc::new(FakeCluster::new());
        seed_namespace(&cluster, APP_NS, None);
        seed_mesh_role_binding(&cluster, "istio-mesh-role-binding", false);
        seed_mesh_role_binding(&cluster, "istio-internal-role-binding", true);

        let (reconciler, _strategy) = reconciler_with_fake_strategy(&cluster).await;
        reconciler.reconcile_namespace_in_mesh(APP_NS).await.unwrap();

        assert!(cluster
            .get_stored(&role_binding_key(APP_NS, "istio-mesh-role-binding"))
            .is_some());
        assert!(cluster
            .get_stored(&role_binding_key(APP_NS, "istio-internal-role-binding"))
            .is_none());
    }

    #[tokio::test]
    async fn test_network_policy_strategy_set_difference() {
        let cluster = Arc::new(FakeCluster::new());
        seed_mesh_network_policy(&cluster, "istio-mesh", false);
        seed_mesh_network_policy(&cluster, "istio-expose-route", true);
        // stale copy from an earlier mesh generation
        cluster.seed(obj(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": {
                "name": "obsolete",
                "namespace": APP_NS,
                "labels": {MEMBER_OF_KEY: MESH_NS},
            },
            "spec": {"podSelector": {}},
        })));

        let strategy = NetworkPolicyStrategy::new(cluster.clone(), MESH_NS)
            .await
            .unwrap();
        strategy.reconcile_namespace_in_mesh(APP_NS).await.unwrap();

        let netpol = |ns: &str, name: &str| {
            ResourceKey::new("networking.k8s.io/v1", "NetworkPolicy", Some(ns), name)
        };
        // required − existing was created
        let copied = cluster.get_stored(&netpol(APP_NS, "istio-mesh")).unwrap();
        assert_eq!(get_label(&copied, MEMBER_OF_KEY), Some(MESH_NS));
        // internal templates are not required for members
        assert!(cluster.get_stored(&netpol(APP_NS, "istio-expose-route")).is_none());
        // existing − required was deleted
        assert!(cluster.get_stored(&netpol(APP_NS, "obsolete")).is_none());
    }

    #[tokio::test]
    async fn test_network_policy_strategy_leaves_converged_namespace_alone() {
        let cluster = Arc::new(FakeCluster::new());
        seed_mesh_network_policy(&cluster, "istio-mesh", false);

        let strategy = NetworkPolicyStrategy::new(cluster.clone(), MESH_NS)
            .await
            .unwrap();
        strategy.reconcile_namespace_in_mesh(APP_NS).await.unwrap();
        let mutations_after_first = cluster.mutations();

        strategy.reconcile_namespace_in_mesh(APP_NS).await.unwrap();
        assert_eq!(cluster.mutations(), mutations_after_first);
    }

    #[tokio::test]
    async fn test_cni_strategy_copies_and_removes_net_attach_defs() {
        let cluster = Arc::new(FakeCluster::new());
        seed_mesh_net_attach_def(&cluster, "istio-cni");

        let strategy = CniStrategy::new(cluster.clone(), MESH_NS).await.unwrap();
        strategy.reconcile_namespace_in_mesh(APP_NS).await.unwrap();

        let nad_key = ResourceKey::new(
            "k8s.cni.cncf.io/v1",
            "NetworkAttachmentDefinition",
            Some(APP_NS),
            "istio-cni",
        );
        let copied = cluster.get_stored(&nad_key).unwrap();
        assert_eq!(get_label(&copied, MEMBER_OF_KEY), Some(MESH_NS));

        strategy.remove_namespace_from_mesh(APP_NS).await.unwrap();
        assert!(cluster.get_stored(&nad_key).is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_converges_what_it_can() {
        let cluster = Arc::new(FakeCluster::new());
        seed_namespace(&cluster, APP_NS, None);
        seed_mesh_role_binding(&cluster, "rb-a", false);
        seed_mesh_role_binding(&cluster, "rb-b", false);

        let (reconciler, _strategy) = reconciler_with_fake_strategy(&cluster).await;
        // the first copy attempt fails; the second must still happen
        cluster.inject_create_error(crate::error::Error::Conflict("RoleBinding".to_string()));

        let err = reconciler
            .reconcile_namespace_in_mesh(APP_NS)
            .await
            .unwrap_err();
        assert_eq!(crate::error::error_count(&err), 1);

        let existing = [
            cluster.get_stored(&role_binding_key(APP_NS, "rb-a")).is_some(),
            cluster.get_stored(&role_binding_key(APP_NS, "rb-b")).is_some(),
        ];
        assert_eq!(existing.iter().filter(|created| **created).count(), 1);
    }
}
