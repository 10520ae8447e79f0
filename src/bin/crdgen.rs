use kube::CustomResourceExt;
use mesh_operator::crd::{ServiceMeshControlPlane, ServiceMeshMemberRoll};

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&ServiceMeshControlPlane::crd()).unwrap()
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&ServiceMeshMemberRoll::crd()).unwrap()
    );
}
