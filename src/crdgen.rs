use controller::EksCluster;
use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&EksCluster::crd()).unwrap())
}
