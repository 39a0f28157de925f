//! Prints the CRD manifests as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/all.yaml`

use crds::{DatabaseCluster, Datacenter, RebuildTask};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [DatabaseCluster::crd(), Datacenter::crd(), RebuildTask::crd()];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
