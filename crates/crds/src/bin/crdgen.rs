//! Prints the CRD manifests as a multi-document YAML stream.

use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        crds::CLBPortPool::crd(),
        crds::CLBPodBinding::crd(),
        crds::CLBNodeBinding::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
