use anyhow::Result;
use kube::CustomResourceExt;

use kube_rbac_watch::crd::{AuditSource, PolicyReport};

/// Print both CRD YAMLs to stdout for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    let source_crd = serde_yaml::to_string(&AuditSource::crd())?;
    let report_crd = serde_yaml::to_string(&PolicyReport::crd())?;
    println!("{source_crd}---\n{report_crd}");
    Ok(())
}

/// Apply both CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [AuditSource::crd(), PolicyReport::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => {
                println!("CRD '{name}' installed successfully");
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists — skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
