use anyhow::{Context as _, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::CustomResourceExt;

use kubewarden_operator::crd::{AdmissionPolicy, ClusterAdmissionPolicy, PolicyServer};

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        PolicyServer::crd(),
        ClusterAdmissionPolicy::crd(),
        AdmissionPolicy::crd(),
    ]
}

/// Print the CRD manifests as a multi-document YAML stream.
pub fn generate() -> Result<()> {
    for crd in all_crds() {
        println!("---");
        print!(
            "{}",
            serde_yaml::to_string(&crd).context("CRD serialization failed")?
        );
    }
    Ok(())
}

/// Server-side apply the CRDs into the connected cluster.
pub async fn install() -> Result<()> {
    println!("Installing CRDs...\n");

    let client = kube::Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let api: Api<CustomResourceDefinition> = Api::all(client);

    for crd in all_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .context("generated CRD has no name")?;
        api.patch(
            &name,
            &PatchParams::apply("kubewarden-operator").force(),
            &Patch::Apply(&crd),
        )
        .await
        .with_context(|| format!("Failed to apply CRD {name}"))?;
        println!("  {name} ... applied");
    }

    println!("\nCRDs installed.");
    Ok(())
}

/* ============================= TESTS ============================= */
