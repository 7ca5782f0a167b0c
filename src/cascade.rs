use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use notify::{RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::crd::PolicyServer;
use crate::errors::ReconcileError;
use crate::reconciler::{Context, ensure_root_ca};
use crate::secrets::{POLICY_SERVER_LABEL, create_or_patch, fill_leaf_secret};
use crate::webhooks::{KUBEWARDEN_LABEL, refresh_mutating_bundle, refresh_validating_bundle};

/* ============================= CONSTANTS ============================= */

/// How long the operator waits for its own serving certificate files.
pub const SERVING_CERT_TIMEOUT: Duration = Duration::from_secs(60);

const SERVING_CERT: &str = "tls.crt";
const SERVING_KEY: &str = "tls.key";

/* ============================= ROTATION ============================= */

/// Root CA event handler. Fetch-or-initialize the root secret; when this
/// pass created it (first boot or rotation-by-deletion), every leaf is
/// reissued under the new root and every webhook bundle refreshed.
pub async fn reconcile_root_ca(ctx: &Context) -> Result<(), ReconcileError> {
    let (ca, initialized) = ensure_root_ca(&ctx.client, &ctx.deployments_namespace).await?;
    if !initialized {
        return Ok(());
    }

    info!("root_ca_rotated");
    rotate_leaf_secrets(ctx, &ca).await?;
    refresh_webhook_bundles(ctx, ca.cert_pem.as_bytes()).await?;
    Ok(())
}

/// Reissue every leaf secret carrying the policy-server label.
async fn rotate_leaf_secrets(
    ctx: &Context,
    ca: &crate::ca::CertificateAuthority,
) -> Result<(), ReconcileError> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let servers: Api<PolicyServer> = Api::all(ctx.client.clone());

    let leaves = secrets
        .list(&ListParams::default().labels(POLICY_SERVER_LABEL))
        .await?;

    for leaf in leaves {
        let leaf_name = leaf.name_any();
        let Some(server_name) = leaf
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(POLICY_SERVER_LABEL))
            .cloned()
        else {
            continue;
        };

        // Orphaned leaves are garbage-collected by their owner reference,
        // not rotated.
        let Some(server) = servers.get_opt(&server_name).await? else {
            warn!(secret = %leaf_name, server = %server_name, "leaf_without_server_skipped");
            continue;
        };

        let pair = ca.generate_leaf(&server.cert_sans(&ctx.deployments_namespace))?;
        let namespace = ctx.deployments_namespace.clone();
        create_or_patch(&secrets, &leaf_name, |secret| {
            fill_leaf_secret(secret, &namespace, &server, &pair)
        })
        .await?;
        info!(secret = %leaf_name, server = %server_name, "leaf_secret_rotated");
    }
    Ok(())
}

/// Push the new client-CA bundle into every kubewarden-managed webhook
/// configuration, without waiting for each policy's next reconcile.
async fn refresh_webhook_bundles(ctx: &Context, bundle: &[u8]) -> Result<(), ReconcileError> {
    let selector = ListParams::default().labels(&format!("{KUBEWARDEN_LABEL}=true"));

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
    for cfg in validating.list(&selector).await? {
        let name = cfg.name_any();
        let mut desired = cfg.clone();
        refresh_validating_bundle(&mut desired, bundle);
        if desired != cfg {
            validating
                .patch(
                    &name,
                    &PatchParams::apply("kubewarden-controller"),
                    &Patch::Merge(&desired),
                )
                .await?;
            info!(webhook = %name, "ca_bundle_refreshed");
        }
    }

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());
    for cfg in mutating.list(&selector).await? {
        let name = cfg.name_any();
        let mut desired = cfg.clone();
        refresh_mutating_bundle(&mut desired, bundle);
        if desired != cfg {
            mutating
                .patch(
                    &name,
                    &PatchParams::apply("kubewarden-controller"),
                    &Patch::Merge(&desired),
                )
                .await?;
            info!(webhook = %name, "ca_bundle_refreshed");
        }
    }
    Ok(())
}

/* ============================= SERVING CERT WAIT ============================= */

pub fn serving_cert_present(dir: &Path) -> bool {
    dir.join(SERVING_CERT).exists() && dir.join(SERVING_KEY).exists()
}

/// Block until both `tls.crt` and `tls.key` are observable under `dir`.
///
/// The secret holding the operator's own serving certificate is mounted by
/// the kubelet with some delay after (re)issue; readiness must not be
/// declared before the files exist. Watches the directory and falls back to
/// polling when it cannot be watched yet.
pub async fn wait_for_serving_cert(dir: PathBuf, timeout: Duration) -> Result<(), ReconcileError> {
    let shown = dir.display().to_string();
    let found = tokio::task::spawn_blocking(move || wait_blocking(&dir, timeout))
        .await
        .map_err(|e| ReconcileError::InvalidConfig(format!("certificate watcher failed: {e}")))?;

    if found {
        Ok(())
    } else {
        Err(ReconcileError::InvalidConfig(format!(
            "serving certificate not present in '{shown}' after {}s",
            timeout.as_secs()
        )))
    }
}

fn wait_blocking(dir: &Path, timeout: Duration) -> bool {
    if serving_cert_present(dir) {
        return true;
    }
    let deadline = Instant::now() + timeout;

    let (tx, rx) = mpsc::channel();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res.is_ok());
    });
    let mut watcher = match watcher {
        Ok(w) => w,
        Err(_) => return poll_until(dir, deadline),
    };
    if watcher.watch(dir, RecursiveMode::NonRecursive).is_err() {
        // Directory not mounted yet; plain polling until it shows up.
        return poll_until(dir, deadline);
    }

    while Instant::now() < deadline {
        if serving_cert_present(dir) {
            return true;
        }
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .min(Duration::from_millis(500));
        let _ = rx.recv_timeout(remaining);
    }
    serving_cert_present(dir)
}

fn poll_until(dir: &Path, deadline: Instant) -> bool {
    while Instant::now() < deadline {
        if serving_cert_present(dir) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    serving_cert_present(dir)
}

/* ============================= TESTS ============================= */
