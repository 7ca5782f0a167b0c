use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::ca::{CertificateAuthority, TLS_CERT_KEY};
use crate::configmap::fill_config_map;
use crate::crd::{
    AdmissionPolicy, AnyPolicy, ClusterAdmissionPolicy, FINALIZER, PolicyServer, PolicyStatus,
    condition, upsert_condition,
};
use crate::deployment::{build_deployment, should_update, stamp_patch_timestamp};
use crate::errors::{ReconcileError, is_404};
use crate::readiness::{deployment_ready, uniquely_reachable};
use crate::secrets::{
    ROOT_CA_SECRET_NAME, create_or_patch, fill_leaf_secret, leaf_material, root_ca_secret,
};
use crate::service::{build_pdb, build_service};
use crate::status::{
    CONDITION_POLICY_ACTIVE, CONDITION_UNIQUELY_REACHABLE, PolicyObservation, REASON_FAILED,
    REASON_SUCCEEDED, next_phase, observed_mode,
};
use crate::webhooks::{fill_mutating, fill_validating};

/* ============================= CONTEXT ============================= */

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: Client,
    /// Namespace all operator-managed workloads live in.
    pub deployments_namespace: String,
    /// Append a NotIn requirement for the deployments namespace to every
    /// webhook's namespace selector.
    pub exclude_deployments_namespace: bool,
    /// Metrics port exposed on policy server Services, when enabled.
    pub metrics_port: Option<i32>,
}

const NOT_READY_REQUEUE: Duration = Duration::from_secs(5);
const POLICY_PENDING_REQUEUE: Duration = Duration::from_secs(2);
const DELETION_REQUEUE: Duration = Duration::from_secs(5);

const MANAGER: &str = "kubewarden-controller";

/* ============================= CONDITION TYPES ============================= */

const CONDITION_CERT_SECRET: &str = "CertSecretReconciled";
const CONDITION_CONFIG_MAP: &str = "ConfigMapReconciled";
const CONDITION_DEPLOYMENT: &str = "DeploymentReconciled";
const CONDITION_SERVICE: &str = "ServiceReconciled";
const CONDITION_PDB: &str = "PodDisruptionBudgetReconciled";

/* ============================= HELPERS ============================= */

/// Finalizer list with ours added or removed.
fn finalizers_with(current: Option<&Vec<String>>, present: bool) -> Option<Vec<String>> {
    let mut list = current.cloned().unwrap_or_default();
    let has = list.iter().any(|f| f == FINALIZER);
    match (has, present) {
        (true, true) | (false, false) => None,
        (false, true) => {
            list.push(FINALIZER.to_string());
            Some(list)
        }
        (true, false) => {
            list.retain(|f| f != FINALIZER);
            Some(list)
        }
    }
}

/// Add or remove our finalizer on any object, skipping the write when the
/// list is already in the desired state.
pub async fn set_finalizer<K>(api: &Api<K>, obj: &K, present: bool) -> Result<(), ReconcileError>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + Serialize + DeserializeOwned,
{
    let Some(desired) = finalizers_with(obj.meta().finalizers.as_ref(), present) else {
        return Ok(());
    };
    let name = obj.name_any();
    let patch = serde_json::json!({ "metadata": { "finalizers": desired } });
    api.patch(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(object = %name, present, "finalizer_updated");
    Ok(())
}

/// Absorb 404s on deletes; everything else is surfaced.
async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), ReconcileError>
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_404(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/* ============================= BOUND POLICIES ============================= */

/// Every policy targeting the given server, both kinds, any status.
pub async fn list_bound_policies(
    client: &Client,
    server_name: &str,
) -> Result<Vec<AnyPolicy>, ReconcileError> {
    let mut bound = Vec::new();

    let cluster: Api<ClusterAdmissionPolicy> = Api::all(client.clone());
    for p in cluster.list(&Default::default()).await? {
        if p.spec.policy.policy_server == server_name {
            bound.push(AnyPolicy::Cluster(p));
        }
    }

    let namespaced: Api<AdmissionPolicy> = Api::all(client.clone());
    for p in namespaced.list(&Default::default()).await? {
        if p.spec.policy.policy_server == server_name {
            bound.push(AnyPolicy::Namespaced(p));
        }
    }

    Ok(bound)
}

/* ============================= ROOT CA ============================= */

/// Load the root CA secret, creating it when absent. Returns the CA and
/// whether this call created it.
pub async fn ensure_root_ca(
    client: &Client,
    namespace: &str,
) -> Result<(CertificateAuthority, bool), ReconcileError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);

    if let Some(secret) = api.get_opt(ROOT_CA_SECRET_NAME).await? {
        return Ok((CertificateAuthority::from_secret(&secret)?, false));
    }

    let ca = CertificateAuthority::generate()?;
    let secret = root_ca_secret(namespace, &ca);
    match api.create(&Default::default(), &secret).await {
        Ok(_) => {
            info!(namespace, "root_ca_created");
            Ok((ca, true))
        }
        Err(e) if crate::errors::is_409(&e) => {
            // Lost the creation race, use the winner's CA.
            let secret = api.get(ROOT_CA_SECRET_NAME).await?;
            Ok((CertificateAuthority::from_secret(&secret)?, false))
        }
        Err(e) => Err(e.into()),
    }
}

/// PEM bundle of the root CA certificate, for webhook client configs.
pub async fn root_ca_bundle(client: &Client, namespace: &str) -> Result<Vec<u8>, ReconcileError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(ROOT_CA_SECRET_NAME).await?;
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(TLS_CERT_KEY))
        .map(|b| b.0.clone())
        .ok_or_else(|| {
            ReconcileError::invalid_secret(ROOT_CA_SECRET_NAME, "missing key 'tls.crt'")
        })
}

/* ============================= POLICY SERVER ============================= */

pub async fn reconcile_policy_server(
    server: Arc<PolicyServer>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = server.name_any();
    let namespace = ctx.deployments_namespace.clone();
    info!(server = %name, "reconcile_policy_server");

    let policies = list_bound_policies(&ctx.client, &name).await?;

    if server.metadata.deletion_timestamp.is_some() {
        return delete_policy_server(&server, &policies, &ctx).await;
    }

    let servers: Api<PolicyServer> = Api::all(ctx.client.clone());
    set_finalizer(&servers, server.as_ref(), true).await?;

    let mut conditions = server
        .status
        .clone()
        .unwrap_or_default()
        .conditions;

    // Strictly ordered: root CA, leaf secret, configmap, deployment,
    // service and PDB. A failing step records its condition, publishes the
    // status and stops the pass.
    let step = |conditions: &mut Vec<_>, type_: &str, result: &Result<(), ReconcileError>| {
        match result {
            Ok(()) => upsert_condition(conditions, condition(type_, true, REASON_SUCCEEDED, "")),
            Err(e) => upsert_condition(
                conditions,
                condition(type_, false, REASON_FAILED, &e.to_string()),
            ),
        }
    };

    let ca = match ensure_root_ca(&ctx.client, &namespace).await {
        Ok((ca, _)) => ca,
        Err(e) => {
            upsert_condition(
                &mut conditions,
                condition(CONDITION_CERT_SECRET, false, REASON_FAILED, &e.to_string()),
            );
            publish_server_status_best_effort(&ctx.client, &name, conditions).await;
            return Err(e);
        }
    };

    let leaf = reconcile_leaf_secret(&ctx, &server, &ca).await;
    step(&mut conditions, CONDITION_CERT_SECRET, &leaf);
    if let Err(e) = leaf {
        publish_server_status_best_effort(&ctx.client, &name, conditions).await;
        return Err(e);
    }

    let config_map = reconcile_config_map(&ctx, &server, &policies).await;
    step(
        &mut conditions,
        CONDITION_CONFIG_MAP,
        &config_map.as_ref().map(|_| ()).map_err(clone_error),
    );
    let config_map = match config_map {
        Ok(cm) => cm,
        Err(e) => {
            publish_server_status_best_effort(&ctx.client, &name, conditions).await;
            return Err(e);
        }
    };

    let deployment = reconcile_deployment(&ctx, &server, &config_map).await;
    step(&mut conditions, CONDITION_DEPLOYMENT, &deployment);
    if let Err(e) = deployment {
        publish_server_status_best_effort(&ctx.client, &name, conditions).await;
        return Err(e);
    }

    let service = reconcile_service(&ctx, &server).await;
    step(&mut conditions, CONDITION_SERVICE, &service);
    if let Err(e) = service {
        publish_server_status_best_effort(&ctx.client, &name, conditions).await;
        return Err(e);
    }

    let pdb = reconcile_pdb(&ctx, &server).await;
    step(&mut conditions, CONDITION_PDB, &pdb);
    if let Err(e) = pdb {
        publish_server_status_best_effort(&ctx.client, &name, conditions).await;
        return Err(e);
    }

    publish_server_status_best_effort(&ctx.client, &name, conditions).await;

    // Readiness decides between settling and a short requeue.
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let live = deployments.get(&server.resource_name()).await?;
    match deployment_ready(&live) {
        Ok(()) => {
            info!(server = %name, "policy_server_ready");
            Ok(Action::await_change())
        }
        Err(ReconcileError::PolicyServerNotReady(message)) => {
            info!(server = %name, %message, "policy_server_not_ready");
            Ok(Action::requeue(NOT_READY_REQUEUE))
        }
        Err(e) => Err(e),
    }
}

fn clone_error(e: &ReconcileError) -> ReconcileError {
    // ReconcileError is not Clone because of the kube variant; conditions
    // only need the message.
    ReconcileError::InvalidConfig(e.to_string())
}

async fn publish_server_status_best_effort(
    client: &Client,
    name: &str,
    conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
) {
    if let Err(e) = try_publish_server_status(client, name, conditions).await {
        warn!(server = %name, error = %e, "status_publish_failed");
    }
}

async fn try_publish_server_status(
    client: &Client,
    name: &str,
    conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
) -> Result<(), ReconcileError> {
    let api: Api<PolicyServer> = Api::all(client.clone());

    // Unchanged conditions produce no write, reconciles must stay
    // observable-idempotent.
    if let Some(current) = api.get_opt(name).await? {
        if current
            .status
            .as_ref()
            .map(|s| s.conditions == conditions)
            .unwrap_or(false)
        {
            return Ok(());
        }
    }

    let patch = serde_json::json!({ "status": { "conditions": conditions } });
    api.patch_status(name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn reconcile_leaf_secret(
    ctx: &Context,
    server: &PolicyServer,
    ca: &CertificateAuthority,
) -> Result<(), ReconcileError> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let name = server.resource_name();

    // An existing leaf with intact material is left alone; rotation is the
    // CA controller's job.
    if let Some(existing) = api.get_opt(&name).await? {
        if leaf_material(&existing).is_ok() {
            return Ok(());
        }
    }

    let pair = ca.generate_leaf(&server.cert_sans(&ctx.deployments_namespace))?;
    let namespace = ctx.deployments_namespace.clone();
    create_or_patch(&api, &name, |secret| {
        fill_leaf_secret(secret, &namespace, server, &pair)
    })
    .await?;
    info!(secret = %name, "leaf_secret_reconciled");
    Ok(())
}

async fn reconcile_config_map(
    ctx: &Context,
    server: &PolicyServer,
    policies: &[AnyPolicy],
) -> Result<ConfigMap, ReconcileError> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let namespace = ctx.deployments_namespace.clone();
    let name = server.resource_name();

    let outcome = create_or_patch(&api, &name, |cm| {
        // Serialization errors surface through the deployment step reading
        // the map back; the mutator itself cannot fail.
        let _ = fill_config_map(cm, &namespace, server, policies);
    })
    .await?;
    if outcome.wrote() {
        info!(configmap = %name, "configmap_reconciled");
    }
    Ok(outcome.into_inner())
}

async fn reconcile_deployment(
    ctx: &Context,
    server: &PolicyServer,
    config_map: &ConfigMap,
) -> Result<(), ReconcileError> {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let name = server.resource_name();

    let pull_secret = match &server.spec.image_pull_secret {
        Some(secret_name) => {
            let secrets: Api<Secret> =
                Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
            match secrets.get_opt(secret_name).await? {
                Some(secret) => Some(secret),
                None => {
                    return Err(ReconcileError::InvalidConfig(format!(
                        "imagePullSecret '{secret_name}' not found"
                    )));
                }
            }
        }
        None => None,
    };

    let config_version = config_map
        .metadata
        .resource_version
        .clone()
        .unwrap_or_default();
    let mut desired = build_deployment(
        &ctx.deployments_namespace,
        server,
        &config_version,
        pull_secret.as_ref(),
    )?;

    match api.get_opt(&name).await? {
        None => {
            api.create(&Default::default(), &desired).await?;
            info!(deployment = %name, "deployment_created");
        }
        Some(existing) => {
            if should_update(&existing, &desired) {
                // The timestamp only moves when we actually patch, so
                // content changes always roll the pods.
                stamp_patch_timestamp(&mut desired, &chrono::Utc::now().to_rfc3339());
                api.patch(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&desired))
                    .await?;
                info!(deployment = %name, "deployment_patched");
            }
        }
    }
    Ok(())
}

async fn reconcile_service(ctx: &Context, server: &PolicyServer) -> Result<(), ReconcileError> {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let desired = build_service(&ctx.deployments_namespace, server, ctx.metrics_port);
    let name = server.resource_name();

    let outcome = create_or_patch(&api, &name, |svc| {
        svc.metadata.labels = desired.metadata.labels.clone();
        svc.metadata.owner_references = desired.metadata.owner_references.clone();
        // Only the operator-owned fields; the API server fills cluster IPs
        // and friends, which a full spec replacement would fight over.
        let spec = svc.spec.get_or_insert_with(Default::default);
        let desired_spec = desired.spec.as_ref().expect("built service has a spec");
        spec.selector = desired_spec.selector.clone();
        spec.ports = desired_spec.ports.clone();
    })
    .await?;
    if outcome.wrote() {
        info!(service = %name, "service_reconciled");
    }
    Ok(())
}

async fn reconcile_pdb(ctx: &Context, server: &PolicyServer) -> Result<(), ReconcileError> {
    let api: Api<PodDisruptionBudget> =
        Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
    let name = server.resource_name();

    match build_pdb(&ctx.deployments_namespace, server)? {
        None => {
            // Only issue the delete when there is something to remove.
            if api.get_opt(&name).await?.is_some() {
                delete_ignoring_missing(&api, &name).await?;
                info!(pdb = %name, "pdb_removed");
            }
            Ok(())
        }
        Some(desired) => {
            let outcome = create_or_patch(&api, &name, |pdb| {
                pdb.metadata.owner_references = desired.metadata.owner_references.clone();
                pdb.spec = desired.spec.clone();
            })
            .await?;
            if outcome.wrote() {
                info!(pdb = %name, "pdb_reconciled");
            }
            Ok(())
        }
    }
}

/// Two-layer teardown: bound policies go first (their own finalizers remove
/// the webhook configurations), owned workload objects after, the finalizer
/// last.
async fn delete_policy_server(
    server: &PolicyServer,
    policies: &[AnyPolicy],
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let name = server.name_any();

    if !policies.is_empty() {
        info!(server = %name, pending = policies.len(), "deleting_bound_policies");
        for policy in policies {
            match policy {
                AnyPolicy::Cluster(p) => {
                    let api: Api<ClusterAdmissionPolicy> = Api::all(ctx.client.clone());
                    delete_ignoring_missing(&api, &p.name_any()).await?;
                }
                AnyPolicy::Namespaced(p) => {
                    let api: Api<AdmissionPolicy> = Api::namespaced(
                        ctx.client.clone(),
                        &p.namespace().unwrap_or_default(),
                    );
                    delete_ignoring_missing(&api, &p.name_any()).await?;
                }
            }
        }
        // Their finalizers still have to run; check back shortly.
        return Ok(Action::requeue(DELETION_REQUEUE));
    }

    let resource_name = server.resource_name();
    let ns = &ctx.deployments_namespace;
    delete_ignoring_missing(
        &Api::<Deployment>::namespaced(ctx.client.clone(), ns),
        &resource_name,
    )
    .await?;
    delete_ignoring_missing(
        &Api::<Service>::namespaced(ctx.client.clone(), ns),
        &resource_name,
    )
    .await?;
    delete_ignoring_missing(
        &Api::<ConfigMap>::namespaced(ctx.client.clone(), ns),
        &resource_name,
    )
    .await?;
    delete_ignoring_missing(
        &Api::<Secret>::namespaced(ctx.client.clone(), ns),
        &resource_name,
    )
    .await?;
    delete_ignoring_missing(
        &Api::<PodDisruptionBudget>::namespaced(ctx.client.clone(), ns),
        &resource_name,
    )
    .await?;

    let servers: Api<PolicyServer> = Api::all(ctx.client.clone());
    set_finalizer(&servers, server, false).await?;
    info!(server = %name, "policy_server_deleted");
    Ok(Action::await_change())
}

pub fn policy_server_error_policy(
    _server: Arc<PolicyServer>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    warn!(error = %error, "policy_server_reconcile_error");
    if error.is_retryable() {
        Action::requeue(NOT_READY_REQUEUE)
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

/* ============================= POLICIES ============================= */

pub async fn reconcile_cluster_policy(
    policy: Arc<ClusterAdmissionPolicy>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    reconcile_policy(AnyPolicy::Cluster(policy.as_ref().clone()), ctx).await
}

pub async fn reconcile_admission_policy(
    policy: Arc<AdmissionPolicy>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    reconcile_policy(AnyPolicy::Namespaced(policy.as_ref().clone()), ctx).await
}

async fn reconcile_policy(policy: AnyPolicy, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let unique_name = policy.unique_name();
    info!(policy = %unique_name, "reconcile_policy");

    if policy.deletion_in_progress() {
        return delete_policy(&policy, &ctx).await;
    }
    ensure_policy_finalizer(&policy, &ctx).await?;

    // Observe the world this policy depends on.
    let spec = policy.spec();
    let server_named = !spec.policy_server.is_empty();

    let servers: Api<PolicyServer> = Api::all(ctx.client.clone());
    let server = if server_named {
        servers.get_opt(&spec.policy_server).await?
    } else {
        None
    };

    let mut deployment = None;
    let mut config_map = None;
    if let Some(server) = &server {
        let deployments: Api<Deployment> =
            Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
        deployment = deployments.get_opt(&server.resource_name()).await?;

        let config_maps: Api<ConfigMap> =
            Api::namespaced(ctx.client.clone(), &ctx.deployments_namespace);
        config_map = config_maps.get_opt(&server.resource_name()).await?;
    }

    let ready = deployment
        .as_ref()
        .map(|d| deployment_ready(d).is_ok())
        .unwrap_or(false);

    // The webhook configuration exists if and only if the server serves.
    let mut served = false;
    if ready {
        let bundle = root_ca_bundle(&ctx.client, &ctx.deployments_namespace).await?;
        reconcile_webhook_config(&policy, &bundle, &ctx).await?;
        served = true;
    }

    let observation = PolicyObservation {
        server_named,
        server_found: server.is_some(),
        deployment_found: deployment.is_some(),
        served,
    };
    let current = policy
        .status()
        .map(|s| s.policy_status)
        .unwrap_or_default();
    let phase = next_phase(current, observation);

    let mut conditions = policy.status().map(|s| s.conditions.clone()).unwrap_or_default();
    upsert_condition(
        &mut conditions,
        condition(
            CONDITION_POLICY_ACTIVE,
            phase == crate::crd::PolicyStatusPhase::Active,
            REASON_SUCCEEDED,
            "",
        ),
    );
    upsert_condition(
        &mut conditions,
        condition(
            CONDITION_UNIQUELY_REACHABLE,
            deployment.as_ref().map(uniquely_reachable).unwrap_or(false),
            REASON_SUCCEEDED,
            "",
        ),
    );

    let status = PolicyStatus {
        policy_status: phase,
        policy_mode: observed_mode(config_map.as_ref(), &unique_name, spec.mode),
        conditions,
    };
    publish_policy_status(&policy, status, &ctx).await?;

    // Progression is time-driven while waiting on the server: pending
    // polls fast for the rollout, scheduled slower for the server to show
    // up. Unscheduled and active settle until something changes.
    match phase {
        crate::crd::PolicyStatusPhase::Pending => {
            info!(policy = %unique_name, "policy_server_pending");
            Ok(Action::requeue(POLICY_PENDING_REQUEUE))
        }
        crate::crd::PolicyStatusPhase::Scheduled => {
            Ok(Action::requeue(NOT_READY_REQUEUE))
        }
        _ => Ok(Action::await_change()),
    }
}

async fn ensure_policy_finalizer(policy: &AnyPolicy, ctx: &Context) -> Result<(), ReconcileError> {
    match policy {
        AnyPolicy::Cluster(p) => {
            let api: Api<ClusterAdmissionPolicy> = Api::all(ctx.client.clone());
            set_finalizer(&api, p, true).await
        }
        AnyPolicy::Namespaced(p) => {
            let api: Api<AdmissionPolicy> =
                Api::namespaced(ctx.client.clone(), &p.namespace().unwrap_or_default());
            set_finalizer(&api, p, true).await
        }
    }
}

async fn reconcile_webhook_config(
    policy: &AnyPolicy,
    ca_bundle: &[u8],
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let name = policy.unique_name();
    if policy.is_mutating() {
        // A flipped mutating flag leaves a configuration of the other kind
        // behind; drop it before writing the current one.
        let stale: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
        if stale.get_opt(&name).await?.is_some() {
            delete_ignoring_missing(&stale, &name).await?;
        }

        let api: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());
        create_or_patch(&api, &name, |cfg| {
            fill_mutating(
                cfg,
                policy,
                &ctx.deployments_namespace,
                ca_bundle,
                ctx.exclude_deployments_namespace,
            )
        })
        .await?;
    } else {
        let stale: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());
        if stale.get_opt(&name).await?.is_some() {
            delete_ignoring_missing(&stale, &name).await?;
        }

        let api: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
        create_or_patch(&api, &name, |cfg| {
            fill_validating(
                cfg,
                policy,
                &ctx.deployments_namespace,
                ca_bundle,
                ctx.exclude_deployments_namespace,
            )
        })
        .await?;
    }
    Ok(())
}

/// Policy teardown: drop the webhook configuration, then the finalizer.
/// Both webhook kinds are tried; the mutating flag may have changed since
/// the configuration was written.
async fn delete_policy(policy: &AnyPolicy, ctx: &Context) -> Result<Action, ReconcileError> {
    let name = policy.unique_name();

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(ctx.client.clone());
    delete_ignoring_missing(&validating, &name).await?;
    let mutating: Api<MutatingWebhookConfiguration> = Api::all(ctx.client.clone());
    delete_ignoring_missing(&mutating, &name).await?;

    match policy {
        AnyPolicy::Cluster(p) => {
            let api: Api<ClusterAdmissionPolicy> = Api::all(ctx.client.clone());
            set_finalizer(&api, p, false).await?;
        }
        AnyPolicy::Namespaced(p) => {
            let api: Api<AdmissionPolicy> =
                Api::namespaced(ctx.client.clone(), &p.namespace().unwrap_or_default());
            set_finalizer(&api, p, false).await?;
        }
    }
    info!(policy = %name, "policy_deleted");
    Ok(Action::await_change())
}

async fn publish_policy_status(
    policy: &AnyPolicy,
    status: PolicyStatus,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    if policy.status() == Some(&status) {
        return Ok(());
    }
    let patch = serde_json::json!({ "status": status });
    match policy {
        AnyPolicy::Cluster(p) => {
            let api: Api<ClusterAdmissionPolicy> = Api::all(ctx.client.clone());
            api.patch_status(
                &p.name_any(),
                &PatchParams::apply(MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        }
        AnyPolicy::Namespaced(p) => {
            let api: Api<AdmissionPolicy> =
                Api::namespaced(ctx.client.clone(), &p.namespace().unwrap_or_default());
            api.patch_status(
                &p.name_any(),
                &PatchParams::apply(MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        }
    }
    Ok(())
}

pub fn cluster_policy_error_policy(
    _policy: Arc<ClusterAdmissionPolicy>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    policy_error_action(error)
}

pub fn admission_policy_error_policy(
    _policy: Arc<AdmissionPolicy>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    policy_error_action(error)
}

fn policy_error_action(error: &ReconcileError) -> Action {
    warn!(error = %error, "policy_reconcile_error");
    if error.is_retryable() {
        Action::requeue(POLICY_PENDING_REQUEUE)
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── finalizer list computation ──

    #[test]
    fn test_add_finalizer_to_empty() {
        assert_eq!(
            finalizers_with(None, true),
            Some(vec![FINALIZER.to_string()])
        );
    }

    #[test]
    fn test_add_finalizer_preserves_others() {
        let current = vec!["other/finalizer".to_string()];
        assert_eq!(
            finalizers_with(Some(&current), true),
            Some(vec!["other/finalizer".to_string(), FINALIZER.to_string()])
        );
    }

    #[test]
    fn test_add_finalizer_already_present_is_noop() {
        let current = vec![FINALIZER.to_string()];
        assert_eq!(finalizers_with(Some(&current), true), None);
    }

    #[test]
    fn test_remove_finalizer() {
        let current = vec![FINALIZER.to_string(), "other/finalizer".to_string()];
        assert_eq!(
            finalizers_with(Some(&current), false),
            Some(vec!["other/finalizer".to_string()])
        );
    }

    #[test]
    fn test_remove_absent_finalizer_is_noop() {
        assert_eq!(finalizers_with(None, false), None);
        let current = vec!["other/finalizer".to_string()];
        assert_eq!(finalizers_with(Some(&current), false), None);
    }

    // ── error policy mapping ──

    #[test]
    fn test_retryable_errors_requeue_fast() {
        let action = policy_error_action(&ReconcileError::PolicyServerNotReady("x".into()));
        assert_eq!(action, Action::requeue(POLICY_PENDING_REQUEUE));
    }

    #[test]
    fn test_terminal_errors_requeue_slow() {
        let action = policy_error_action(&ReconcileError::InvalidConfig("x".into()));
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }
}
