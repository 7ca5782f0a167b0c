use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HTTPGetAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::configmap::{POLICIES_KEY, SOURCES_KEY, has_sources};
use crate::crd::PolicyServer;
use crate::errors::ReconcileError;
use crate::secrets::{LEAF_CERT_KEY, LEAF_KEY_KEY};

/* ============================= CONSTANTS ============================= */

/// Port every policy server listens on.
pub const POLICY_SERVER_PORT: i32 = 8443;

/// Pod-template annotation carrying the observed ConfigMap resource
/// version. Any ConfigMap write changes it and forces a rollout.
pub const CONFIG_VERSION_ANNOTATION: &str = "kubewarden/config-version";

/// Pod-template annotation stamped only when the Deployment is patched, so
/// spec changes outside the ConfigMap also roll the pods.
pub const PATCH_TIMESTAMP_ANNOTATION: &str = "kubewarden/last-patch";

const CERTS_MOUNT: &str = "/pki";
const POLICIES_MOUNT: &str = "/config";
const SOURCES_MOUNT: &str = "/sources";
const VERIFICATION_MOUNT: &str = "/verification";
const DOCKER_CONFIG_MOUNT: &str = "/home/kubewarden/.docker";

const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";

/* ============================= BUILD ============================= */

/// Compose the Deployment for a policy server.
///
/// `config_version` is the resource version of the server's ConfigMap at
/// build time. `image_pull_secret` must be the resolved secret when the spec
/// names one; its type is validated here.
pub fn build_deployment(
    namespace: &str,
    server: &PolicyServer,
    config_version: &str,
    image_pull_secret: Option<&Secret>,
) -> Result<Deployment, ReconcileError> {
    let name = server.resource_name();
    let app_label = server.app_label();

    if let Some(secret) = image_pull_secret {
        let type_ = secret.type_.as_deref().unwrap_or_default();
        if type_ != DOCKER_CONFIG_SECRET_TYPE {
            return Err(ReconcileError::InvalidConfig(format!(
                "imagePullSecret '{}' has type '{}', expected '{}'",
                secret.metadata.name.as_deref().unwrap_or_default(),
                type_,
                DOCKER_CONFIG_SECRET_TYPE
            )));
        }
    }

    let mut pod_labels = BTreeMap::new();
    pod_labels.insert("app".to_string(), app_label.clone());
    pod_labels.insert("policyServer".to_string(), server.name_any());

    let mut pod_annotations: BTreeMap<String, String> =
        server.spec.annotations.clone().unwrap_or_default();
    pod_annotations.insert(
        CONFIG_VERSION_ANNOTATION.to_string(),
        config_version.to_string(),
    );

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), app_label.clone())])),
            owner_references: server.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(server.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([("app".to_string(), app_label)])),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: server.spec.service_account_name.clone(),
                    containers: vec![build_container(server, image_pull_secret.is_some())],
                    volumes: Some(build_volumes(server, image_pull_secret.is_some())),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    };

    Ok(deployment)
}

fn build_container(server: &PolicyServer, has_pull_secret: bool) -> Container {
    Container {
        name: "policy-server".to_string(),
        image: Some(server.spec.image.clone()),
        env: Some(build_env(server, has_pull_secret)),
        ports: Some(vec![ContainerPort {
            container_port: POLICY_SERVER_PORT,
            name: Some("policy-server".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/readiness".to_string()),
                port: IntOrString::Int(POLICY_SERVER_PORT),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources: Some(build_resources(server)),
        volume_mounts: Some(build_volume_mounts(server, has_pull_secret)),
        ..Default::default()
    }
}

/// Requests fall back to limits when only limits are configured.
fn build_resources(server: &PolicyServer) -> ResourceRequirements {
    let limits = server.spec.limits.clone();
    let requests = server.spec.requests.clone().or_else(|| limits.clone());
    ResourceRequirements { claims: None, limits, requests }
}

fn build_env(server: &PolicyServer, has_pull_secret: bool) -> Vec<EnvVar> {
    let literal = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    };

    let mut env = vec![
        literal("CERT_FILE", format!("{CERTS_MOUNT}/{LEAF_CERT_KEY}")),
        literal("KEY_FILE", format!("{CERTS_MOUNT}/{LEAF_KEY_KEY}")),
        literal("PORT", POLICY_SERVER_PORT.to_string()),
        literal("POLICIES_DOWNLOAD_DIR", "/tmp/".to_string()),
        literal("POLICIES", format!("{POLICIES_MOUNT}/{POLICIES_KEY}")),
    ];

    if server.spec.verification_config.is_some() {
        env.push(literal("ENABLE_VERIFICATION", "yes".to_string()));
        env.push(literal(
            "VERIFICATION_CONFIG_PATH",
            format!("{VERIFICATION_MOUNT}/verification-config"),
        ));
    }
    if has_sources(server) {
        env.push(literal(
            "SOURCES_PATH",
            format!("{SOURCES_MOUNT}/{SOURCES_KEY}"),
        ));
    }
    if has_pull_secret {
        env.push(literal(
            "DOCKER_CONFIG_JSON_PATH",
            format!("{DOCKER_CONFIG_MOUNT}/config.json"),
        ));
    }

    // User-provided overrides are appended last.
    if let Some(extra) = &server.spec.env {
        env.extend(extra.iter().cloned());
    }
    env
}

fn build_volumes(server: &PolicyServer, has_pull_secret: bool) -> Vec<Volume> {
    let name = server.resource_name();
    let mut volumes = vec![
        Volume {
            name: "certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "policies".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(name.clone()),
                items: Some(vec![KeyToPath {
                    key: POLICIES_KEY.to_string(),
                    path: POLICIES_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    if has_sources(server) {
        volumes.push(Volume {
            name: "sources".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(name),
                items: Some(vec![KeyToPath {
                    key: SOURCES_KEY.to_string(),
                    path: SOURCES_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(verification) = &server.spec.verification_config {
        volumes.push(Volume {
            name: "verification".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(verification.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if has_pull_secret {
        volumes.push(Volume {
            name: "imagepullsecret".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: server.spec.image_pull_secret.clone(),
                items: Some(vec![KeyToPath {
                    key: ".dockerconfigjson".to_string(),
                    path: "config.json".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

fn build_volume_mounts(server: &PolicyServer, has_pull_secret: bool) -> Vec<VolumeMount> {
    let read_only = |name: &str, path: &str| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    };

    let mut mounts = vec![
        read_only("certs", CERTS_MOUNT),
        read_only("policies", POLICIES_MOUNT),
    ];
    if has_sources(server) {
        mounts.push(read_only("sources", SOURCES_MOUNT));
    }
    if server.spec.verification_config.is_some() {
        mounts.push(read_only("verification", VERIFICATION_MOUNT));
    }
    if has_pull_secret {
        mounts.push(read_only("imagepullsecret", DOCKER_CONFIG_MOUNT));
    }
    mounts
}

/* ============================= UPDATE DECISION ============================= */

/// Whether the live Deployment needs a patch to match the desired one.
///
/// Compares the fields the operator owns: replica count, container image,
/// service account, environment and pod-template annotations. The patch
/// timestamp annotation is stripped first, it only exists to force rollouts
/// and must never keep a patch loop alive.
pub fn should_update(existing: &Deployment, desired: &Deployment) -> bool {
    let spec = |d: &Deployment| d.spec.clone().unwrap_or_default();
    let existing_spec = spec(existing);
    let desired_spec = spec(desired);

    if existing_spec.replicas != desired_spec.replicas {
        return true;
    }

    let container = |s: &DeploymentSpec| {
        s.template
            .spec
            .as_ref()
            .and_then(|p| p.containers.first())
            .cloned()
            .unwrap_or_default()
    };
    let existing_container = container(&existing_spec);
    let desired_container = container(&desired_spec);

    if existing_container.image != desired_container.image {
        return true;
    }
    if existing_container.env != desired_container.env {
        return true;
    }

    let sa = |s: &DeploymentSpec| {
        s.template
            .spec
            .as_ref()
            .and_then(|p| p.service_account_name.clone())
    };
    if sa(&existing_spec) != sa(&desired_spec) {
        return true;
    }

    annotations_without_timestamp(existing) != annotations_without_timestamp(desired)
}

fn annotations_without_timestamp(d: &Deployment) -> BTreeMap<String, String> {
    let mut annotations = d
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();
    annotations.remove(PATCH_TIMESTAMP_ANNOTATION);
    annotations
}

/// Stamp the pod template so the patch triggers a rollout.
pub fn stamp_patch_timestamp(deployment: &mut Deployment, timestamp: &str) {
    if let Some(spec) = deployment.spec.as_mut() {
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(PATCH_TIMESTAMP_ANNOTATION.to_string(), timestamp.to_string());
    }
}

/* ============================= TESTS ============================= */
