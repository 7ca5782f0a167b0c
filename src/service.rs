use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::PolicyServer;
use crate::deployment::POLICY_SERVER_PORT;
use crate::errors::ReconcileError;

/* ============================= ENVIRONMENT ============================= */

/// Presence of this variable adds a metrics port to the Service.
pub const ENABLE_METRICS_ENV: &str = "KUBEWARDEN_ENABLE_METRICS";

/// Overrides the metrics port number.
pub const METRICS_PORT_ENV: &str = "KUBEWARDEN_POLICY_SERVER_SERVICES_METRICS_PORT";

pub const DEFAULT_METRICS_PORT: i32 = 8080;

/// Read the metrics-port configuration from the process environment.
pub fn metrics_port_from_env() -> Option<i32> {
    if std::env::var_os(ENABLE_METRICS_ENV).is_none() {
        return None;
    }
    let port = std::env::var(METRICS_PORT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_METRICS_PORT);
    Some(port)
}

/* ============================= SERVICE ============================= */

/// Derive the Service fronting a policy server's pods.
pub fn build_service(
    namespace: &str,
    server: &PolicyServer,
    metrics_port: Option<i32>,
) -> Service {
    let mut ports = vec![ServicePort {
        name: Some("policy-server".to_string()),
        port: POLICY_SERVER_PORT,
        target_port: Some(IntOrString::Int(POLICY_SERVER_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if let Some(port) = metrics_port {
        ports.push(ServicePort {
            name: Some("metrics".to_string()),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    Service {
        metadata: ObjectMeta {
            name: Some(server.resource_name()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), server.app_label())])),
            owner_references: server.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([("app".to_string(), server.app_label())])),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/* ============================= POD DISRUPTION BUDGET ============================= */

/// Derive the optional PodDisruptionBudget.
///
/// Returns `Ok(None)` when neither bound is configured; both bounds at once
/// is invalid (the validation webhook rejects it, this is the backstop).
pub fn build_pdb(
    namespace: &str,
    server: &PolicyServer,
) -> Result<Option<PodDisruptionBudget>, ReconcileError> {
    let min_available = server.spec.min_available.clone();
    let max_unavailable = server.spec.max_unavailable.clone();

    if min_available.is_some() && max_unavailable.is_some() {
        return Err(ReconcileError::InvalidConfig(
            "minAvailable and maxUnavailable are mutually exclusive".to_string(),
        ));
    }
    if min_available.is_none() && max_unavailable.is_none() {
        return Ok(None);
    }

    let selector_labels = BTreeMap::from([
        ("app".to_string(), server.app_label()),
        ("policyServer".to_string(), server.name_any()),
    ]);

    Ok(Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(server.resource_name()),
            namespace: Some(namespace.to_string()),
            owner_references: server.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available,
            max_unavailable,
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }))
}

/* ============================= TESTS ============================= */
