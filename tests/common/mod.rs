#![allow(dead_code)]

use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

use kubewarden_operator::crd::{
    AdmissionPolicy, AdmissionPolicySpec, AnyPolicy, ClusterAdmissionPolicy,
    ClusterAdmissionPolicySpec, PolicyServer, PolicyServerSpec, PolicySpec, PolicyStatus,
    PolicyStatusPhase,
};

pub fn make_policy_server(name: &str, image: &str, replicas: i32) -> PolicyServer {
    PolicyServer {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: PolicyServerSpec {
            image: image.to_string(),
            replicas,
            ..Default::default()
        },
        status: None,
    }
}

pub fn make_rule(
    groups: &[&str],
    versions: &[&str],
    resources: &[&str],
    operations: &[&str],
) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
        api_versions: Some(versions.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        operations: Some(operations.iter().map(|s| s.to_string()).collect()),
        scope: None,
    }
}

pub fn make_cluster_policy(
    name: &str,
    server: &str,
    rules: Vec<RuleWithOperations>,
) -> ClusterAdmissionPolicy {
    ClusterAdmissionPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: ClusterAdmissionPolicySpec {
            policy: PolicySpec {
                policy_server: server.to_string(),
                module: format!("registry://example/{name}:v1"),
                rules,
                ..Default::default()
            },
            namespace_selector: None,
        },
        status: None,
    }
}

pub fn make_namespaced_policy(
    name: &str,
    namespace: &str,
    server: &str,
    rules: Vec<RuleWithOperations>,
) -> AdmissionPolicy {
    AdmissionPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            ..Default::default()
        },
        spec: AdmissionPolicySpec {
            policy: PolicySpec {
                policy_server: server.to_string(),
                module: format!("registry://example/{name}:v1"),
                rules,
                ..Default::default()
            },
        },
        status: None,
    }
}

pub fn activate(policy: &mut ClusterAdmissionPolicy) {
    policy.status = Some(PolicyStatus {
        policy_status: PolicyStatusPhase::Active,
        ..Default::default()
    });
}

pub fn with_namespace_selector(
    mut policy: ClusterAdmissionPolicy,
    key: &str,
    value: &str,
) -> ClusterAdmissionPolicy {
    policy.spec.namespace_selector = Some(LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Default::default()
    });
    policy
}

pub fn as_any(policy: ClusterAdmissionPolicy) -> AnyPolicy {
    AnyPolicy::Cluster(policy)
}
