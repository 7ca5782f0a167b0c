use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};

use crate::crd::AnyPolicy;
use crate::deployment::POLICY_SERVER_PORT;

/* ============================= CONSTANTS ============================= */

pub const KUBEWARDEN_LABEL: &str = "kubewarden";
pub const SCOPE_LABEL: &str = "kubewarden/policyScope";
pub const POLICY_NAME_ANNOTATION: &str = "kubewarden/policy-name";
pub const POLICY_NAMESPACE_ANNOTATION: &str = "kubewarden/policy-namespace";

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/* ============================= PIECES ============================= */

fn webhook_entry_name(policy: &AnyPolicy) -> String {
    format!("{}.kubewarden.admission", policy.unique_name())
}

fn object_meta(policy: &AnyPolicy) -> ObjectMeta {
    let scope = if policy.is_namespaced() {
        "namespace"
    } else {
        "cluster"
    };
    let mut annotations = BTreeMap::from([(
        POLICY_NAME_ANNOTATION.to_string(),
        policy.name(),
    )]);
    if let Some(namespace) = policy.namespace() {
        annotations.insert(POLICY_NAMESPACE_ANNOTATION.to_string(), namespace);
    }

    ObjectMeta {
        name: Some(policy.unique_name()),
        labels: Some(BTreeMap::from([
            (KUBEWARDEN_LABEL.to_string(), "true".to_string()),
            (SCOPE_LABEL.to_string(), scope.to_string()),
        ])),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn client_config(
    policy: &AnyPolicy,
    deployments_namespace: &str,
    ca_bundle: &[u8],
) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            name: format!("policy-server-{}", policy.spec().policy_server),
            namespace: deployments_namespace.to_string(),
            path: Some(format!("/validate/{}", policy.unique_name())),
            port: Some(POLICY_SERVER_PORT),
        }),
        ca_bundle: Some(ByteString(ca_bundle.to_vec())),
        url: None,
    }
}

/// Rules copied from the policy; namespaced policies can only ever match
/// namespaced objects, so their scope is forced.
fn effective_rules(policy: &AnyPolicy) -> Vec<RuleWithOperations> {
    let mut rules = policy.spec().rules.clone();
    if policy.is_namespaced() {
        for rule in &mut rules {
            rule.scope = Some("Namespaced".to_string());
        }
    }
    rules
}

/// Namespace selector for the webhook.
///
/// A namespaced policy is pinned to its own namespace; a cluster-scoped one
/// carries the user's selector. When the operator is configured to keep the
/// deployments namespace out of admission, a `NotIn` requirement for it is
/// appended in both cases. The empty selector is emitted explicitly, the
/// API server persists it that way and the change detection must agree.
fn namespace_selector(
    policy: &AnyPolicy,
    deployments_namespace: &str,
    exclude_deployments_namespace: bool,
) -> LabelSelector {
    let mut selector = if let Some(namespace) = policy.namespace() {
        LabelSelector {
            match_labels: Some(BTreeMap::from([(
                NAMESPACE_NAME_LABEL.to_string(),
                namespace,
            )])),
            ..Default::default()
        }
    } else {
        policy.namespace_selector().cloned().unwrap_or_default()
    };

    if exclude_deployments_namespace {
        selector
            .match_expressions
            .get_or_insert_with(Vec::new)
            .push(LabelSelectorRequirement {
                key: NAMESPACE_NAME_LABEL.to_string(),
                operator: "NotIn".to_string(),
                values: Some(vec![deployments_namespace.to_string()]),
            });
    }

    selector
}

/* ============================= BUILDERS ============================= */

/// Write the desired state of a policy's ValidatingWebhookConfiguration.
pub fn fill_validating(
    cfg: &mut ValidatingWebhookConfiguration,
    policy: &AnyPolicy,
    deployments_namespace: &str,
    ca_bundle: &[u8],
    exclude_deployments_namespace: bool,
) {
    let spec = policy.spec();
    let meta = object_meta(policy);
    cfg.metadata.name = meta.name;
    cfg.metadata.labels = meta.labels;
    cfg.metadata.annotations = meta.annotations;
    cfg.webhooks = Some(vec![ValidatingWebhook {
        name: webhook_entry_name(policy),
        admission_review_versions: vec!["v1".to_string()],
        client_config: client_config(policy, deployments_namespace, ca_bundle),
        rules: Some(effective_rules(policy)),
        failure_policy: Some(spec.failure_policy().as_str().to_string()),
        side_effects: spec.side_effects().to_string(),
        match_policy: Some(spec.match_policy.clone().unwrap_or_else(|| "Equivalent".to_string())),
        namespace_selector: Some(namespace_selector(
            policy,
            deployments_namespace,
            exclude_deployments_namespace,
        )),
        object_selector: Some(spec.object_selector.clone().unwrap_or_default()),
        timeout_seconds: Some(spec.timeout_seconds()),
    }]);
}

/// Write the desired state of a policy's MutatingWebhookConfiguration.
pub fn fill_mutating(
    cfg: &mut MutatingWebhookConfiguration,
    policy: &AnyPolicy,
    deployments_namespace: &str,
    ca_bundle: &[u8],
    exclude_deployments_namespace: bool,
) {
    let spec = policy.spec();
    let meta = object_meta(policy);
    cfg.metadata.name = meta.name;
    cfg.metadata.labels = meta.labels;
    cfg.metadata.annotations = meta.annotations;
    cfg.webhooks = Some(vec![MutatingWebhook {
        name: webhook_entry_name(policy),
        admission_review_versions: vec!["v1".to_string()],
        client_config: client_config(policy, deployments_namespace, ca_bundle),
        rules: Some(effective_rules(policy)),
        failure_policy: Some(spec.failure_policy().as_str().to_string()),
        side_effects: spec.side_effects().to_string(),
        match_policy: Some(spec.match_policy.clone().unwrap_or_else(|| "Equivalent".to_string())),
        namespace_selector: Some(namespace_selector(
            policy,
            deployments_namespace,
            exclude_deployments_namespace,
        )),
        object_selector: Some(spec.object_selector.clone().unwrap_or_default()),
        timeout_seconds: Some(spec.timeout_seconds()),
        reinvocation_policy: Some("Never".to_string()),
    }]);
}

/// Replace the client-CA bundle of an existing webhook configuration.
/// Used by the rotation cascade; everything else is left untouched.
pub fn refresh_validating_bundle(cfg: &mut ValidatingWebhookConfiguration, ca_bundle: &[u8]) {
    if let Some(webhooks) = cfg.webhooks.as_mut() {
        for webhook in webhooks {
            webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
        }
    }
}

pub fn refresh_mutating_bundle(cfg: &mut MutatingWebhookConfiguration, ca_bundle: &[u8]) {
    if let Some(webhooks) = cfg.webhooks.as_mut() {
        for webhook in webhooks {
            webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
        }
    }
}

/* ============================= TESTS ============================= */
