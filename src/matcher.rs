use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::crd::AnyPolicy;

/* ============================= TYPES ============================= */

/// A concrete group/version/resource a policy subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetResource {
    pub group: String,
    pub version: String,
    /// Lowercase plural resource name, e.g. `pods`.
    pub resource: String,
}

impl TargetResource {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Which policies want which resources, for one scan.
#[derive(Debug, Default)]
pub struct AuditPlan {
    /// Policies to evaluate, grouped by target resource.
    pub targets: BTreeMap<TargetResource, Vec<AnyPolicy>>,
    /// Policies with a `*` in a rule's resources list; they are reported as
    /// skipped rather than fanned out over every resource in the cluster.
    pub skipped: Vec<AnyPolicy>,
}

/* ============================= PLANNING ============================= */

/// The audit evaluates resources as if they were being created.
const AUDITED_OPERATION: &str = "CREATE";

/// Resolve every auditable policy's rules into concrete targets.
pub fn plan_audit(policies: &[AnyPolicy]) -> AuditPlan {
    let mut plan = AuditPlan::default();

    for policy in policies {
        let mut wildcard = false;
        // A policy may reach the same GVR through several rules; it still
        // gets evaluated once per resource.
        let mut targets = std::collections::BTreeSet::new();

        for rule in &policy.spec().rules {
            let operations = rule.operations.clone().unwrap_or_default();
            if !operations
                .iter()
                .any(|op| op == AUDITED_OPERATION || op == "*")
            {
                continue;
            }

            let groups = rule.api_groups.clone().unwrap_or_default();
            let versions = rule.api_versions.clone().unwrap_or_default();
            let resources = rule.resources.clone().unwrap_or_default();

            for resource in &resources {
                if resource == "*" {
                    wildcard = true;
                    continue;
                }
                // Subresources cannot be listed, only their parents can.
                if resource.contains('/') {
                    continue;
                }
                for group in &groups {
                    for version in &versions {
                        targets.insert(TargetResource {
                            group: group.clone(),
                            version: version.clone(),
                            resource: resource.clone(),
                        });
                    }
                }
            }
        }

        if wildcard {
            plan.skipped.push(policy.clone());
        }
        for target in targets {
            plan.targets.entry(target).or_default().push(policy.clone());
        }
    }

    plan
}

/* ============================= SELECTORS ============================= */

/// Evaluate a label selector against a label set. An absent selector
/// matches everything, mirroring the API server's behavior.
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Some(selector) = selector else {
        return true;
    };

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let actual = labels.get(&expression.key);
            let values = expression.values.clone().unwrap_or_default();
            let matched = match expression.operator.as_str() {
                "In" => actual.is_some_and(|v| values.contains(v)),
                "NotIn" => !actual.is_some_and(|v| values.contains(v)),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }
    }

    true
}

/// Whether a policy's object selector accepts a resource's labels.
pub fn policy_matches_object(policy: &AnyPolicy, labels: &BTreeMap<String, String>) -> bool {
    selector_matches(policy.spec().object_selector.as_ref(), labels)
}

/// Whether a cluster policy's namespace selector accepts a namespace's
/// labels. Namespaced policies only ever audit their own namespace.
pub fn policy_matches_namespace(
    policy: &AnyPolicy,
    namespace: &str,
    namespace_labels: &BTreeMap<String, String>,
) -> bool {
    match policy.namespace() {
        Some(own) => own == namespace,
        None => selector_matches(policy.namespace_selector(), namespace_labels),
    }
}

/* ============================= TESTS ============================= */
